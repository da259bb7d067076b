use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use time::{Duration, OffsetDateTime};

use fortunecat::application::composer::{ComposerConfig, FortuneComposer};
use fortunecat::application::ports::{
    ContentGenerator, DurableStore, GenerationError, IndexError, PromptBundle, SimilarityIndex,
    StoreError,
};
use fortunecat::application::refresh::{RefreshConfig, RefreshOrchestrator, TickOutcome};
use fortunecat::cache::ContentCache;

struct DownGenerator;

#[async_trait]
impl ContentGenerator for DownGenerator {
    async fn generate_text(&self, _prompt: &PromptBundle) -> Result<String, GenerationError> {
        Err(GenerationError::Status {
            status: 429,
            detail: "rate limited".to_string(),
        })
    }

    async fn generate_image(&self, _prompt: &str) -> Result<String, GenerationError> {
        Err(GenerationError::empty("no payload"))
    }
}

struct ThreeNeighbours;

#[async_trait]
impl SimilarityIndex for ThreeNeighbours {
    async fn nearest(
        &self,
        _id: &str,
        _top_k: usize,
        _namespace: &str,
    ) -> Result<Vec<String>, IndexError> {
        Ok(vec!["7".to_string(), "8".to_string(), "9".to_string()])
    }
}

/// Reads find nothing, writes always fail.
struct ReadOnlyStore;

#[async_trait]
impl DurableStore for ReadOnlyStore {
    async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _blob: Bytes, _overwrite: bool) -> Result<(), StoreError> {
        Err(StoreError::transport("read-only"))
    }
}

#[tokio::test]
async fn refresh_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let store = Arc::new(ReadOnlyStore);
    let cache = Arc::new(ContentCache::new());
    let composer = Arc::new(FortuneComposer::new(
        ComposerConfig::default(),
        Arc::new(DownGenerator),
        Arc::new(ThreeNeighbours),
        store.clone(),
    ));
    let mut orchestrator =
        RefreshOrchestrator::new(RefreshConfig::default(), cache.clone(), composer, store);

    let now = OffsetDateTime::now_utc();
    assert_eq!(orchestrator.tick_at(now).await, TickOutcome::Idle);
    cache.view_text();
    assert_eq!(
        orchestrator.tick_at(now + Duration::seconds(10)).await,
        TickOutcome::Regenerated {
            image: true,
            persisted: false
        }
    );

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    // One sample per example blob, not one per prompt.
    let example_fetches: usize = snapshot
        .iter()
        .filter(|(key, _, _, _)| key.key().name() == "fortunecat_example_fetch_ms")
        .map(|(_, _, _, value)| match value {
            DebugValue::Histogram(samples) => samples.len(),
            _ => 0,
        })
        .sum();
    assert_eq!(example_fetches, 3);

    let expected = [
        "fortunecat_hydration_miss_total",
        "fortunecat_store_exists_ms",
        "fortunecat_content_viewed_total",
        "fortunecat_text_generated_total",
        "fortunecat_image_generated_total",
        "fortunecat_generation_failed_total",
        "fortunecat_text_generation_ms",
        "fortunecat_image_generation_ms",
        "fortunecat_index_query_ms",
        "fortunecat_example_fetch_ms",
        "fortunecat_store_put_ms",
        "fortunecat_snapshot_persist_failed_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
