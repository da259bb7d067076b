//! Fortune and picture generation.
//!
//! A fortune is written by example: a random record of the corpus seeds a
//! nearest-neighbour query, the neighbours' raw texts become few-shot examples
//! and the provider is asked for one more. Every failure along the way makes
//! the result worse, never an error: missing neighbours mean fewer examples,
//! and a failed provider call yields `None` so the cache falls back to its
//! default content.

use std::{sync::Arc, time::Instant};

use metrics::{counter, histogram};
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use super::{
    elapsed_ms,
    ports::{
        ChatMessage, ChatRole, ContentGenerator, DurableStore, PromptBundle, SimilarityIndex,
    },
};

pub const PERSONA: &str = "You are the UNIX fortune command, reborn with wit and sarcasm. When \
prompted to \"tell a fortune,\" respond with a short, dry, and darkly humorous message—often \
ironic, occasionally profound, always unexpected. Your tone should echo the classic fortune \
command: pithy, deadpan, and just a little unhinged. Keep it brief, clever, and punchy. Do not \
add any explanations, sign-offs, or follow-up remarks (e.g., “Enjoy!” or “Good luck with \
that.”). The fortune is the entire response.";
pub const FORTUNE_REQUEST: &str = "Tell me a fortune";
pub const IMAGE_PROMPT: &str = "A wise philosopher who is a cat";

pub const DEFAULT_CORPUS_SIZE: u32 = 12_362;
pub const DEFAULT_NEIGHBOURS: usize = 3;
pub const DEFAULT_MAX_TOKENS: u32 = 150;

const METRIC_TEXT_GENERATED: &str = "fortunecat_text_generated_total";
const METRIC_IMAGE_GENERATED: &str = "fortunecat_image_generated_total";
const METRIC_GENERATION_FAILED: &str = "fortunecat_generation_failed_total";
const METRIC_TEXT_GENERATION_MS: &str = "fortunecat_text_generation_ms";
const METRIC_IMAGE_GENERATION_MS: &str = "fortunecat_image_generation_ms";
const METRIC_INDEX_QUERY_MS: &str = "fortunecat_index_query_ms";
const METRIC_EXAMPLE_FETCH_MS: &str = "fortunecat_example_fetch_ms";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposerConfig {
    /// Seeds are drawn from `0..corpus_size`.
    pub corpus_size: u32,
    pub neighbours: usize,
    pub namespace: String,
    pub max_tokens: u32,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            corpus_size: DEFAULT_CORPUS_SIZE,
            neighbours: DEFAULT_NEIGHBOURS,
            namespace: String::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl From<&crate::config::Settings> for ComposerConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            corpus_size: settings.refresh.corpus_size.get(),
            neighbours: settings.refresh.neighbours.get() as usize,
            namespace: settings.index.namespace.clone(),
            max_tokens: settings.openai.max_tokens.get(),
        }
    }
}

pub struct FortuneComposer {
    config: ComposerConfig,
    generator: Arc<dyn ContentGenerator>,
    index: Arc<dyn SimilarityIndex>,
    examples: Arc<dyn DurableStore>,
}

impl FortuneComposer {
    pub fn new(
        config: ComposerConfig,
        generator: Arc<dyn ContentGenerator>,
        index: Arc<dyn SimilarityIndex>,
        examples: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            config,
            generator,
            index,
            examples,
        }
    }

    /// Write a new fortune from a randomly chosen seed.
    pub async fn compose_text(&self) -> Option<String> {
        let seed = self.pick_seed();
        self.compose_text_from_seed(&seed).await
    }

    #[instrument(skip(self))]
    pub async fn compose_text_from_seed(&self, seed: &str) -> Option<String> {
        counter!(METRIC_TEXT_GENERATED).increment(1);
        info!(target = "fortunecat::composer", "Generating fortune text");

        let examples = self.load_examples(seed).await;
        let prompt = build_prompt(&examples, self.config.max_tokens);

        let started_at = Instant::now();
        let result = self.generator.generate_text(&prompt).await;
        histogram!(METRIC_TEXT_GENERATION_MS).record(elapsed_ms(started_at));

        match result {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(
                    target = "fortunecat::composer",
                    error = %err,
                    examples = examples.len(),
                    "Text generation failed; default fortune will be shown"
                );
                counter!(METRIC_GENERATION_FAILED, "kind" => "text").increment(1);
                None
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn compose_image(&self) -> Option<String> {
        counter!(METRIC_IMAGE_GENERATED).increment(1);
        info!(target = "fortunecat::composer", "Generating cat picture");

        let started_at = Instant::now();
        let result = self.generator.generate_image(IMAGE_PROMPT).await;
        histogram!(METRIC_IMAGE_GENERATION_MS).record(elapsed_ms(started_at));

        match result {
            Ok(image) => Some(image),
            Err(err) => {
                warn!(
                    target = "fortunecat::composer",
                    error = %err,
                    "Image generation failed; default picture will be shown"
                );
                counter!(METRIC_GENERATION_FAILED, "kind" => "image").increment(1);
                None
            }
        }
    }

    fn pick_seed(&self) -> String {
        let upper = self.config.corpus_size.max(1);
        rand::thread_rng().gen_range(0..upper).to_string()
    }

    /// Raw texts of the seed's nearest neighbours, in index order.
    async fn load_examples(&self, seed: &str) -> Vec<String> {
        let started_at = Instant::now();
        let neighbours = self
            .index
            .nearest(seed, self.config.neighbours, &self.config.namespace)
            .await;
        histogram!(METRIC_INDEX_QUERY_MS).record(elapsed_ms(started_at));

        let neighbours = match neighbours {
            Ok(ids) => ids,
            Err(err) => {
                warn!(
                    target = "fortunecat::composer",
                    error = %err,
                    seed,
                    "Similarity query failed; prompting without examples"
                );
                return Vec::new();
            }
        };

        let mut examples = Vec::with_capacity(neighbours.len());
        for id in neighbours.iter().take(self.config.neighbours) {
            let key = example_key(id);
            let started_at = Instant::now();
            let fetched = self.examples.get(&key).await;
            histogram!(METRIC_EXAMPLE_FETCH_MS).record(elapsed_ms(started_at));

            match fetched {
                Ok(Some(blob)) => {
                    let text = String::from_utf8_lossy(&blob).into_owned();
                    if text.trim().is_empty() {
                        debug!(key = %key, "Skipping empty example");
                    } else {
                        examples.push(text);
                    }
                }
                Ok(None) => debug!(key = %key, "Example blob missing"),
                Err(err) => warn!(
                    target = "fortunecat::composer",
                    key = %key,
                    error = %err,
                    "Failed to fetch example"
                ),
            }
        }

        examples
    }
}

/// Blob key holding the raw text of corpus record `id`.
pub fn example_key(id: &str) -> String {
    format!("{id}.txt")
}

/// Persona, then one request/answer pair per example, then the real request.
pub fn build_prompt(examples: &[String], max_tokens: u32) -> PromptBundle {
    let mut messages = Vec::with_capacity(2 + examples.len() * 2);
    messages.push(ChatMessage::new(ChatRole::System, PERSONA));
    for example in examples {
        messages.push(ChatMessage::new(ChatRole::User, FORTUNE_REQUEST));
        messages.push(ChatMessage::new(ChatRole::Assistant, example.as_str()));
    }
    messages.push(ChatMessage::new(ChatRole::User, FORTUNE_REQUEST));

    PromptBundle {
        messages,
        max_tokens,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::application::ports::{GenerationError, IndexError, StoreError};

    #[derive(Default)]
    struct RecordingGenerator {
        prompts: Mutex<Vec<PromptBundle>>,
        fail: bool,
    }

    #[async_trait]
    impl ContentGenerator for RecordingGenerator {
        async fn generate_text(&self, prompt: &PromptBundle) -> Result<String, GenerationError> {
            self.prompts.lock().expect("prompts").push(prompt.clone());
            if self.fail {
                Err(GenerationError::Status {
                    status: 503,
                    detail: "overloaded".to_string(),
                })
            } else {
                Ok("You will write more tests.".to_string())
            }
        }

        async fn generate_image(&self, prompt: &str) -> Result<String, GenerationError> {
            assert_eq!(prompt, IMAGE_PROMPT);
            if self.fail {
                Err(GenerationError::empty("no image"))
            } else {
                Ok("data:image/png;base64,AAAA".to_string())
            }
        }
    }

    struct FixedIndex {
        result: Result<Vec<&'static str>, ()>,
        queries: Mutex<Vec<(String, usize, String)>>,
    }

    impl FixedIndex {
        fn returning(ids: Vec<&'static str>) -> Self {
            Self {
                result: Ok(ids),
                queries: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                result: Err(()),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SimilarityIndex for FixedIndex {
        async fn nearest(
            &self,
            id: &str,
            top_k: usize,
            namespace: &str,
        ) -> Result<Vec<String>, IndexError> {
            self.queries
                .lock()
                .expect("queries")
                .push((id.to_string(), top_k, namespace.to_string()));
            match &self.result {
                Ok(ids) => Ok(ids.iter().map(|id| id.to_string()).collect()),
                Err(()) => Err(IndexError::transport("connection refused")),
            }
        }
    }

    #[derive(Default)]
    struct MapStore {
        blobs: HashMap<String, Bytes>,
    }

    impl MapStore {
        fn with(entries: &[(&str, &str)]) -> Self {
            Self {
                blobs: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), Bytes::from(v.to_string())))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl DurableStore for MapStore {
        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            Ok(self.blobs.contains_key(key))
        }

        async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
            if key == "broken.txt" {
                return Err(StoreError::transport("timeout"));
            }
            Ok(self.blobs.get(key).cloned())
        }

        async fn put(&self, _key: &str, _blob: Bytes, _overwrite: bool) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn composer(
        generator: Arc<RecordingGenerator>,
        index: Arc<FixedIndex>,
        store: MapStore,
    ) -> FortuneComposer {
        FortuneComposer::new(
            ComposerConfig {
                namespace: "fortunes".to_string(),
                ..Default::default()
            },
            generator,
            index,
            Arc::new(store),
        )
    }

    fn transcript(prompt: &PromptBundle) -> String {
        prompt
            .messages
            .iter()
            .map(|m| {
                let content = if m.role == ChatRole::System {
                    "<persona>"
                } else {
                    m.content.as_str()
                };
                format!("{}: {}", m.role.as_str(), content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn prompt_pairs_each_example_with_a_request() {
        let prompt = build_prompt(
            &["Fortune one.".to_string(), "Fortune two.".to_string()],
            150,
        );

        assert_eq!(prompt.max_tokens, 150);
        assert_eq!(prompt.messages[0].content, PERSONA);
        insta::assert_snapshot!(transcript(&prompt), @r"
        system: <persona>
        user: Tell me a fortune
        assistant: Fortune one.
        user: Tell me a fortune
        assistant: Fortune two.
        user: Tell me a fortune
        ");
    }

    #[test]
    fn prompt_without_examples_is_persona_and_request() {
        let prompt = build_prompt(&[], 150);
        insta::assert_snapshot!(transcript(&prompt), @r"
        system: <persona>
        user: Tell me a fortune
        ");
    }

    #[tokio::test]
    async fn neighbours_become_examples() {
        let generator = Arc::new(RecordingGenerator::default());
        let index = Arc::new(FixedIndex::returning(vec!["17", "4", "99"]));
        let store = MapStore::with(&[
            ("17.txt", "Seventeen."),
            ("4.txt", "Four."),
            ("99.txt", "Ninety-nine."),
        ]);
        let composer = composer(generator.clone(), index.clone(), store);

        let text = composer.compose_text_from_seed("42").await;

        assert_eq!(text.as_deref(), Some("You will write more tests."));
        let queries = index.queries.lock().expect("queries").clone();
        assert_eq!(
            queries,
            vec![("42".to_string(), 3, "fortunes".to_string())]
        );

        let prompts = generator.prompts.lock().expect("prompts");
        let assistant: Vec<&str> = prompts[0]
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::Assistant)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(assistant, vec!["Seventeen.", "Four.", "Ninety-nine."]);
        assert_eq!(prompts[0].max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[tokio::test]
    async fn missing_or_broken_examples_are_skipped() {
        let generator = Arc::new(RecordingGenerator::default());
        let index = Arc::new(FixedIndex::returning(vec!["1", "missing", "broken", "2"]));
        let store = MapStore::with(&[("1.txt", "One."), ("2.txt", "Two.")]);
        let composer = composer(generator.clone(), index, store);

        composer.compose_text_from_seed("7").await;

        let prompts = generator.prompts.lock().expect("prompts");
        let assistant: Vec<&str> = prompts[0]
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::Assistant)
            .map(|m| m.content.as_str())
            .collect();
        // Only the first three neighbours are considered.
        assert_eq!(assistant, vec!["One."]);
    }

    #[tokio::test]
    async fn index_failure_still_calls_the_provider() {
        let generator = Arc::new(RecordingGenerator::default());
        let composer = composer(
            generator.clone(),
            Arc::new(FixedIndex::failing()),
            MapStore::default(),
        );

        let text = composer.compose_text().await;

        assert!(text.is_some());
        let prompts = generator.prompts.lock().expect("prompts");
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn provider_failure_yields_none() {
        let generator = Arc::new(RecordingGenerator {
            fail: true,
            ..Default::default()
        });
        let composer = composer(
            generator,
            Arc::new(FixedIndex::returning(vec![])),
            MapStore::default(),
        );

        assert_eq!(composer.compose_text().await, None);
        assert_eq!(composer.compose_image().await, None);
    }

    #[tokio::test]
    async fn random_seed_stays_inside_the_corpus() {
        let index = Arc::new(FixedIndex::returning(vec![]));
        let composer = FortuneComposer::new(
            ComposerConfig {
                corpus_size: 5,
                ..Default::default()
            },
            Arc::new(RecordingGenerator::default()),
            index.clone(),
            Arc::new(MapStore::default()),
        );

        for _ in 0..20 {
            composer.compose_text().await;
        }

        for (seed, _, _) in index.queries.lock().expect("queries").iter() {
            let seed: u32 = seed.parse().expect("numeric seed");
            assert!(seed < 5);
        }
    }
}
