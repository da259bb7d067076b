//! Background refresh of the screen content.
//!
//! The loop ticks on a fixed interval. The first tick tries to restore the
//! persisted snapshot; after that a tick regenerates only when a consumer has
//! seen the current content. Text is always regenerated, the picture only
//! once it is older than the image TTL. Cancellation is observed between
//! ticks, never inside one.

use std::{sync::Arc, time::Instant};

use bytes::Bytes;
use metrics::{counter, histogram};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::ContentCache,
    domain::screen::{ContentSnapshot, ContentUpdate, ImageUpdate},
};

use super::{
    composer::FortuneComposer,
    elapsed_ms,
    ports::{DurableStore, StoreError},
};

pub const DEFAULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
pub const DEFAULT_IMAGE_TTL: time::Duration = time::Duration::minutes(120);
pub const DEFAULT_SNAPSHOT_KEY: &str = "screen.json";

const METRIC_HYDRATION_MISS: &str = "fortunecat_hydration_miss_total";
const METRIC_SNAPSHOT_PERSIST_FAILED: &str = "fortunecat_snapshot_persist_failed_total";
const METRIC_STORE_EXISTS_MS: &str = "fortunecat_store_exists_ms";
const METRIC_STORE_GET_MS: &str = "fortunecat_store_get_ms";
const METRIC_STORE_PUT_MS: &str = "fortunecat_store_put_ms";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshConfig {
    pub interval: std::time::Duration,
    pub image_ttl: time::Duration,
    pub snapshot_key: String,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            image_ttl: DEFAULT_IMAGE_TTL,
            snapshot_key: DEFAULT_SNAPSHOT_KEY.to_string(),
        }
    }
}

impl From<&crate::config::Settings> for RefreshConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            interval: settings.refresh.interval,
            image_ttl: settings.refresh.image_ttl,
            snapshot_key: settings.store.snapshot_key.clone(),
        }
    }
}

/// Whether the persisted snapshot has been looked for yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Cold,
    Warm,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The persisted snapshot was loaded; nothing was generated.
    Hydrated,
    /// Nobody has seen the current content yet.
    Idle,
    Regenerated { image: bool, persisted: bool },
}

#[derive(Debug, Error)]
enum HydrationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("snapshot could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

pub struct RefreshOrchestrator {
    config: RefreshConfig,
    cache: Arc<ContentCache>,
    composer: Arc<FortuneComposer>,
    store: Arc<dyn DurableStore>,
    phase: Phase,
}

impl RefreshOrchestrator {
    pub fn new(
        config: RefreshConfig,
        cache: Arc<ContentCache>,
        composer: Arc<FortuneComposer>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            config,
            cache,
            composer,
            store,
            phase: Phase::Cold,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub async fn tick(&mut self) -> TickOutcome {
        self.tick_at(OffsetDateTime::now_utc()).await
    }

    /// Run one tick as if the clock read `now`.
    #[instrument(skip(self), fields(phase = ?self.phase))]
    pub async fn tick_at(&mut self, now: OffsetDateTime) -> TickOutcome {
        if self.phase == Phase::Cold {
            self.phase = Phase::Warm;
            if self.hydrate(now).await {
                return TickOutcome::Hydrated;
            }
        }

        if !self.cache.viewed() {
            debug!("Content not viewed yet; skipping refresh");
            return TickOutcome::Idle;
        }

        let ttl = self.config.image_ttl;
        let refresh_image = self.cache.inspect(|state| state.image_expired(now, ttl));

        let (text, image) = if refresh_image {
            let (text, image) =
                tokio::join!(self.composer.compose_text(), self.composer.compose_image());
            (text, ImageUpdate::Replace(image))
        } else {
            (self.composer.compose_text().await, ImageUpdate::Keep)
        };

        let snapshot = self.cache.apply(ContentUpdate { text, image }, now);
        info!(
            target = "fortunecat::refresh",
            image = refresh_image,
            "Screen content regenerated"
        );

        let persisted = self.persist(&snapshot).await;
        TickOutcome::Regenerated {
            image: refresh_image,
            persisted,
        }
    }

    /// Drive ticks until `shutdown` is cancelled. An in-flight tick always
    /// runs to completion.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            target = "fortunecat::refresh",
            interval_ms = self.config.interval.as_millis() as u64,
            image_ttl_minutes = self.config.image_ttl.whole_minutes(),
            "Refresh loop running"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(target = "fortunecat::refresh", "Refresh loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Restore the persisted snapshot. Returns `true` when one was loaded.
    async fn hydrate(&self, now: OffsetDateTime) -> bool {
        match self.load_snapshot().await {
            Ok(Some(mut snapshot)) => {
                // A stored "never" is clamped to now: the restored picture counts as fresh.
                if snapshot.last_image_refresh_at.is_none() {
                    snapshot.last_image_refresh_at = Some(now);
                }
                info!(
                    target = "fortunecat::refresh",
                    key = %self.config.snapshot_key,
                    viewed = snapshot.viewed,
                    "Restored persisted screen"
                );
                self.cache.restore(snapshot);
                true
            }
            Ok(None) => {
                info!(
                    target = "fortunecat::refresh",
                    key = %self.config.snapshot_key,
                    "No persisted screen; starting fresh"
                );
                counter!(METRIC_HYDRATION_MISS, "reason" => "absent").increment(1);
                false
            }
            Err(err) => {
                warn!(
                    target = "fortunecat::refresh",
                    key = %self.config.snapshot_key,
                    error = %err,
                    "Could not restore persisted screen; starting fresh"
                );
                let reason = match err {
                    HydrationError::Store(_) => "store",
                    HydrationError::Decode(_) => "decode",
                };
                counter!(METRIC_HYDRATION_MISS, "reason" => reason).increment(1);
                false
            }
        }
    }

    async fn load_snapshot(&self) -> Result<Option<ContentSnapshot>, HydrationError> {
        let key = self.config.snapshot_key.as_str();

        let started_at = Instant::now();
        let exists = self.store.exists(key).await;
        histogram!(METRIC_STORE_EXISTS_MS).record(elapsed_ms(started_at));
        if !exists? {
            return Ok(None);
        }

        let started_at = Instant::now();
        let blob = self.store.get(key).await;
        histogram!(METRIC_STORE_GET_MS).record(elapsed_ms(started_at));

        match blob? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write the snapshot, overwriting the previous one. Failures are logged
    /// and counted; the in-memory content stays as it is.
    async fn persist(&self, snapshot: &ContentSnapshot) -> bool {
        let key = self.config.snapshot_key.as_str();
        let payload = match serde_json::to_vec(snapshot) {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                warn!(
                    target = "fortunecat::refresh",
                    error = %err,
                    "Failed to encode screen snapshot"
                );
                counter!(METRIC_SNAPSHOT_PERSIST_FAILED).increment(1);
                return false;
            }
        };

        let started_at = Instant::now();
        let result = self.store.put(key, payload, true).await;
        histogram!(METRIC_STORE_PUT_MS).record(elapsed_ms(started_at));

        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target = "fortunecat::refresh",
                    key,
                    error = %err,
                    "Failed to persist screen snapshot"
                );
                counter!(METRIC_SNAPSHOT_PERSIST_FAILED).increment(1);
                false
            }
        }
    }
}
