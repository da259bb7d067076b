//! Shared, lock-guarded holder of the current screen.
//!
//! Every field lives behind one mutex so a regeneration (text, image, viewed
//! flag, timestamp) is never observed half-applied. The lock is synchronous
//! and never held across an `.await`.

use std::sync::Mutex;

use metrics::counter;
use time::OffsetDateTime;

use crate::domain::screen::{ContentSnapshot, ContentUpdate, ScreenState};

use super::lock::mutex_lock;

const SOURCE: &str = "cache::content";
const METRIC_CONTENT_VIEWED: &str = "fortunecat_content_viewed_total";

/// Which field a consumer read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentField {
    Text,
    Image,
}

impl ContentField {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentField::Text => "text",
            ContentField::Image => "image",
        }
    }
}

#[derive(Debug, Default)]
pub struct ContentCache {
    state: Mutex<ScreenState>,
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        mutex_lock(&self.state, SOURCE, "text").text().to_string()
    }

    pub fn image(&self) -> String {
        mutex_lock(&self.state, SOURCE, "image").image_ref().to_string()
    }

    pub fn viewed(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "viewed").viewed()
    }

    pub fn last_image_refresh_at(&self) -> Option<OffsetDateTime> {
        mutex_lock(&self.state, SOURCE, "last_image_refresh_at").last_image_refresh_at()
    }

    pub fn set_text(&self, value: Option<String>) {
        mutex_lock(&self.state, SOURCE, "set_text").assign_text(value);
    }

    /// Stamps the refresh time with the current clock iff `value` is a real image.
    pub fn set_image(&self, value: Option<String>) {
        mutex_lock(&self.state, SOURCE, "set_image")
            .assign_image(value, OffsetDateTime::now_utc());
    }

    pub fn set_viewed(&self, viewed: bool) {
        mutex_lock(&self.state, SOURCE, "set_viewed").set_viewed(viewed);
    }

    pub fn snapshot(&self) -> ContentSnapshot {
        mutex_lock(&self.state, SOURCE, "snapshot").snapshot()
    }

    /// Consumer read of the text; marks the content viewed in the same critical section.
    pub fn view_text(&self) -> String {
        self.view(ContentField::Text)
    }

    /// Consumer read of the image; marks the content viewed in the same critical section.
    pub fn view_image(&self) -> String {
        self.view(ContentField::Image)
    }

    fn view(&self, field: ContentField) -> String {
        let mut state = mutex_lock(&self.state, SOURCE, "view");
        let flipped = state.mark_viewed();
        let value = match field {
            ContentField::Text => state.text().to_string(),
            ContentField::Image => state.image_ref().to_string(),
        };
        drop(state);

        if flipped {
            counter!(METRIC_CONTENT_VIEWED, "field" => field.as_str()).increment(1);
        }
        value
    }

    /// Apply a regeneration atomically and return the resulting snapshot.
    pub fn apply(&self, update: ContentUpdate, now: OffsetDateTime) -> ContentSnapshot {
        let mut state = mutex_lock(&self.state, SOURCE, "apply");
        state.apply(update, now);
        state.snapshot()
    }

    pub fn restore(&self, snapshot: ContentSnapshot) {
        mutex_lock(&self.state, SOURCE, "restore").restore(snapshot);
    }

    /// Evaluate `f` against a consistent view of the state.
    pub fn inspect<R>(&self, f: impl FnOnce(&ScreenState) -> R) -> R {
        let state = mutex_lock(&self.state, SOURCE, "inspect");
        f(&*state)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use time::Duration;

    use super::*;
    use crate::domain::screen::{DEFAULT_IMAGE, DEFAULT_TEXT, ImageUpdate};

    #[test]
    fn getters_and_setters_follow_screen_rules() {
        let cache = ContentCache::new();
        cache.set_text(Some("hello".to_string()));
        cache.set_image(Some("cat".to_string()));

        assert_eq!(cache.text(), "hello");
        assert_eq!(cache.image(), "cat");
        assert!(cache.last_image_refresh_at().is_some());

        cache.set_text(None);
        cache.set_image(None);
        assert_eq!(cache.text(), DEFAULT_TEXT);
        assert_eq!(cache.image(), DEFAULT_IMAGE);
    }

    #[test]
    fn set_text_never_touches_image_timestamp() {
        let cache = ContentCache::new();
        cache.set_text(Some("a".to_string()));
        assert_eq!(cache.last_image_refresh_at(), None);

        cache.set_image(Some("cat".to_string()));
        let stamped = cache.last_image_refresh_at();
        cache.set_text(Some("b".to_string()));
        assert_eq!(cache.last_image_refresh_at(), stamped);
    }

    #[test]
    fn view_marks_viewed_and_returns_value() {
        let cache = ContentCache::new();
        assert!(!cache.viewed());

        assert_eq!(cache.view_text(), DEFAULT_TEXT);
        assert!(cache.viewed());

        assert_eq!(cache.view_image(), DEFAULT_IMAGE);
        assert!(cache.viewed());
    }

    #[test]
    fn apply_returns_the_committed_snapshot() {
        let cache = ContentCache::new();
        cache.set_viewed(true);
        let now = OffsetDateTime::now_utc();

        let snapshot = cache.apply(
            ContentUpdate {
                text: Some("fresh".to_string()),
                image: ImageUpdate::Replace(Some("fresh-cat".to_string())),
            },
            now,
        );

        assert_eq!(snapshot, cache.snapshot());
        assert_eq!(snapshot.text, "fresh");
        assert_eq!(snapshot.image_ref, "fresh-cat");
        assert_eq!(snapshot.last_image_refresh_at, Some(now));
        assert!(!snapshot.viewed);
    }

    #[test]
    fn readers_never_see_a_torn_regeneration() {
        let cache = Arc::new(ContentCache::new());
        let start = OffsetDateTime::now_utc();

        let writer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for round in 0..500_i64 {
                    cache.set_viewed(true);
                    cache.apply(
                        ContentUpdate {
                            text: Some(format!("text-{round}")),
                            image: ImageUpdate::Replace(Some(format!("image-{round}"))),
                        },
                        start + Duration::seconds(round),
                    );
                }
            })
        };

        for _ in 0..2_000 {
            let snapshot = cache.snapshot();
            if let Some(round) = snapshot.text.strip_prefix("text-") {
                assert_eq!(snapshot.image_ref, format!("image-{round}"));
                let round: i64 = round.parse().expect("round number");
                assert_eq!(
                    snapshot.last_image_refresh_at,
                    Some(start + Duration::seconds(round))
                );
            }
        }

        writer.join().expect("writer thread");
    }
}
