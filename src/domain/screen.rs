//! The single piece of content shown on screen: a fortune and a cat picture.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Shown whenever no generated fortune is available.
pub const DEFAULT_TEXT: &str = "A stopped clock is right twice a day.";
/// Shown whenever no generated image is available.
pub const DEFAULT_IMAGE: &str = "https://dreamlands.org/fortunecat/default_cat.png";

/// Persisted form of the screen, written under a single fixed key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSnapshot {
    pub text: String,
    pub image_ref: String,
    pub viewed: bool,
    /// `None` means the image has never been refreshed.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_image_refresh_at: Option<OffsetDateTime>,
}

impl Default for ContentSnapshot {
    fn default() -> Self {
        ScreenState::default().snapshot()
    }
}

/// What a regeneration changes about the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageUpdate {
    Keep,
    /// `None` records a failed generation and falls back to [`DEFAULT_IMAGE`].
    Replace(Option<String>),
}

/// One regeneration, applied as a single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUpdate {
    /// `None` records a failed generation and falls back to [`DEFAULT_TEXT`].
    pub text: Option<String>,
    pub image: ImageUpdate,
}

/// In-memory screen state. Owns the default-substitution and timestamp rules;
/// callers are responsible for locking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenState {
    text: String,
    image_ref: String,
    viewed: bool,
    last_image_refresh_at: Option<OffsetDateTime>,
}

impl Default for ScreenState {
    fn default() -> Self {
        Self {
            text: DEFAULT_TEXT.to_string(),
            image_ref: DEFAULT_IMAGE.to_string(),
            viewed: false,
            last_image_refresh_at: None,
        }
    }
}

impl ScreenState {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn image_ref(&self) -> &str {
        &self.image_ref
    }

    pub fn viewed(&self) -> bool {
        self.viewed
    }

    pub fn last_image_refresh_at(&self) -> Option<OffsetDateTime> {
        self.last_image_refresh_at
    }

    pub fn assign_text(&mut self, value: Option<String>) {
        self.text = present(value).unwrap_or_else(|| DEFAULT_TEXT.to_string());
    }

    /// Assign the image, stamping `now` only for a real (non-default) picture.
    pub fn assign_image(&mut self, value: Option<String>, now: OffsetDateTime) {
        match present(value) {
            Some(image) if image != DEFAULT_IMAGE => {
                self.image_ref = image;
                self.last_image_refresh_at = Some(now);
            }
            _ => self.image_ref = DEFAULT_IMAGE.to_string(),
        }
    }

    pub fn set_viewed(&mut self, viewed: bool) {
        self.viewed = viewed;
    }

    /// Mark the content as seen. Returns `true` only on the transition.
    pub fn mark_viewed(&mut self) -> bool {
        let flipped = !self.viewed;
        self.viewed = true;
        flipped
    }

    pub fn apply(&mut self, update: ContentUpdate, now: OffsetDateTime) {
        self.assign_text(update.text);
        if let ImageUpdate::Replace(image) = update.image {
            self.assign_image(image, now);
        }
        self.viewed = false;
    }

    /// Load a persisted snapshot verbatim; the timestamp is not re-stamped.
    pub fn restore(&mut self, snapshot: ContentSnapshot) {
        self.assign_text(Some(snapshot.text));
        self.image_ref =
            present(Some(snapshot.image_ref)).unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        self.viewed = snapshot.viewed;
        self.last_image_refresh_at = snapshot.last_image_refresh_at;
    }

    pub fn snapshot(&self) -> ContentSnapshot {
        ContentSnapshot {
            text: self.text.clone(),
            image_ref: self.image_ref.clone(),
            viewed: self.viewed,
            last_image_refresh_at: self.last_image_refresh_at,
        }
    }

    /// Whether the image is older than `ttl` at `now`. A never-refreshed image
    /// is always stale.
    pub fn image_expired(&self, now: OffsetDateTime, ttl: Duration) -> bool {
        match self.last_image_refresh_at {
            Some(refreshed_at) => now - refreshed_at > ttl,
            None => true,
        }
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
