//! In-process content cache.
//!
//! Holds exactly one screen (fortune text plus cat picture). There is no
//! eviction: the background refresh replaces the content once a consumer has
//! seen it.

mod content;
mod lock;

pub use content::{ContentCache, ContentField};
