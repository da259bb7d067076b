//! Application services: content generation and the refresh loop.

use std::time::Instant;

pub mod composer;
pub mod error;
pub mod ports;
pub mod refresh;

pub(crate) fn elapsed_ms(started_at: Instant) -> f64 {
    started_at.elapsed().as_secs_f64() * 1000.0
}
