//! Fortune cat: one AI-written fortune and one cat picture, served over HTTP
//! and regenerated in the background once someone has looked at them.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
