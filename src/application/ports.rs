//! Capability traits for the services the refresh loop talks to.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is not configured: {0}")]
    Configuration(String),
    #[error("invalid blob key `{0}`")]
    InvalidKey(String),
    #[error("blob `{0}` already exists")]
    AlreadyExists(String),
    #[error("store request failed: {0}")]
    Transport(String),
    #[error("store returned status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("similarity index is not configured: {0}")]
    Configuration(String),
    #[error("similarity index request failed: {0}")]
    Transport(String),
    #[error("similarity index returned status {status}: {detail}")]
    Status { status: u16, detail: String },
}

impl IndexError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generator is not configured: {0}")]
    Configuration(String),
    #[error("generator request failed: {0}")]
    Transport(String),
    #[error("generator returned status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("generator returned no usable output: {0}")]
    EmptyResponse(String),
}

impl GenerationError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn empty(message: impl Into<String>) -> Self {
        Self::EmptyResponse(message.into())
    }
}

/// Key/blob storage used for the screen snapshot and for example fortunes.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Write `blob` under `key`. With `overwrite == false` an existing blob is
    /// left untouched and [`StoreError::AlreadyExists`] is returned.
    async fn put(&self, key: &str, blob: Bytes, overwrite: bool) -> Result<(), StoreError>;
}

/// Nearest-neighbour lookup over the example corpus.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Ids of the `top_k` records closest to the record `id`.
    async fn nearest(
        &self,
        id: &str,
        top_k: usize,
        namespace: &str,
    ) -> Result<Vec<String>, IndexError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A complete chat prompt ready for the text provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptBundle {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
}

/// The generative text and image provider.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate_text(&self, prompt: &PromptBundle) -> Result<String, GenerationError>;

    /// Returns an image reference usable directly by a browser.
    async fn generate_image(&self, prompt: &str) -> Result<String, GenerationError>;
}
