//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod openai;
pub mod pinecone;
pub mod store;
pub mod telemetry;
