//! Durable blob stores selectable by configuration.

mod azure;
mod fs;
mod memory;

use std::sync::Arc;

use tracing::info;

pub use azure::AzureBlobStore;
pub use fs::FsStore;
pub use memory::MemoryStore;

use crate::{
    application::ports::DurableStore,
    config::{StoreBackend, StoreSettings},
};

use super::error::InfraError;

/// Construct the configured backend. Remote credentials are not checked here.
pub fn build_store(settings: &StoreSettings) -> Result<Arc<dyn DurableStore>, InfraError> {
    let store: Arc<dyn DurableStore> = match settings.backend {
        StoreBackend::Azure => Arc::new(AzureBlobStore::new(
            settings.connection_string.clone(),
            settings.container.clone(),
        )?),
        StoreBackend::Fs => Arc::new(FsStore::new(settings.directory.clone())?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };

    info!(
        target = "fortunecat::store",
        backend = ?settings.backend,
        "Durable store ready"
    );
    Ok(store)
}
