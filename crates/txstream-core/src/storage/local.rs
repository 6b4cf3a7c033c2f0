//! Filesystem backend, used for single-node deployments and tests.

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{IoSnafu, ObjectStoreSnafu, StorageError};

use super::{BackendConfig, StorageProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    /// Directory every object key is resolved against. Created on demand.
    pub root: String,
}

impl StorageProvider {
    pub(super) async fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.root)
            .await
            .context(IoSnafu)?;

        // Create-only puts rely on the backend's atomic rename-if-absent
        let store = LocalFileSystem::new_with_prefix(&config.root).context(ObjectStoreSnafu)?;
        debug!(root = %config.root, "Using local filesystem storage");

        Ok(Self {
            canonical_url: format!("file://{}", config.root),
            object_store: Arc::new(store) as Arc<dyn ObjectStore>,
            config: BackendConfig::Local(config),
            storage_options: HashMap::new(),
        })
    }
}
