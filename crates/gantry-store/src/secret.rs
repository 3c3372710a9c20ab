//! Secret store backends.

use async_trait::async_trait;
use gantry_core::secret::{SecretBundle, SecretResolver};
use gantry_core::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory secret store. Bundles are registered up front by an operator
/// (typically from a bundle file at startup) and read-only afterwards.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    bundles: RwLock<HashMap<String, SecretBundle>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from parsed bundles.
    pub fn from_bundles(bundles: impl IntoIterator<Item = SecretBundle>) -> Self {
        let map = bundles
            .into_iter()
            .map(|b| (b.name.clone(), b))
            .collect();
        Self {
            bundles: RwLock::new(map),
        }
    }

    /// Register or replace a bundle.
    pub async fn register(&self, bundle: SecretBundle) {
        self.bundles
            .write()
            .await
            .insert(bundle.name.clone(), bundle);
    }
}

#[async_trait]
impl SecretResolver for MemorySecretStore {
    async fn resolve(&self, bundle_name: &str) -> Result<SecretBundle> {
        self.bundles
            .read()
            .await
            .get(bundle_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret bundle '{bundle_name}'")))
    }
}
