use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config_loader::{EndpointConfig, EndpointKind};
use crate::errors::{HermesError, HermesResult};
use crate::object_store::ObjectStore;
use crate::object_store_fs::FsObjectStore;
use crate::object_store_memory::MemoryObjectStore;

/// Named storage endpoints the object handlers and transfers resolve against.
#[derive(Clone, Default)]
pub struct EndpointRegistry {
    stores: BTreeMap<String, Arc<dyn ObjectStore>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured endpoint. Filesystem roots are created if missing.
    pub fn from_config(endpoints: &BTreeMap<String, EndpointConfig>) -> HermesResult<Self> {
        let mut registry = Self::new();
        for (name, endpoint) in endpoints {
            let store: Arc<dyn ObjectStore> = match endpoint.kind {
                EndpointKind::Memory => Arc::new(MemoryObjectStore::new()),
                EndpointKind::Fs => {
                    let root = endpoint.root.as_ref().ok_or_else(|| {
                        HermesError::config(format!("endpoint {name}: fs endpoints need a root"))
                    })?;
                    std::fs::create_dir_all(root)
                        .map_err(|e| HermesError::io(format!("create {}", root.display()), e))?;
                    Arc::new(FsObjectStore::new(root))
                }
            };
            tracing::info!(endpoint = %name, kind = ?endpoint.kind, "registered storage endpoint");
            registry.insert(name.clone(), store);
        }
        Ok(registry)
    }

    pub fn with(mut self, name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        self.insert(name, store);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, store: Arc<dyn ObjectStore>) {
        self.stores.insert(name.into(), store);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ObjectStore>> {
        self.stores.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }
}
