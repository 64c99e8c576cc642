use std::sync::Arc;

use serde::Deserialize;

use crate::{Schema, Store, backends::MemoryStore};

/// Configuration for the row store
///
/// Memory-backed store with a row limit:
/// ```ron
/// store: (
///     type: "Memory",
///     capacity: 100000,
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StoreConfig {
    /// Memory-based store (development/transient deployments)
    Memory(MemoryConfig),
}

/// Configuration for the memory-backed store
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryConfig {
    /// Maximum number of rows to keep (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory(MemoryConfig::default())
    }
}

impl StoreConfig {
    /// Build the configured store with tables laid out by `schema`
    #[must_use]
    pub fn build(&self, schema: &Schema) -> Arc<dyn Store> {
        match self {
            Self::Memory(MemoryConfig {
                capacity: Some(capacity),
            }) => Arc::new(MemoryStore::with_capacity(schema, *capacity)),
            Self::Memory(MemoryConfig { capacity: None }) => Arc::new(MemoryStore::new(schema)),
        }
    }
}
