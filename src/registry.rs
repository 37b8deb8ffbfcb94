// src/registry.rs

use anyhow::{bail, Result};
use indexmap::IndexMap;
use std::sync::Arc;

use crate::source_adapter::SourceAdapter;

/// Adapters by source key, in registration order.
///
/// Built once at startup and shared immutably with the aggregator.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: IndexMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> Result<()> {
        let key = adapter.key().to_string();
        if self.adapters.contains_key(&key) {
            bail!("Source {} is already registered", key);
        }
        self.adapters.insert(key, adapter);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    /// Keys of the sources able to price fee-on-transfer tokens.
    pub fn fee_on_transfer_keys(&self) -> Vec<String> {
        self.adapters
            .iter()
            .filter(|(_, adapter)| adapter.is_fee_on_transfer_supported())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn SourceAdapter>)> {
        self.adapters.iter()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
