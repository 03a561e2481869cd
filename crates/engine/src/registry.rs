//! Compile-time processor registry.
//!
//! Embedding code registers a factory per processor key at startup and
//! resolves the key from configuration, instead of loading implementations by
//! name at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use objproc_core::ProcessableObject;

use crate::config::{ConfigError, EngineConfig};
use crate::processor::ObjectProcessor;

/// Builds a processor from the engine configuration.
pub type ProcessorFactory<O> =
    Box<dyn Fn(&EngineConfig) -> Arc<dyn ObjectProcessor<O>> + Send + Sync>;

/// Map from processor key to factory.
pub struct ProcessorRegistry<O: ProcessableObject> {
    factories: HashMap<String, ProcessorFactory<O>>,
}

impl<O: ProcessableObject> Default for ProcessorRegistry<O> {
    fn default() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }
}

impl<O: ProcessableObject> std::fmt::Debug for ProcessorRegistry<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.factories.keys().collect();
        keys.sort();
        f.debug_struct("ProcessorRegistry").field("keys", &keys).finish()
    }
}

impl<O: ProcessableObject> ProcessorRegistry<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under an exact key, a `prefix.*` pattern or `*`.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&EngineConfig) -> Arc<dyn ObjectProcessor<O>> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Box::new(factory));
    }

    pub fn with<F>(mut self, key: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&EngineConfig) -> Arc<dyn ObjectProcessor<O>> + Send + Sync + 'static,
    {
        self.register(key, factory);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factory_for(key).is_some()
    }

    /// Build the processor registered for `key`.
    pub fn resolve(
        &self,
        key: &str,
        config: &EngineConfig,
    ) -> Result<Arc<dyn ObjectProcessor<O>>, ConfigError> {
        self.factory_for(key)
            .map(|factory| factory(config))
            .ok_or_else(|| ConfigError::UnknownProcessor(key.to_string()))
    }

    fn factory_for(&self, key: &str) -> Option<&ProcessorFactory<O>> {
        if let Some(f) = self.factories.get(key) {
            return Some(f);
        }

        // Category match ("reports.*" matches "reports.monthly"); longest prefix wins.
        let category = self
            .factories
            .iter()
            .filter_map(|(pattern, f)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = key.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), f))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, f)| f);
        if category.is_some() {
            return category;
        }

        self.factories.get("*")
    }
}
