//! Prometheus registry shared by an engine and its caller
//!
//! The engine registers its metric families once at start-up. Clones point at
//! the same families, which lets the CLI print the exposition after the engine
//! has shut down.

use parking_lot::RwLock;
use prometheus_client::encoding::text;
use prometheus_client::registry::Registry;
use std::fmt;
use std::sync::Arc;

use super::MetricsError;

/// Cloneable handle to one set of metric families
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    families: Arc<RwLock<Registry>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `register` with write access to the underlying families
    pub fn register_with<R>(&self, register: impl FnOnce(&mut Registry) -> R) -> R {
        register(&mut self.families.write())
    }

    /// Render every family in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut exposition = String::new();
        text::encode(&mut exposition, &self.families.read())
            .map_err(|e| MetricsError::EncodingError(e.to_string()))?;
        Ok(exposition)
    }

    fn shares_families_with(&self, other: &MetricsRegistry) -> bool {
        Arc::ptr_eq(&self.families, &other.families)
    }
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

impl PartialEq for MetricsRegistry {
    fn eq(&self, other: &Self) -> bool {
        self.shares_families_with(other)
    }
}
