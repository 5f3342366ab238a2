//! Backend client cache.
//!
//! Two agents whose resolved [`ClientKey`]s match share one backend client
//! (never middleware, which is per agent). The cache is created once per
//! crew rather than globally so tests stay isolated.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crewd_domain::error::Result;

use crate::traits::LlmClient;

/// Identifies one concrete backend binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub host: String,
    pub base_url: String,
    pub organization: String,
}

pub struct ClientCache {
    inner: RwLock<HashMap<ClientKey, Arc<dyn LlmClient>>>,
}

impl Default for ClientCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the client for `key`, building one if absent.
    ///
    /// The builder runs *outside* the write lock so client construction
    /// (which may do network I/O) never blocks other lookups. If a
    /// concurrent caller inserted first, the freshly built client is
    /// discarded and the winner's instance returned.
    pub fn get_or_create<F>(&self, key: ClientKey, build: F) -> Result<Arc<dyn LlmClient>>
    where
        F: FnOnce() -> Result<Arc<dyn LlmClient>>,
    {
        if let Some(existing) = self.inner.read().get(&key) {
            return Ok(existing.clone());
        }

        let fresh = build()?;

        let mut map = self.inner.write();
        if let Some(existing) = map.get(&key) {
            return Ok(existing.clone());
        }
        map.insert(key, fresh.clone());
        Ok(fresh)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
