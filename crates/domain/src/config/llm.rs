use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The global provider table: provider name → settings.
///
/// A `BTreeMap` keeps iteration order deterministic, which matters when an
/// agent has no preferences and the crew falls back to the first enabled
/// provider.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(flatten)]
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl ProvidersConfig {
    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.get(name)
    }

    /// Whether the named provider is both enabled and configured.
    pub fn usable(&self, name: &str) -> bool {
        self.get(name).is_some_and(|p| p.enabled && p.configured())
    }

    /// The first enabled-and-configured provider, in name order.
    pub fn first_usable(&self) -> Option<(&String, &ProviderSettings)> {
        self.providers
            .iter()
            .find(|(_, p)| p.enabled && p.configured())
    }
}

/// Per-provider connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Host for self-hosted backends (e.g. a local inference server).
    #[serde(default)]
    pub host: Option<String>,
    /// Full base URL override; takes precedence over `host`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    /// Model used when an agent preference leaves the model empty.
    #[serde(default)]
    pub default_model: String,
}

impl ProviderSettings {
    /// A provider is configured when it has credentials or an endpoint.
    pub fn configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
            || self.host.as_deref().is_some_and(|h| !h.is_empty())
            || self.base_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

fn d_true() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn table(json: serde_json::Value) -> ProvidersConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn provider_without_credentials_is_not_configured() {
        let cfg = table(serde_json::json!({
            "anthropic": {}
        }));
        assert!(!cfg.usable("anthropic"));
    }

    #[test]
    fn api_key_makes_provider_usable() {
        let cfg = table(serde_json::json!({
            "anthropic": { "api_key": "sk-test", "default_model": "claude-3-5-haiku" }
        }));
        assert!(cfg.usable("anthropic"));
    }

    #[test]
    fn host_alone_makes_provider_usable() {
        let cfg = table(serde_json::json!({
            "ollama": { "host": "http://localhost:11434" }
        }));
        assert!(cfg.usable("ollama"));
    }

    #[test]
    fn disabled_provider_is_not_usable() {
        let cfg = table(serde_json::json!({
            "anthropic": { "enabled": false, "api_key": "sk-test" }
        }));
        assert!(!cfg.usable("anthropic"));
        assert!(cfg.first_usable().is_none());
    }

    #[test]
    fn first_usable_respects_name_order() {
        let cfg = table(serde_json::json!({
            "zeta": { "api_key": "k" },
            "alpha": { "api_key": "k" },
            "beta": { "enabled": false, "api_key": "k" }
        }));
        let (name, _) = cfg.first_usable().unwrap();
        assert_eq!(name, "alpha");
    }

    #[test]
    fn unknown_provider_is_not_usable() {
        let cfg = ProvidersConfig::default();
        assert!(!cfg.usable("ghost"));
    }
}
