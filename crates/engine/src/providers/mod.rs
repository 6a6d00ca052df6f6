//! Provider adapters and their registry.

pub mod anthropic;
pub mod openai;
pub mod openai_compat;

pub use {anthropic::AnthropicAdapter, openai::OpenAiAdapter};

use std::{collections::HashMap, sync::Arc};

use {secrecy::ExposeSecret, tracing::debug, weft_config::ProvidersConfig};

use crate::model::ProviderAdapter;

const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

/// Resolve an API key from config (Secret) or environment variable, keeping
/// the value wrapped in `Secret<String>` to avoid leaking it.
fn resolve_api_key(
    config: &ProvidersConfig,
    provider: &str,
    env_key: &str,
) -> Option<secrecy::Secret<String>> {
    config
        .get(provider)
        .and_then(|e| e.api_key.clone())
        .or_else(|| {
            std::env::var(env_key)
                .ok()
                .filter(|k| !k.is_empty())
                .map(secrecy::Secret::new)
        })
        .filter(|s| !s.expose_secret().is_empty())
}

/// An OpenAI-compatible endpoint that can be enabled purely through config.
struct CompatProvider {
    config_name: &'static str,
    env_key: &'static str,
    env_base_url_key: &'static str,
    default_base_url: &'static str,
}

const OPENAI_COMPAT_PROVIDERS: &[CompatProvider] = &[
    CompatProvider {
        config_name: "openrouter",
        env_key: "OPENROUTER_API_KEY",
        env_base_url_key: "OPENROUTER_BASE_URL",
        default_base_url: "https://openrouter.ai/api/v1",
    },
    CompatProvider {
        config_name: "groq",
        env_key: "GROQ_API_KEY",
        env_base_url_key: "GROQ_BASE_URL",
        default_base_url: "https://api.groq.com/openai/v1",
    },
    CompatProvider {
        config_name: "deepseek",
        env_key: "DEEPSEEK_API_KEY",
        env_base_url_key: "DEEPSEEK_BASE_URL",
        default_base_url: "https://api.deepseek.com/v1",
    },
    CompatProvider {
        config_name: "mistral",
        env_key: "MISTRAL_API_KEY",
        env_base_url_key: "MISTRAL_BASE_URL",
        default_base_url: "https://api.mistral.ai/v1",
    },
];

/// Adapters keyed by model id.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    /// Build a registry from provider config, registering every provider
    /// that is enabled and has a usable API key.
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let mut registry = Self::default();
        registry.register_anthropic(config);
        registry.register_openai(config);
        registry.register_openai_compatible(config);
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(model_id).cloned()
    }

    /// Registered model ids in sorted order.
    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    fn register_anthropic(&mut self, config: &ProvidersConfig) {
        if !config.is_enabled("anthropic") {
            return;
        }
        let Some(key) = resolve_api_key(config, "anthropic", "ANTHROPIC_API_KEY") else {
            return;
        };
        let base_url = config
            .get("anthropic")
            .and_then(|e| e.base_url.clone())
            .or_else(|| std::env::var("ANTHROPIC_BASE_URL").ok())
            .unwrap_or_else(|| "https://api.anthropic.com".into());
        let model = config
            .get("anthropic")
            .and_then(|e| e.model.clone())
            .unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.into());

        debug!(provider = "anthropic", model = %model, "registering provider adapter");
        self.register(Arc::new(AnthropicAdapter::new(key, model, base_url)));
    }

    fn register_openai(&mut self, config: &ProvidersConfig) {
        if !config.is_enabled("openai") {
            return;
        }
        let Some(key) = resolve_api_key(config, "openai", "OPENAI_API_KEY") else {
            return;
        };
        let base_url = config
            .get("openai")
            .and_then(|e| e.base_url.clone())
            .or_else(|| std::env::var("OPENAI_BASE_URL").ok())
            .unwrap_or_else(|| "https://api.openai.com/v1".into());
        let model = config
            .get("openai")
            .and_then(|e| e.model.clone())
            .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.into());

        debug!(provider = "openai", model = %model, "registering provider adapter");
        self.register(Arc::new(OpenAiAdapter::new(key, model, base_url)));
    }

    fn register_openai_compatible(&mut self, config: &ProvidersConfig) {
        for def in OPENAI_COMPAT_PROVIDERS {
            if !config.is_enabled(def.config_name) {
                continue;
            }
            let Some(key) = resolve_api_key(config, def.config_name, def.env_key) else {
                continue;
            };
            // Compatible endpoints have no sensible default model; the user
            // has to name one.
            let Some(model) = config.get(def.config_name).and_then(|e| e.model.clone()) else {
                debug!(
                    provider = def.config_name,
                    "provider has a key but no model configured, skipping"
                );
                continue;
            };
            let base_url = config
                .get(def.config_name)
                .and_then(|e| e.base_url.clone())
                .or_else(|| std::env::var(def.env_base_url_key).ok())
                .unwrap_or_else(|| def.default_base_url.into());

            debug!(provider = def.config_name, model = %model, "registering provider adapter");
            self.register(Arc::new(OpenAiAdapter::new_with_name(
                key,
                model,
                base_url,
                def.config_name.into(),
            )));
        }
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("models", &self.model_ids())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use weft_config::ProviderEntry;

    use super::*;

    fn entry(api_key: Option<&str>, model: Option<&str>) -> ProviderEntry {
        ProviderEntry {
            api_key: api_key.map(|k| secrecy::Secret::new(k.to_string())),
            model: model.map(ToString::to_string),
            ..ProviderEntry::default()
        }
    }

    fn config_with(name: &str, e: ProviderEntry) -> ProvidersConfig {
        let mut providers = HashMap::new();
        providers.insert(name.to_string(), e);
        ProvidersConfig { providers }
    }

    #[test]
    fn configured_anthropic_model_is_registered() {
        let config = config_with("anthropic", entry(Some("sk-test"), Some("claude-test")));
        let registry = AdapterRegistry::from_config(&config);
        let adapter = registry.get("claude-test").unwrap();
        assert_eq!(adapter.name(), "anthropic");
        assert!(adapter.supports_native_tools());
    }

    #[test]
    fn disabled_provider_is_skipped() {
        let mut e = entry(Some("sk-test"), Some("claude-test"));
        e.enabled = false;
        let config = config_with("anthropic", e);
        let registry = AdapterRegistry::from_config(&config);
        assert!(registry.get("claude-test").is_none());
    }

    #[test]
    fn compat_provider_needs_an_explicit_model() {
        let config = config_with("openrouter", entry(Some("sk-or"), None));
        let registry = AdapterRegistry::from_config(&config);
        assert!(registry.is_empty());

        let config = config_with("openrouter", entry(Some("sk-or"), Some("meta-llama/llama-3-70b")));
        let registry = AdapterRegistry::from_config(&config);
        let adapter = registry.get("meta-llama/llama-3-70b").unwrap();
        assert_eq!(adapter.name(), "openrouter");
    }

    #[test]
    fn blank_config_key_is_rejected() {
        let config = config_with("mistral", entry(Some(""), Some("mistral-large")));
        assert!(resolve_api_key(&config, "mistral", "WEFT_TEST_UNSET_KEY").is_none());
    }

    #[test]
    fn model_ids_are_sorted() {
        let mut providers = HashMap::new();
        providers.insert(
            "anthropic".to_string(),
            entry(Some("sk-a"), Some("claude-test")),
        );
        providers.insert("openai".to_string(), entry(Some("sk-o"), Some("gpt-test")));
        let registry = AdapterRegistry::from_config(&ProvidersConfig { providers });
        assert_eq!(registry.model_ids(), vec!["claude-test", "gpt-test"]);
    }
}
