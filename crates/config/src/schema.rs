//! Config schema types (chat loop, providers).

use std::collections::HashMap;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    pub chat: ChatConfig,
    pub providers: ProvidersConfig,
}

/// Chat loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Stream responses chunk by chunk. Defaults to true.
    pub stream: bool,
    /// How tool calls reach the model for a turn.
    pub tool_mode: ToolMode,
    /// Maximum provider round-trips per turn (0 = use default). Default 25.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// Tag pair delimiting reasoning in streamed model output.
    pub reasoning_tags: ReasoningTags,
    /// Tool whose invocation marks the turn as finished.
    #[serde(default = "default_completion_tool")]
    pub completion_tool: String,
    /// Maximum bytes for a single tool result before truncation. Default 50KB.
    #[serde(default = "default_max_tool_result_bytes")]
    pub max_tool_result_bytes: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            stream: true,
            tool_mode: ToolMode::default(),
            max_tool_iterations: default_max_tool_iterations(),
            reasoning_tags: ReasoningTags::default(),
            completion_tool: default_completion_tool(),
            max_tool_result_bytes: default_max_tool_result_bytes(),
        }
    }
}

/// How tool definitions reach the model and how calls come back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    /// Advertise tools through the provider's function-calling API.
    #[default]
    Native,
    /// Describe tools in the system prompt and parse markers out of the reply.
    Textual,
}

/// Tag pair that delimits reasoning in streamed output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningTags {
    pub open: String,
    pub close: String,
}

impl Default for ReasoningTags {
    fn default() -> Self {
        Self {
            open: "<think>".into(),
            close: "</think>".into(),
        }
    }
}

fn default_max_tool_iterations() -> usize {
    25
}

fn default_completion_tool() -> String {
    "attempt_completion".into()
}

fn default_max_tool_result_bytes() -> usize {
    50_000
}

/// Per-provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider-specific settings keyed by provider name.
    /// Known keys: "anthropic", "openai"
    #[serde(flatten)]
    pub providers: HashMap<String, ProviderEntry>,
}

impl ProvidersConfig {
    /// Check if a provider is enabled (defaults to true if not configured).
    pub fn is_enabled(&self, name: &str) -> bool {
        self.providers.get(name).is_none_or(|e| e.enabled)
    }

    /// Get the configured entry for a provider, if any.
    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.get(name)
    }
}

/// Configuration for a single LLM provider.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEntry {
    /// Whether this provider is enabled. Defaults to true.
    pub enabled: bool,

    /// Override the API key (optional; env var still takes precedence if set).
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key: Option<Secret<String>>,

    /// Override the base URL.
    pub base_url: Option<String>,

    /// Default model ID for this provider.
    pub model: Option<String>,
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("enabled", &self.enabled)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: None,
            model: None,
        }
    }
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = WeftConfig::default();
        assert!(cfg.chat.stream);
        assert_eq!(cfg.chat.tool_mode, ToolMode::Native);
        assert_eq!(cfg.chat.max_tool_iterations, 25);
        assert_eq!(cfg.chat.reasoning_tags.open, "<think>");
        assert_eq!(cfg.chat.reasoning_tags.close, "</think>");
        assert_eq!(cfg.chat.completion_tool, "attempt_completion");
        assert!(cfg.providers.providers.is_empty());
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: WeftConfig = toml::from_str(
            r#"
            [chat]
            tool_mode = "textual"
            max_tool_iterations = 5

            [providers.openai]
            api_key = "sk-test"
            model = "gpt-4.1-mini"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.chat.tool_mode, ToolMode::Textual);
        assert_eq!(cfg.chat.max_tool_iterations, 5);
        // Untouched fields keep their defaults.
        assert!(cfg.chat.stream);
        assert_eq!(cfg.chat.completion_tool, "attempt_completion");
        let openai = cfg.providers.get("openai").unwrap();
        assert!(openai.enabled);
        assert_eq!(openai.api_key.as_ref().unwrap().expose_secret(), "sk-test");
        assert_eq!(openai.model.as_deref(), Some("gpt-4.1-mini"));
    }

    #[test]
    fn provider_enabled_defaults_to_true_when_absent() {
        let cfg = WeftConfig::default();
        assert!(cfg.providers.is_enabled("anthropic"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let entry = ProviderEntry {
            api_key: Some(Secret::new("sk-secret".into())),
            ..ProviderEntry::default()
        };
        let dump = format!("{entry:?}");
        assert!(dump.contains("[REDACTED]"));
        assert!(!dump.contains("sk-secret"));
    }
}
