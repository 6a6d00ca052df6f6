//! Capability registry: the set of tools a turn may invoke.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One piece of a capability's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputPart {
    Text { text: String },
    Binary { media_type: String, data: Vec<u8> },
}

/// Result of invoking a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    #[serde(default)]
    pub is_error: bool,
    pub content: Vec<OutputPart>,
}

impl CapabilityOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            is_error: false,
            content: vec![OutputPart::Text { text: text.into() }],
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            content: vec![OutputPart::Text {
                text: message.into(),
            }],
        }
    }

    /// Flatten the output to plain text for message history. Binary parts
    /// are replaced with a short placeholder.
    pub fn rendered(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if !out.is_empty() {
                out.push('\n');
            }
            match part {
                OutputPart::Text { text } => out.push_str(text),
                OutputPart::Binary { media_type, data } => {
                    out.push_str(&format!("[binary {} ({} bytes)]", media_type, data.len()));
                }
            }
        }
        out
    }
}

/// A tool the engine can invoke on behalf of the model.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Stable identity used in tool schemas and invocation requests.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn invoke(&self, arguments: serde_json::Value) -> anyhow::Result<CapabilityOutput>;
}

/// Lookup table of capabilities by identity.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Box<dyn Capability>) {
        let capability: Arc<dyn Capability> = Arc::from(capability);
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    /// Registered identities in sorted order.
    pub fn identities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    /// Declarations in the neutral `{name, description, parameters}` shape
    /// that adapters translate to their provider's native schema.
    pub fn schemas(&self) -> Vec<serde_json::Value> {
        self.identities()
            .iter()
            .filter_map(|name| self.capabilities.get(name))
            .map(|cap| {
                serde_json::json!({
                    "name": cap.name(),
                    "description": cap.description(),
                    "parameters": cap.parameters_schema(),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.identities())
            .finish()
    }
}
