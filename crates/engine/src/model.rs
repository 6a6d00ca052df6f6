use std::pin::Pin;

use {async_trait::async_trait, serde::Serialize, tokio_stream::Stream};

use crate::error::Result;

// ── Typed chat messages ─────────────────────────────────────────────────────

/// Typed chat message for the provider adapter interface.
///
/// Only contains backend-relevant fields. UI metadata (timestamps, model
/// names, token counts) cannot exist here, so it can never leak into
/// provider API requests.
#[derive(Debug, Clone)]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// Create an assistant message with text only (no tool calls).
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: vec![],
        }
    }

    /// Create an assistant message with tool calls (and optional text).
    pub fn assistant_with_tools(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            content,
            tool_calls,
        }
    }

    /// Create a tool result message.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }

    /// Convert to OpenAI-compatible JSON format.
    ///
    /// Used by providers that speak the OpenAI Chat Completions API.
    #[must_use]
    pub fn to_openai_value(&self) -> serde_json::Value {
        match self {
            ChatMessage::System { content } => {
                serde_json::json!({ "role": "system", "content": content })
            },
            ChatMessage::User { content } => {
                serde_json::json!({ "role": "user", "content": content })
            },
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                if tool_calls.is_empty() {
                    serde_json::json!({
                        "role": "assistant",
                        "content": content.as_deref().unwrap_or(""),
                    })
                } else {
                    let tc_json: Vec<serde_json::Value> = tool_calls
                        .iter()
                        .map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string(),
                                }
                            })
                        })
                        .collect();
                    let mut msg = serde_json::json!({
                        "role": "assistant",
                        "tool_calls": tc_json,
                    });
                    if let Some(text) = content {
                        msg["content"] = serde_json::Value::String(text.clone());
                    }
                    msg
                }
            },
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => {
                serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content,
                })
            },
        }
    }
}

/// A native tool call as it appears in history (backend id + name + args).
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

// ── Tool invocation lifecycle ───────────────────────────────────────────────

/// Keep generated invocation IDs OpenAI-compatible (`maxLength: 40`).
const INVOCATION_ID_MAX_LEN: usize = 40;

/// Generate a fresh invocation id, unique across turns.
pub fn new_invocation_id() -> String {
    let mut id = format!("inv_{}", uuid::Uuid::new_v4().simple());
    id.truncate(INVOCATION_ID_MAX_LEN);
    id
}

/// One detected tool invocation, tracked through its lifecycle.
///
/// `id` is generated at detection time; tool chunks correlate on it.
/// `originating_call_id` holds the call id the backend attached, when one
/// exists, and is what the matching tool-result history entry must echo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocationRequest {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub originating_call_id: Option<String>,
    pub identity: String,
    pub arguments: serde_json::Value,
    pub status: InvocationStatus,
}

impl ToolInvocationRequest {
    /// Create a pending request with a freshly generated id.
    pub fn new(
        identity: impl Into<String>,
        arguments: serde_json::Value,
        originating_call_id: Option<String>,
    ) -> Self {
        Self {
            id: new_invocation_id(),
            originating_call_id,
            identity: identity.into(),
            arguments,
            status: InvocationStatus::Pending,
        }
    }

    /// The id the tool-result history entry must carry.
    pub fn history_id(&self) -> &str {
        self.originating_call_id.as_deref().unwrap_or(&self.id)
    }
}

/// Lifecycle of a tool invocation: created pending, moves to invoking on
/// dispatch, terminal at done/error on resolver response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Pending,
    Invoking,
    Done,
    Error,
}

/// Parse finalized tool-call arguments, falling back to a raw string capture
/// when the accumulated fragments are not valid JSON.
pub fn parse_arguments_lenient(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(trimmed)
        .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()))
}

// ── Provider events ─────────────────────────────────────────────────────────

/// Normalized events produced by provider adapters during streaming.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Plain text delta. May still contain reasoning-tag markup; the
    /// orchestration loop routes it through the tag scanner.
    Delta(String),
    /// Backend-native reasoning delta (e.g. Anthropic thinking blocks).
    /// Bypasses the tag scanner.
    Reasoning(String),
    /// A native tool call has started.
    ToolCallStart {
        /// Call ID assigned by the backend.
        id: String,
        /// Tool name being called.
        name: String,
        /// Index of this tool call in the response (0-based).
        index: usize,
    },
    /// Streaming delta for tool call arguments (JSON fragment).
    ToolCallArgumentsDelta { index: usize, delta: String },
    /// A tool call's arguments are complete.
    ToolCallComplete { index: usize },
    /// Stream completed successfully.
    Done(Usage),
    /// An error occurred.
    Error(String),
}

/// Per-round sampling controls passed through to the backend.
#[derive(Debug, Clone, Default)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Stop sequences. In textual tool mode the loop appends the tool-result
    /// marker here so backends that honor stops cut the model off before it
    /// fabricates a result.
    pub stop: Vec<String>,
}

/// Provider adapter: one implementation per backend family.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider family name (e.g. "anthropic", "openai").
    fn name(&self) -> &str;

    /// Model identifier (e.g. "claude-sonnet-4-20250514", "gpt-4o").
    fn id(&self) -> &str;

    /// Whether this backend speaks a native function-calling protocol.
    /// Defaults to false; adapters that translate the `tools` parameter
    /// should override this to return true.
    fn supports_native_tools(&self) -> bool {
        false
    }

    /// Single-shot completion.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        tools: &[serde_json::Value],
    ) -> Result<CompletionResponse>;

    /// Stream a completion, yielding normalized provider events.
    ///
    /// `tools` carries `{name, description, parameters}` schemas; each
    /// adapter translates them into its backend's advertisement shape. An
    /// empty slice disables native tool calling for the round.
    fn stream(
        &self,
        messages: Vec<ChatMessage>,
        params: SamplingParams,
        tools: Vec<serde_json::Value>,
    ) -> Pin<Box<dyn Stream<Item = ProviderEvent> + Send + '_>>;
}

/// Response from a single-shot completion call.
#[derive(Debug)]
pub struct CompletionResponse {
    pub text: Option<String>,
    /// Backend-native reasoning, when the backend separates it from text.
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

/// Token usage for one backend call, aggregated per turn by the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn system_message() {
        let msg = ChatMessage::system("You are helpful.");
        assert!(matches!(msg, ChatMessage::System { content } if content == "You are helpful."));
    }

    #[test]
    fn tool_message() {
        let msg = ChatMessage::tool("call_1", "result");
        assert!(
            matches!(msg, ChatMessage::Tool { tool_call_id, content } if tool_call_id == "call_1" && content == "result")
        );
    }

    #[test]
    fn to_openai_assistant_with_tools() {
        let msg = ChatMessage::assistant_with_tools(Some("thinking".into()), vec![ToolCall {
            id: "call_1".into(),
            name: "exec".into(),
            arguments: serde_json::json!({"cmd": "ls"}),
        }]);
        let val = msg.to_openai_value();
        assert_eq!(val["role"], "assistant");
        assert_eq!(val["content"], "thinking");
        let tcs = val["tool_calls"].as_array().unwrap();
        assert_eq!(tcs.len(), 1);
        assert_eq!(tcs[0]["id"], "call_1");
        assert_eq!(tcs[0]["function"]["name"], "exec");
    }

    #[test]
    fn to_openai_assistant_without_tools_has_no_array() {
        let val = ChatMessage::assistant("hello").to_openai_value();
        assert_eq!(val["content"], "hello");
        assert!(val.get("tool_calls").is_none());
    }

    #[test]
    fn invocation_ids_are_unique_and_bounded() {
        let a = new_invocation_id();
        let b = new_invocation_id();
        assert_ne!(a, b);
        assert!(a.len() <= INVOCATION_ID_MAX_LEN);
        assert!(a.starts_with("inv_"));
    }

    #[test]
    fn request_starts_pending_with_fresh_id() {
        let req = ToolInvocationRequest::new("search", serde_json::json!({"q": "x"}), None);
        assert_eq!(req.status, InvocationStatus::Pending);
        assert!(!req.id.is_empty());
        assert_eq!(req.history_id(), req.id);
    }

    #[test]
    fn history_id_prefers_originating_call_id() {
        let req = ToolInvocationRequest::new(
            "search",
            serde_json::json!({}),
            Some("call_abc".into()),
        );
        assert_eq!(req.history_id(), "call_abc");
        assert_ne!(req.id, "call_abc");
    }

    #[test]
    fn lenient_arguments_parse_json() {
        let v = parse_arguments_lenient(r#"{"city": "Paris"}"#);
        assert_eq!(v["city"], "Paris");
    }

    #[test]
    fn lenient_arguments_fall_back_to_raw_string() {
        let v = parse_arguments_lenient("not-json{");
        assert_eq!(v, serde_json::Value::String("not-json{".into()));
    }

    #[test]
    fn lenient_arguments_empty_is_object() {
        assert_eq!(parse_arguments_lenient("  "), serde_json::json!({}));
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.add(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 2,
            cache_write_tokens: 1,
        });
        total.add(&Usage {
            input_tokens: 3,
            output_tokens: 4,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        });
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 9);
        assert_eq!(total.cache_read_tokens, 2);
        assert_eq!(total.cache_write_tokens, 1);
    }
}
