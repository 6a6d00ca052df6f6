use std::pin::Pin;

use {async_trait::async_trait, futures::StreamExt, secrecy::ExposeSecret, tokio_stream::Stream};

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::model::{
    ChatMessage, CompletionResponse, ProviderAdapter, ProviderEvent, SamplingParams, ToolCall,
    Usage,
};

pub struct AnthropicAdapter {
    api_key: secrecy::Secret<String>,
    model: String,
    base_url: String,
    client: &'static reqwest::Client,
}

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

impl AnthropicAdapter {
    pub fn new(api_key: secrecy::Secret<String>, model: String, base_url: String) -> Self {
        Self {
            api_key,
            model,
            base_url,
            client: crate::shared_http_client(),
        }
    }

    fn build_body(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        tools: &[serde_json::Value],
        streaming: bool,
    ) -> serde_json::Value {
        let (system_text, anthropic_messages) = to_anthropic_messages(messages);

        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": anthropic_messages,
        });

        if streaming {
            body["stream"] = serde_json::json!(true);
        }
        if let Some(system) = system_text {
            body["system"] = serde_json::Value::String(system);
        }
        if let Some(temperature) = params.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if !params.stop.is_empty() {
            body["stop_sequences"] = serde_json::json!(params.stop);
        }
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(to_anthropic_tools(tools));
        }

        body
    }
}

/// Convert neutral tool declarations to Anthropic's format.
fn to_anthropic_tools(tools: &[serde_json::Value]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t["name"],
                "description": t["description"],
                "input_schema": t["parameters"],
            })
        })
        .collect()
}

/// Parse `tool_use` blocks out of a response content array.
fn parse_tool_calls(content: &[serde_json::Value]) -> Vec<ToolCall> {
    content
        .iter()
        .filter_map(|block| {
            if block["type"].as_str() == Some("tool_use") {
                Some(ToolCall {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: block["input"].clone(),
                })
            } else {
                None
            }
        })
        .collect()
}

/// Convert history to Anthropic wire format.
///
/// Returns `(system_text, messages)`. System messages are hoisted into the
/// top-level `system` field. Tool results become user messages carrying
/// `tool_result` blocks; results from one parallel batch are merged into a
/// single user message, which the API requires.
fn to_anthropic_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<serde_json::Value>) {
    let mut system_text: Option<String> = None;
    let mut out: Vec<serde_json::Value> = Vec::new();

    for msg in messages {
        match msg {
            ChatMessage::System { content } => {
                system_text = Some(match system_text {
                    Some(existing) => format!("{existing}\n\n{content}"),
                    None => content.clone(),
                });
            }
            ChatMessage::User { content } => {
                out.push(serde_json::json!({"role": "user", "content": content}));
            }
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                if tool_calls.is_empty() {
                    out.push(serde_json::json!({
                        "role": "assistant",
                        "content": content.as_deref().unwrap_or(""),
                    }));
                } else {
                    let mut blocks = Vec::new();
                    if let Some(text) = content
                        && !text.is_empty()
                    {
                        blocks.push(serde_json::json!({"type": "text", "text": text}));
                    }
                    for tc in tool_calls {
                        blocks.push(serde_json::json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    out.push(serde_json::json!({"role": "assistant", "content": blocks}));
                }
            }
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => {
                let block = serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": content,
                });
                let merged = out.last_mut().is_some_and(|prev| {
                    prev["role"] == "user"
                        && prev["content"]
                            .as_array()
                            .is_some_and(|blocks| blocks.iter().all(|b| b["type"] == "tool_result"))
                });
                if merged {
                    if let Some(blocks) = out
                        .last_mut()
                        .and_then(|prev| prev["content"].as_array_mut())
                    {
                        blocks.push(block);
                    }
                } else {
                    out.push(serde_json::json!({"role": "user", "content": [block]}));
                }
            }
        }
    }

    (system_text, out)
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn id(&self) -> &str {
        &self.model
    }

    fn supports_native_tools(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        tools: &[serde_json::Value],
    ) -> Result<CompletionResponse> {
        let body = self.build_body(messages, params, tools, false);

        debug!(
            model = %self.model,
            messages_count = messages.len(),
            tools_count = tools.len(),
            "anthropic complete request"
        );
        trace!(body = %serde_json::to_string(&body).unwrap_or_default(), "anthropic request body");

        let http_resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = http_resp.status();
        if !status.is_success() {
            let body_text = http_resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body_text, "anthropic API error");
            return Err(Error::transport(format!(
                "anthropic API error HTTP {status}: {body_text}"
            )));
        }

        let resp = http_resp.json::<serde_json::Value>().await?;
        trace!(response = %resp, "anthropic raw response");

        let content = resp["content"].as_array().cloned().unwrap_or_default();

        let text = content
            .iter()
            .filter_map(|b| {
                if b["type"].as_str() == Some("text") {
                    b["text"].as_str().map(ToString::to_string)
                } else {
                    None
                }
            })
            .reduce(|a, b| a + &b);
        let reasoning = content
            .iter()
            .filter_map(|b| {
                if b["type"].as_str() == Some("thinking") {
                    b["thinking"].as_str().map(ToString::to_string)
                } else {
                    None
                }
            })
            .reduce(|a, b| a + &b);

        let tool_calls = parse_tool_calls(&content);

        let usage = Usage {
            input_tokens: resp["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: resp["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            cache_read_tokens: resp["usage"]["cache_read_input_tokens"]
                .as_u64()
                .unwrap_or(0) as u32,
            cache_write_tokens: resp["usage"]["cache_creation_input_tokens"]
                .as_u64()
                .unwrap_or(0) as u32,
        };

        Ok(CompletionResponse {
            text,
            reasoning,
            tool_calls,
            usage,
        })
    }

    fn stream(
        &self,
        messages: Vec<ChatMessage>,
        params: SamplingParams,
        tools: Vec<serde_json::Value>,
    ) -> Pin<Box<dyn Stream<Item = ProviderEvent> + Send + '_>> {
        Box::pin(async_stream::stream! {
            let body = self.build_body(&messages, &params, &tools, true);

            debug!(
                model = %self.model,
                messages_count = messages.len(),
                tools_count = tools.len(),
                "anthropic stream request"
            );
            trace!(body = %serde_json::to_string(&body).unwrap_or_default(), "anthropic stream request body");

            let resp = match self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", self.api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
            {
                Ok(r) => {
                    if let Err(e) = r.error_for_status_ref() {
                        let status = e.status().map(|s| s.as_u16()).unwrap_or(0);
                        let body_text = r.text().await.unwrap_or_default();
                        yield ProviderEvent::Error(format!("HTTP {status}: {body_text}"));
                        return;
                    }
                    r
                }
                Err(e) => {
                    yield ProviderEvent::Error(e.to_string());
                    return;
                }
            };

            let mut byte_stream = resp.bytes_stream();
            let mut buf = String::new();
            let mut usage = Usage::default();

            // Index of the content block currently streaming tool input.
            let mut tool_block_index: Option<usize> = None;

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield ProviderEvent::Error(e.to_string());
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find("\n\n") {
                    let frame = buf[..pos].to_string();
                    buf = buf[pos + 2..].to_string();

                    for line in frame.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        let Ok(evt) = serde_json::from_str::<serde_json::Value>(data) else {
                            continue;
                        };

                        match evt["type"].as_str().unwrap_or("") {
                            "message_start" => {
                                let u = &evt["message"]["usage"];
                                if let Some(v) = u["input_tokens"].as_u64() {
                                    usage.input_tokens = v as u32;
                                }
                                if let Some(v) = u["cache_read_input_tokens"].as_u64() {
                                    usage.cache_read_tokens = v as u32;
                                }
                                if let Some(v) = u["cache_creation_input_tokens"].as_u64() {
                                    usage.cache_write_tokens = v as u32;
                                }
                            }
                            "content_block_start" => {
                                let index = evt["index"].as_u64().unwrap_or(0) as usize;
                                let content_block = &evt["content_block"];
                                if content_block["type"].as_str() == Some("tool_use") {
                                    let id = content_block["id"].as_str().unwrap_or("").to_string();
                                    let name = content_block["name"].as_str().unwrap_or("").to_string();
                                    tool_block_index = Some(index);
                                    yield ProviderEvent::ToolCallStart { id, name, index };
                                }
                            }
                            "content_block_delta" => {
                                let delta = &evt["delta"];
                                match delta["type"].as_str().unwrap_or("") {
                                    "text_delta" => {
                                        if let Some(text) = delta["text"].as_str()
                                            && !text.is_empty()
                                        {
                                            yield ProviderEvent::Delta(text.to_string());
                                        }
                                    }
                                    "thinking_delta" => {
                                        if let Some(thinking) = delta["thinking"].as_str()
                                            && !thinking.is_empty()
                                        {
                                            yield ProviderEvent::Reasoning(thinking.to_string());
                                        }
                                    }
                                    "input_json_delta" => {
                                        if let Some(partial) = delta["partial_json"].as_str() {
                                            let index = evt["index"].as_u64().unwrap_or(0) as usize;
                                            yield ProviderEvent::ToolCallArgumentsDelta {
                                                index,
                                                delta: partial.to_string(),
                                            };
                                        }
                                    }
                                    _ => {}
                                }
                            }
                            "content_block_stop" => {
                                let index = evt["index"].as_u64().unwrap_or(0) as usize;
                                // Only tool_use blocks need a completion event.
                                if tool_block_index == Some(index) {
                                    yield ProviderEvent::ToolCallComplete { index };
                                    tool_block_index = None;
                                }
                            }
                            "message_delta" => {
                                let u = &evt["usage"];
                                if let Some(v) = u["output_tokens"].as_u64() {
                                    usage.output_tokens = v as u32;
                                }
                                if let Some(v) = u["cache_read_input_tokens"].as_u64() {
                                    usage.cache_read_tokens = v as u32;
                                }
                                if let Some(v) = u["cache_creation_input_tokens"].as_u64() {
                                    usage.cache_write_tokens = v as u32;
                                }
                            }
                            "message_stop" => {
                                yield ProviderEvent::Done(usage.clone());
                                return;
                            }
                            "error" => {
                                let msg = evt["error"]["message"].as_str().unwrap_or("unknown error");
                                yield ProviderEvent::Error(msg.to_string());
                                return;
                            }
                            _ => {}
                        }
                    }
                }
            }
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use {
        axum::{extract::Request, routing::post, Router},
        secrecy::Secret,
        tokio_stream::StreamExt,
    };

    use super::*;

    type Captured = Arc<Mutex<Vec<serde_json::Value>>>;

    async fn start_mock(payload: String, content_type: &'static str) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let captured_clone = captured.clone();

        let app = Router::new().route(
            "/v1/messages",
            post(move |req: Request| {
                let cap = captured_clone.clone();
                let payload = payload.clone();
                async move {
                    let body_bytes = axum::body::to_bytes(req.into_body(), 1024 * 1024)
                        .await
                        .unwrap_or_default();
                    if let Ok(body) = serde_json::from_slice(&body_bytes) {
                        cap.lock().unwrap().push(body);
                    }
                    axum::response::Response::builder()
                        .header("content-type", content_type)
                        .body(axum::body::Body::from(payload))
                        .unwrap()
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), captured)
    }

    fn adapter(base_url: &str) -> AnthropicAdapter {
        AnthropicAdapter::new(
            Secret::new("test-key".to_string()),
            "claude-sonnet-4-5".to_string(),
            base_url.to_string(),
        )
    }

    #[tokio::test]
    async fn stream_emits_thinking_then_text() {
        let payload = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":10}}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"maybe 2\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"text_delta\",\"text\":\"it's 4\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":6}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        )
        .to_string();
        let (base_url, _) = start_mock(payload, "text/event-stream").await;

        let adapter = adapter(&base_url);
        let mut stream = adapter.stream(
            vec![ChatMessage::user("2+2?")],
            SamplingParams::default(),
            vec![],
        );

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert!(matches!(&events[0], ProviderEvent::Reasoning(s) if s == "maybe 2"));
        assert!(matches!(&events[1], ProviderEvent::Delta(s) if s == "it's 4"));
        assert!(matches!(
            &events[2],
            ProviderEvent::Done(u) if u.input_tokens == 10 && u.output_tokens == 6
        ));
    }

    #[tokio::test]
    async fn stream_surfaces_tool_use_blocks() {
        let payload = concat!(
            "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"search\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"query\\\":\\\"rust\\\"}\"}}\n\n",
            "data: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        )
        .to_string();
        let (base_url, _) = start_mock(payload, "text/event-stream").await;

        let adapter = adapter(&base_url);
        let mut stream = adapter.stream(
            vec![ChatMessage::user("search rust")],
            SamplingParams::default(),
            vec![],
        );

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert!(matches!(
            &events[0],
            ProviderEvent::ToolCallStart { id, name, index: 1 }
            if id == "toolu_1" && name == "search"
        ));
        assert!(matches!(
            &events[1],
            ProviderEvent::ToolCallArgumentsDelta { index: 1, .. }
        ));
        assert!(matches!(&events[2], ProviderEvent::ToolCallComplete { index: 1 }));
        assert!(matches!(&events[3], ProviderEvent::Done(_)));
    }

    #[tokio::test]
    async fn request_body_hoists_system_and_converts_tools() {
        let (base_url, captured) =
            start_mock("data: {\"type\":\"message_stop\"}\n\n".to_string(), "text/event-stream")
                .await;

        let adapter = adapter(&base_url);
        let tools = vec![serde_json::json!({
            "name": "search",
            "description": "Search the web",
            "parameters": {"type": "object", "properties": {}}
        })];
        let params = SamplingParams {
            temperature: None,
            max_tokens: None,
            stop: vec!["<tool_result>".to_string()],
        };
        let mut stream = adapter.stream(
            vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("hi"),
            ],
            params,
            tools,
        );
        while stream.next().await.is_some() {}

        let bodies = captured.lock().unwrap();
        let body = &bodies[0];
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stop_sequences"][0], "<tool_result>");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[tokio::test]
    async fn complete_parses_thinking_text_and_tool_use() {
        let payload = serde_json::json!({
            "content": [
                {"type": "thinking", "thinking": "maybe 2"},
                {"type": "text", "text": "it's 4"},
                {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"query": "rust"}}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 8}
        })
        .to_string();
        let (base_url, _) = start_mock(payload, "application/json").await;

        let adapter = adapter(&base_url);
        let resp = adapter
            .complete(&[ChatMessage::user("2+2?")], &SamplingParams::default(), &[])
            .await
            .unwrap();

        assert_eq!(resp.text.as_deref(), Some("it's 4"));
        assert_eq!(resp.reasoning.as_deref(), Some("maybe 2"));
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "toolu_1");
        assert_eq!(resp.usage.output_tokens, 8);
    }

    #[test]
    fn history_merges_parallel_tool_results() {
        let messages = vec![
            ChatMessage::assistant_with_tools(
                Some("checking".into()),
                vec![
                    ToolCall {
                        id: "toolu_1".into(),
                        name: "search".into(),
                        arguments: serde_json::json!({"q": 1}),
                    },
                    ToolCall {
                        id: "toolu_2".into(),
                        name: "search".into(),
                        arguments: serde_json::json!({"q": 2}),
                    },
                ],
            ),
            ChatMessage::tool("toolu_1", "first"),
            ChatMessage::tool("toolu_2", "second"),
        ];

        let (system, out) = to_anthropic_messages(&messages);
        assert!(system.is_none());
        assert_eq!(out.len(), 2);
        let results = out[1]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "toolu_1");
        assert_eq!(results[1]["tool_use_id"], "toolu_2");
    }

    #[test]
    fn history_keeps_text_before_tool_use_blocks() {
        let messages = vec![ChatMessage::assistant_with_tools(
            Some("let me check".into()),
            vec![ToolCall {
                id: "toolu_1".into(),
                name: "search".into(),
                arguments: serde_json::json!({}),
            }],
        )];
        let (_, out) = to_anthropic_messages(&messages);
        let blocks = out[0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "tool_use");
    }
}
