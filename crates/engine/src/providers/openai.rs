use std::{
    collections::{HashMap, HashSet},
    pin::Pin,
};

use {async_trait::async_trait, futures::StreamExt, secrecy::ExposeSecret, tokio_stream::Stream};

use tracing::{debug, trace, warn};

use {
    super::openai_compat::{
        finalize_stream, parse_tool_calls, process_openai_sse_line, to_openai_tools, SseLineResult,
        StreamingToolState,
    },
    crate::error::{Error, Result},
    crate::model::{
        ChatMessage, CompletionResponse, ProviderAdapter, ProviderEvent, SamplingParams, Usage,
    },
};

/// Adapter for the OpenAI chat-completions API and compatible endpoints.
pub struct OpenAiAdapter {
    api_key: secrecy::Secret<String>,
    model: String,
    base_url: String,
    provider_name: String,
    client: &'static reqwest::Client,
}

const MAX_TOOL_CALL_ID_LEN: usize = 40;

impl OpenAiAdapter {
    pub fn new(api_key: secrecy::Secret<String>, model: String, base_url: String) -> Self {
        Self::new_with_name(api_key, model, base_url, "openai".into())
    }

    /// Build an adapter for another OpenAI-compatible endpoint under its own
    /// provider name.
    pub fn new_with_name(
        api_key: secrecy::Secret<String>,
        model: String,
        base_url: String,
        provider_name: String,
    ) -> Self {
        Self {
            api_key,
            model,
            base_url,
            provider_name,
            client: crate::shared_http_client(),
        }
    }

    /// Serialize history for the request, remapping any tool call id the API
    /// would reject (too long or with illegal characters). The remap is
    /// applied consistently to assistant `tool_calls` entries and to the
    /// `tool_call_id` of the matching result messages.
    fn serialize_messages_for_request(&self, messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        let mut remapped = HashMap::new();
        let mut used = HashSet::new();
        let mut out = Vec::with_capacity(messages.len());

        for message in messages {
            let mut value = message.to_openai_value();

            if let Some(tool_calls) = value
                .get_mut("tool_calls")
                .and_then(serde_json::Value::as_array_mut)
            {
                for tool_call in tool_calls {
                    let Some(id) = tool_call.get("id").and_then(serde_json::Value::as_str) else {
                        continue;
                    };
                    let mapped = assign_tool_call_id(id, &mut remapped, &mut used);
                    tool_call["id"] = serde_json::Value::String(mapped);
                }
            } else if value.get("role").and_then(serde_json::Value::as_str) == Some("tool")
                && let Some(id) = value
                    .get("tool_call_id")
                    .and_then(serde_json::Value::as_str)
            {
                let mapped = remapped
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| assign_tool_call_id(id, &mut remapped, &mut used));
                value["tool_call_id"] = serde_json::Value::String(mapped);
            }

            out.push(value);
        }

        out
    }

    fn build_body(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        tools: &[serde_json::Value],
        streaming: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": self.serialize_messages_for_request(messages),
        });

        if streaming {
            body["stream"] = serde_json::json!(true);
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if let Some(temperature) = params.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = params.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !params.stop.is_empty() {
            body["stop"] = serde_json::json!(params.stop);
        }
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(to_openai_tools(tools));
        }

        body
    }
}

fn short_stable_hash(value: &str) -> String {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn base_tool_call_id(raw: &str) -> String {
    let mut cleaned: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        cleaned = "call".to_string();
    }

    if cleaned.len() <= MAX_TOOL_CALL_ID_LEN {
        return cleaned;
    }

    let hash = short_stable_hash(raw);
    let keep = MAX_TOOL_CALL_ID_LEN.saturating_sub(hash.len() + 1);
    cleaned.truncate(keep);
    if cleaned.is_empty() {
        return format!("call-{hash}");
    }
    format!("{cleaned}-{hash}")
}

fn disambiguate_tool_call_id(base: &str, nonce: usize) -> String {
    let suffix = format!("-{nonce}");
    let keep = MAX_TOOL_CALL_ID_LEN.saturating_sub(suffix.len());

    let mut value = base.to_string();
    if value.len() > keep {
        value.truncate(keep);
    }
    format!("{value}{suffix}")
}

fn assign_tool_call_id(
    raw: &str,
    remapped: &mut HashMap<String, String>,
    used: &mut HashSet<String>,
) -> String {
    if let Some(existing) = remapped.get(raw) {
        return existing.clone();
    }

    let base = base_tool_call_id(raw);
    let mut candidate = base.clone();
    let mut nonce = 1usize;
    while used.contains(&candidate) {
        candidate = disambiguate_tool_call_id(&base, nonce);
        nonce = nonce.saturating_add(1);
    }

    used.insert(candidate.clone());
    remapped.insert(raw.to_string(), candidate.clone());
    candidate
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.provider_name
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
            "openai complete request"
        );
        trace!(body = %serde_json::to_string(&body).unwrap_or_default(), "openai request body");

        let http_resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = http_resp.status();
        if !status.is_success() {
            let body_text = http_resp.text().await.unwrap_or_default();
            warn!(status = %status, model = %self.model, body = %body_text, "openai API error");
            return Err(Error::transport(format!(
                "openai API error HTTP {status}: {body_text}"
            )));
        }

        let resp = http_resp.json::<serde_json::Value>().await?;
        trace!(response = %resp, "openai raw response");

        let message = &resp["choices"][0]["message"];
        let text = message["content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(ToString::to_string);
        let reasoning = message["reasoning_content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(ToString::to_string);
        let tool_calls = parse_tool_calls(message);

        let u = &resp["usage"];
        let usage = Usage {
            input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
            cache_read_tokens: u["prompt_tokens_details"]["cached_tokens"]
                .as_u64()
                .unwrap_or(0) as u32,
            cache_write_tokens: 0,
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
                "openai stream request"
            );
            trace!(body = %serde_json::to_string(&body).unwrap_or_default(), "openai stream request body");

            let resp = match self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
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
            let mut state = StreamingToolState::default();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield ProviderEvent::Error(e.to_string());
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf = buf[pos + 1..].to_string();

                    if line.is_empty() {
                        continue;
                    }

                    let Some(data) = line
                        .strip_prefix("data: ")
                        .or_else(|| line.strip_prefix("data:"))
                    else {
                        continue;
                    };

                    match process_openai_sse_line(data, &mut state) {
                        SseLineResult::Done => {
                            for event in finalize_stream(&state) {
                                yield event;
                            }
                            return;
                        }
                        SseLineResult::Events(events) => {
                            for event in events {
                                yield event;
                            }
                        }
                        SseLineResult::Skip => {}
                    }
                }
            }

            // Some compatible endpoints close without an explicit [DONE]
            // frame or trailing newline. Process the residual line and
            // always finalize so usage still propagates.
            let line = buf.trim().to_string();
            if !line.is_empty()
                && let Some(data) = line
                    .strip_prefix("data: ")
                    .or_else(|| line.strip_prefix("data:"))
            {
                match process_openai_sse_line(data, &mut state) {
                    SseLineResult::Done => {
                        for event in finalize_stream(&state) {
                            yield event;
                        }
                        return;
                    }
                    SseLineResult::Events(events) => {
                        for event in events {
                            yield event;
                        }
                    }
                    SseLineResult::Skip => {}
                }
            }

            for event in finalize_stream(&state) {
                yield event;
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

    /// Mock server that records request bodies and answers with a fixed
    /// payload under the given content type.
    async fn start_mock(payload: String, content_type: &'static str) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let captured_clone = captured.clone();

        let app = Router::new().route(
            "/chat/completions",
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

    fn adapter(base_url: &str) -> OpenAiAdapter {
        OpenAiAdapter::new(
            Secret::new("test-key".to_string()),
            "gpt-4o".to_string(),
            base_url.to_string(),
        )
    }

    fn sample_tools() -> Vec<serde_json::Value> {
        vec![serde_json::json!({
            "name": "search",
            "description": "Search the web",
            "parameters": {
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }
        })]
    }

    #[tokio::test]
    async fn stream_emits_text_then_usage() {
        let payload = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        )
        .to_string();
        let (base_url, _) = start_mock(payload, "text/event-stream").await;

        let adapter = adapter(&base_url);
        let mut stream = adapter.stream(
            vec![ChatMessage::user("hi")],
            SamplingParams::default(),
            vec![],
        );

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert!(matches!(&events[0], ProviderEvent::Delta(s) if s == "Hel"));
        assert!(matches!(&events[1], ProviderEvent::Delta(s) if s == "lo"));
        assert!(matches!(
            events.last().unwrap(),
            ProviderEvent::Done(u) if u.input_tokens == 5 && u.output_tokens == 2
        ));
    }

    #[tokio::test]
    async fn stream_surfaces_tool_calls() {
        let payload = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"search\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"query\\\":\\\"rust\\\"}\"}}]}}]}\n\n",
            "data: [DONE]\n\n",
        )
        .to_string();
        let (base_url, _) = start_mock(payload, "text/event-stream").await;

        let adapter = adapter(&base_url);
        let mut stream = adapter.stream(
            vec![ChatMessage::user("hi")],
            SamplingParams::default(),
            sample_tools(),
        );

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert!(matches!(
            &events[0],
            ProviderEvent::ToolCallStart { id, name, index: 0 }
            if id == "call_1" && name == "search"
        ));
        assert!(matches!(
            &events[1],
            ProviderEvent::ToolCallArgumentsDelta { index: 0, .. }
        ));
        assert!(matches!(&events[2], ProviderEvent::ToolCallComplete { index: 0 }));
        assert!(matches!(&events[3], ProviderEvent::Done(_)));
    }

    #[tokio::test]
    async fn request_body_carries_tools_and_sampling() {
        let (base_url, captured) = start_mock("data: [DONE]\n\n".to_string(), "text/event-stream").await;

        let adapter = adapter(&base_url);
        let params = SamplingParams {
            temperature: Some(0.2),
            max_tokens: Some(512),
            stop: vec!["<tool_result>".to_string()],
        };
        let mut stream = adapter.stream(vec![ChatMessage::user("hi")], params, sample_tools());
        while stream.next().await.is_some() {}

        let bodies = captured.lock().unwrap();
        let body = &bodies[0];
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["stop"][0], "<tool_result>");
        assert_eq!(body["tools"][0]["function"]["name"], "search");
    }

    #[tokio::test]
    async fn complete_parses_message_and_usage() {
        let payload = serde_json::json!({
            "choices": [{
                "message": {
                    "content": "The answer is 4.",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "search", "arguments": "{\"query\":\"rust\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 4}
        })
        .to_string();
        let (base_url, _) = start_mock(payload, "application/json").await;

        let adapter = adapter(&base_url);
        let resp = adapter
            .complete(
                &[ChatMessage::user("2+2?")],
                &SamplingParams::default(),
                &sample_tools(),
            )
            .await
            .unwrap();

        assert_eq!(resp.text.as_deref(), Some("The answer is 4."));
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "search");
        assert_eq!(resp.usage.input_tokens, 9);
    }

    #[tokio::test]
    async fn complete_maps_http_error_to_transport() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                axum::response::Response::builder()
                    .status(500)
                    .body(axum::body::Body::from("upstream broke"))
                    .unwrap()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let adapter = adapter(&format!("http://{addr}"));
        let err = adapter
            .complete(&[ChatMessage::user("hi")], &SamplingParams::default(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[test]
    fn long_history_ids_are_remapped_consistently() {
        let long_id = "x".repeat(60);
        let messages = vec![
            ChatMessage::assistant_with_tools(
                None,
                vec![crate::model::ToolCall {
                    id: long_id.clone(),
                    name: "search".into(),
                    arguments: serde_json::json!({}),
                }],
            ),
            ChatMessage::tool(long_id, "result"),
        ];

        let adapter = adapter("http://unused");
        let serialized = adapter.serialize_messages_for_request(&messages);
        let call_id = serialized[0]["tool_calls"][0]["id"].as_str().unwrap();
        let result_id = serialized[1]["tool_call_id"].as_str().unwrap();
        assert_eq!(call_id, result_id);
        assert!(call_id.len() <= MAX_TOOL_CALL_ID_LEN);
    }

    #[test]
    fn colliding_ids_stay_distinct_after_remap() {
        let mut remapped = HashMap::new();
        let mut used = HashSet::new();
        let a = assign_tool_call_id("weird id!", &mut remapped, &mut used);
        let b = assign_tool_call_id("weird id?", &mut remapped, &mut used);
        assert_ne!(a, b);
        // Same raw id maps to the same remapped id.
        assert_eq!(assign_tool_call_id("weird id!", &mut remapped, &mut used), a);
    }
}
