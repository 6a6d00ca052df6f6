//! Shared parsing for OpenAI-compatible chat-completions streams.
//!
//! Everything here is pure so the SSE handling stays unit-testable without a
//! live endpoint. Used by the OpenAI adapter and by anything else speaking
//! the same wire dialect (many hosted providers do).

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::trace;

use crate::model::{parse_arguments_lenient, ProviderEvent, ToolCall, Usage};

/// Chat Completions tool declaration (nested under `function`).
#[derive(Debug, Serialize)]
pub struct ChatCompletionsTool {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub function: ChatCompletionsFunction,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionsFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub strict: bool,
}

/// Recursively patch a JSON Schema for strict-mode compliance.
///
/// Strict mode requires `additionalProperties: false` on every object in the
/// tree and every property listed in `required`.
pub fn patch_schema_for_strict_mode(schema: &mut serde_json::Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("object") {
        obj.insert("additionalProperties".to_string(), serde_json::json!(false));
        if let Some(props) = obj.get("properties").and_then(|p| p.as_object()) {
            let names: Vec<serde_json::Value> = props.keys().map(|k| serde_json::json!(k)).collect();
            obj.insert("required".to_string(), serde_json::json!(names));
        } else {
            // An object schema with no properties still needs both keys.
            obj.insert("properties".to_string(), serde_json::json!({}));
            obj.insert("required".to_string(), serde_json::json!([]));
        }
    }

    if let Some(props) = obj.get_mut("properties").and_then(|p| p.as_object_mut()) {
        for (_, prop_schema) in props.iter_mut() {
            patch_schema_for_strict_mode(prop_schema);
        }
    }

    if let Some(items) = obj.get_mut("items") {
        patch_schema_for_strict_mode(items);
    }

    for key in ["anyOf", "oneOf", "allOf"] {
        if let Some(variants) = obj.get_mut(key).and_then(|v| v.as_array_mut()) {
            for variant in variants {
                patch_schema_for_strict_mode(variant);
            }
        }
    }

    if let Some(additional) = obj.get_mut("additionalProperties")
        && additional.is_object()
    {
        patch_schema_for_strict_mode(additional);
    }
}

/// Convert neutral `{name, description, parameters}` declarations to the
/// Chat Completions function-calling format, patched for strict mode.
pub fn to_openai_tools(tools: &[serde_json::Value]) -> Vec<serde_json::Value> {
    let result: Vec<serde_json::Value> = tools
        .iter()
        .filter_map(|t| {
            let mut params = t["parameters"].clone();
            patch_schema_for_strict_mode(&mut params);

            let name = t["name"].as_str()?.to_string();
            let description = t["description"].as_str().unwrap_or("").to_string();

            let tool = ChatCompletionsTool {
                tool_type: "function",
                function: ChatCompletionsFunction {
                    name,
                    description,
                    parameters: params,
                    strict: true,
                },
            };
            serde_json::to_value(tool).ok()
        })
        .collect();

    trace!(tool_count = result.len(), "converted tools to chat completions format");
    result
}

/// Parse `tool_calls` out of a non-streaming response message.
///
/// Entries without an id get a synthesized `call_{index}` so downstream
/// correlation still works.
pub fn parse_tool_calls(message: &serde_json::Value) -> Vec<ToolCall> {
    message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(i, tc)| {
                    let name = tc["function"]["name"].as_str()?.to_string();
                    let id = tc["id"]
                        .as_str()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| format!("call_{i}"));
                    let raw_args = tc["function"]["arguments"].as_str().unwrap_or("{}");
                    Some(ToolCall {
                        id,
                        name,
                        arguments: parse_arguments_lenient(raw_args),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Accumulated stream state across SSE lines.
#[derive(Default)]
pub struct StreamingToolState {
    /// Tool call indices seen so far, with their ids. Ordered so the
    /// completion events at end of stream come out in index order.
    pub started: BTreeMap<usize, String>,
    pub usage: Usage,
}

/// Outcome of one SSE data line.
pub enum SseLineResult {
    /// Nothing actionable on this line.
    Skip,
    /// Stream finished (`[DONE]` sentinel).
    Done,
    /// Events to forward.
    Events(Vec<ProviderEvent>),
}

/// Process one SSE `data:` payload in the OpenAI streaming dialect.
pub fn process_openai_sse_line(data: &str, state: &mut StreamingToolState) -> SseLineResult {
    if data == "[DONE]" {
        return SseLineResult::Done;
    }

    let Ok(evt) = serde_json::from_str::<serde_json::Value>(data) else {
        return SseLineResult::Skip;
    };

    let mut events = Vec::new();

    // Usage frame, present when the request asked for include_usage.
    if let Some(u) = evt.get("usage").filter(|u| !u.is_null()) {
        state.usage.input_tokens = u["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        state.usage.output_tokens = u["completion_tokens"].as_u64().unwrap_or(0) as u32;
        if let Some(cached) = u["prompt_tokens_details"]["cached_tokens"].as_u64() {
            state.usage.cache_read_tokens = cached as u32;
        }
    }

    let delta = &evt["choices"][0]["delta"];

    if let Some(content) = delta["content"].as_str()
        && !content.is_empty()
    {
        events.push(ProviderEvent::Delta(content.to_string()));
    }

    // Reasoning models surface their thinking under reasoning_content
    // (DeepSeek style) or reasoning (OpenRouter style).
    let reasoning = delta["reasoning_content"]
        .as_str()
        .or_else(|| delta["reasoning"].as_str());
    if let Some(reasoning) = reasoning
        && !reasoning.is_empty()
    {
        events.push(ProviderEvent::Reasoning(reasoning.to_string()));
    }

    if let Some(calls) = delta["tool_calls"].as_array() {
        for tc in calls {
            let index = tc["index"].as_u64().unwrap_or(0) as usize;

            if let Some(name) = tc["function"]["name"].as_str() {
                let id = tc["id"]
                    .as_str()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| format!("call_{index}"));
                state.started.insert(index, id.clone());
                events.push(ProviderEvent::ToolCallStart {
                    id,
                    name: name.to_string(),
                    index,
                });
            }

            if let Some(args_delta) = tc["function"]["arguments"].as_str()
                && !args_delta.is_empty()
            {
                events.push(ProviderEvent::ToolCallArgumentsDelta {
                    index,
                    delta: args_delta.to_string(),
                });
            }
        }
    }

    if events.is_empty() {
        SseLineResult::Skip
    } else {
        SseLineResult::Events(events)
    }
}

/// Final events when the stream ends: completion for every open tool call,
/// then `Done` with the accumulated usage.
pub fn finalize_stream(state: &StreamingToolState) -> Vec<ProviderEvent> {
    let mut events: Vec<ProviderEvent> = state
        .started
        .keys()
        .map(|index| ProviderEvent::ToolCallComplete { index: *index })
        .collect();
    events.push(ProviderEvent::Done(state.usage.clone()));
    events
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn tools_are_wrapped_and_strict() {
        let tools = vec![serde_json::json!({
            "name": "search",
            "description": "Search the web",
            "parameters": {"type": "object", "properties": {"query": {"type": "string"}}}
        })];
        let converted = to_openai_tools(&tools);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0]["type"], "function");
        assert_eq!(converted[0]["function"]["name"], "search");
        assert_eq!(converted[0]["function"]["strict"], true);
        assert_eq!(
            converted[0]["function"]["parameters"]["additionalProperties"],
            false
        );
    }

    #[test]
    fn strict_patch_reaches_nested_objects_and_items() {
        let mut schema = serde_json::json!({
            "type": "object",
            "properties": {
                "outer": {
                    "type": "object",
                    "properties": {"inner": {"type": "string"}}
                },
                "list": {
                    "type": "array",
                    "items": {"type": "object", "properties": {"x": {"type": "number"}}}
                }
            },
            "required": ["outer"]
        });
        patch_schema_for_strict_mode(&mut schema);
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(schema["properties"]["outer"]["additionalProperties"], false);
        assert_eq!(
            schema["properties"]["list"]["items"]["additionalProperties"],
            false
        );
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&serde_json::json!("list")));
    }

    #[test]
    fn strict_patch_fills_empty_objects() {
        let mut schema = serde_json::json!({"type": "object"});
        patch_schema_for_strict_mode(&mut schema);
        assert_eq!(schema["properties"], serde_json::json!({}));
        assert_eq!(schema["required"], serde_json::json!([]));
    }

    #[test]
    fn parse_tool_calls_synthesizes_missing_id() {
        let msg = serde_json::json!({
            "tool_calls": [{
                "function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}
            }]
        });
        let calls = parse_tool_calls(&msg);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[0].arguments["q"], "rust");
    }

    #[test]
    fn parse_tool_calls_keeps_unparseable_arguments_as_string() {
        let msg = serde_json::json!({
            "tool_calls": [{
                "id": "call_1",
                "function": {"name": "search", "arguments": "not json"}
            }]
        });
        let calls = parse_tool_calls(&msg);
        assert_eq!(calls[0].arguments, serde_json::json!("not json"));
    }

    #[test]
    fn done_sentinel_ends_the_stream() {
        let mut state = StreamingToolState::default();
        assert!(matches!(
            process_openai_sse_line("[DONE]", &mut state),
            SseLineResult::Done
        ));
    }

    #[test]
    fn content_delta_becomes_delta_event() {
        let mut state = StreamingToolState::default();
        let data = r#"{"choices":[{"delta":{"content":"Hello"}}]}"#;
        match process_openai_sse_line(data, &mut state) {
            SseLineResult::Events(events) => {
                assert!(matches!(&events[0], ProviderEvent::Delta(s) if s == "Hello"));
            }
            _ => panic!("expected events"),
        }
    }

    #[test]
    fn reasoning_content_becomes_reasoning_event() {
        let mut state = StreamingToolState::default();
        let data = r#"{"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#;
        match process_openai_sse_line(data, &mut state) {
            SseLineResult::Events(events) => {
                assert!(matches!(&events[0], ProviderEvent::Reasoning(s) if s == "hmm"));
            }
            _ => panic!("expected events"),
        }
    }

    #[test]
    fn tool_call_start_without_id_gets_synthesized_one() {
        let mut state = StreamingToolState::default();
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":2,"function":{"name":"search"}}]}}]}"#;
        match process_openai_sse_line(data, &mut state) {
            SseLineResult::Events(events) => {
                assert!(matches!(
                    &events[0],
                    ProviderEvent::ToolCallStart { id, name, index }
                    if id == "call_2" && name == "search" && *index == 2
                ));
            }
            _ => panic!("expected events"),
        }
        assert_eq!(state.started.get(&2).map(String::as_str), Some("call_2"));
    }

    #[test]
    fn argument_deltas_carry_the_index() {
        let mut state = StreamingToolState::default();
        let start = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"search"}}]}}]}"#;
        let _ = process_openai_sse_line(start, &mut state);

        let args = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":"}}]}}]}"#;
        match process_openai_sse_line(args, &mut state) {
            SseLineResult::Events(events) => {
                assert!(matches!(
                    &events[0],
                    ProviderEvent::ToolCallArgumentsDelta { index: 0, delta } if delta == "{\"q\":"
                ));
            }
            _ => panic!("expected events"),
        }
    }

    #[test]
    fn usage_frame_updates_state() {
        let mut state = StreamingToolState::default();
        let data = r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":7,"prompt_tokens_details":{"cached_tokens":4}}}"#;
        let _ = process_openai_sse_line(data, &mut state);
        assert_eq!(state.usage.input_tokens, 12);
        assert_eq!(state.usage.output_tokens, 7);
        assert_eq!(state.usage.cache_read_tokens, 4);
    }

    #[test]
    fn finalize_completes_calls_in_index_order() {
        let mut state = StreamingToolState::default();
        state.started.insert(1, "call_b".into());
        state.started.insert(0, "call_a".into());
        state.usage.input_tokens = 3;

        let events = finalize_stream(&state);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ProviderEvent::ToolCallComplete { index: 0 }));
        assert!(matches!(events[1], ProviderEvent::ToolCallComplete { index: 1 }));
        assert!(matches!(&events[2], ProviderEvent::Done(u) if u.input_tokens == 3));
    }
}
