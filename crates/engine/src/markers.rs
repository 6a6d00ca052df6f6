//! Textual tool markers: detection, extraction and stripping of inline tool
//! call syntax for providers without native function calling.
//!
//! Two dialects are recognized. The wrapper form carries the identity in a
//! JSON body:
//!
//! ```text
//! <tool_call>{"name": "search", "arguments": {"query": "rust"}}</tool_call>
//! ```
//!
//! The identity form names the tool in the tag itself:
//!
//! ```text
//! <search>{"query": "rust"}</search>
//! ```
//!
//! Tool names in either dialect are matched raw first, then in sanitized
//! form, so a model that normalizes an awkward identity still gets its call
//! through.

use serde_json::Value;
use tracing::debug;

use crate::model::{parse_arguments_lenient, ToolInvocationRequest};

const WRAPPER_TAG: &str = "tool_call";
const IDENTITY_MAX_LEN: usize = 64;

/// Normalize an identity into tag-safe form: anything outside
/// `[A-Za-z0-9_-]` becomes `_`, a non-letter lead gains a `tool_` prefix,
/// and the result is capped at 64 characters.
pub fn sanitize_identity(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if !out.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        out.insert_str(0, "tool_");
    }
    out.truncate(IDENTITY_MAX_LEN);
    out
}

/// Cheap check for marker syntax, run on every harvested answer before the
/// full extraction pass.
pub fn contains_tool_marker(text: &str, identities: &[String]) -> bool {
    if text.contains("<tool_call>") {
        return true;
    }
    identities.iter().any(|identity| {
        if text.contains(&format!("<{identity}>")) {
            return true;
        }
        let sanitized = sanitize_identity(identity);
        sanitized != *identity && text.contains(&format!("<{sanitized}>"))
    })
}

/// Extract every tool invocation from `text`, in order of appearance.
///
/// Wrapper-form bodies that do not parse to an object with a `name` are
/// skipped. Identity-form bodies that are not JSON objects fall back to
/// `{"input": <raw body>}` so the capability still sees them.
pub fn extract_tool_requests(text: &str, identities: &[String]) -> Vec<ToolInvocationRequest> {
    let mut found: Vec<(usize, ToolInvocationRequest)> = Vec::new();

    for (start, _, body) in find_tagged_bodies(text, WRAPPER_TAG) {
        match parse_wrapper_body(body) {
            Some(mut request) => {
                if !identities.contains(&request.identity)
                    && let Some(raw) = identities
                        .iter()
                        .find(|id| sanitize_identity(id) == request.identity)
                {
                    request.identity = raw.clone();
                }
                found.push((start, request));
            }
            None => debug!(body, "skipping unparseable tool_call body"),
        }
    }

    for identity in identities {
        if identity == WRAPPER_TAG || sanitize_identity(identity) == WRAPPER_TAG {
            continue;
        }
        let mut matches = find_tagged_bodies(text, identity);
        if matches.is_empty() {
            let sanitized = sanitize_identity(identity);
            if sanitized != *identity {
                matches = find_tagged_bodies(text, &sanitized);
            }
        }
        for (start, _, body) in matches {
            let trimmed = body.trim();
            let arguments = serde_json::from_str::<Value>(trimmed)
                .ok()
                .filter(Value::is_object)
                .unwrap_or_else(|| serde_json::json!({ "input": trimmed }));
            found.push((
                start,
                ToolInvocationRequest::new(identity.clone(), arguments, None),
            ));
        }
    }

    found.sort_by_key(|(start, _)| *start);
    found.into_iter().map(|(_, request)| request).collect()
}

/// Remove every complete marker span (both dialects) from `text`.
///
/// Unclosed markers are left alone; only well-formed spans disappear.
pub fn strip_tool_markers(text: &str, identities: &[String]) -> String {
    let mut spans: Vec<(usize, usize)> = find_tagged_bodies(text, WRAPPER_TAG)
        .into_iter()
        .map(|(start, end, _)| (start, end))
        .collect();
    for identity in identities {
        for tag in [identity.clone(), sanitize_identity(identity)] {
            if tag == WRAPPER_TAG {
                continue;
            }
            spans.extend(
                find_tagged_bodies(text, &tag)
                    .into_iter()
                    .map(|(start, end, _)| (start, end)),
            );
        }
    }
    spans.sort_unstable();
    spans.dedup();

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end) in spans {
        if start < cursor {
            continue;
        }
        out.push_str(&text[cursor..start]);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// System prompt section describing the marker dialect and the available
/// capabilities. Injected for providers running in textual mode.
pub fn build_textual_tools_section(schemas: &[Value]) -> String {
    let mut section = String::from(
        "## Tool calls\n\n\
         To invoke a tool, emit a block in exactly this form:\n\n\
         <tool_call>\n\
         {\"name\": \"<tool name>\", \"arguments\": {...}}\n\
         </tool_call>\n\n\
         Tool results arrive in the next user message inside <tool_result> \
         blocks. Emit nothing after a tool call block; wait for the result.\n\n\
         Available tools:\n",
    );
    for schema in schemas {
        let name = schema["name"].as_str().unwrap_or("unknown");
        let description = schema["description"].as_str().unwrap_or("");
        section.push_str(&format!("\n### {name}\n{description}\n"));
        if let Some(params) = schema.get("parameters") {
            section.push_str(&format!("Parameters schema: {params}\n"));
        }
    }
    section
}

/// Locate `(span_start, span_end, body)` for every complete
/// `<tag>body</tag>` pair, left to right, non-overlapping.
fn find_tagged_bodies<'a>(text: &'a str, tag: &str) -> Vec<(usize, usize, &'a str)> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut found = Vec::new();
    let mut search = 0;
    while let Some(rel) = text[search..].find(&open) {
        let start = search + rel;
        let body_start = start + open.len();
        let Some(rel_close) = text[body_start..].find(&close) else {
            break;
        };
        let end = body_start + rel_close + close.len();
        found.push((start, end, &text[body_start..body_start + rel_close]));
        search = end;
    }
    found
}

fn parse_wrapper_body(body: &str) -> Option<ToolInvocationRequest> {
    let value: Value = serde_json::from_str(body.trim()).ok()?;
    let obj = value.as_object()?;
    let name = obj.get("name")?.as_str()?.to_string();
    let arguments = match obj.get("arguments") {
        Some(Value::String(raw)) => parse_arguments_lenient(raw),
        Some(other) => other.clone(),
        None => serde_json::json!({}),
    };
    let originating = obj
        .get("id")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    Some(ToolInvocationRequest::new(name, arguments, originating))
}
