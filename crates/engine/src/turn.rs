//! The turn loop: request a model response, detect tool invocations, dispatch
//! them, feed results back, repeat until the model answers in prose.
//!
//! One call to [`run_turn`] covers the whole exchange. The loop owns the
//! history vector for its duration; nothing else appends to it while a turn
//! runs, so callers always get back a history whose tool results line up with
//! the assistant entries that requested them.

use std::collections::BTreeMap;

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use weft_config::ChatConfig;

use crate::chunk::{ChunkEmitter, OnChunk};
use crate::dispatch::dispatch_batch;
use crate::error::{Error, Result};
use crate::markers::{
    build_textual_tools_section, contains_tool_marker, extract_tool_requests, strip_tool_markers,
};
use crate::model::{
    parse_arguments_lenient, ChatMessage, ProviderAdapter, ProviderEvent, SamplingParams, ToolCall,
    ToolInvocationRequest, Usage,
};
use crate::registry::CapabilityRegistry;
use crate::scanner::{ScanEvent, TagScanner};

const DEFAULT_MAX_ITERATIONS: usize = 25;
const DEFAULT_MAX_TOOL_RESULT_BYTES: usize = 50_000;

/// Tag wrapping tool results fed back to textual-mode models. Also pushed as
/// a stop sequence so the model cannot fabricate a result before we inject
/// the real one.
const RESULT_TAG: &str = "tool_result";

/// Where a turn currently stands, and how it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    /// A provider round-trip is in flight.
    Requesting,
    /// Tool invocations are dispatched and the loop is waiting on them.
    AwaitingToolResults,
    /// The turn finished normally.
    Done,
    /// The turn was cancelled. Not an error; partial output is kept.
    Aborted,
    /// A transport failure ended the turn. Reported via `Err`.
    Failed,
}

/// How tool definitions reach the model for a turn. Fixed per turn; no
/// mid-turn renegotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolMode {
    /// Advertise schemas through the provider's function-calling API.
    #[default]
    NativeFunctionCalling,
    /// Describe tools in the system prompt, parse markers out of the reply.
    TextualPromptInjection,
}

impl From<weft_config::ToolMode> for ToolMode {
    fn from(mode: weft_config::ToolMode) -> Self {
        match mode {
            weft_config::ToolMode::Native => Self::NativeFunctionCalling,
            weft_config::ToolMode::Textual => Self::TextualPromptInjection,
        }
    }
}

/// Per-turn knobs. [`TurnOptions::from_config`] builds one from the chat
/// config section; `Default` gives the same values without a config.
#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub tool_mode: ToolMode,
    /// Maximum provider round-trips before the loop stops dispatching.
    pub max_iterations: usize,
    /// Tool whose invocation marks the turn as finished.
    pub completion_tool: String,
    /// `(open, close)` tag pair delimiting inline reasoning. Empty tags
    /// disable the scanner.
    pub reasoning_tags: (String, String),
    /// Stream the response instead of waiting for the full completion.
    pub stream: bool,
    /// Truncation limit for a single tool result, in bytes. 0 disables.
    pub max_tool_result_bytes: usize,
    pub sampling: SamplingParams,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            tool_mode: ToolMode::default(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            completion_tool: "attempt_completion".into(),
            reasoning_tags: ("<think>".into(), "</think>".into()),
            stream: true,
            max_tool_result_bytes: DEFAULT_MAX_TOOL_RESULT_BYTES,
            sampling: SamplingParams::default(),
        }
    }
}

impl TurnOptions {
    pub fn from_config(chat: &ChatConfig) -> Self {
        let max_iterations = if chat.max_tool_iterations == 0 {
            warn!(
                "chat.max_tool_iterations is 0, using default {}",
                DEFAULT_MAX_ITERATIONS
            );
            DEFAULT_MAX_ITERATIONS
        } else {
            chat.max_tool_iterations
        };
        Self {
            tool_mode: chat.tool_mode.into(),
            max_iterations,
            completion_tool: chat.completion_tool.clone(),
            reasoning_tags: (
                chat.reasoning_tags.open.clone(),
                chat.reasoning_tags.close.clone(),
            ),
            stream: chat.stream,
            max_tool_result_bytes: chat.max_tool_result_bytes,
            sampling: SamplingParams::default(),
        }
    }
}

/// What a finished turn produced.
#[derive(Debug)]
pub struct TurnOutcome {
    /// Terminal phase: `Done` or `Aborted`. Failures return `Err` instead.
    pub phase: TurnPhase,
    /// Cumulative visible answer across all rounds.
    pub answer: String,
    /// Cumulative reasoning across all rounds.
    pub reasoning: String,
    /// Full history including the assistant and tool entries this turn added.
    pub messages: Vec<ChatMessage>,
    /// Provider round-trips performed.
    pub iterations: usize,
    /// Token usage summed over all rounds.
    pub usage: Usage,
}

/// Run one turn to completion: model rounds interleaved with tool dispatch.
///
/// Tool invocations the model requests are resolved against `capabilities`
/// and their results appended to history before the next round. The loop
/// stops when a round produces no invocations, when the completion tool is
/// invoked, when `options.max_iterations` round-trips have been spent, or
/// when `cancel` fires.
///
/// Cancellation is cooperative and clean: no new provider round or dispatch
/// batch starts after the token fires, and no further chunks are emitted.
/// The partial answer and history stay in the returned outcome.
pub async fn run_turn(
    adapter: &dyn ProviderAdapter,
    capabilities: &CapabilityRegistry,
    options: &TurnOptions,
    messages: Vec<ChatMessage>,
    on_chunk: Option<OnChunk>,
    cancel: &CancellationToken,
) -> Result<TurnOutcome> {
    let mut messages = messages;
    let mut tool_mode = options.tool_mode;
    if tool_mode == ToolMode::NativeFunctionCalling
        && !capabilities.is_empty()
        && !adapter.supports_native_tools()
    {
        warn!(
            provider = adapter.name(),
            "backend lacks native tool calling, falling back to textual prompt injection"
        );
        tool_mode = ToolMode::TextualPromptInjection;
    }

    let mut sampling = options.sampling.clone();
    if tool_mode == ToolMode::TextualPromptInjection && !capabilities.is_empty() {
        let section = build_textual_tools_section(&capabilities.schemas());
        let insert_at = messages
            .iter()
            .take_while(|m| matches!(m, ChatMessage::System { .. }))
            .count();
        messages.insert(insert_at, ChatMessage::system(section));
        let result_open = format!("<{RESULT_TAG}>");
        if !sampling.stop.contains(&result_open) {
            sampling.stop.push(result_open);
        }
    }

    let tool_schemas = match tool_mode {
        ToolMode::NativeFunctionCalling => capabilities.schemas(),
        ToolMode::TextualPromptInjection => Vec::new(),
    };
    let identities = capabilities.identities();
    let max_iterations = if options.max_iterations == 0 {
        DEFAULT_MAX_ITERATIONS
    } else {
        options.max_iterations
    };

    let mut emitter = ChunkEmitter::new(on_chunk);
    let mut iteration_count = 0usize;
    let mut usage_total = Usage::default();

    loop {
        if cancel.is_cancelled() {
            debug!(iteration = iteration_count, "turn cancelled before round");
            return Ok(aborted_outcome(
                &emitter,
                messages,
                iteration_count,
                usage_total,
            ));
        }

        iteration_count += 1;
        debug!(
            iteration = iteration_count,
            phase = ?TurnPhase::Requesting,
            "requesting model response"
        );
        let answer_before = emitter.answer().to_string();

        let round = if options.stream {
            run_streaming_round(
                adapter,
                &messages,
                &sampling,
                &tool_schemas,
                &options.reasoning_tags,
                &mut emitter,
                cancel,
            )
            .await
        } else {
            run_blocking_round(
                adapter,
                &messages,
                &sampling,
                &tool_schemas,
                &options.reasoning_tags,
                &mut emitter,
                cancel,
            )
            .await
        };
        let round = match round {
            Ok(round) => round,
            Err(e) => {
                error!(
                    iteration = iteration_count,
                    phase = ?TurnPhase::Failed,
                    error = %e,
                    "model round failed"
                );
                return Err(e);
            },
        };
        if round.aborted {
            debug!(iteration = iteration_count, "turn cancelled mid-round");
            return Ok(aborted_outcome(
                &emitter,
                messages,
                iteration_count,
                usage_total,
            ));
        }
        usage_total.add(&round.usage);

        let mut requests: Vec<ToolInvocationRequest> = match tool_mode {
            ToolMode::NativeFunctionCalling => round
                .tool_calls
                .iter()
                .map(|call| {
                    ToolInvocationRequest::new(
                        call.name.clone(),
                        call.arguments.clone(),
                        Some(call.id.clone()),
                    )
                })
                .collect(),
            ToolMode::TextualPromptInjection => {
                if contains_tool_marker(&round.text, &identities) {
                    extract_tool_requests(&round.text, &identities)
                } else {
                    Vec::new()
                }
            },
        };
        // Unknown tools are dropped here, before any chunk or history entry
        // mentions them, so the backend never sees a call without a result.
        requests.retain(|request| {
            if capabilities.resolve(&request.identity).is_some() {
                true
            } else {
                warn!(tool = %request.identity, "dropping invocation of unknown tool");
                false
            }
        });

        if requests.is_empty() {
            if !round.text.is_empty() {
                messages.push(ChatMessage::assistant(round.text.clone()));
            }
            debug!(
                iteration = iteration_count,
                phase = ?TurnPhase::Done,
                "turn complete"
            );
            emitter.text_complete();
            emitter.block_complete();
            return Ok(TurnOutcome {
                phase: TurnPhase::Done,
                answer: emitter.answer().to_string(),
                reasoning: emitter.reasoning().to_string(),
                messages,
                iterations: iteration_count,
                usage: usage_total,
            });
        }

        if tool_mode == ToolMode::TextualPromptInjection {
            let stripped = strip_tool_markers(&round.text, &identities);
            let mut rewritten = answer_before;
            rewritten.push_str(stripped.trim_end());
            emitter.rewrite_answer(rewritten);
        }

        for request in &requests {
            emitter.tool_created(request);
        }

        match tool_mode {
            ToolMode::NativeFunctionCalling => {
                let content = (!round.text.is_empty()).then(|| round.text.clone());
                let tool_calls = requests
                    .iter()
                    .map(|request| ToolCall {
                        id: request.history_id().to_string(),
                        name: request.identity.clone(),
                        arguments: request.arguments.clone(),
                    })
                    .collect();
                messages.push(ChatMessage::assistant_with_tools(content, tool_calls));
            },
            // The raw marker text stays in history so the model sees its own
            // call next to the result.
            ToolMode::TextualPromptInjection => {
                messages.push(ChatMessage::assistant(round.text.clone()));
            },
        }

        if iteration_count >= max_iterations {
            warn!(
                iterations = iteration_count,
                pending = requests.len(),
                "max tool iterations reached, finishing without dispatching"
            );
            emitter.text_complete();
            emitter.block_complete();
            return Ok(TurnOutcome {
                phase: TurnPhase::Done,
                answer: emitter.answer().to_string(),
                reasoning: emitter.reasoning().to_string(),
                messages,
                iterations: iteration_count,
                usage: usage_total,
            });
        }

        debug!(
            iteration = iteration_count,
            pending = requests.len(),
            phase = ?TurnPhase::AwaitingToolResults,
            "dispatching tool invocations"
        );
        let dispatched = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(iteration = iteration_count, "turn cancelled awaiting tool results");
                return Ok(aborted_outcome(&emitter, messages, iteration_count, usage_total));
            }
            outcome = dispatch_batch(capabilities, requests, &options.completion_tool, &emitter) => outcome,
        };

        match tool_mode {
            ToolMode::NativeFunctionCalling => {
                for resolved in &dispatched.results {
                    messages.push(ChatMessage::tool(
                        resolved.request.history_id(),
                        sanitize_tool_result(&resolved.content, options.max_tool_result_bytes),
                    ));
                }
            },
            ToolMode::TextualPromptInjection => {
                let blocks: Vec<String> = dispatched
                    .results
                    .iter()
                    .map(|resolved| {
                        format!(
                            "<{RESULT_TAG} tool=\"{}\">\n{}\n</{RESULT_TAG}>",
                            resolved.request.identity,
                            sanitize_tool_result(&resolved.content, options.max_tool_result_bytes),
                        )
                    })
                    .collect();
                messages.push(ChatMessage::user(blocks.join("\n\n")));
            },
        }

        if dispatched.completion_requested {
            debug!(
                iteration = iteration_count,
                phase = ?TurnPhase::Done,
                "completion tool invoked, finishing turn"
            );
            emitter.text_complete();
            emitter.block_complete();
            return Ok(TurnOutcome {
                phase: TurnPhase::Done,
                answer: emitter.answer().to_string(),
                reasoning: emitter.reasoning().to_string(),
                messages,
                iterations: iteration_count,
                usage: usage_total,
            });
        }
    }
}

fn aborted_outcome(
    emitter: &ChunkEmitter,
    messages: Vec<ChatMessage>,
    iterations: usize,
    usage: Usage,
) -> TurnOutcome {
    TurnOutcome {
        phase: TurnPhase::Aborted,
        answer: emitter.answer().to_string(),
        reasoning: emitter.reasoning().to_string(),
        messages,
        iterations,
        usage,
    }
}

/// What one provider round produced, after scanner routing.
#[derive(Debug, Default)]
struct RoundOutput {
    /// Answer-channel text for this round. Markers included in textual mode.
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Usage,
    aborted: bool,
}

struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

async fn run_streaming_round(
    adapter: &dyn ProviderAdapter,
    messages: &[ChatMessage],
    sampling: &SamplingParams,
    tools: &[serde_json::Value],
    tags: &(String, String),
    emitter: &mut ChunkEmitter,
    cancel: &CancellationToken,
) -> Result<RoundOutput> {
    let mut scanner = TagScanner::new(tags.0.clone(), tags.1.clone());
    let mut stream = adapter.stream(messages.to_vec(), sampling.clone(), tools.to_vec());
    let mut out = RoundOutput::default();
    let mut pending: BTreeMap<usize, PendingToolCall> = BTreeMap::new();
    let mut failure: Option<String> = None;

    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                out.aborted = true;
                return Ok(out);
            }
            event = stream.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            ProviderEvent::Delta(text) => {
                for scan in scanner.push(&text) {
                    apply_scan_event(emitter, &mut out.text, scan);
                }
            },
            ProviderEvent::Reasoning(text) => emitter.reasoning_delta(&text),
            ProviderEvent::ToolCallStart { id, name, index } => {
                pending.insert(
                    index,
                    PendingToolCall {
                        id,
                        name,
                        arguments: String::new(),
                    },
                );
            },
            ProviderEvent::ToolCallArgumentsDelta { index, delta } => {
                if let Some(call) = pending.get_mut(&index) {
                    call.arguments.push_str(&delta);
                }
            },
            ProviderEvent::ToolCallComplete { .. } => {},
            ProviderEvent::Done(usage) => out.usage = usage,
            ProviderEvent::Error(message) => {
                failure = Some(message);
                break;
            },
        }
    }

    if let Some(message) = failure {
        return Err(Error::transport(message));
    }
    for scan in scanner.flush() {
        apply_scan_event(emitter, &mut out.text, scan);
    }
    out.tool_calls = pending
        .into_values()
        .map(|call| ToolCall {
            id: call.id,
            name: call.name,
            arguments: parse_arguments_lenient(&call.arguments),
        })
        .collect();
    Ok(out)
}

async fn run_blocking_round(
    adapter: &dyn ProviderAdapter,
    messages: &[ChatMessage],
    sampling: &SamplingParams,
    tools: &[serde_json::Value],
    tags: &(String, String),
    emitter: &mut ChunkEmitter,
    cancel: &CancellationToken,
) -> Result<RoundOutput> {
    let response = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            return Ok(RoundOutput {
                aborted: true,
                ..RoundOutput::default()
            });
        }
        response = adapter.complete(messages, sampling, tools) => response?,
    };

    let mut out = RoundOutput::default();
    if let Some(reasoning) = response.reasoning.as_deref().filter(|r| !r.is_empty()) {
        emitter.reasoning_delta(reasoning);
    }
    let mut scanner = TagScanner::new(tags.0.clone(), tags.1.clone());
    if let Some(text) = response.text.as_deref() {
        for scan in scanner.push(text) {
            apply_scan_event(emitter, &mut out.text, scan);
        }
    }
    for scan in scanner.flush() {
        apply_scan_event(emitter, &mut out.text, scan);
    }
    out.tool_calls = response.tool_calls;
    out.usage = response.usage;
    Ok(out)
}

fn apply_scan_event(emitter: &mut ChunkEmitter, text: &mut String, event: ScanEvent) {
    match event {
        ScanEvent::Answer(part) => {
            text.push_str(&part);
            emitter.answer_delta(&part);
        },
        ScanEvent::Reasoning(part) => emitter.reasoning_delta(&part),
        ScanEvent::ReasoningEnd => emitter.reasoning_complete(),
    }
}

// ── Tool result sanitation ──────────────────────────────────────────────────

const BASE64_TAG: &str = "data:";
const BASE64_MARKER: &str = ";base64,";
/// Minimum run length before a base64 or hex blob is worth stripping.
const BLOB_MIN_LEN: usize = 200;

/// Prepare a tool result for history injection: strip embedded binary blobs,
/// then truncate to `max_bytes` at a char boundary. `max_bytes == 0` means
/// no length limit.
pub fn sanitize_tool_result(content: &str, max_bytes: usize) -> String {
    let stripped = strip_base64_blobs(content);
    let stripped = strip_hex_blobs(&stripped);
    if max_bytes == 0 || stripped.len() <= max_bytes {
        return stripped;
    }
    let total = stripped.len();
    let mut end = max_bytes;
    while end > 0 && !stripped.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n\n[truncated, {total} bytes total]",
        &stripped[..end]
    )
}

fn is_base64_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '+' | '/' | '=')
}

/// Replace long base64 payloads in `data:` URIs with a short placeholder.
/// Screenshots and file previews otherwise dominate the context window.
fn strip_base64_blobs(text: &str) -> String {
    if !text.contains(BASE64_MARKER) {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(tag_pos) = rest.find(BASE64_TAG) {
        let mime_start = tag_pos + BASE64_TAG.len();
        let Some(marker_rel) = rest[mime_start..].find(BASE64_MARKER) else {
            break;
        };
        let mime = &rest[mime_start..mime_start + marker_rel];
        let payload_start = mime_start + marker_rel + BASE64_MARKER.len();
        let payload_len = rest[payload_start..]
            .find(|ch| !is_base64_char(ch))
            .unwrap_or(rest.len() - payload_start);
        if mime.len() <= 64 && payload_len >= BLOB_MIN_LEN {
            out.push_str(&rest[..tag_pos]);
            out.push_str(&format!("[{mime} data removed ({payload_len} bytes)]"));
        } else {
            out.push_str(&rest[..payload_start + payload_len]);
        }
        rest = &rest[payload_start + payload_len..];
    }
    out.push_str(rest);
    out
}

/// Replace long hex runs (raw buffer dumps) with a short placeholder.
fn strip_hex_blobs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run_start: Option<usize> = None;
    for (pos, ch) in text.char_indices() {
        if ch.is_ascii_hexdigit() {
            run_start.get_or_insert(pos);
            continue;
        }
        if let Some(start) = run_start.take() {
            flush_hex_run(&mut out, &text[start..pos]);
        }
        out.push(ch);
    }
    if let Some(start) = run_start {
        flush_hex_run(&mut out, &text[start..]);
    }
    out
}

fn flush_hex_run(out: &mut String, run: &str) {
    if run.len() >= BLOB_MIN_LEN {
        out.push_str(&format!("[hex data removed ({} chars)]", run.len()));
    } else {
        out.push_str(run);
    }
}
