//! Streaming chat engine: provider adapters, chunk normalization, tool
//! invocation orchestration.
//!
//! The entry point is [`run_turn`]: give it an adapter, a capability
//! registry and the conversation so far, and it drives the full
//! request/dispatch/feed-back loop, emitting normalized [`Chunk`]s along the
//! way.

pub mod chunk;
pub mod dispatch;
pub mod error;
pub mod markers;
pub mod model;
pub mod providers;
pub mod registry;
pub mod scanner;
pub mod turn;

pub use {
    chunk::{Chunk, ChunkEmitter, OnChunk},
    error::{Error, Result},
    model::{
        ChatMessage, CompletionResponse, InvocationStatus, ProviderAdapter, ProviderEvent,
        SamplingParams, ToolCall, ToolInvocationRequest, Usage,
    },
    providers::{AdapterRegistry, AnthropicAdapter, OpenAiAdapter},
    registry::{Capability, CapabilityOutput, CapabilityRegistry, OutputPart},
    turn::{run_turn, ToolMode, TurnOptions, TurnOutcome, TurnPhase},
};

/// Shared HTTP client for provider adapters.
///
/// Adapters without custom redirect/proxy needs reuse this client to share
/// connection pools, DNS cache, and TLS sessions.
pub fn shared_http_client() -> &'static reqwest::Client {
    static CLIENT: std::sync::LazyLock<reqwest::Client> =
        std::sync::LazyLock::new(reqwest::Client::new);
    &CLIENT
}
