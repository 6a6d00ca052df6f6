//! Canonical chunk vocabulary toward the UI, and the emitter that maintains
//! cumulative channel values for a turn.

use std::time::Instant;

use serde::Serialize;

use crate::model::ToolInvocationRequest;

/// One unit of the canonical output vocabulary.
///
/// Delta variants carry the cumulative value of their channel so far, not an
/// increment: consumers always see the full current value and can render
/// statelessly. Reasoning variants also carry elapsed time in the channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Chunk {
    TextDelta { text: String },
    TextComplete { text: String },
    ReasoningDelta { text: String, elapsed_ms: u64 },
    ReasoningComplete { text: String, elapsed_ms: u64 },
    /// A tool invocation was detected.
    ToolCreated { request: ToolInvocationRequest },
    /// A batch of invocations started executing.
    ToolInProgress { requests: Vec<ToolInvocationRequest> },
    /// One invocation resolved (done or error).
    ToolComplete { request: ToolInvocationRequest },
    /// Terminal chunk for the turn; nothing follows.
    BlockComplete,
}

/// Callback for streaming chunks out of the engine.
pub type OnChunk = Box<dyn Fn(Chunk) + Send + Sync>;

/// Turn-scoped emitter owning the cumulative answer and reasoning channels.
///
/// The same emitter is used across every round of a turn so the cumulative
/// values span the whole turn. Tool chunks pass through without touching
/// channel state, which lets the dispatcher emit them from concurrent tasks
/// through a shared borrow.
pub struct ChunkEmitter {
    sink: Option<OnChunk>,
    answer: String,
    reasoning: String,
    /// Start of the currently open reasoning region.
    region_start: Option<Instant>,
    /// Time accumulated in already-closed reasoning regions.
    elapsed_base_ms: u64,
    /// Reasoning arrived since the last `ReasoningComplete`.
    region_dirty: bool,
}

impl ChunkEmitter {
    pub fn new(sink: Option<OnChunk>) -> Self {
        Self {
            sink,
            answer: String::new(),
            reasoning: String::new(),
            region_start: None,
            elapsed_base_ms: 0,
            region_dirty: false,
        }
    }

    /// Append visible answer text and emit the cumulative snapshot.
    ///
    /// Closes any open reasoning region first, so `ReasoningComplete` always
    /// precedes the first subsequent text chunk.
    pub fn answer_delta(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        self.reasoning_complete();
        self.answer.push_str(fragment);
        self.emit(Chunk::TextDelta {
            text: self.answer.clone(),
        });
    }

    /// Append reasoning text and emit the cumulative snapshot.
    ///
    /// The region timer starts at the first byte entering the channel.
    pub fn reasoning_delta(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        if self.region_start.is_none() {
            self.region_start = Some(Instant::now());
        }
        self.region_dirty = true;
        self.reasoning.push_str(fragment);
        self.emit(Chunk::ReasoningDelta {
            text: self.reasoning.clone(),
            elapsed_ms: self.elapsed_ms(),
        });
    }

    /// Close the open reasoning region, if any. Safe to call repeatedly.
    pub fn reasoning_complete(&mut self) {
        if let Some(started) = self.region_start.take() {
            self.elapsed_base_ms += started.elapsed().as_millis() as u64;
        }
        if self.region_dirty {
            self.region_dirty = false;
            self.emit(Chunk::ReasoningComplete {
                text: self.reasoning.clone(),
                elapsed_ms: self.elapsed_base_ms,
            });
        }
    }

    /// Replace the answer channel wholesale and emit the new snapshot.
    ///
    /// Used after harvesting textual tool markers: the stripped text replaces
    /// what streamed, and stateless consumers simply re-render the snapshot.
    pub fn rewrite_answer(&mut self, answer: String) {
        if self.answer == answer {
            return;
        }
        self.answer = answer;
        self.emit(Chunk::TextDelta {
            text: self.answer.clone(),
        });
    }

    /// Emit the final text snapshot, closing any open reasoning region.
    pub fn text_complete(&mut self) {
        self.reasoning_complete();
        self.emit(Chunk::TextComplete {
            text: self.answer.clone(),
        });
    }

    pub fn tool_created(&self, request: &ToolInvocationRequest) {
        self.emit(Chunk::ToolCreated {
            request: request.clone(),
        });
    }

    pub fn tool_in_progress(&self, requests: &[ToolInvocationRequest]) {
        self.emit(Chunk::ToolInProgress {
            requests: requests.to_vec(),
        });
    }

    pub fn tool_complete(&self, request: &ToolInvocationRequest) {
        self.emit(Chunk::ToolComplete {
            request: request.clone(),
        });
    }

    /// Terminal chunk. Only the orchestration loop calls this, never an
    /// adapter, so a multi-round turn cannot signal completion twice.
    pub fn block_complete(&self) {
        self.emit(Chunk::BlockComplete);
    }

    /// Cumulative visible answer so far.
    pub fn answer(&self) -> &str {
        &self.answer
    }

    /// Cumulative reasoning so far.
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    fn elapsed_ms(&self) -> u64 {
        let open = self
            .region_start
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.elapsed_base_ms + open
    }

    fn emit(&self, chunk: Chunk) {
        if let Some(sink) = &self.sink {
            sink(chunk);
        }
    }
}
