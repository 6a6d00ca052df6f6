use {thiserror::Error, weft_common::FromMessage};

/// Engine-level failures.
///
/// Only `Transport` is fatal for a turn. Cancellation is not an error: the
/// orchestration loop reports it as [`TurnPhase::Aborted`](crate::turn::TurnPhase)
/// so callers can distinguish it from real failures. Everything else the loop
/// recovers from locally (unknown tools, per-call execution failures, argument
/// parse fallbacks).
#[derive(Debug, Error)]
pub enum Error {
    /// Backend or network failure. The turn transitions to `Failed`.
    #[error("transport: {message}")]
    Transport { message: String },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport {
            message: e.to_string(),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

weft_common::impl_context!();
