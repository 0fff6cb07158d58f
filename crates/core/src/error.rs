// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for FlowGraph.
//!
//! Errors fall into the categories the runtime distinguishes when deciding how
//! to react: configuration problems are surfaced synchronously from
//! `initialize`/`start_run`, while stream-protocol violations and
//! calculator-reported failures are funneled to the graph's centralized error
//! callback from whichever worker thread detected them.

use thiserror::Error;

/// Main error type for FlowGraph operations.
///
/// All variants carry a descriptive message. The enum is `Clone` so the graph
/// can keep a sticky copy of the first recorded error and also return it from
/// `wait_until_idle`/`wait_until_done`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowGraphError {
    /// Bad graph wiring, contract mismatch, or missing required side packet.
    /// Detected at validation time; the graph never starts running.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A packet violated a stream's protocol: wrong payload type, disallowed
    /// timestamp, or a timestamp below the stream's current bound.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation arrived in a state that forbids it, e.g. writing to a
    /// closed stream or mutating intro data after the first Process call.
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// A named entity (stream, side packet, calculator, handler) does not
    /// exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A monotonicity violation on a timestamp bound.
    #[error("Unknown error: {0}")]
    Unknown(String),

    /// A non-ok status returned by a calculator's Open/Process/Close.
    #[error("Calculator error: {0}")]
    Calculator(String),

    /// An inconsistency inside the runtime itself.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using `FlowGraphError`.
pub type Result<T> = std::result::Result<T, FlowGraphError>;

impl From<FlowGraphError> for String {
    fn from(err: FlowGraphError) -> Self {
        err.to_string()
    }
}

// Generic string errors default to the calculator-reported category, since
// calculator bodies are the main producers of ad hoc messages.
impl From<String> for FlowGraphError {
    fn from(s: String) -> Self {
        Self::Calculator(s)
    }
}

impl From<&str> for FlowGraphError {
    fn from(s: &str) -> Self {
        Self::Calculator(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FlowGraphError::Configuration("stream 'video' has no producer".to_string());
        assert_eq!(err.to_string(), "Configuration error: stream 'video' has no producer");

        let err = FlowGraphError::InvalidArgument("timestamp 5 is below bound 7".to_string());
        assert_eq!(err.to_string(), "Invalid argument: timestamp 5 is below bound 7");
    }

    #[test]
    fn test_error_to_string_conversion() {
        let err = FlowGraphError::Unknown("bound moved backwards".to_string());
        let s: String = err.into();
        assert_eq!(s, "Unknown error: bound moved backwards");
    }

    #[test]
    fn test_string_to_error_conversion() {
        let err: FlowGraphError = "decoder choked".into();
        assert_eq!(err.to_string(), "Calculator error: decoder choked");
    }
}
