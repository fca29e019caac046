//! Error types for the softphone engine
//!
//! Every command on [`SoftphoneEngine`](crate::SoftphoneEngine) resolves to a
//! [`SoftphoneResult`]. Errors are grouped so callers can decide what to do
//! without matching every variant:
//!
//! - **network** - transport and registration failures, usually recovered by
//!   the reconnection driver
//! - **call** - invalid or colliding operations on a call session
//! - **transfer** - a transfer step failed; the original call is left in its
//!   last valid state
//! - **presence** - a BLF subscription failed; the health sweep retries it
//! - **configuration** - bad input or settings, never retried
//!
//! ```rust
//! use softphone_core::{SoftphoneError, SessionId};
//!
//! let err = SoftphoneError::SessionGone { session_id: SessionId(7) };
//! assert!(err.is_benign());
//! assert_eq!(err.category(), "call");
//! ```

use thiserror::Error;

use crate::call::SessionId;
use crate::transfer::TransferPhase;
use crate::transport::SignalingError;

/// Result type alias for engine operations
pub type SoftphoneResult<T> = Result<T, SoftphoneError>;

/// Errors surfaced by the call-session and presence engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SoftphoneError {
    /// Signaling connectivity could not be established or was lost
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// The registrar rejected or never answered the registration
    #[error("Registration failed: {reason}")]
    Registration { reason: String },

    /// Reconnection gave up after the configured number of attempts
    #[error("Reconnection abandoned after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Operation is not allowed in the current state (caller bug, never retried)
    #[error("Invalid state for {operation}: {state}")]
    InvalidState { operation: String, state: String },

    /// Another operation is already in flight on this session
    #[error("Session {session_id} is busy with another operation")]
    SessionBusy { session_id: SessionId },

    /// The session terminated while the operation was suspended
    #[error("Session {session_id} is gone")]
    SessionGone { session_id: SessionId },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    /// All lines are occupied
    #[error("No free line available")]
    NoLineAvailable,

    /// The transport accepted the request but the far end refused it
    #[error("{operation} failed: {reason}")]
    SignalingFailed { operation: String, reason: String },

    #[error("Transfer failed during {phase} phase: {reason}")]
    TransferFailed { phase: TransferPhase, reason: String },

    #[error("BLF subscription failed for {extension}: {reason}")]
    SubscriptionFailed { extension: String, reason: String },

    #[error("Invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("{operation} timed out after {duration_ms}ms")]
    OperationTimeout { operation: String, duration_ms: u64 },
}

impl SoftphoneError {
    pub fn invalid_state(operation: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn signaling(operation: impl Into<String>, error: SignalingError) -> Self {
        Self::SignalingFailed {
            operation: operation.into(),
            reason: error.to_string(),
        }
    }

    pub fn transfer_failed(phase: TransferPhase, reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            phase,
            reason: reason.into(),
        }
    }

    /// Check if retrying the same operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            SoftphoneError::Transport { .. }
            | SoftphoneError::OperationTimeout { .. }
            | SoftphoneError::SessionBusy { .. }
            | SoftphoneError::SubscriptionFailed { .. }
            | SoftphoneError::NoLineAvailable => true,

            SoftphoneError::Registration { reason } => !reason.contains("403"),

            _ => false,
        }
    }

    /// `SessionGone` means the target already reached a terminal state; the
    /// caller should treat it as a successful no-op.
    pub fn is_benign(&self) -> bool {
        matches!(self, SoftphoneError::SessionGone { .. })
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            SoftphoneError::Transport { .. }
            | SoftphoneError::Registration { .. }
            | SoftphoneError::ReconnectExhausted { .. } => "network",

            SoftphoneError::InvalidState { .. }
            | SoftphoneError::SessionBusy { .. }
            | SoftphoneError::SessionGone { .. }
            | SoftphoneError::SessionNotFound { .. }
            | SoftphoneError::NoLineAvailable
            | SoftphoneError::SignalingFailed { .. } => "call",

            SoftphoneError::TransferFailed { .. } => "transfer",

            SoftphoneError::SubscriptionFailed { .. } => "presence",

            SoftphoneError::InvalidArgument { .. }
            | SoftphoneError::InvalidConfiguration { .. } => "configuration",

            SoftphoneError::OperationTimeout { .. } => "system",
        }
    }
}
