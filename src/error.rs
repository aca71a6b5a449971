//! Error types used by the propagation runtime and the transport seam.
//!
//! This module defines two main error enums:
//!
//! - [`PropagationError`]: outcomes of raising, acknowledging and shutting down.
//! - [`TransportError`]: failures reported by the RPC session layer.
//!
//! Both types provide [`as_label`](PropagationError::as_label) for logs.
//! None of these errors is retried locally: the coordinator owns retry policy.

use thiserror::Error;

/// # Errors produced by the propagation runtime.
///
/// ## Taxonomy
/// - `Busy`: a transition is already in flight (protocol-level rejection).
/// - `TimedOut`: a deadline elapsed.
/// - `Canceled`: shutdown in progress; always propagated, never masked.
/// - `Closed`: the local dispatcher is gone, so the event could not be posted.
/// - `Desync`: the coordinator and this module no longer agree on protocol state.
/// - `Transport`: the session layer failed underneath us.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PropagationError {
    /// Another state change is already outstanding.
    #[error("state change already in flight")]
    Busy,

    /// A deadline passed before the operation completed.
    #[error("deadline exceeded")]
    TimedOut,

    /// Shutdown is in progress (or finished); no new work is accepted.
    #[error("canceled by shutdown")]
    Canceled,

    /// The local dispatcher is no longer receiving events.
    #[error("local dispatcher closed")]
    Closed,

    /// Protocol desynchronization with the coordinator.
    #[error("protocol desync: {reason}")]
    Desync {
        /// What went wrong.
        reason: String,
    },

    /// Session layer failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl PropagationError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use statecast::PropagationError;
    ///
    /// assert_eq!(PropagationError::Busy.as_label(), "busy");
    /// assert_eq!(PropagationError::TimedOut.as_label(), "timed_out");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            PropagationError::Busy => "busy",
            PropagationError::TimedOut => "timed_out",
            PropagationError::Canceled => "canceled",
            PropagationError::Closed => "closed",
            PropagationError::Desync { .. } => "desync",
            PropagationError::Transport(e) => e.as_label(),
        }
    }

    /// True for errors caused by shutdown rather than by a fault.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            PropagationError::Canceled | PropagationError::Transport(TransportError::Canceled)
        )
    }

    pub(crate) fn desync(reason: impl Into<String>) -> Self {
        PropagationError::Desync {
            reason: reason.into(),
        }
    }
}

/// # Errors produced by the RPC session layer.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not connect to the remote service.
    #[error("connect to {service} failed: {reason}")]
    Connect {
        /// Target service name.
        service: String,
        /// Transport-provided detail.
        reason: String,
    },

    /// Connection was established but the session could not be opened.
    #[error("session to {service} failed: {reason}")]
    Session {
        /// Target service name.
        service: String,
        /// Transport-provided detail.
        reason: String,
    },

    /// I/O failure while writing or invoking.
    #[error("session i/o failed: {0}")]
    Io(String),

    /// The session timeout elapsed.
    #[error("session timed out")]
    TimedOut,

    /// The session was cancelled by the registry.
    #[error("session canceled")]
    Canceled,

    /// The peer went away.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TransportError::Connect { .. } => "transport_connect",
            TransportError::Session { .. } => "transport_session",
            TransportError::Io(_) => "transport_io",
            TransportError::TimedOut => "transport_timed_out",
            TransportError::Canceled => "transport_canceled",
            TransportError::Closed => "transport_closed",
        }
    }
}
