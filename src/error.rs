//! Error types for the receiver core
//!
//! Only two failures are ever visible to a caller driving a session: a
//! transport failure and a liveness timeout. Everything else (malformed
//! datagrams, lost fragments) is absorbed locally and shows up in the
//! session health counters.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::state::PrepareState;

/// A datagram that does not match the layout declared by its header.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("truncated packet: {field} needs {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("unknown {direction} packet type {value}")]
    UnknownType { direction: &'static str, value: u8 },

    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Socket-level failure other than "would block".
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("socket receive failed: {0}")]
    Receive(io::Error),

    #[error("socket send failed: {0}")]
    Send(io::Error),
}

/// Why a sender session ended (or refused an operation).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no packet received from sender for {elapsed:?} (timeout {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid prepare state transition {from} -> {to}")]
    InvalidTransition { from: PrepareState, to: PrepareState },
}

impl SessionError {
    /// True for errors that mean the session is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Timeout { .. } | SessionError::Transport(_))
    }
}
