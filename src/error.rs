//! # Error Handling
//!
//! This module defines the error taxonomy for the relay. Every failure the
//! relay can encounter falls into one of a small number of categories, and
//! the category decides the policy: is the session over, or can we keep going?
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **Purpose**: Forces you to handle both success and failure cases
//! - **T**: The success type (what you get when everything works)
//! - **E**: The error type (what you get when something goes wrong)
//! - **No exceptions**: Rust doesn't have try/catch, it uses Result instead
//!
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of error
//! - **Data**: Each variant can hold additional information (String, numbers, etc.)
//! - **Pattern matching**: Use `match` to handle different error types
//!
//! ## Error Categories and Policy:
//! - **Connect**: upstream connection/authentication failed at session start.
//!   Terminal: the client is informed and the session never becomes active.
//! - **Transport**: a read/write failure mid-session on either socket.
//!   Always terminal for the session; both sides are drained and closed.
//! - **Provider**: the upstream explicitly reported an error payload instead
//!   of a transcript (bad audio, quota, etc.). Forwarded to the client as an
//!   `{ "error": ... }` message, then the session drains.
//! - **Protocol**: a malformed or oversized audio frame from the client.
//!   The one recoverable category: the frame is dropped and logged, the
//!   session keeps running.
//! - **Closed**: a send or receive was attempted on a connection that has
//!   already shut down. Terminal, but expected during teardown races.

use std::fmt;

use tokio_tungstenite::tungstenite;

/// Error type covering every failure mode of a relay session.
///
/// ## Usage Example:
/// ```rust
/// return Err(RelayError::Protocol("empty audio frame".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Upstream connection or authentication failed at session start
    Connect(String),

    /// Read/write/send/receive failure mid-session on either connection
    Transport(String),

    /// The upstream reported an explicit error payload instead of a transcript
    Provider(String),

    /// Malformed or oversized inbound audio frame from the client
    Protocol(String),

    /// Operation attempted on a connection that already shut down
    Closed,
}

impl RelayError {
    /// Whether the session can survive this error.
    ///
    /// Only `Protocol` errors are recoverable: a single bad frame is dropped
    /// without ending an otherwise-healthy session. Everything else is
    /// terminal and triggers draining on both sides.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RelayError::Protocol(_))
    }

    /// Short machine-readable label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Connect(_) => "connect_error",
            RelayError::Transport(_) => "transport_error",
            RelayError::Provider(_) => "provider_error",
            RelayError::Protocol(_) => "protocol_error",
            RelayError::Closed => "closed",
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Connect(msg) => write!(f, "upstream connect failed: {}", msg),
            RelayError::Transport(msg) => write!(f, "transport error: {}", msg),
            RelayError::Provider(msg) => write!(f, "provider error: {}", msg),
            RelayError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            RelayError::Closed => write!(f, "connection already closed"),
        }
    }
}

impl std::error::Error for RelayError {}

/// Conversion from WebSocket-level errors to the relay taxonomy.
///
/// ## Why Transport:
/// Anything tungstenite reports after the handshake is a socket-level
/// failure: a half-written frame, a reset, a TLS fault. Those are never
/// retried at this layer, so they all map to the terminal `Transport`
/// category. Handshake failures are mapped to `Connect` explicitly at the
/// call site, where the distinction is still visible.
impl From<tungstenite::Error> for RelayError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                RelayError::Closed
            }
            other => RelayError::Transport(other.to_string()),
        }
    }
}

/// Conversion from JSON errors to the relay taxonomy.
///
/// ## When this happens:
/// A provider payload failed to deserialize in full. Per the forwarding
/// policy, such a payload is never passed to the client; the caller
/// decides whether to discard it or end the session.
impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Provider(format!("malformed payload: {}", err))
    }
}

/// Type alias for Results that use the relay error type.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_protocol_errors_are_recoverable() {
        assert!(RelayError::Protocol("oversized frame".to_string()).is_recoverable());
        assert!(!RelayError::Connect("bad key".to_string()).is_recoverable());
        assert!(!RelayError::Transport("reset".to_string()).is_recoverable());
        assert!(!RelayError::Provider("quota".to_string()).is_recoverable());
        assert!(!RelayError::Closed.is_recoverable());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = RelayError::Connect("401 unauthorized".to_string());
        assert_eq!(err.to_string(), "upstream connect failed: 401 unauthorized");
        assert_eq!(err.kind(), "connect_error");
    }

    #[test]
    fn test_tungstenite_closed_maps_to_closed() {
        let err: RelayError = tungstenite::Error::ConnectionClosed.into();
        assert_eq!(err, RelayError::Closed);
    }
}
