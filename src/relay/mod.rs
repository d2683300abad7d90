//! # Session Relay
//!
//! The core of the service: per-session bidirectional pumping between one
//! client WebSocket and one upstream STT connection, with the
//! failure-coupling policy between them.
//!
//! ## Key Components:
//! - **Session / SessionState**: lifecycle state machine and diagnostics counters
//! - **FrameCodec**: inbound audio validation and buffer normalization
//! - **run_session** (`core`): the two forwarding loops, drain handling, and
//!   the bounded-grace teardown guarantee
//! - **ServerMessage**: the JSON wire shape delivered to the client
//!
//! ## Data Flow:
//! client audio bytes → FrameCodec → upstream send → provider →
//! upstream receive (canonical event) → ServerMessage → client.

pub mod codec;
pub mod core;
pub mod session;

use serde::Serialize;

use crate::upstream::TranscriptEvent;

/// One alternative in the client wire format.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WireAlternative {
    pub transcript: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// The `channel` envelope mirroring the upstream result nesting.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WireChannel {
    pub alternatives: Vec<WireAlternative>,
}

/// Outbound message to the client.
///
/// Transcripts serialize as
/// `{"channel":{"alternatives":[{"transcript":...}]},"is_final":...}` and
/// upstream failures as `{"error":...}`, the two shapes the web client
/// distinguishes by key. Content is carried over from the canonical event
/// verbatim, never transformed.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ServerMessage {
    Transcript {
        channel: WireChannel,
        is_final: bool,
    },
    Error {
        error: String,
    },
}

impl ServerMessage {
    /// Re-serialize a canonical upstream event into the client wire shape.
    pub fn from_event(event: &TranscriptEvent) -> ServerMessage {
        match event {
            TranscriptEvent::Transcript {
                alternatives,
                is_final,
            } => ServerMessage::Transcript {
                channel: WireChannel {
                    alternatives: alternatives
                        .iter()
                        .map(|alt| WireAlternative {
                            transcript: alt.transcript.clone(),
                            confidence: alt.confidence,
                        })
                        .collect(),
                },
                is_final: *is_final,
            },
            TranscriptEvent::Error { message } => ServerMessage::Error {
                error: message.clone(),
            },
        }
    }

    pub fn error(message: impl Into<String>) -> ServerMessage {
        ServerMessage::Error {
            error: message.into(),
        }
    }
}
