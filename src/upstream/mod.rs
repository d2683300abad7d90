//! # Upstream STT Connector
//!
//! Everything that talks to the cloud speech-to-text provider lives here.
//! One streaming connection is opened per rehearsal session, configured once
//! at connect time, and torn down with the session.
//!
//! ## Key Components:
//! - **SttProvider trait**: the per-provider protocol description (connect
//!   request, payload parsing, end-of-stream message)
//! - **UpstreamConnection**: the uniform send/receive/close handle the relay
//!   uses, regardless of which provider is behind it
//! - **Deepgram / AssemblyAI bindings**: the two supported providers, with
//!   materially different payload nesting normalized into one event shape
//!
//! ## Why the trait seam:
//! Providers disagree about everything except the logical contract: Deepgram
//! nests transcripts under `channel.alternatives`, AssemblyAI sends a flat
//! `message_type`/`text` object, and both decorate the stream with metadata
//! frames the client must never see. All of that is absorbed here so the
//! relay core only ever handles the canonical [`TranscriptEvent`].

pub mod assemblyai;
pub mod connection;
pub mod deepgram;

use std::sync::Arc;

use tokio_tungstenite::tungstenite::handshake::client::Request;

use crate::config::UpstreamConfig;
use crate::error::{RelayError, RelayResult};

pub use connection::{
    UpstreamClose, UpstreamConnection, UpstreamReceiver, UpstreamSender, UpstreamState,
};

/// One transcript alternative as normalized from a provider payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptAlternative {
    /// The transcribed text.
    pub transcript: String,
    /// Confidence score (0.0 to 1.0) when the provider reports one.
    pub confidence: Option<f64>,
}

/// Canonical event received from the upstream connection.
///
/// Immutable once parsed; forwarded to the client essentially verbatim
/// (re-serialized into the client wire shape, never content-transformed).
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// A transcript (interim or final) for audio sent earlier in the session.
    Transcript {
        alternatives: Vec<TranscriptAlternative>,
        is_final: bool,
    },
    /// The provider reported an error payload instead of a transcript.
    /// Forwarded to the client, then the session drains.
    Error { message: String },
}

/// Protocol description for one STT provider.
///
/// Implementations are stateless: they translate the fixed session
/// configuration into a connection request and individual wire payloads into
/// canonical events. The connection lifecycle itself is owned by
/// [`UpstreamConnection`], which is provider-agnostic.
pub trait SttProvider: std::fmt::Debug + Send + Sync {
    /// Provider identifier, as used in configuration and logs.
    fn name(&self) -> &'static str;

    /// Build the WebSocket upgrade request: URL with the fixed connection
    /// parameters baked into query string, plus the authorization header.
    fn connect_request(&self, config: &UpstreamConfig) -> RelayResult<Request>;

    /// Parse one text payload from the provider.
    ///
    /// Returns `Ok(None)` for traffic that is valid but not client-facing
    /// (metadata, keepalives, session bookkeeping). Returns an error when the
    /// payload does not deserialize in full; such payloads are never
    /// forwarded.
    fn parse_event(&self, payload: &str) -> RelayResult<Option<TranscriptEvent>>;

    /// The end-of-stream message sent during orderly teardown, if the
    /// provider defines one. Sending it prompts the provider to flush any
    /// remaining final transcripts before closing its side.
    fn close_message(&self) -> Option<String>;
}

/// Create a provider instance by its configuration id.
pub fn create_provider(id: &str) -> RelayResult<Arc<dyn SttProvider>> {
    match id {
        "deepgram" => Ok(Arc::new(deepgram::DeepgramProvider)),
        "assemblyai" => Ok(Arc::new(assemblyai::AssemblyAiProvider)),
        other => Err(RelayError::Connect(format!("unknown provider: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_providers() {
        assert_eq!(create_provider("deepgram").unwrap().name(), "deepgram");
        assert_eq!(create_provider("assemblyai").unwrap().name(), "assemblyai");
    }

    #[test]
    fn test_create_unknown_provider() {
        let err = create_provider("watson").unwrap_err();
        assert_eq!(err.kind(), "connect_error");
    }
}
