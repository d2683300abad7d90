//! # Deepgram Provider Binding
//!
//! Deepgram's live transcription API is a WebSocket endpoint that accepts raw
//! binary PCM frames and streams back JSON results with transcripts nested
//! under `channel.alternatives`. All connection parameters are query-string
//! arguments fixed at connect time; authentication is a `Token` scheme
//! authorization header.

use serde::Deserialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};

use crate::config::UpstreamConfig;
use crate::error::{RelayError, RelayResult};
use crate::upstream::{SttProvider, TranscriptAlternative, TranscriptEvent};

const LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";

/// A single alternative within a Deepgram result.
#[derive(Debug, Clone, Deserialize)]
struct DeepgramAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// The channel object wrapping the alternatives list.
#[derive(Debug, Clone, Deserialize)]
struct DeepgramChannel {
    #[serde(default)]
    alternatives: Vec<DeepgramAlternative>,
}

/// Top-level live-transcription message.
///
/// Deepgram multiplexes several message kinds over the stream; `type`
/// discriminates them. Only `Results` carries transcripts; `Metadata`,
/// `SpeechStarted` and `UtteranceEnd` are provider bookkeeping.
#[derive(Debug, Clone, Deserialize)]
struct DeepgramMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    channel: Option<DeepgramChannel>,
    #[serde(default)]
    is_final: Option<bool>,
    /// Error payloads carry a description instead of a channel.
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug)]
pub struct DeepgramProvider;

impl SttProvider for DeepgramProvider {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    fn connect_request(&self, config: &UpstreamConfig) -> RelayResult<Request> {
        if config.api_key.is_empty() {
            return Err(RelayError::Connect(
                "DEEPGRAM_API_KEY is not set".to_string(),
            ));
        }

        let url = format!(
            "{}?model={}&language={}&sample_rate={}&encoding={}&channels=1\
             &interim_results={}&endpointing={}&utterance_end_ms={}&punctuate=true",
            LISTEN_URL,
            config.model,
            config.language,
            config.sample_rate_hz,
            config.encoding,
            config.interim_results,
            config.endpointing_ms,
            config.utterance_end_ms,
        );

        let mut request = url
            .into_client_request()
            .map_err(|e| RelayError::Connect(e.to_string()))?;

        let auth = HeaderValue::from_str(&format!("Token {}", config.api_key))
            .map_err(|_| RelayError::Connect("API key is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        Ok(request)
    }

    fn parse_event(&self, payload: &str) -> RelayResult<Option<TranscriptEvent>> {
        let message: DeepgramMessage = serde_json::from_str(payload)?;

        match message.kind.as_str() {
            "Results" => {
                let channel = message.channel.ok_or_else(|| {
                    RelayError::Provider("Results message without channel".to_string())
                })?;
                let alternatives = channel
                    .alternatives
                    .into_iter()
                    .map(|alt| TranscriptAlternative {
                        transcript: alt.transcript,
                        confidence: alt.confidence,
                    })
                    .collect();
                Ok(Some(TranscriptEvent::Transcript {
                    alternatives,
                    is_final: message.is_final.unwrap_or(false),
                }))
            }
            "Error" => {
                let message = message
                    .description
                    .or(message.error)
                    .unwrap_or_else(|| "unspecified provider error".to_string());
                Ok(Some(TranscriptEvent::Error { message }))
            }
            // Metadata, SpeechStarted, UtteranceEnd: valid, not client-facing.
            _ => Ok(None),
        }
    }

    fn close_message(&self) -> Option<String> {
        Some(r#"{"type":"CloseStream"}"#.to_string())
    }
}
