//! # AssemblyAI Provider Binding
//!
//! AssemblyAI's realtime API takes the sample rate as its only query
//! parameter and authenticates with a bare API key in the authorization
//! header. Payloads are flat objects discriminated by `message_type`; the
//! contrast with Deepgram's nested shape is exactly what the provider trait
//! exists to absorb.
//!
//! AssemblyAI reports a single transcript per message (no alternatives
//! list), so normalization wraps it into a one-element alternatives vector.

use serde::Deserialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};

use crate::config::UpstreamConfig;
use crate::error::{RelayError, RelayResult};
use crate::upstream::{SttProvider, TranscriptAlternative, TranscriptEvent};

const REALTIME_URL: &str = "wss://api.assemblyai.com/v2/realtime/ws";

/// Realtime message, flat shape.
///
/// `message_type` is absent on error payloads, which instead carry a
/// top-level `error` string.
#[derive(Debug, Clone, Deserialize)]
struct AssemblyAiMessage {
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug)]
pub struct AssemblyAiProvider;

impl SttProvider for AssemblyAiProvider {
    fn name(&self) -> &'static str {
        "assemblyai"
    }

    fn connect_request(&self, config: &UpstreamConfig) -> RelayResult<Request> {
        if config.api_key.is_empty() {
            return Err(RelayError::Connect(
                "ASSEMBLYAI_API_KEY is not set".to_string(),
            ));
        }

        let url = format!("{}?sample_rate={}", REALTIME_URL, config.sample_rate_hz);

        let mut request = url
            .into_client_request()
            .map_err(|e| RelayError::Connect(e.to_string()))?;

        let auth = HeaderValue::from_str(&config.api_key)
            .map_err(|_| RelayError::Connect("API key is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        Ok(request)
    }

    fn parse_event(&self, payload: &str) -> RelayResult<Option<TranscriptEvent>> {
        let message: AssemblyAiMessage = serde_json::from_str(payload)?;

        if let Some(error) = message.error {
            return Ok(Some(TranscriptEvent::Error { message: error }));
        }

        let kind = match message.message_type.as_deref() {
            Some(kind) => kind,
            None => {
                return Err(RelayError::Provider(
                    "payload without message_type or error".to_string(),
                ))
            }
        };

        match kind {
            "PartialTranscript" | "FinalTranscript" => {
                let text = message.text.ok_or_else(|| {
                    RelayError::Provider(format!("{} without text", kind))
                })?;
                // An empty partial is AssemblyAI's keepalive while the
                // speaker is silent; there is nothing to forward.
                if text.is_empty() && kind == "PartialTranscript" {
                    return Ok(None);
                }
                Ok(Some(TranscriptEvent::Transcript {
                    alternatives: vec![TranscriptAlternative {
                        transcript: text,
                        confidence: message.confidence,
                    }],
                    is_final: kind == "FinalTranscript",
                }))
            }
            // SessionBegins / SessionTerminated: bookkeeping only.
            _ => Ok(None),
        }
    }

    fn close_message(&self) -> Option<String> {
        Some(r#"{"terminate_session":true}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UpstreamConfig {
        UpstreamConfig {
            provider: "assemblyai".to_string(),
            model: String::new(),
            language: "en_us".to_string(),
            sample_rate_hz: 44100,
            encoding: "linear16".to_string(),
            interim_results: true,
            endpointing_ms: 300,
            utterance_end_ms: 1000,
            api_key: "aai-test-key".to_string(),
        }
    }

    #[test]
    fn test_connect_request_url_and_auth() {
        let request = AssemblyAiProvider.connect_request(&config()).unwrap();
        assert_eq!(
            request.uri().to_string(),
            "wss://api.assemblyai.com/v2/realtime/ws?sample_rate=44100"
        );
        let auth = request.headers().get(AUTHORIZATION).unwrap();
        assert_eq!(auth.to_str().unwrap(), "aai-test-key");
    }

    #[test]
    fn test_parse_partial_and_final() {
        let partial = r#"{"message_type":"PartialTranscript","text":"friends roman","confidence":0.61}"#;
        let event = AssemblyAiProvider.parse_event(partial).unwrap().unwrap();
        assert_eq!(
            event,
            TranscriptEvent::Transcript {
                alternatives: vec![TranscriptAlternative {
                    transcript: "friends roman".to_string(),
                    confidence: Some(0.61),
                }],
                is_final: false,
            }
        );

        let fin = r#"{"message_type":"FinalTranscript","text":"Friends, Romans, countrymen.","confidence":0.93}"#;
        let event = AssemblyAiProvider.parse_event(fin).unwrap().unwrap();
        match event {
            TranscriptEvent::Transcript { is_final, .. } => assert!(is_final),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_empty_partial_is_ignored() {
        let payload = r#"{"message_type":"PartialTranscript","text":""}"#;
        assert_eq!(AssemblyAiProvider.parse_event(payload).unwrap(), None);
    }

    #[test]
    fn test_session_bookkeeping_is_ignored() {
        let payload = r#"{"message_type":"SessionBegins","session_id":"s1"}"#;
        assert_eq!(AssemblyAiProvider.parse_event(payload).unwrap(), None);
    }

    #[test]
    fn test_error_payload() {
        let payload = r#"{"error":"Sample rate must be a positive integer"}"#;
        let event = AssemblyAiProvider.parse_event(payload).unwrap().unwrap();
        assert_eq!(
            event,
            TranscriptEvent::Error {
                message: "Sample rate must be a positive integer".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        assert!(AssemblyAiProvider.parse_event("{}").is_err());
        assert!(AssemblyAiProvider.parse_event("[1,2,3]").is_err());
    }
}
