//! # Configuration Management
//!
//! This module handles loading and managing the relay configuration from
//! multiple sources:
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! There is deliberately no file-based configuration: the service is deployed
//! as a container with everything supplied through the environment.
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment-platform variables (HOST, PORT, STT_PROVIDER, <PROVIDER>_API_KEY)
//! 2. APP_-prefixed environment variables (APP_SERVER_HOST, APP_SERVER_PORT, etc.)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, upstream, relay)
/// keeps the listener, the provider connection parameters, and the relay
/// policy knobs independently overridable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub relay: RelayConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection parameters for the upstream speech-to-text provider.
///
/// These are fixed per deployment, not negotiated per message: the whole
/// audio format contract is established once at connect time and assumed to
/// hold for the life of every session.
///
/// ## Fields:
/// - `provider`: which STT backend to use (`"deepgram"` or `"assemblyai"`)
/// - `model`: provider model name (e.g. `"nova-2"` for Deepgram)
/// - `language`: BCP-47 language code sent to the provider
/// - `sample_rate_hz`: PCM sample rate the clients record at (16000 or 44100)
/// - `encoding`: audio encoding label (`"linear16"`)
/// - `interim_results`: whether partial transcripts are streamed before an
///   utterance is final
/// - `endpointing_ms`: provider-side silence threshold for utterance end
/// - `utterance_end_ms`: provider-side gap after which an utterance-end
///   event is emitted
/// - `api_key`: bearer credential, supplied via `<PROVIDER>_API_KEY`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub provider: String,
    pub model: String,
    pub language: String,
    pub sample_rate_hz: u32,
    pub encoding: String,
    pub interim_results: bool,
    pub endpointing_ms: u32,
    pub utterance_end_ms: u32,
    #[serde(default)]
    pub api_key: String,
}

/// Relay policy knobs.
///
/// ## Fields:
/// - `max_concurrent_sessions`: hard cap on simultaneous rehearsal sessions
/// - `max_frame_bytes`: inbound audio frames larger than this are dropped
/// - `drain_grace_ms`: how long a draining session may take to flush before
///   its loops are forcibly cancelled
/// - `shutdown_grace_ms`: how long graceful shutdown waits for all sessions
///   to drain before force-closing the remainder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub max_concurrent_sessions: usize,
    pub max_frame_bytes: usize,
    pub drain_grace_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            upstream: UpstreamConfig {
                provider: "deepgram".to_string(),
                model: "nova-2".to_string(),
                language: "en-US".to_string(),
                sample_rate_hz: 16000,       // 16kHz 16-bit mono PCM from the browser
                encoding: "linear16".to_string(),
                interim_results: true,
                endpointing_ms: 300,
                utterance_end_ms: 1000,
                api_key: String::new(),
            },
            relay: RelayConfig {
                max_concurrent_sessions: 64,
                max_frame_bytes: 1024 * 1024,    // 1MB; real frames are ~640 bytes
                drain_grace_ms: 2000,
                shutdown_grace_ms: 5000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with environment variables prefixed with APP_
    /// 3. Handle the special-cased variables used by deployment platforms
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `APP_SERVER_PORT=3000`: Override server port
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    /// - `STT_PROVIDER=assemblyai`: Select the upstream provider
    /// - `DEEPGRAM_API_KEY=...` / `ASSEMBLYAI_API_KEY=...`: Provider credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // APP_SERVER_HOST becomes server.host in the config
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms set these without the APP_ prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(provider) = env::var("STT_PROVIDER") {
            settings = settings.set_override("upstream.provider", provider)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;

        // The credential lives in a provider-named variable so that both keys
        // can be present in an environment that switches providers.
        let key_var = format!("{}_API_KEY", config.upstream.provider.to_uppercase());
        if let Ok(key) = env::var(&key_var) {
            config.upstream.api_key = key;
        }

        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0 (port 0 is reserved and can't be used)
    /// - Session and frame limits are non-zero
    /// - The sample rate is one the clients actually record at
    ///
    /// ## Why validate:
    /// Catching configuration errors early prevents runtime failures and
    /// provides clear error messages about what's wrong. The API key is
    /// deliberately not required here: a missing credential surfaces as a
    /// per-session connect error rather than preventing startup.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.relay.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.relay.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        if !matches!(self.upstream.sample_rate_hz, 8000 | 16000 | 44100 | 48000) {
            return Err(anyhow::anyhow!(
                "Unsupported sample rate: {}",
                self.upstream.sample_rate_hz
            ));
        }

        if self.upstream.provider.is_empty() {
            return Err(anyhow::anyhow!("Upstream provider cannot be empty"));
        }

        Ok(())
    }
}
