//! # Application State Management
//!
//! This module manages the state shared by every connection handler: the
//! configuration, the session registry, the provider binding, and the
//! process-wide session metrics.
//!
//! ## Key Rust Concepts (IMPORTANT for beginners):
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows multiple parts of the program to safely share ownership of data
//! - **Why needed**: Every accepted connection needs access to the same registry and config
//! - **Memory safety**: Automatically cleans up data when the last reference is dropped
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time (but not both)
//! - **Why needed**: Handlers read config concurrently; metrics are updated per session
//!
//! The audio/transcript data path deliberately does NOT go through this
//! module: sessions own their connections outright, and the only cross-
//! session shared structure is the registry map (see `supervisor`).

use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::config::AppConfig;
use crate::supervisor::SessionRegistry;
use crate::upstream::SttProvider;

/// The shared application state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration, built once at startup
    config: Arc<AppConfig>,

    /// Aggregate session metrics (updated by the supervisor)
    metrics: Arc<RwLock<AppMetrics>>,

    /// Registry of live sessions, for coordinated shutdown
    registry: Arc<SessionRegistry>,

    /// The upstream provider binding selected by configuration
    provider: Arc<dyn SttProvider>,

    /// When the server started (never changes, safe to share directly)
    pub start_time: Instant,
}

/// Aggregate metrics across all sessions since server start.
///
/// Individual session failures never propagate to the supervisor except
/// through these counts; they exist for observability, nothing reads them
/// on the control path.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Sessions accepted since start
    pub sessions_started: u64,

    /// Sessions that ended, cleanly or otherwise
    pub sessions_ended: u64,

    /// Sessions that ended with a terminal error
    pub sessions_errored: u64,
}

impl AppState {
    pub fn new(config: AppConfig, provider: Arc<dyn SttProvider>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.relay.max_concurrent_sessions));
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry,
            provider,
            start_time: Instant::now(),
        }
    }

    /// The configuration, shared and immutable after startup.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The session registry.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// The configured upstream provider binding.
    pub fn provider(&self) -> Arc<dyn SttProvider> {
        self.provider.clone()
    }

    /// Record a newly accepted session.
    pub fn record_session_started(&self) {
        self.metrics.write().unwrap().sessions_started += 1;
    }

    /// Record a finished session.
    pub fn record_session_ended(&self, errored: bool) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.sessions_ended += 1;
        if errored {
            metrics.sessions_errored += 1;
        }
    }

    /// Get a snapshot of current metrics.
    ///
    /// ## Why a snapshot:
    /// Clones the data so the lock is not held while the caller formats or
    /// logs it.
    pub fn metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap().clone()
    }

    /// Get server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::create_provider;

    fn state() -> AppState {
        let config = AppConfig::default();
        let provider = create_provider(&config.upstream.provider).unwrap();
        AppState::new(config, provider)
    }

    #[test]
    fn test_session_metrics_accumulate() {
        let state = state();
        state.record_session_started();
        state.record_session_started();
        state.record_session_ended(false);
        state.record_session_ended(true);

        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.sessions_started, 2);
        assert_eq!(metrics.sessions_ended, 2);
        assert_eq!(metrics.sessions_errored, 1);
    }

    #[test]
    fn test_registry_capacity_matches_config() {
        let state = state();
        assert_eq!(state.registry().active_count(), 0);
    }
}
