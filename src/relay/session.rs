//! # Session Lifecycle
//!
//! A `Session` is the pairing of one client connection and one upstream STT
//! connection, plus the bookkeeping that travels with them. Sessions are
//! transient: created on accept, destroyed on disconnect, never shared
//! across connections and never persisted.
//!
//! ## Session Lifecycle:
//! 1. **Initializing**: client accepted, upstream connection attempt in flight
//! 2. **Active**: both connections open, both forwarding loops running
//! 3. **Draining**: one side initiated close; the other gets a bounded window to flush
//! 4. **Closed**: terminal; both connections released, all loops exited

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Current lifecycle state of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Client accepted, upstream connect in flight
    Initializing,
    /// Both connections open, forwarding in both directions
    Active,
    /// One side is closing; the other side is flushing
    Draining,
    /// Terminal; everything released
    Closed,
}

impl SessionState {
    /// Convert state to string for log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Initializing => "initializing",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

/// Per-session diagnostics counters.
///
/// Purely observational: logged when the session ends, never part of the
/// relay's control flow.
#[derive(Debug, Default, Clone)]
pub struct SessionCounters {
    /// Audio frames forwarded upstream
    pub frames_forwarded: u64,

    /// Audio bytes forwarded upstream
    pub bytes_forwarded: u64,

    /// Inbound frames dropped by validation
    pub frames_dropped: u64,

    /// Transcript messages delivered to the client
    pub transcripts_delivered: u64,
}

/// One rehearsal session: a client/upstream connection pair with coupled
/// lifetimes.
///
/// ## Thread Safety:
/// Shared between the WebSocket actor, the relay task, and the supervisor
/// registry, so state and counters sit behind locks. The locks are held only
/// for field reads/writes; the audio data path itself never takes them.
pub struct Session {
    /// Unique identifier for this session
    pub id: String,

    /// When the session was accepted
    pub created_at: DateTime<Utc>,

    state: RwLock<SessionState>,

    counters: RwLock<SessionCounters>,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            state: RwLock::new(SessionState::Initializing),
            counters: RwLock::new(SessionCounters::default()),
        })
    }

    /// Get the current session state.
    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    /// Mark the session active.
    ///
    /// ## State Transition:
    /// Initializing → Active. Any other transition into Active is a bug in
    /// the relay and is ignored rather than honored.
    pub fn activate(&self) {
        let mut state = self.state.write().unwrap();
        if *state == SessionState::Initializing {
            *state = SessionState::Active;
        }
    }

    /// Begin draining.
    ///
    /// ## State Transition:
    /// Active → Draining. Called by whichever forwarding loop exits first;
    /// the second caller finds the session already draining and this is a
    /// no-op, which is what makes the trigger safe to fire from both loops.
    pub fn begin_drain(&self) {
        let mut state = self.state.write().unwrap();
        if *state == SessionState::Active {
            *state = SessionState::Draining;
        }
    }

    /// Mark the session closed. Terminal and idempotent: closing an
    /// already-closed session is a no-op, never an error.
    pub fn close(&self) {
        *self.state.write().unwrap() = SessionState::Closed;
    }

    /// Record one audio frame forwarded upstream.
    pub fn record_frame(&self, bytes: usize) {
        let mut counters = self.counters.write().unwrap();
        counters.frames_forwarded += 1;
        counters.bytes_forwarded += bytes as u64;
    }

    /// Record one inbound frame dropped by validation.
    pub fn record_dropped_frame(&self) {
        self.counters.write().unwrap().frames_dropped += 1;
    }

    /// Record one transcript delivered to the client.
    pub fn record_transcript(&self) {
        self.counters.write().unwrap().transcripts_delivered += 1;
    }

    /// Snapshot of the diagnostics counters.
    pub fn counters(&self) -> SessionCounters {
        self.counters.read().unwrap().clone()
    }

    /// Session duration in seconds, from accept to now.
    pub fn duration_seconds(&self) -> f64 {
        let duration = Utc::now().signed_duration_since(self.created_at);
        duration.num_milliseconds() as f64 / 1000.0
    }
}
