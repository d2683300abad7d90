//! # Connection Supervisor
//!
//! Tracks the set of live sessions and coordinates their shutdown. The
//! accept loop itself belongs to Actix; this module is what makes each
//! accepted connection a supervised session:
//!
//! - `SessionRegistry::register`: synchronous registration at accept time,
//!   enforcing the concurrent-session cap
//! - `spawn_session`: runs the relay in its own task with a panic boundary
//!   and end-of-session bookkeeping, so one session's fault can never look
//!   like a process-wide fault
//! - `SessionRegistry::shutdown`: the graceful-shutdown cascade: cancel
//!   every session, wait up to the grace period for voluntary drain, then
//!   force-abort the remainder
//!
//! ## Shared-Resource Policy:
//! The registry map is the one structure mutated concurrently from multiple
//! session lifecycles (insert on start, remove on end) and is protected by
//! a lock. The audio/transcript data path never touches it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::RelayResult;
use crate::relay::core::{run_session, ClientIo, RelaySettings, SessionOutcome};
use crate::relay::session::Session;
use crate::state::AppState;
use crate::upstream::UpstreamConnection;

/// How often the shutdown cascade re-checks the registry while draining.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Supervisor-side handle to one live session.
struct SessionHandle {
    session: Arc<Session>,
    cancel: watch::Sender<bool>,
    /// Abort handle for the relay task, attached once it is spawned.
    abort: Option<AbortHandle>,
}

/// Registry of active sessions.
///
/// ## Thread Safety:
/// Uses RwLock to allow multiple readers (counting, shutdown inspection) or
/// one writer (insert on accept, remove on end) at a time. Lock scopes are
/// kept synchronous; the shutdown cascade never holds the lock across an
/// await.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Register a new session at accept time.
    ///
    /// ## Returns:
    /// - **Ok(receiver)**: the cancellation receiver the relay task watches
    /// - **Err(message)**: the session cap is reached (or, defensively, the
    ///   id collided) and the connection should be refused
    pub fn register(&self, session: Arc<Session>) -> Result<watch::Receiver<bool>, String> {
        let mut sessions = self.sessions.write().unwrap();

        if sessions.len() >= self.max_sessions {
            return Err(format!(
                "maximum concurrent sessions ({}) reached",
                self.max_sessions
            ));
        }

        if sessions.contains_key(&session.id) {
            return Err(format!("session '{}' already registered", session.id));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        sessions.insert(
            session.id.clone(),
            SessionHandle {
                session,
                cancel: cancel_tx,
                abort: None,
            },
        );

        Ok(cancel_rx)
    }

    /// Attach the relay task's abort handle, once spawned.
    pub fn attach_abort(&self, session_id: &str, abort: AbortHandle) {
        if let Some(handle) = self.sessions.write().unwrap().get_mut(session_id) {
            handle.abort = Some(abort);
        }
    }

    /// Remove a session when it ends.
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().unwrap().remove(session_id).is_some()
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Cascade shutdown to every registered session.
    ///
    /// Signals all sessions to close, waits up to `grace` for voluntary
    /// drain, then force-aborts whatever is left. Returns the number of
    /// sessions that had to be force-closed. Non-fatal, reported so the
    /// caller can surface it in the exit status.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let signalled = {
            let sessions = self.sessions.read().unwrap();
            for handle in sessions.values() {
                let _ = handle.cancel.send(true);
            }
            sessions.len()
        };

        if signalled == 0 {
            return 0;
        }
        info!(sessions = signalled, "shutdown signalled to active sessions");

        let deadline = Instant::now() + grace;
        while self.active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let mut forced = 0;
        {
            let sessions = self.sessions.read().unwrap();
            for handle in sessions.values() {
                warn!(
                    session_id = %handle.session.id,
                    state = handle.session.state().as_str(),
                    "session did not drain within grace period, force-closing"
                );
                if let Some(abort) = &handle.abort {
                    abort.abort();
                }
                forced += 1;
            }
        }

        // Give the bookkeeping wrappers a moment to observe the aborts and
        // unregister; they run on the same runtime.
        if forced > 0 {
            let force_deadline = Instant::now() + DRAIN_POLL_INTERVAL * 4;
            while self.active_count() > 0 && Instant::now() < force_deadline {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        }

        forced
    }
}

/// Launch the relay for one registered session.
///
/// The relay runs in its own task so that a panic is caught at the task
/// boundary: the bookkeeping wrapper converts it into a logged, errored
/// session end instead of letting it take anything else down. The wrapper
/// also owns unregistration, so a session leaves the registry exactly when
/// its task is truly finished.
pub fn spawn_session<F>(
    state: AppState,
    session: Arc<Session>,
    client: ClientIo,
    connect: F,
    cancel: watch::Receiver<bool>,
) where
    F: Future<Output = RelayResult<UpstreamConnection>> + Send + 'static,
{
    let registry = state.registry();
    let settings = RelaySettings::from(&state.config().relay);

    state.record_session_started();
    info!(session_id = %session.id, "session started");

    let relay_task = tokio::spawn(run_session(
        session.clone(),
        client,
        connect,
        settings,
        cancel,
    ));
    registry.attach_abort(&session.id, relay_task.abort_handle());

    tokio::spawn(async move {
        let outcome = match relay_task.await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_cancelled() => {
                session.close();
                SessionOutcome {
                    error: None,
                    forced: true,
                }
            }
            Err(join_err) => {
                error!(
                    session_id = %session.id,
                    error = %join_err,
                    "session task panicked"
                );
                session.close();
                SessionOutcome {
                    error: Some(crate::error::RelayError::Transport(
                        "session task panicked".to_string(),
                    )),
                    forced: false,
                }
            }
        };

        registry.remove(&session.id);
        state.record_session_ended(outcome.error.is_some());

        let counters = session.counters();
        info!(
            session_id = %session.id,
            duration_s = session.duration_seconds(),
            frames_forwarded = counters.frames_forwarded,
            bytes_forwarded = counters.bytes_forwarded,
            frames_dropped = counters.frames_dropped,
            transcripts_delivered = counters.transcripts_delivered,
            forced = outcome.forced,
            error = outcome.error.as_ref().map(|e| e.kind()),
            "session ended"
        );
    });
}
