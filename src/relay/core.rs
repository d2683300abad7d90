//! # Relay Core
//!
//! `run_session` owns one session from upstream connect to final teardown:
//! the Initializing → Active → Draining → Closed state machine, the two
//! forwarding loops, and the failure-coupling policy between the client and
//! upstream connections.
//!
//! ## Concurrency Model:
//! Two loops run concurrently inside the session task. One only ever reads
//! the client side and writes the upstream side; the other only ever reads
//! upstream and writes the client side. That read/write split means the
//! steady-state data path holds no locks; the only shared state is the
//! session lifecycle flag and a drain watch channel.
//!
//! ## Failure Coupling:
//! Whichever side fails first, the other side is closed within the drain
//! grace period. The first loop to exit flips the drain signal and closes
//! the upstream connection; the transcript loop is given the drain window to
//! flush in-flight finals, after which the whole session future is dropped.
//! No mid-session failure is retried: a dropped socket on either side is
//! terminal for the session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use actix_web::web::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::relay::codec::FrameCodec;
use crate::relay::session::Session;
use crate::relay::ServerMessage;
use crate::upstream::{
    TranscriptEvent, UpstreamClose, UpstreamConnection, UpstreamReceiver, UpstreamSender,
};

/// The channel-backed client connection as seen by the relay core.
///
/// The WebSocket actor sits on the other end of both channels: inbound
/// binary frames arrive on `frames` (the channel closing is the disconnect
/// signal), and everything sent to `outbound` is serialized to the client
/// (the channel closing tells the actor to close the socket).
pub struct ClientIo {
    pub frames: mpsc::Receiver<Bytes>,
    pub outbound: mpsc::Sender<ServerMessage>,
}

/// Relay policy for one session.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub max_frame_bytes: usize,
    pub drain_grace: Duration,
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            drain_grace: Duration::from_millis(config.drain_grace_ms),
        }
    }
}

/// How a session ended, for supervisor bookkeeping.
#[derive(Debug)]
pub struct SessionOutcome {
    /// The terminal error, if the session did not end by orderly close.
    pub error: Option<RelayError>,
    /// Whether the drain grace elapsed and the loops were forcibly dropped.
    pub forced: bool,
}

/// Run one session to completion.
///
/// `connect` is the in-flight upstream connection attempt; it is awaited
/// here so that a client disconnect or supervisor shutdown during
/// Initializing still wins. A connect failure is terminal: the client is
/// sent an `{ "error": ... }` message and the session closes without
/// retrying, matching the policy that upstream failures end the session.
pub async fn run_session<F>(
    session: Arc<Session>,
    mut client: ClientIo,
    connect: F,
    settings: RelaySettings,
    mut cancel: watch::Receiver<bool>,
) -> SessionOutcome
where
    F: Future<Output = RelayResult<UpstreamConnection>>,
{
    let upstream = tokio::select! {
        // Biased so that a connect that is already done wins over a
        // simultaneous cancel; the pumps observe the cancel immediately and
        // the upstream still gets an orderly close.
        biased;

        result = connect => match result {
            Ok(upstream) => upstream,
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "upstream connect failed");
                let _ = client
                    .outbound
                    .send(ServerMessage::error(err.to_string()))
                    .await;
                session.close();
                return SessionOutcome { error: Some(err), forced: false };
            }
        },
        _ = async { let _ = cancel.wait_for(|cancelled| *cancelled).await; } => {
            debug!(session_id = %session.id, "cancelled while connecting upstream");
            session.close();
            return SessionOutcome { error: None, forced: false };
        }
    };

    session.activate();
    debug!(
        session_id = %session.id,
        upstream = upstream.state().as_str(),
        "session active"
    );

    let (upstream_tx, mut upstream_rx, upstream_close) = upstream.split();
    let codec = FrameCodec::new(settings.max_frame_bytes);
    let (drain_tx, drain_rx) = watch::channel(false);

    let pumps = async {
        let (audio_error, transcript_error) = tokio::join!(
            pump_audio(
                &session,
                &mut client.frames,
                &upstream_tx,
                &upstream_close,
                &codec,
                drain_rx.clone(),
                cancel.clone(),
                &drain_tx,
            ),
            pump_transcripts(
                &session,
                &mut upstream_rx,
                &client.outbound,
                cancel.clone(),
                &drain_tx,
            ),
        );
        audio_error.or(transcript_error)
    };
    tokio::pin!(pumps);

    let mut drain_started = drain_rx.clone();
    let (error, forced) = tokio::select! {
        biased;

        // Both loops exited on their own: the normal path.
        error = &mut pumps => (error, false),

        // Draining began but a loop is still stuck past the grace window;
        // dropping the pump future cancels whatever is left.
        _ = async {
            let _ = drain_started.wait_for(|draining| *draining).await;
            tokio::time::sleep(settings.drain_grace).await;
        } => {
            warn!(session_id = %session.id, "drain grace elapsed, forcing teardown");
            (None, true)
        }
    };

    upstream_close.close();
    session.close();
    debug!(session_id = %session.id, "session closed");

    SessionOutcome { error, forced }
}

/// Client→upstream loop: read one audio frame, validate it, forward it.
///
/// Ends on client disconnect (channel closed), upstream send failure, drain
/// initiated by the other loop, or supervisor cancellation. A frame that
/// fails validation is dropped with a warning and does not end the loop,
/// the one recoverable error class.
///
/// On exit this loop closes the upstream connection, which is the signal for
/// the provider to flush remaining finals and for the transcript loop to
/// drain to end-of-stream.
#[allow(clippy::too_many_arguments)]
async fn pump_audio(
    session: &Session,
    frames: &mut mpsc::Receiver<Bytes>,
    upstream: &UpstreamSender,
    upstream_close: &UpstreamClose,
    codec: &FrameCodec,
    mut drain: watch::Receiver<bool>,
    mut cancel: watch::Receiver<bool>,
    drain_tx: &watch::Sender<bool>,
) -> Option<RelayError> {
    let error = loop {
        tokio::select! {
            _ = async { let _ = cancel.wait_for(|cancelled| *cancelled).await; } => break None,
            _ = async { let _ = drain.wait_for(|draining| *draining).await; } => break None,
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    debug!(session_id = %session.id, "client closed audio stream");
                    break None;
                };
                let prepared = match codec.prepare(&frame) {
                    Ok(prepared) => prepared,
                    Err(err) if err.is_recoverable() => {
                        warn!(
                            session_id = %session.id,
                            error = %err,
                            "dropping invalid audio frame"
                        );
                        session.record_dropped_frame();
                        continue;
                    }
                    Err(err) => break Some(err),
                };
                let frame_len = prepared.len();
                if let Err(err) = upstream.send(prepared).await {
                    break Some(err);
                }
                session.record_frame(frame_len);
            }
        }
    };

    session.begin_drain();
    upstream_close.close();
    let _ = drain_tx.send(true);
    error
}

/// Upstream→client loop: receive one transcript event, forward it.
///
/// Ends on upstream end-of-stream or transport failure, a client write
/// failure, a provider error event (forwarded first, then terminal), drain,
/// or supervisor cancellation. This loop does not watch the drain signal
/// directly: after the audio loop closes the upstream, it keeps flushing
/// whatever the provider still delivers until end-of-stream, bounded by the
/// session's drain grace.
async fn pump_transcripts(
    session: &Session,
    upstream: &mut UpstreamReceiver,
    outbound: &mpsc::Sender<ServerMessage>,
    mut cancel: watch::Receiver<bool>,
    drain_tx: &watch::Sender<bool>,
) -> Option<RelayError> {
    let error = loop {
        tokio::select! {
            _ = async { let _ = cancel.wait_for(|cancelled| *cancelled).await; } => break None,
            event = upstream.receive() => {
                match event {
                    None => {
                        debug!(session_id = %session.id, "upstream closed transcript stream");
                        break None;
                    }
                    Some(Ok(event)) => {
                        let provider_error = match &event {
                            TranscriptEvent::Error { message } => Some(message.clone()),
                            TranscriptEvent::Transcript { .. } => None,
                        };
                        if outbound.send(ServerMessage::from_event(&event)).await.is_err() {
                            // Client write failed; the client side is gone.
                            break None;
                        }
                        match provider_error {
                            // The provider has effectively ended the stream.
                            Some(message) => break Some(RelayError::Provider(message)),
                            None => session.record_transcript(),
                        }
                    }
                    Some(Err(err)) => break Some(err),
                }
            }
        }
    };

    session.begin_drain();
    let _ = drain_tx.send(true);
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::session::SessionState;
    use crate::upstream::TranscriptAlternative;
    use tokio::time::timeout;

    /// Grace values used by the test harness; generous enough to never flake,
    /// tight enough that a coupling failure is obvious.
    const TEST_GRACE: Duration = Duration::from_millis(200);

    fn settings() -> RelaySettings {
        RelaySettings {
            max_frame_bytes: 1024 * 1024,
            drain_grace: TEST_GRACE,
        }
    }

    struct Harness {
        session: Arc<Session>,
        frame_tx: mpsc::Sender<Bytes>,
        outbound_rx: mpsc::Receiver<ServerMessage>,
        cancel_tx: watch::Sender<bool>,
    }

    fn harness() -> (Harness, ClientIo, watch::Receiver<bool>) {
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let session = Session::new();
        (
            Harness {
                session: session.clone(),
                frame_tx,
                outbound_rx,
                cancel_tx,
            },
            ClientIo {
                frames: frame_rx,
                outbound: outbound_tx,
            },
            cancel_rx,
        )
    }

    fn transcript(text: &str, is_final: bool) -> TranscriptEvent {
        TranscriptEvent::Transcript {
            alternatives: vec![TranscriptAlternative {
                transcript: text.to_string(),
                confidence: None,
            }],
            is_final,
        }
    }

    /// Frames arrive upstream in order, with no drops, for any count.
    #[tokio::test]
    async fn test_order_preservation() {
        let (h, client, cancel_rx) = harness();
        let (upstream, mut fake) = UpstreamConnection::from_parts();

        let relay = tokio::spawn(run_session(
            h.session.clone(),
            client,
            async move { Ok(upstream) },
            settings(),
            cancel_rx,
        ));

        for i in 0u16..50 {
            let frame = Bytes::from(i.to_le_bytes().to_vec());
            h.frame_tx.send(frame).await.unwrap();
        }

        for i in 0u16..50 {
            let received = timeout(TEST_GRACE, fake.audio_rx.recv())
                .await
                .expect("frame not forwarded in time")
                .unwrap();
            assert_eq!(received, i.to_le_bytes().to_vec());
        }

        drop(h.frame_tx);
        drop(fake);
        let outcome = relay.await.unwrap();
        assert!(outcome.error.is_none());
        assert!(!outcome.forced);
        assert_eq!(h.session.counters().frames_forwarded, 50);
    }

    /// A session that never sends audio still tears down cleanly.
    #[tokio::test]
    async fn test_zero_frames_is_clean() {
        let (h, client, cancel_rx) = harness();
        let (upstream, mut fake) = UpstreamConnection::from_parts();

        let relay = tokio::spawn(run_session(
            h.session.clone(),
            client,
            async move { Ok(upstream) },
            settings(),
            cancel_rx,
        ));

        drop(h.frame_tx);
        // Upstream observes the close instead of any audio.
        timeout(TEST_GRACE, fake.close_rx.wait_for(|c| *c))
            .await
            .expect("upstream not closed in time")
            .unwrap();
        assert!(fake.audio_rx.try_recv().is_err());

        drop(fake);
        let outcome = relay.await.unwrap();
        assert!(outcome.error.is_none());
    }

    /// Transcript events reach the client with identical content, in order.
    #[tokio::test]
    async fn test_transcript_fidelity() {
        let (mut h, client, cancel_rx) = harness();
        let (upstream, fake) = UpstreamConnection::from_parts();

        let relay = tokio::spawn(run_session(
            h.session.clone(),
            client,
            async move { Ok(upstream) },
            settings(),
            cancel_rx,
        ));

        let events = vec![
            transcript("speak the", false),
            transcript("speak the speech", false),
            transcript("Speak the speech, I pray you.", true),
        ];
        for event in &events {
            fake.event_tx.send(Ok(event.clone())).await.unwrap();
        }

        for event in &events {
            let message = timeout(TEST_GRACE, h.outbound_rx.recv())
                .await
                .expect("transcript not delivered in time")
                .unwrap();
            assert_eq!(message, ServerMessage::from_event(event));
        }

        drop(h.frame_tx);
        drop(fake);
        relay.await.unwrap();
        assert_eq!(h.session.counters().transcripts_delivered, 3);
    }

    /// When the upstream dies mid-session, the client connection is closed
    /// within the grace period.
    #[tokio::test]
    async fn test_upstream_death_closes_client() {
        let (mut h, client, cancel_rx) = harness();
        let (upstream, fake) = UpstreamConnection::from_parts();

        let relay = tokio::spawn(run_session(
            h.session.clone(),
            client,
            async move { Ok(upstream) },
            settings(),
            cancel_rx,
        ));

        // Keep the client nominally alive: only the upstream goes away.
        drop(fake);

        let closed = timeout(TEST_GRACE, async {
            while h.outbound_rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "client was not closed within the grace period");

        let outcome = relay.await.unwrap();
        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(!outcome.forced);
    }

    /// When the client disconnects mid-session, the upstream close is
    /// invoked within the grace period.
    #[tokio::test]
    async fn test_client_death_closes_upstream() {
        let (h, client, cancel_rx) = harness();
        let (upstream, mut fake) = UpstreamConnection::from_parts();

        let _relay = tokio::spawn(run_session(
            h.session.clone(),
            client,
            async move { Ok(upstream) },
            settings(),
            cancel_rx,
        ));

        drop(h.frame_tx);

        let closed = timeout(TEST_GRACE, fake.close_rx.wait_for(|c| *c)).await;
        assert!(
            closed.is_ok(),
            "upstream close was not invoked within the grace period"
        );
    }

    /// A connect failure in one session does not disturb another session's
    /// active flow.
    #[tokio::test]
    async fn test_session_isolation() {
        let (mut h_a, client_a, cancel_a) = harness();
        let (h_b, client_b, cancel_b) = harness();
        let (upstream_b, mut fake_b) = UpstreamConnection::from_parts();

        let relay_a = tokio::spawn(run_session(
            h_a.session.clone(),
            client_a,
            async move { Err(RelayError::Connect("auth rejected".to_string())) },
            settings(),
            cancel_a,
        ));
        let _relay_b = tokio::spawn(run_session(
            h_b.session.clone(),
            client_b,
            async move { Ok(upstream_b) },
            settings(),
            cancel_b,
        ));

        let outcome_a = relay_a.await.unwrap();
        assert_eq!(
            outcome_a.error,
            Some(RelayError::Connect("auth rejected".to_string()))
        );
        assert_eq!(h_a.session.state(), SessionState::Closed);
        // A's client was told why.
        let message = h_a.outbound_rx.recv().await.unwrap();
        assert!(matches!(message, ServerMessage::Error { .. }));

        // B keeps pumping while A is torn down.
        for _ in 0..5 {
            h_b.frame_tx.send(Bytes::from(vec![0u8; 640])).await.unwrap();
            let forwarded = timeout(TEST_GRACE, fake_b.audio_rx.recv())
                .await
                .expect("session B stalled")
                .unwrap();
            assert_eq!(forwarded.len(), 640);
        }
        assert_eq!(h_b.session.state(), SessionState::Active);
    }

    /// Happy path: 5 frames of 640 bytes, a final transcript after
    /// the third, delivered byte-for-byte, session still active afterward.
    #[tokio::test]
    async fn test_happy_path_scenario() {
        let (mut h, client, cancel_rx) = harness();
        let (upstream, mut fake) = UpstreamConnection::from_parts();

        let _relay = tokio::spawn(run_session(
            h.session.clone(),
            client,
            async move { Ok(upstream) },
            settings(),
            cancel_rx,
        ));

        for i in 0..5 {
            h.frame_tx.send(Bytes::from(vec![i as u8; 640])).await.unwrap();
            let forwarded = timeout(TEST_GRACE, fake.audio_rx.recv())
                .await
                .expect("frame not forwarded")
                .unwrap();
            assert_eq!(forwarded, vec![i as u8; 640]);

            if i == 2 {
                fake.event_tx
                    .send(Ok(transcript("hello", true)))
                    .await
                    .unwrap();
                let message = timeout(TEST_GRACE, h.outbound_rx.recv())
                    .await
                    .expect("transcript not delivered")
                    .unwrap();
                assert_eq!(
                    serde_json::to_string(&message).unwrap(),
                    r#"{"channel":{"alternatives":[{"transcript":"hello"}]},"is_final":true}"#
                );
            }
        }

        assert_eq!(h.session.state(), SessionState::Active);
        assert_eq!(h.session.counters().frames_forwarded, 5);
    }

    /// Upstream auth failure: client closed within the grace
    /// period, no audio ever sent upstream.
    #[tokio::test]
    async fn test_connect_failure_scenario() {
        let (mut h, client, cancel_rx) = harness();

        let relay = tokio::spawn(run_session(
            h.session.clone(),
            client,
            async move { Err(RelayError::Connect("invalid api key".to_string())) },
            settings(),
            cancel_rx,
        ));

        let message = timeout(TEST_GRACE, h.outbound_rx.recv())
            .await
            .expect("error not delivered in time")
            .unwrap();
        assert_eq!(
            message,
            ServerMessage::error("upstream connect failed: invalid api key")
        );
        // And then the client channel closes.
        assert!(timeout(TEST_GRACE, h.outbound_rx.recv())
            .await
            .unwrap()
            .is_none());

        let outcome = relay.await.unwrap();
        assert!(matches!(outcome.error, Some(RelayError::Connect(_))));
        assert_eq!(h.session.counters().frames_forwarded, 0);
    }

    /// Oversized frame: dropped without ending the session;
    /// subsequent valid frames still flow.
    #[tokio::test]
    async fn test_oversized_frame_scenario() {
        let (h, client, cancel_rx) = harness();
        let (upstream, mut fake) = UpstreamConnection::from_parts();

        let _relay = tokio::spawn(run_session(
            h.session.clone(),
            client,
            async move { Ok(upstream) },
            settings(),
            cancel_rx,
        ));

        h.frame_tx
            .send(Bytes::from(vec![0u8; 10 * 1024 * 1024]))
            .await
            .unwrap();
        h.frame_tx.send(Bytes::from(vec![1u8; 640])).await.unwrap();

        let forwarded = timeout(TEST_GRACE, fake.audio_rx.recv())
            .await
            .expect("valid frame did not survive the dropped one")
            .unwrap();
        assert_eq!(forwarded, vec![1u8; 640]);

        assert_eq!(h.session.state(), SessionState::Active);
        let counters = h.session.counters();
        assert_eq!(counters.frames_dropped, 1);
        assert_eq!(counters.frames_forwarded, 1);
    }

    /// A provider error payload is forwarded to the client and then ends the
    /// session.
    #[tokio::test]
    async fn test_provider_error_is_forwarded_then_terminal() {
        let (mut h, client, cancel_rx) = harness();
        let (upstream, fake) = UpstreamConnection::from_parts();

        let relay = tokio::spawn(run_session(
            h.session.clone(),
            client,
            async move { Ok(upstream) },
            settings(),
            cancel_rx,
        ));

        fake.event_tx
            .send(Ok(TranscriptEvent::Error {
                message: "quota exceeded".to_string(),
            }))
            .await
            .unwrap();

        let message = timeout(TEST_GRACE, h.outbound_rx.recv())
            .await
            .expect("provider error not delivered")
            .unwrap();
        assert_eq!(message, ServerMessage::error("quota exceeded"));

        drop(fake);
        let outcome = relay.await.unwrap();
        assert_eq!(
            outcome.error,
            Some(RelayError::Provider("quota exceeded".to_string()))
        );
    }

    /// Supervisor cancellation drains an active session promptly.
    #[tokio::test]
    async fn test_cancellation_closes_session() {
        let (h, client, cancel_rx) = harness();
        let (upstream, mut fake) = UpstreamConnection::from_parts();

        let relay = tokio::spawn(run_session(
            h.session.clone(),
            client,
            async move { Ok(upstream) },
            settings(),
            cancel_rx,
        ));

        h.cancel_tx.send(true).unwrap();

        timeout(TEST_GRACE, fake.close_rx.wait_for(|c| *c))
            .await
            .expect("upstream not closed after cancellation")
            .unwrap();
        let outcome = timeout(TEST_GRACE, relay).await.unwrap().unwrap();
        assert!(outcome.error.is_none());
        assert!(!outcome.forced);
    }

    /// A transcript loop that never reaches end-of-stream is forcibly torn
    /// down once the drain grace elapses.
    #[tokio::test]
    async fn test_stuck_drain_is_forced() {
        let (h, client, cancel_rx) = harness();
        let (upstream, fake) = UpstreamConnection::from_parts();

        let relay = tokio::spawn(run_session(
            h.session.clone(),
            client,
            async move { Ok(upstream) },
            RelaySettings {
                max_frame_bytes: 1024 * 1024,
                drain_grace: Duration::from_millis(50),
            },
            cancel_rx,
        ));

        // Client disconnects, but the fake provider never closes its side.
        drop(h.frame_tx);

        let outcome = timeout(Duration::from_millis(500), relay)
            .await
            .expect("forced teardown did not happen")
            .unwrap();
        assert!(outcome.forced);
        assert_eq!(h.session.state(), SessionState::Closed);
        drop(fake);
    }
}
