//! # Upstream Connection Lifecycle
//!
//! One `UpstreamConnection` is opened per rehearsal session and lives exactly
//! as long as the session does. The WebSocket socket itself is owned by a
//! dedicated driver task; the relay holds channel-backed handles, which is
//! what makes the contract safe to use from two forwarding loops at once:
//! the sender half and receiver half are independent objects, and the close
//! handle can be invoked from any execution context, any number of times.
//!
//! ## State Machine:
//! `Connecting → Open → Closing → Closed`, with `Errored` reachable from
//! `Connecting` or `Open`. The state is shared between the driver task and
//! the handles so that `send()` can refuse work once teardown has begun.
//!
//! ## Teardown:
//! Closing is cooperative: the close handle flips a watch flag, the driver
//! sends the provider's end-of-stream message and then keeps reading so any
//! remaining final transcripts still reach the session before the provider
//! closes its side. Dropping the receiver or sender handles never blocks.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::error::{RelayError, RelayResult};
use crate::upstream::{SttProvider, TranscriptEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// In-flight audio frames buffered toward the provider socket. Small on
/// purpose: a dead upstream must surface as backpressure, not as an
/// unbounded buffer.
const AUDIO_CHANNEL_CAPACITY: usize = 64;

/// Parsed events buffered toward the relay.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long the driver waits, after sending end-of-stream, for the provider
/// to flush and close its side before the socket is dropped anyway. The
/// timer restarts on every message, so a provider still delivering finals is
/// never cut off by it.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state as seen by both the driver task and the handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    /// Handshake in flight
    Connecting,
    /// Streaming in both directions
    Open,
    /// End-of-stream sent, draining remaining provider traffic
    Closing,
    /// Socket released after an orderly close
    Closed,
    /// Socket released after a transport failure
    Errored,
}

impl UpstreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamState::Connecting => "connecting",
            UpstreamState::Open => "open",
            UpstreamState::Closing => "closing",
            UpstreamState::Closed => "closed",
            UpstreamState::Errored => "errored",
        }
    }
}

type SharedState = Arc<RwLock<UpstreamState>>;

fn set_state(state: &SharedState, next: UpstreamState) {
    *state.write().unwrap() = next;
}

fn get_state(state: &SharedState) -> UpstreamState {
    *state.read().unwrap()
}

/// Write half of the connection: audio frames toward the provider.
pub struct UpstreamSender {
    audio_tx: mpsc::Sender<Vec<u8>>,
    state: SharedState,
}

impl UpstreamSender {
    /// Forward one binary audio frame upstream.
    ///
    /// Fails with `Closed` once the connection has begun teardown, and with
    /// `Transport` if the driver task died under the frame. Either failure is
    /// fatal to the session; there is no partial-frame retry.
    pub async fn send(&self, frame: Vec<u8>) -> RelayResult<()> {
        match get_state(&self.state) {
            UpstreamState::Open => {}
            UpstreamState::Errored => {
                return Err(RelayError::Transport("upstream connection errored".to_string()))
            }
            _ => return Err(RelayError::Closed),
        }

        self.audio_tx
            .send(frame)
            .await
            .map_err(|_| RelayError::Closed)
    }
}

/// Read half of the connection: canonical events toward the relay.
pub struct UpstreamReceiver {
    event_rx: mpsc::Receiver<RelayResult<TranscriptEvent>>,
}

impl UpstreamReceiver {
    /// Block until the next transcript event, error, or close signal.
    ///
    /// `None` is the clean end-of-stream: the provider closed its side and
    /// the driver exited. A `Some(Err(..))` carries the transport failure
    /// that ended the stream otherwise.
    pub async fn receive(&mut self) -> Option<RelayResult<TranscriptEvent>> {
        self.event_rx.recv().await
    }
}

/// Close handle, safe to clone, call twice, and call from a different task
/// than the one using `send`/`receive`.
#[derive(Clone)]
pub struct UpstreamClose {
    close_tx: Arc<watch::Sender<bool>>,
}

impl UpstreamClose {
    /// Signal end-of-stream to the provider and release the connection.
    /// Idempotent; the first call wins and later calls are no-ops.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }
}

/// The per-session streaming connection to the STT provider.
pub struct UpstreamConnection {
    sender: UpstreamSender,
    receiver: UpstreamReceiver,
    close: UpstreamClose,
    state: SharedState,
}

impl UpstreamConnection {
    /// Establish the connection with the given fixed configuration.
    ///
    /// Translation of the configuration into provider parameters is the
    /// provider's job ([`SttProvider::connect_request`]); this function owns
    /// the handshake and spawns the socket driver. A rejected credential or
    /// failed network call surfaces as `Connect`; retry policy belongs to
    /// the caller, not here.
    pub async fn connect(
        provider: Arc<dyn SttProvider>,
        config: UpstreamConfig,
    ) -> RelayResult<UpstreamConnection> {
        let state: SharedState = Arc::new(RwLock::new(UpstreamState::Connecting));
        let request = provider.connect_request(&config)?;

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;

        set_state(&state, UpstreamState::Open);
        debug!(provider = provider.name(), "upstream connection open");

        let (sink, stream) = socket.split();
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = watch::channel(false);

        tokio::spawn(drive(
            sink,
            stream,
            provider,
            audio_rx,
            event_tx,
            close_rx,
            state.clone(),
        ));

        Ok(UpstreamConnection {
            sender: UpstreamSender {
                audio_tx,
                state: state.clone(),
            },
            receiver: UpstreamReceiver { event_rx },
            close: UpstreamClose {
                close_tx: Arc::new(close_tx),
            },
            state,
        })
    }

    /// Current connection state.
    pub fn state(&self) -> UpstreamState {
        get_state(&self.state)
    }

    /// Split into independently-owned halves for the two forwarding loops.
    pub fn split(self) -> (UpstreamSender, UpstreamReceiver, UpstreamClose) {
        (self.sender, self.receiver, self.close)
    }

    /// Build a connection around raw channel halves, with no socket behind
    /// it. The returned fake ends play the provider's role in tests.
    #[cfg(test)]
    pub fn from_parts() -> (UpstreamConnection, FakeUpstream) {
        let state: SharedState = Arc::new(RwLock::new(UpstreamState::Open));
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = watch::channel(false);

        let connection = UpstreamConnection {
            sender: UpstreamSender {
                audio_tx,
                state: state.clone(),
            },
            receiver: UpstreamReceiver { event_rx },
            close: UpstreamClose {
                close_tx: Arc::new(close_tx),
            },
            state: state.clone(),
        };

        let fake = FakeUpstream {
            audio_rx,
            event_tx,
            close_rx,
            state,
        };

        (connection, fake)
    }
}

/// The provider's side of a test connection built by `from_parts`.
#[cfg(test)]
pub struct FakeUpstream {
    /// Frames the relay sent upstream.
    pub audio_rx: mpsc::Receiver<Vec<u8>>,
    /// Inject transcript events or transport errors toward the relay.
    pub event_tx: mpsc::Sender<RelayResult<TranscriptEvent>>,
    /// Observes the close signal (flips to true when the relay closes).
    pub close_rx: watch::Receiver<bool>,
    /// Shared state, writable by tests to simulate driver transitions.
    pub state: SharedState,
}

#[cfg(test)]
impl FakeUpstream {
    pub fn set_state(&self, next: UpstreamState) {
        set_state(&self.state, next);
    }
}

/// Socket driver: the single task that owns the provider WebSocket.
///
/// One `select!` loop covers both directions plus the close signal. The
/// read/write split means the relay's two forwarding loops never contend on
/// the socket: they only touch their own channel half.
///
/// Exit paths:
/// - provider closes cleanly → state `Closed`, event channel dropped (EOF)
/// - transport error either direction → state `Errored`, error event emitted
/// - close signal (or all senders dropped) → end-of-stream message sent,
///   remaining provider traffic drained until the provider closes
async fn drive(
    mut sink: SplitSink<WsStream, Message>,
    mut stream: SplitStream<WsStream>,
    provider: Arc<dyn SttProvider>,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    event_tx: mpsc::Sender<RelayResult<TranscriptEvent>>,
    mut close_rx: watch::Receiver<bool>,
    state: SharedState,
) {
    let mut closing = false;

    loop {
        tokio::select! {
            _ = async { let _ = close_rx.wait_for(|closed| *closed).await; }, if !closing => {
                closing = true;
                set_state(&state, UpstreamState::Closing);
                if !begin_close(&mut sink, provider.as_ref()).await {
                    set_state(&state, UpstreamState::Errored);
                    break;
                }
                // Keep reading: the provider flushes remaining finals before
                // closing its side.
            }

            // The provider neither delivered nor closed after end-of-stream.
            _ = tokio::time::sleep(CLOSE_DRAIN_TIMEOUT), if closing => {
                debug!(
                    provider = provider.name(),
                    "provider did not close after end-of-stream, dropping socket"
                );
                break;
            }

            frame = audio_rx.recv(), if !closing => {
                match frame {
                    Some(data) => {
                        if let Err(err) = sink.send(Message::Binary(data)).await {
                            set_state(&state, UpstreamState::Errored);
                            let _ = event_tx.send(Err(err.into())).await;
                            break;
                        }
                    }
                    // Every sender handle dropped: treat as an orderly close.
                    None => {
                        closing = true;
                        set_state(&state, UpstreamState::Closing);
                        if !begin_close(&mut sink, provider.as_ref()).await {
                            set_state(&state, UpstreamState::Errored);
                            break;
                        }
                    }
                }
            }

            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(payload))) => {
                        match provider.parse_event(&payload) {
                            Ok(Some(event)) => {
                                if event_tx.send(Ok(event)).await.is_err() {
                                    // Receiver gone; nobody is listening.
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                // Never forward a payload that did not
                                // deserialize in full.
                                warn!(
                                    provider = provider.name(),
                                    error = %err,
                                    "discarding malformed provider payload"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        if get_state(&state) != UpstreamState::Errored {
                            set_state(&state, UpstreamState::Closed);
                        }
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary/ping/pong from the provider: nothing to do,
                        // tungstenite answers pings itself.
                    }
                    Some(Err(err)) => {
                        set_state(&state, UpstreamState::Errored);
                        let _ = event_tx.send(Err(err.into())).await;
                        break;
                    }
                }
            }
        }
    }

    if matches!(
        get_state(&state),
        UpstreamState::Open | UpstreamState::Closing
    ) {
        set_state(&state, UpstreamState::Closed);
    }
    debug!(
        provider = provider.name(),
        state = get_state(&state).as_str(),
        "upstream driver exited"
    );
    // event_tx drops here; the receiver observes end-of-stream.
}

/// Send the provider's end-of-stream message, falling back to a bare
/// WebSocket close frame for providers without one. Returns false on a
/// write failure.
async fn begin_close(
    sink: &mut SplitSink<WsStream, Message>,
    provider: &dyn SttProvider,
) -> bool {
    let result = match provider.close_message() {
        Some(text) => sink.send(Message::Text(text)).await,
        None => sink.send(Message::Close(None)).await,
    };
    result.is_ok()
}
