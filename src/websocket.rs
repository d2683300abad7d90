//! # Client WebSocket Transport
//!
//! The browser-facing side of a session. Clients connect to `/`, stream raw
//! binary PCM frames (no envelope: each message is exactly one audio
//! chunk), and receive UTF-8 JSON transcript messages back.
//!
//! ## Actor Model:
//! Each connection is an independent Actix actor. The actor is deliberately
//! thin: it bridges the socket to the relay core's channel pair and owns
//! nothing else. Inbound binary frames go into the frame channel (closing it
//! is the disconnect signal the relay watches); outbound messages arrive as
//! a stream the relay writes, and that stream ending tells the actor to
//! close the socket, which is how upstream failures propagate to the
//! client within the grace period.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::web::Bytes;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::health;
use crate::relay::core::ClientIo;
use crate::relay::session::Session;
use crate::relay::ServerMessage;
use crate::supervisor;
use crate::state::AppState;
use crate::upstream::UpstreamConnection;

/// How often we ping the client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long without any pong/traffic before we consider the client gone.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Inbound audio frames buffered toward the relay. At 20ms per frame this
/// is several seconds of audio; a backlog this deep means the upstream has
/// stalled and dropping is better than buffering without bound.
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Outbound transcript messages buffered toward the socket.
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// WebSocket actor for one client connection.
pub struct RelayWebSocket {
    /// The session this connection belongs to
    session: Arc<Session>,

    /// Inbound audio frames toward the relay; dropping it signals disconnect
    frame_tx: Option<mpsc::Sender<Bytes>>,

    /// Outbound messages from the relay, attached as a stream on start
    outbound_rx: Option<mpsc::Receiver<ServerMessage>>,

    /// Last time the client showed signs of life
    last_heartbeat: Instant,
}

impl RelayWebSocket {
    pub fn new(
        session: Arc<Session>,
        frame_tx: mpsc::Sender<Bytes>,
        outbound_rx: mpsc::Receiver<ServerMessage>,
    ) -> Self {
        Self {
            session,
            frame_tx: Some(frame_tx),
            outbound_rx: Some(outbound_rx),
            last_heartbeat: Instant::now(),
        }
    }

    /// Start the liveness ping. A client that stops answering is treated as
    /// disconnected, so a half-open TCP connection still triggers the
    /// failure-coupling path instead of holding the upstream open.
    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    session_id = %act.session.id,
                    "client heartbeat timeout, closing connection"
                );
                act.frame_tx.take();
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session.id, "client connection started");
        self.heartbeat(ctx);

        if let Some(outbound_rx) = self.outbound_rx.take() {
            ctx.add_stream(ReceiverStream::new(outbound_rx));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the frame sender is the disconnect signal the relay's
        // audio loop is waiting on.
        self.frame_tx.take();
        info!(session_id = %self.session.id, "client connection stopped");
    }
}

/// Inbound traffic from the client socket.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                if let Some(frame_tx) = &self.frame_tx {
                    match frame_tx.try_send(data) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(
                                session_id = %self.session.id,
                                "inbound audio backlog, dropping frame"
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            // Relay already finished; the outbound stream's
                            // end will close this socket shortly.
                            self.frame_tx = None;
                        }
                    }
                }
            }
            Ok(ws::Message::Text(_)) => {
                warn!(
                    session_id = %self.session.id,
                    "ignoring unexpected text frame from client"
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session.id, ?reason, "client closed connection");
                self.frame_tx.take();
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session.id, "unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(
                    session_id = %self.session.id,
                    error = %err,
                    "websocket protocol error"
                );
                self.frame_tx.take();
                ctx.stop();
            }
        }
    }
}

/// Outbound traffic from the relay.
impl StreamHandler<ServerMessage> for RelayWebSocket {
    fn handle(&mut self, msg: ServerMessage, ctx: &mut Self::Context) {
        if let Ok(json) = serde_json::to_string(&msg) {
            ctx.text(json);
        }
    }

    /// The relay dropped its outbound sender: the session is over, close the
    /// socket. This is the client half of the failure-coupling invariant.
    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(session_id = %self.session.id, "relay finished, closing client socket");
        self.frame_tx.take();
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// Whether the request asks for a WebSocket upgrade.
fn wants_websocket(req: &HttpRequest) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Entry point for `/`: WebSocket upgrades become sessions, plain GETs get
/// the health text.
///
/// ## HTTP to WebSocket Upgrade:
/// Acceptance is synchronous: register the session, wire the channel pair,
/// hand the relay its half. It never waits on relay work. The upstream
/// connect is started here but only awaited inside the session task, so a
/// slow or failing provider cannot delay the accept loop.
pub async fn relay_entry(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    if !wants_websocket(&req) {
        return Ok(health::index().await);
    }

    let session = Session::new();
    let cancel_rx = match state.registry().register(session.clone()) {
        Ok(cancel_rx) => cancel_rx,
        Err(message) => {
            warn!(error = %message, "refusing connection");
            return Ok(HttpResponse::ServiceUnavailable()
                .content_type("text/plain")
                .body(message));
        }
    };

    info!(
        session_id = %session.id,
        peer = ?req.connection_info().peer_addr(),
        "accepted client connection"
    );

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

    let connect = UpstreamConnection::connect(state.provider(), state.config().upstream.clone());
    supervisor::spawn_session(
        state.get_ref().clone(),
        session.clone(),
        ClientIo {
            frames: frame_rx,
            outbound: outbound_tx,
        },
        connect,
        cancel_rx,
    );

    ws::start(RelayWebSocket::new(session, frame_tx, outbound_rx), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_upgrade_detection() {
        let upgrade = TestRequest::default()
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "upgrade"))
            .to_http_request();
        assert!(wants_websocket(&upgrade));

        let upgrade_mixed_case = TestRequest::default()
            .insert_header(("upgrade", "WebSocket"))
            .to_http_request();
        assert!(wants_websocket(&upgrade_mixed_case));

        let plain = TestRequest::default().to_http_request();
        assert!(!wants_websocket(&plain));
    }
}
