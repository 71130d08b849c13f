//! Relay router and the control connection.
//!
//! The router serves the control WebSocket at `tunnel.path` and sends every
//! other request to the ingress fallback. A control connection claims the
//! tunnel slot, authenticates with its first message, then feeds the
//! demultiplexer until either side closes.

use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{stream::SplitStream, Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn, Instrument};

use super::demux;
use super::frame::{ChunkDecoder, ControlMessage};
use super::ingress;
use super::session::{
    CloseReason, TunnelMessage, TunnelSession, CLOSE_CONFLICT, CLOSE_NORMAL, CLOSE_PROTOCOL,
    CLOSE_UNAUTHORIZED,
};
use crate::state::AppState;

/// How long the writer gets to flush its close frame after the reader ends.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Build the relay router.
pub fn router(state: AppState) -> Router {
    let path = state.config.tunnel.path.clone();
    Router::new()
        .route(&path, get(control_upgrade))
        .fallback(ingress::public_entry)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn control_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_control(socket, state))
}

async fn handle_control(socket: WebSocket, state: AppState) {
    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.tunnel.outbound_buffer);
    let Some(session) = state.tunnel.claim(outbound_tx).await else {
        reject_conflict(socket).await;
        return;
    };

    let span = info_span!("tunnel_session", session = %session.id());
    async move {
        info!("Tunnel connection opened");
        let mut closed = session.closed_signal();
        let (sink, mut incoming) = socket.split();
        let mut writer = tokio::spawn(write_loop(sink, outbound_rx, session.closed_signal()));

        let timeout = Duration::from_secs(state.config.tunnel.auth_timeout_secs);
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(timeout, wait_for_auth(&mut incoming, &state.config.tunnel.token)) => {
                outcome.unwrap_or(AuthOutcome::TimedOut)
            }
            _ = closed.changed() => AuthOutcome::Disconnected,
        };

        match outcome {
            AuthOutcome::Accepted if session.authenticate() => {
                info!("Tunnel client authenticated");
                read_loop(&mut incoming, &session, &mut closed, state.config.tunnel.max_frame_bytes)
                    .await;
            }
            AuthOutcome::Accepted | AuthOutcome::Disconnected => {}
            AuthOutcome::Rejected => {
                warn!("Tunnel authentication failed");
            }
            AuthOutcome::TimedOut => {
                warn!(timeout_secs = timeout.as_secs(), "Tunnel authentication timed out");
            }
        }

        if session.is_authenticated() {
            session.close(CLOSE_NORMAL, "Connection closed");
        } else {
            session.close(CLOSE_UNAUTHORIZED, "Unauthorized");
        }
        state.tunnel.release(&session).await;

        if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
            debug!("Writer did not finish in time, aborting");
            writer.abort();
        }
    }
    .instrument(span)
    .await;
}

/// Tell a second tunnel client why it is being turned away.
async fn reject_conflict(mut socket: WebSocket) {
    warn!("Rejecting tunnel connection: a tunnel is already connected");
    let error = ControlMessage::Error {
        message: "A tunnel is already connected".into(),
    };
    let _ = socket.send(Message::Text(error.to_json().into())).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_CONFLICT,
            reason: "Tunnel already connected".into(),
        })))
        .await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthOutcome {
    Accepted,
    Rejected,
    TimedOut,
    Disconnected,
}

/// Read until the first data message and check it is a valid `auth`.
async fn wait_for_auth(incoming: &mut SplitStream<WebSocket>, token: &str) -> AuthOutcome {
    loop {
        let Some(Ok(msg)) = incoming.next().await else {
            return AuthOutcome::Disconnected;
        };
        match msg {
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return AuthOutcome::Disconnected,
            Message::Binary(_) => {
                warn!("Binary message before auth");
                return AuthOutcome::Rejected;
            }
            Message::Text(text) => {
                return match ControlMessage::parse(text.as_str()) {
                    Ok(msg) if crate::auth::is_valid_auth(token, &msg) => AuthOutcome::Accepted,
                    Ok(msg) => {
                        warn!(kind = msg.kind(), "First message is not a valid auth");
                        AuthOutcome::Rejected
                    }
                    Err(e) => {
                        warn!(error = %e, "Unparsable first message");
                        AuthOutcome::Rejected
                    }
                };
            }
        }
    }
}

/// Feed traffic from an authenticated client to the demultiplexer until the
/// connection ends, a framing error occurs, or the session is closed.
async fn read_loop(
    incoming: &mut SplitStream<WebSocket>,
    session: &TunnelSession,
    closed: &mut watch::Receiver<Option<CloseReason>>,
    max_frame_bytes: usize,
) {
    let mut decoder = ChunkDecoder::new(max_frame_bytes);
    loop {
        let msg = tokio::select! {
            msg = incoming.next() => msg,
            _ = closed.changed() => return,
        };
        match msg {
            Some(Ok(Message::Text(text))) => match ControlMessage::parse(text.as_str()) {
                Ok(msg) => {
                    demux::route_control(session.streams(), msg);
                }
                Err(e) => warn!(error = %e, "Dropping malformed control message"),
            },
            Some(Ok(Message::Binary(data))) => {
                decoder.push(&data);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => {
                            demux::route_chunk(session.streams(), frame);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Fatal framing error, closing tunnel");
                            session.close(CLOSE_PROTOCOL, "Protocol violation");
                            return;
                        }
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                info!(code = ?frame.map(|f| f.code), "Tunnel client closed the connection");
                return;
            }
            Some(Err(e)) => {
                warn!(error = %e, "Control connection failed");
                return;
            }
            None => {
                info!("Control connection ended");
                return;
            }
        }
    }
}

/// Drain the session's outbound queue onto the socket until the session
/// closes, then send its close frame. Queued traffic still waiting at that
/// point is discarded.
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<TunnelMessage>,
    mut closed: watch::Receiver<Option<CloseReason>>,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        if closed.borrow_and_update().is_some() {
            break;
        }
        let msg = tokio::select! {
            biased;
            changed = closed.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            msg = outbound.recv() => msg,
        };
        let frame = match msg {
            Some(TunnelMessage::Control(msg)) => Message::Text(msg.to_json().into()),
            Some(TunnelMessage::Chunk(bytes)) => Message::Binary(bytes),
            None => break,
        };
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "Control connection write failed");
            return;
        }
    }

    let reason = *closed.borrow();
    if let Some(CloseReason { code, reason }) = reason {
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }));
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "Could not send close frame");
        }
    }
}
