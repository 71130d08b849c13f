//! Public side of the relay: every HTTP request and WebSocket upgrade that is
//! not the control connection lands here and becomes a tunnel stream.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Request, State,
    },
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::frame::{apply_headers, headers_from_http, ControlMessage, Headers};
use super::session::TunnelSession;
use super::streams::{HttpStream, PendingResponse, ResponseHead, StreamEntry, WsDelivery, WsStream};
use crate::state::AppState;

const NOT_CONNECTED: &str = "Tunnel client not connected or not authenticated";
const CLOSED_EARLY: &str = "Tunnel closed before the response started";

/// Connection-level headers that must not be copied from the tunnel's
/// response onto the public one.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Fallback handler for all public traffic.
pub async fn public_entry(State(state): State<AppState>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    if wants_websocket(&parts.headers) {
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => forward_websocket(&state, ws, &parts).await,
            Err(rejection) => rejection.into_response(),
        };
    }
    forward_http(&state, parts, body).await
}

fn wants_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("websocket"))
}

fn request_url(parts: &Parts) -> String {
    parts
        .uri
        .path_and_query()
        .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string())
}

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, NOT_CONNECTED).into_response()
}

fn bad_gateway(message: &'static str) -> Response {
    (StatusCode::BAD_GATEWAY, message).into_response()
}

/// Removes the stream from its table when the public side is done with it,
/// whether the response completed or the client disconnected.
struct StreamGuard {
    session: Arc<TunnelSession>,
    id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.session.streams().remove(&self.id).is_some() {
            debug!(id = %self.id, "Public client went away, stream removed");
        }
    }
}

async fn forward_http(state: &AppState, parts: Parts, body: Body) -> Response {
    let Some(session) = state.tunnel.authenticated().await else {
        return unavailable();
    };

    let id = uuid::Uuid::new_v4().to_string();
    let (stream, pending) = HttpStream::new();
    if !session.streams().register(id.clone(), StreamEntry::Http(stream)) {
        return unavailable();
    }
    let guard = StreamGuard {
        session: Arc::clone(&session),
        id: id.clone(),
    };

    debug!(%id, method = %parts.method, uri = %parts.uri, "Forwarding request");
    let request = ControlMessage::Request {
        id: id.clone(),
        method: parts.method.to_string(),
        url: request_url(&parts),
        headers: headers_from_http(&parts.headers),
    };
    if !session.send(request).await {
        return bad_gateway(CLOSED_EARLY);
    }
    tokio::spawn(upload_body(Arc::clone(&session), id, body));

    let PendingResponse { head, body } = pending;
    match head.await {
        Ok(head) => build_response(head, body, guard),
        Err(_) => bad_gateway(CLOSED_EARLY),
    }
}

/// Forward the public request body as chunk frames, then `end`.
async fn upload_body(session: Arc<TunnelSession>, id: String, body: Body) {
    let mut data = body.into_data_stream();
    while let Some(chunk) = data.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%id, error = %e, "Public request body failed");
                session.streams().remove(&id);
                return;
            }
        };
        if bytes.is_empty() {
            continue;
        }
        if !session.streams().contains(&id) || !session.send_chunk(&id, &bytes).await {
            return;
        }
    }
    if session.streams().contains(&id) {
        session.send(ControlMessage::End { id }).await;
    }
}

fn build_response(
    head: ResponseHead,
    body: mpsc::UnboundedReceiver<Bytes>,
    guard: StreamGuard,
) -> Response {
    let status = StatusCode::from_u16(head.status).unwrap_or_else(|_| {
        warn!(id = %guard.id, status = head.status, "Tunnel sent an invalid status");
        StatusCode::BAD_GATEWAY
    });

    // The guard rides along with the body so the stream stays registered
    // until the public client has read it or hung up.
    let stream = futures::stream::unfold((body, guard), |(mut body, guard)| async move {
        let bytes = body.recv().await?;
        Some((Ok::<Bytes, std::io::Error>(bytes), (body, guard)))
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    apply_headers(response.headers_mut(), &head.headers, HOP_BY_HOP);
    response
}

async fn forward_websocket(state: &AppState, ws: WebSocketUpgrade, parts: &Parts) -> Response {
    let Some(session) = state.tunnel.authenticated().await else {
        return unavailable();
    };
    let url = request_url(parts);
    let headers = headers_from_http(&parts.headers);
    ws.on_upgrade(move |socket| proxy_websocket(session, socket, url, headers))
}

async fn proxy_websocket(session: Arc<TunnelSession>, socket: WebSocket, url: String, headers: Headers) {
    let (mut sink, mut incoming) = socket.split();

    let id = uuid::Uuid::new_v4().to_string();
    let (stream, mut deliveries) = WsStream::new();
    if !session.streams().register(id.clone(), StreamEntry::Ws(stream)) {
        let _ = sink.send(Message::Close(None)).await;
        return;
    }
    info!(%id, %url, "Public WebSocket opened");

    let init = ControlMessage::WsInit {
        id: id.clone(),
        url,
        headers,
    };
    if !session.send(init).await {
        session.streams().remove(&id);
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    // Writer: tunnel → public socket. Ends when the stream is removed.
    let mut writer = tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let msg = match delivery {
                WsDelivery::Text(text) => Message::Text(text.into()),
                WsDelivery::Binary(data) => Message::Binary(data),
            };
            if sink.send(msg).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    // Reader: public socket → tunnel.
    loop {
        let msg = tokio::select! {
            msg = incoming.next() => msg,
            _ = &mut writer => break,
        };
        let frame = match msg {
            Some(Ok(Message::Text(text))) => ControlMessage::ws_frame(&id, text.as_str().as_bytes(), false),
            Some(Ok(Message::Binary(data))) => ControlMessage::ws_frame(&id, &data, true),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_)) | Err(_)) | None => break,
        };
        if session.is_authenticated() && session.streams().contains(&id) {
            session.send(frame).await;
        }
    }

    if session.streams().remove(&id).is_some() {
        session.send(ControlMessage::WsClose { id: id.clone() }).await;
    }
    info!(%id, "Public WebSocket closed");
}
