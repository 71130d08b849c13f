//! Tunnel client: the private end of the tunnel.
//!
//! Dials the relay's control path, authenticates, then serves each proxied
//! request against a local backend. Reconnects with exponential backoff
//! until the relay rejects the token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, Response};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::frame::{
    apply_headers, decode_ws_payload, headers_from_http, ChunkDecoder, ChunkFrame,
    ControlMessage, HeaderField, Headers,
};
use super::session::CLOSE_UNAUTHORIZED;
use crate::config::Config;
use crate::error::ClientError;

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Shared write half of the relay connection.
type WsSink = Arc<Mutex<SplitSink<RelaySocket, Message>>>;

/// Local WebSockets keyed by stream id.
type LocalSockets = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>>;

type BackendClient = Client<HttpConnector, Full<Bytes>>;

/// Request headers the backend must compute itself.
const SKIP_REQUEST_HEADERS: &[&str] = &["host", "content-length", "transfer-encoding"];

/// Handshake headers the local WebSocket connection generates itself.
const SKIP_HANDSHAKE_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

/// Where proxied traffic goes.
struct Backend {
    http: BackendClient,
    target: String,
    chunk_size: usize,
}

/// Unfinished requests kept per relay connection. The relay sends no `end`
/// for a request whose public client hung up mid-upload, so the oldest
/// entries are evicted past this limit.
const MAX_PENDING_REQUESTS: usize = 1024;

/// A proxied request whose body is still arriving.
struct PendingRequest {
    method: String,
    url: String,
    headers: Headers,
    body: Vec<Bytes>,
}

/// Requests between `request` and `end`, oldest evicted first once full.
struct PendingRequests {
    requests: HashMap<String, (u64, PendingRequest)>,
    next_seq: u64,
    limit: usize,
}

impl PendingRequests {
    fn new(limit: usize) -> Self {
        Self {
            requests: HashMap::new(),
            next_seq: 0,
            limit,
        }
    }

    fn insert(&mut self, id: String, request: PendingRequest) {
        if !self.requests.contains_key(&id) && self.len() >= self.limit {
            let oldest = self
                .requests
                .iter()
                .min_by_key(|(_, (seq, _))| *seq)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                self.requests.remove(&oldest);
                warn!(id = %oldest, "Too many unfinished requests, dropping the oldest");
            }
        }
        self.requests.insert(id, (self.next_seq, request));
        self.next_seq += 1;
    }

    fn append(&mut self, frame: ChunkFrame) {
        match self.requests.get_mut(&frame.id) {
            Some((_, request)) => request.body.push(frame.payload),
            None => debug!(id = %frame.id, "Body chunk for unknown request"),
        }
    }

    fn take(&mut self, id: &str) -> Option<PendingRequest> {
        self.requests.remove(id).map(|(_, request)| request)
    }

    fn len(&self) -> usize {
        self.requests.len()
    }
}

/// Run the client until the relay rejects the token. Connection failures
/// are retried forever.
pub async fn run(config: Arc<Config>) -> Result<(), ClientError> {
    let relay_url = config
        .client
        .relay_url
        .clone()
        .ok_or(ClientError::MissingRelayUrl)?;
    let backend = Arc::new(Backend {
        http: Client::builder(TokioExecutor::new()).build_http(),
        target: config.client.target.trim_end_matches('/').to_string(),
        chunk_size: config.client.chunk_size,
    });

    let base_delay = Duration::from_secs(config.client.reconnect_delay_secs);
    let max_delay = Duration::from_secs(config.client.reconnect_max_delay_secs);
    let mut delay = base_delay;

    loop {
        info!("Connecting to relay at {relay_url}");
        match connect_and_run(&config, &relay_url, &backend).await {
            Ok(()) => {
                info!("Relay connection closed, reconnecting...");
                delay = base_delay;
            }
            Err(ClientError::Unauthorized) => return Err(ClientError::Unauthorized),
            Err(e) => {
                warn!("Relay connection error: {e}, reconnecting in {}s", delay.as_secs());
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

/// One connection attempt: connect, authenticate, serve until disconnect.
async fn connect_and_run(
    config: &Config,
    relay_url: &str,
    backend: &Arc<Backend>,
) -> Result<(), ClientError> {
    let (socket, _response) = tokio_tungstenite::connect_async(relay_url).await?;
    let (sink, stream) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));
    info!("Connected to relay, authenticating");

    let auth = ControlMessage::Auth {
        token: config.tunnel.token.clone(),
    };
    send_control(&sink, &auth).await?;

    let sockets: LocalSockets = Arc::default();
    let result = serve_relay(stream, &sink, &sockets, backend, config.tunnel.max_frame_bytes).await;

    // Dropping the senders closes every local socket.
    let orphaned = {
        let mut sockets = sockets.lock().await;
        let count = sockets.len();
        sockets.clear();
        count
    };
    if orphaned > 0 {
        info!(count = orphaned, "Closed local WebSockets after relay disconnect");
    }
    result
}

async fn serve_relay(
    mut stream: SplitStream<RelaySocket>,
    sink: &WsSink,
    sockets: &LocalSockets,
    backend: &Arc<Backend>,
    max_frame_bytes: usize,
) -> Result<(), ClientError> {
    let mut decoder = ChunkDecoder::new(max_frame_bytes);
    let mut pending = PendingRequests::new(MAX_PENDING_REQUESTS);

    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => match ControlMessage::parse(text.as_str()) {
                Ok(msg) => handle_relay_message(msg, &mut pending, sink, sockets, backend).await,
                Err(e) => warn!(error = %e, "Dropping malformed message from relay"),
            },
            Message::Binary(data) => {
                decoder.push(&data);
                while let Some(frame) = decoder.next_frame()? {
                    pending.append(frame);
                }
            }
            Message::Close(frame) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                info!(?code, "Relay closed the connection");
                if code == Some(CLOSE_UNAUTHORIZED) {
                    return Err(ClientError::Unauthorized);
                }
                return Ok(());
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    Ok(())
}

async fn handle_relay_message(
    msg: ControlMessage,
    pending: &mut PendingRequests,
    sink: &WsSink,
    sockets: &LocalSockets,
    backend: &Arc<Backend>,
) {
    match msg {
        ControlMessage::Request {
            id,
            method,
            url,
            headers,
        } => {
            debug!(%id, %method, %url, "Proxied request started");
            pending.insert(
                id,
                PendingRequest {
                    method,
                    url,
                    headers,
                    body: Vec::new(),
                },
            );
        }
        ControlMessage::End { id } => match pending.take(&id) {
            Some(request) => {
                tokio::spawn(serve_http(Arc::clone(sink), Arc::clone(backend), id, request));
            }
            None => debug!(%id, "End for unknown request"),
        },
        ControlMessage::WsInit { id, url, headers } => {
            // Register before connecting so frames sent right after ws-init
            // queue up instead of being lost.
            let (tx, rx) = mpsc::unbounded_channel();
            sockets.lock().await.insert(id.clone(), tx);
            tokio::spawn(serve_websocket(
                Arc::clone(sink),
                Arc::clone(sockets),
                Arc::clone(backend),
                id,
                url,
                headers,
                rx,
            ));
        }
        ControlMessage::WsFrame {
            id,
            data,
            is_binary,
        } => {
            let payload = match decode_ws_payload(&data) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(%id, error = %e, "Dropping ws-frame with invalid base64");
                    return;
                }
            };
            let msg = if is_binary {
                Message::Binary(payload.into())
            } else {
                Message::Text(String::from_utf8_lossy(&payload).into_owned().into())
            };
            if let Some(tx) = sockets.lock().await.get(&id) {
                let _ = tx.send(msg);
            }
        }
        ControlMessage::WsClose { id } => {
            if sockets.lock().await.remove(&id).is_some() {
                debug!(%id, "Relay closed WebSocket");
            }
        }
        ControlMessage::Error { message } => warn!("Relay reported an error: {message}"),
        other @ (ControlMessage::Auth { .. } | ControlMessage::Response { .. }) => {
            warn!(kind = other.kind(), "Ignoring unexpected message from relay");
        }
    }
}

async fn send_control(sink: &WsSink, msg: &ControlMessage) -> Result<(), ClientError> {
    sink.lock()
        .await
        .send(Message::Text(msg.to_json().into()))
        .await?;
    Ok(())
}

/// Send `data` as chunk frames of at most `chunk_size` bytes.
async fn send_body(sink: &WsSink, id: &str, data: &[u8], chunk_size: usize) -> Result<(), ClientError> {
    for piece in data.chunks(chunk_size) {
        let frame = ChunkFrame::encode(id, piece);
        sink.lock().await.send(Message::Binary(frame)).await?;
    }
    Ok(())
}

/// Issue a completed request against the backend and stream the answer back.
async fn serve_http(sink: WsSink, backend: Arc<Backend>, id: String, request: PendingRequest) {
    let outcome = match fetch(&backend, request).await {
        Ok(response) => relay_response(&sink, &backend, &id, response).await,
        Err(e) => {
            warn!(%id, error = %e, "Backend request failed");
            relay_failure(&sink, &backend, &id, &e).await
        }
    };
    if let Err(e) = outcome {
        debug!(%id, error = %e, "Could not deliver response to relay");
    }
}

async fn fetch(backend: &Backend, request: PendingRequest) -> Result<Response<Incoming>, ClientError> {
    let body: Vec<u8> = request.body.concat();
    let mut outgoing = Request::builder()
        .method(request.method.as_str())
        .uri(format!("{}{}", backend.target, request.url))
        .body(Full::new(Bytes::from(body)))?;
    apply_headers(outgoing.headers_mut(), &request.headers, SKIP_REQUEST_HEADERS);
    Ok(backend.http.request(outgoing).await?)
}

async fn relay_response(
    sink: &WsSink,
    backend: &Backend,
    id: &str,
    response: Response<Incoming>,
) -> Result<(), ClientError> {
    let head = ControlMessage::Response {
        id: id.to_string(),
        status: response.status().as_u16(),
        headers: headers_from_http(response.headers()),
    };
    send_control(sink, &head).await?;

    let mut body = response.into_body();
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Ok(data) = frame.into_data() {
                    send_body(sink, id, &data, backend.chunk_size).await?;
                }
            }
            Err(e) => {
                warn!(%id, error = %e, "Backend response body failed");
                break;
            }
        }
    }
    send_control(sink, &ControlMessage::End { id: id.to_string() }).await
}

/// Report a backend failure as a plain-text 500.
async fn relay_failure(
    sink: &WsSink,
    backend: &Backend,
    id: &str,
    error: &ClientError,
) -> Result<(), ClientError> {
    let mut headers = Headers::new();
    headers.insert("content-type".into(), HeaderField::One("text/plain".into()));
    let head = ControlMessage::Response {
        id: id.to_string(),
        status: 500,
        headers,
    };
    send_control(sink, &head).await?;
    send_body(sink, id, error.to_string().as_bytes(), backend.chunk_size).await?;
    send_control(sink, &ControlMessage::End { id: id.to_string() }).await
}

/// `http(s)://host` + path → `ws(s)://host` + path.
fn websocket_url(target: &str, url: &str) -> String {
    let base = if let Some(rest) = target.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = target.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        target.to_string()
    };
    format!("{base}{url}")
}

async fn serve_websocket(
    sink: WsSink,
    sockets: LocalSockets,
    backend: Arc<Backend>,
    id: String,
    url: String,
    headers: Headers,
    outbound: mpsc::UnboundedReceiver<Message>,
) {
    let ws_url = websocket_url(&backend.target, &url);
    info!(%id, url = %ws_url, "Opening local WebSocket");
    if let Err(e) = proxy_local_websocket(&sink, &id, &ws_url, &headers, outbound).await {
        warn!(%id, error = %e, "Local WebSocket failed");
    }
    sockets.lock().await.remove(&id);
    let _ = send_control(&sink, &ControlMessage::WsClose { id: id.clone() }).await;
    info!(%id, "Local WebSocket closed");
}

async fn proxy_local_websocket(
    sink: &WsSink,
    id: &str,
    ws_url: &str,
    headers: &Headers,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) -> Result<(), ClientError> {
    let mut request = ws_url.into_client_request()?;
    apply_headers(request.headers_mut(), headers, SKIP_HANDSHAKE_HEADERS);
    let (local, _response) = tokio_tungstenite::connect_async(request).await?;
    let (mut local_sink, mut local_stream) = local.split();

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    // The relay closed this stream.
                    let _ = local_sink.close().await;
                    return Ok(());
                };
                local_sink.send(msg).await?;
            }
            msg = local_stream.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => {
                        ControlMessage::ws_frame(id, text.as_str().as_bytes(), false)
                    }
                    Some(Ok(Message::Binary(data))) => ControlMessage::ws_frame(id, &data, true),
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };
                send_control(sink, &frame).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("http://127.0.0.1:3000", "/chat?x=1"),
            "ws://127.0.0.1:3000/chat?x=1"
        );
        assert_eq!(
            websocket_url("https://backend.local", "/socket"),
            "wss://backend.local/socket"
        );
        assert_eq!(websocket_url("ws://already", "/a"), "ws://already/a");
    }

    fn post() -> PendingRequest {
        PendingRequest {
            method: "POST".into(),
            url: "/".into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    fn chunk(id: &str, data: &'static str) -> ChunkFrame {
        ChunkFrame {
            id: id.into(),
            payload: Bytes::from(data),
        }
    }

    #[test]
    fn test_body_chunks_collect_per_request() {
        let mut pending = PendingRequests::new(MAX_PENDING_REQUESTS);
        pending.insert("a".into(), post());
        pending.insert("b".into(), post());
        for (id, data) in [("a", "he"), ("b", "x"), ("a", "llo"), ("ghost", "zzz")] {
            pending.append(chunk(id, data));
        }
        assert_eq!(pending.take("a").unwrap().body.concat(), b"hello");
        assert_eq!(pending.take("b").unwrap().body.concat(), b"x");
        assert!(pending.take("ghost").is_none());
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_abandoned_requests_are_evicted_oldest_first() {
        let mut pending = PendingRequests::new(3);
        for id in ["r0", "r1", "r2"] {
            pending.insert(id.into(), post());
        }
        pending.append(chunk("r0", "never finished"));

        pending.insert("r3".into(), post());
        pending.insert("r4".into(), post());

        assert_eq!(pending.len(), 3);
        assert!(pending.take("r0").is_none());
        assert!(pending.take("r1").is_none());
        for id in ["r2", "r3", "r4"] {
            assert!(pending.take(id).is_some(), "{id} should still be pending");
        }
    }

    #[tokio::test]
    async fn test_run_requires_relay_url() {
        let config = Arc::new(Config::default());
        assert!(matches!(
            run(config).await,
            Err(ClientError::MissingRelayUrl)
        ));
    }
}
