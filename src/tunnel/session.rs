//! The tunnel session and the slot that holds it.
//!
//! A [`TunnelSession`] is one control connection from the private client. It
//! moves through `AwaitingAuth → Authenticated → Closed` and owns the
//! [`StreamTable`] for every stream multiplexed over it. The [`TunnelSlot`]
//! guarantees that at most one session is live at a time: a newcomer is
//! rejected while the current session is awaiting auth or authenticated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::info;

use super::frame::{ChunkFrame, ControlMessage};
use super::streams::{Drained, StreamTable};

/// Normal closure after the peer went away.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Unrecoverable framing error on the binary stream.
pub const CLOSE_PROTOCOL: u16 = 1002;
/// Bad or missing token, or a message before `auth`.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
/// Another tunnel is already connected.
pub const CLOSE_CONFLICT: u16 = 4002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingAuth,
    Authenticated,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingAuth => "awaiting_auth",
            Self::Authenticated => "authenticated",
            Self::Closed => "closed",
        }
    }
}

/// Outbound traffic for the control connection, drained in order by the
/// session's single writer task.
#[derive(Debug)]
pub enum TunnelMessage {
    Control(ControlMessage),
    Chunk(Bytes),
}

/// Close code and reason the writer sends once the session is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

/// One control connection and everything multiplexed over it.
#[derive(Debug)]
pub struct TunnelSession {
    id: String,
    outbound: mpsc::Sender<TunnelMessage>,
    streams: StreamTable,
    authenticated: AtomicBool,
    closed: AtomicBool,
    closed_tx: watch::Sender<Option<CloseReason>>,
    created_at: Instant,
}

impl TunnelSession {
    pub fn new(outbound: mpsc::Sender<TunnelMessage>) -> Self {
        let (closed_tx, _) = watch::channel(None);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            outbound,
            streams: StreamTable::new(),
            authenticated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closed_tx,
            created_at: Instant::now(),
        }
    }

    /// Session id, for logs only. Never sent on the wire.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn streams(&self) -> &StreamTable {
        &self.streams
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) {
            SessionState::Closed
        } else if self.authenticated.load(Ordering::Acquire) {
            SessionState::Authenticated
        } else {
            SessionState::AwaitingAuth
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// Move from `AwaitingAuth` to `Authenticated`. Fails once closed.
    pub fn authenticate(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.authenticated.store(true, Ordering::Release);
        true
    }

    /// Holds the close reason once [`close`](Self::close) has run. The
    /// close frame travels here rather than through the bounded queue, so a
    /// full queue cannot hold it back.
    pub fn closed_signal(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed_tx.subscribe()
    }

    /// Queue a control message. Returns `false` (and drops the message) once
    /// the session is closed.
    pub async fn send(&self, msg: ControlMessage) -> bool {
        self.enqueue(TunnelMessage::Control(msg)).await
    }

    /// Queue one chunk frame of body bytes for `id`.
    pub async fn send_chunk(&self, id: &str, payload: &[u8]) -> bool {
        self.enqueue(TunnelMessage::Chunk(ChunkFrame::encode(id, payload)))
            .await
    }

    async fn enqueue(&self, msg: TunnelMessage) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.outbound.send(msg).await.is_ok()
    }

    /// Close the session: finalize every registered stream, then hand the
    /// close frame to the writer and wake the reader loop.
    ///
    /// Runs once; later calls return `None`.
    pub fn close(&self, code: u16, reason: &'static str) -> Option<Drained> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.authenticated.store(false, Ordering::Release);
        let drained = self.streams.close().unwrap_or_default();
        self.closed_tx.send_replace(Some(CloseReason { code, reason }));
        info!(
            session = %self.id,
            code,
            reason,
            http_streams = drained.http,
            ws_streams = drained.ws,
            "Tunnel session closed after {:.1}s",
            self.age().as_secs_f64()
        );
        Some(drained)
    }
}

/// Holder for the single live tunnel session.
#[derive(Clone, Debug, Default)]
pub struct TunnelSlot {
    current: Arc<RwLock<Option<Arc<TunnelSession>>>>,
}

impl TunnelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for a new control connection, unless one is already
    /// awaiting auth or authenticated.
    pub async fn claim(&self, outbound: mpsc::Sender<TunnelMessage>) -> Option<Arc<TunnelSession>> {
        let mut current = self.current.write().await;
        if let Some(existing) = current.as_ref() {
            if existing.state() != SessionState::Closed {
                info!(
                    session = %existing.id(),
                    state = existing.state().as_str(),
                    "Tunnel slot busy"
                );
                return None;
            }
        }
        let session = Arc::new(TunnelSession::new(outbound));
        *current = Some(Arc::clone(&session));
        Some(session)
    }

    /// The current session, if it has authenticated and is still open.
    pub async fn authenticated(&self) -> Option<Arc<TunnelSession>> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|s| s.is_authenticated())
            .cloned()
    }

    pub async fn current(&self) -> Option<Arc<TunnelSession>> {
        self.current.read().await.clone()
    }

    /// Empty the slot if it still holds `session`.
    pub async fn release(&self, session: &Arc<TunnelSession>) {
        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *current = None;
        }
    }

    /// Close and drop whatever session is live (server shutdown).
    pub async fn shutdown(&self) {
        let session = self.current.write().await.take();
        if let Some(session) = session {
            session.close(CLOSE_GOING_AWAY, "Server shutting down");
        }
    }
}
