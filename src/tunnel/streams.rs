//! Registry of streams multiplexed over one tunnel session.
//!
//! Each public HTTP request or WebSocket owns one entry, keyed by its
//! correlation id. Entries hold only the *sending* halves of channels whose
//! receivers live with the public connection, so every mutation here is a
//! non-blocking channel operation and the lock is never held across an
//! `.await`. Removing an entry drops its senders, which is how the public
//! side learns the stream was finalized.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::frame::Headers;

/// Status and headers for a proxied HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

/// Tunnel-side half of one in-flight public HTTP request.
#[derive(Debug)]
pub struct HttpStream {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: mpsc::UnboundedSender<Bytes>,
    headers_sent: bool,
}

/// Public-side half of an [`HttpStream`].
///
/// `head` fails if the stream is finalized before a `response` arrived;
/// `body` ends when the stream is finalized.
#[derive(Debug)]
pub struct PendingResponse {
    pub head: oneshot::Receiver<ResponseHead>,
    pub body: mpsc::UnboundedReceiver<Bytes>,
}

impl HttpStream {
    pub fn new() -> (Self, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        (
            Self {
                head: Some(head_tx),
                body: body_tx,
                headers_sent: false,
            },
            PendingResponse {
                head: head_rx,
                body: body_rx,
            },
        )
    }
}

/// A message for a public WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsDelivery {
    Text(String),
    Binary(Bytes),
}

/// Tunnel-side half of one proxied public WebSocket. The receiver is drained
/// by the socket's writer task, which closes the socket once the sender is
/// dropped.
#[derive(Debug)]
pub struct WsStream {
    tx: mpsc::UnboundedSender<WsDelivery>,
    open: bool,
}

impl WsStream {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WsDelivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, open: true }, rx)
    }
}

#[derive(Debug)]
pub enum StreamEntry {
    Http(HttpStream),
    Ws(WsStream),
}

/// Result of routing one message to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The stream existed and the message was applied.
    Applied,
    /// No stream of the expected kind is registered under that id.
    UnknownId,
    /// The stream exists but cannot take this message (body before
    /// headers, duplicate response, socket already closed).
    Dropped,
    /// The message type is never valid in this direction.
    Unexpected,
}

/// Counts of streams torn down by [`StreamTable::close`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drained {
    pub http: usize,
    pub ws: usize,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, StreamEntry>,
    closed: bool,
}

/// Thread-safe map from correlation id to stream state.
#[derive(Debug, Default)]
pub struct StreamTable {
    inner: Mutex<Inner>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new stream. Fails if the id is taken or the table has
    /// already been closed with its session.
    pub fn register(&self, id: String, entry: StreamEntry) -> bool {
        let mut inner = self.lock();
        if inner.closed || inner.streams.contains_key(&id) {
            return false;
        }
        inner.streams.insert(id, entry);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().streams.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a stream regardless of kind. Used when the public side goes away.
    pub fn remove(&self, id: &str) -> Option<StreamEntry> {
        self.lock().streams.remove(id)
    }

    /// Hand the response head to the waiting public request.
    pub fn start_response(&self, id: &str, head: ResponseHead) -> Route {
        let mut inner = self.lock();
        let Some(StreamEntry::Http(stream)) = inner.streams.get_mut(id) else {
            return Route::UnknownId;
        };
        let Some(tx) = stream.head.take() else {
            return Route::Dropped;
        };
        stream.headers_sent = true;
        if tx.send(head).is_err() {
            inner.streams.remove(id);
            return Route::Dropped;
        }
        Route::Applied
    }

    /// Append body bytes. Ignored until the head has been sent.
    pub fn append_body(&self, id: &str, payload: Bytes) -> Route {
        let mut inner = self.lock();
        let Some(StreamEntry::Http(stream)) = inner.streams.get_mut(id) else {
            return Route::UnknownId;
        };
        if !stream.headers_sent {
            return Route::Dropped;
        }
        if stream.body.send(payload).is_err() {
            inner.streams.remove(id);
            return Route::Dropped;
        }
        Route::Applied
    }

    /// Finalize an HTTP response and forget the stream.
    pub fn finish_http(&self, id: &str) -> Route {
        let mut inner = self.lock();
        if !matches!(inner.streams.get(id), Some(StreamEntry::Http(_))) {
            return Route::UnknownId;
        }
        inner.streams.remove(id);
        Route::Applied
    }

    /// Deliver a message to a public WebSocket.
    pub fn deliver_ws(&self, id: &str, delivery: WsDelivery) -> Route {
        let mut inner = self.lock();
        let Some(StreamEntry::Ws(stream)) = inner.streams.get_mut(id) else {
            return Route::UnknownId;
        };
        if !stream.open {
            return Route::Dropped;
        }
        if stream.tx.send(delivery).is_err() {
            stream.open = false;
            return Route::Dropped;
        }
        Route::Applied
    }

    /// Close a public WebSocket and forget the stream.
    pub fn close_ws(&self, id: &str) -> Route {
        let mut inner = self.lock();
        if !matches!(inner.streams.get(id), Some(StreamEntry::Ws(_))) {
            return Route::UnknownId;
        }
        inner.streams.remove(id);
        Route::Applied
    }

    /// Tear down every stream and refuse new registrations.
    ///
    /// Returns `None` if the table was already closed.
    pub fn close(&self) -> Option<Drained> {
        let entries: Vec<StreamEntry> = {
            let mut inner = self.lock();
            if inner.closed {
                return None;
            }
            inner.closed = true;
            inner.streams.drain().map(|(_, entry)| entry).collect()
        };
        let mut drained = Drained::default();
        for entry in entries {
            match entry {
                StreamEntry::Http(_) => drained.http += 1,
                StreamEntry::Ws(_) => drained.ws += 1,
            }
        }
        Some(drained)
    }
}
