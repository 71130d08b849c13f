//! Wire format of the control connection.
//!
//! Two representations share the one WebSocket:
//!
//! - **Control messages** travel as text frames holding a JSON object with a
//!   `"type"` discriminator (see [`ControlMessage`]).
//! - **Chunk frames** travel as binary frames and carry streamed HTTP body
//!   bytes without the JSON/base64 overhead:
//!
//! ```text
//! +--------+-------------+------------------+----------+---------------+
//! | "CHNK" | id_len u32  | payload_len u32  | id bytes | payload bytes |
//! +--------+-------------+------------------+----------+---------------+
//!   4 B      big-endian    big-endian         id_len     payload_len
//! ```
//!
//! Frames may be split across or concatenated within transport messages, so
//! the binary side is decoded as a byte stream by [`ChunkDecoder`].

use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::error::FrameError;

/// Leading bytes of every chunk frame.
pub const CHUNK_MAGIC: &[u8; 4] = b"CHNK";

/// Magic + id length + payload length.
pub const CHUNK_HEADER_LEN: usize = 12;

/// Correlation ids are UUIDs; anything near this size is garbage.
pub const MAX_ID_LEN: usize = 256;

/// Default bound on `id_len + payload_len` for a single chunk frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// One header's value(s). Repeated headers (notably `Set-Cookie`) travel as
/// an array, everything else as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderField {
    One(String),
    Many(Vec<String>),
}

impl HeaderField {
    pub fn values(&self) -> &[String] {
        match self {
            Self::One(v) => std::slice::from_ref(v),
            Self::Many(vs) => vs,
        }
    }
}

/// Header map as it appears on the wire.
pub type Headers = BTreeMap<String, HeaderField>;

/// A control message, discriminated on the wire by its `"type"` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Client → server, first message on the connection.
    Auth { token: String },
    /// Server → client: a new public HTTP request.
    Request {
        id: String,
        method: String,
        url: String,
        #[serde(default, deserialize_with = "nullable")]
        headers: Headers,
    },
    /// Client → server: status line and headers for request `id`.
    Response {
        id: String,
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default, deserialize_with = "nullable")]
        headers: Headers,
    },
    /// Both directions: the body for `id` is complete.
    End { id: String },
    /// Server → client: a new public WebSocket.
    WsInit {
        id: String,
        url: String,
        #[serde(default, deserialize_with = "nullable")]
        headers: Headers,
    },
    /// Both directions: one WebSocket message, base64 encoded.
    WsFrame {
        id: String,
        data: String,
        #[serde(rename = "isBinary", default)]
        is_binary: bool,
    },
    /// Both directions: the named WebSocket endpoint closed.
    WsClose { id: String },
    /// Server → client: informational, the connection is about to close.
    Error { message: String },
}

fn default_status() -> u16 {
    200
}

fn nullable<'de, D>(deserializer: D) -> Result<Headers, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Headers>::deserialize(deserializer)?.unwrap_or_default())
}

impl ControlMessage {
    /// Parse a text frame. Unknown types and missing fields are reported as
    /// the recoverable [`FrameError::Json`].
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("control messages always serialize")
    }

    /// Build a `ws-frame` carrying `payload`.
    pub fn ws_frame(id: &str, payload: &[u8], is_binary: bool) -> Self {
        Self::WsFrame {
            id: id.to_string(),
            data: BASE64.encode(payload),
            is_binary,
        }
    }

    /// The wire name of this message's type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::End { .. } => "end",
            Self::WsInit { .. } => "ws-init",
            Self::WsFrame { .. } => "ws-frame",
            Self::WsClose { .. } => "ws-close",
            Self::Error { .. } => "error",
        }
    }
}

/// Decode the `data` field of a `ws-frame`.
pub fn decode_ws_payload(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data)
}

/// One decoded chunk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub id: String,
    pub payload: Bytes,
}

impl ChunkFrame {
    /// Encode a frame for `id` carrying `payload`.
    pub fn encode(id: &str, payload: &[u8]) -> Bytes {
        let id = id.as_bytes();
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + id.len() + payload.len());
        buf.put_slice(CHUNK_MAGIC);
        buf.put_u32(id.len() as u32);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(id);
        buf.put_slice(payload);
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    NeedHeader,
    NeedBody { id_len: usize, payload_len: usize },
}

/// Incremental decoder for the binary side of the control connection.
///
/// Bytes are fed with [`push`](Self::push) as transport messages arrive and
/// complete frames pulled with [`next_frame`](Self::next_frame). A single
/// buffer is reused across frames and never grows past one frame plus
/// whatever trailing bytes arrived with it.
#[derive(Debug)]
pub struct ChunkDecoder {
    buf: BytesMut,
    state: DecodeState,
    max_frame_bytes: usize,
}

impl ChunkDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: DecodeState::NeedHeader,
            max_frame_bytes,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Any error is fatal:
    /// the decoder is left mid-stream and must be discarded with its
    /// connection.
    pub fn next_frame(&mut self) -> Result<Option<ChunkFrame>, FrameError> {
        if let DecodeState::NeedHeader = self.state {
            if self.buf.len() >= CHUNK_MAGIC.len() && self.buf[..4] != CHUNK_MAGIC[..] {
                let mut magic = [0u8; 4];
                magic.copy_from_slice(&self.buf[..4]);
                return Err(FrameError::BadMagic(magic));
            }
            if self.buf.len() < CHUNK_HEADER_LEN {
                return Ok(None);
            }
            self.buf.advance(CHUNK_MAGIC.len());
            let id_len = self.buf.get_u32() as usize;
            let payload_len = self.buf.get_u32() as usize;
            if id_len > MAX_ID_LEN {
                return Err(FrameError::IdTooLong {
                    len: id_len,
                    max: MAX_ID_LEN,
                });
            }
            let total = id_len.saturating_add(payload_len);
            if total > self.max_frame_bytes {
                return Err(FrameError::FrameTooLarge {
                    len: total,
                    max: self.max_frame_bytes,
                });
            }
            self.buf.reserve(total.saturating_sub(self.buf.len()));
            self.state = DecodeState::NeedBody {
                id_len,
                payload_len,
            };
        }

        let DecodeState::NeedBody {
            id_len,
            payload_len,
        } = self.state
        else {
            return Ok(None);
        };
        if self.buf.len() < id_len + payload_len {
            return Ok(None);
        }

        let id_bytes = self.buf.split_to(id_len);
        let payload = self.buf.split_to(payload_len).freeze();
        self.state = DecodeState::NeedHeader;

        let id = std::str::from_utf8(&id_bytes)
            .map_err(|_| FrameError::InvalidId)?
            .to_string();
        Ok(Some(ChunkFrame { id, payload }))
    }
}

/// Convert an HTTP header map to its wire form. Names arrive lowercased;
/// non-UTF-8 values are converted lossily.
pub fn headers_from_http(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for name in map.keys() {
        let mut values: Vec<String> = map
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        let field = if values.len() == 1 {
            HeaderField::One(values.remove(0))
        } else {
            HeaderField::Many(values)
        };
        headers.insert(name.as_str().to_string(), field);
    }
    headers
}

/// Append wire headers to `target`, skipping names listed in `skip`
/// (lowercase) and anything that is not a valid header name or value.
pub fn apply_headers(target: &mut HeaderMap, headers: &Headers, skip: &[&str]) {
    for (name, field) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(header = %name, "Skipping invalid header name");
            continue;
        };
        if skip.contains(&name.as_str()) {
            continue;
        }
        for value in field.values() {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    target.append(name.clone(), value);
                }
                Err(_) => debug!(header = %name, "Skipping invalid header value"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> ChunkDecoder {
        ChunkDecoder::new(DEFAULT_MAX_FRAME_BYTES)
    }

    #[test]
    fn test_parse_auth() {
        let msg = ControlMessage::parse(r#"{"type":"auth","token":"T"}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Auth {
                token: "T".to_string()
            }
        );
    }

    #[test]
    fn test_response_defaults() {
        let msg = ControlMessage::parse(r#"{"type":"response","id":"a"}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Response {
                id: "a".to_string(),
                status: 200,
                headers: Headers::new(),
            }
        );

        let msg =
            ControlMessage::parse(r#"{"type":"response","id":"a","status":404,"headers":null}"#)
                .unwrap();
        let ControlMessage::Response { status, headers, .. } = msg else {
            panic!("expected response");
        };
        assert_eq!(status, 404);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_response_multi_value_headers() {
        let msg = ControlMessage::parse(
            r#"{"type":"response","id":"a","status":200,
                "headers":{"Content-Type":"text/plain","Set-Cookie":["a=1","b=2"]}}"#,
        )
        .unwrap();
        let ControlMessage::Response { headers, .. } = msg else {
            panic!("expected response");
        };
        assert_eq!(headers["Content-Type"].values(), ["text/plain"]);
        assert_eq!(headers["Set-Cookie"].values(), ["a=1", "b=2"]);
    }

    #[test]
    fn test_ws_frame_wire_names() {
        let msg = ControlMessage::ws_frame("x", b"ping", false);
        let json: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["type"], "ws-frame");
        assert_eq!(json["data"], "cGluZw==");
        assert_eq!(json["isBinary"], false);

        let init = ControlMessage::WsInit {
            id: "x".into(),
            url: "/chat".into(),
            headers: Headers::new(),
        };
        assert!(init.to_json().contains(r#""type":"ws-init""#));
        assert_eq!(init.kind(), "ws-init");
    }

    #[test]
    fn test_ws_frame_is_binary_defaults_false() {
        let msg = ControlMessage::parse(r#"{"type":"ws-frame","id":"x","data":"aGk="}"#).unwrap();
        let ControlMessage::WsFrame { is_binary, data, .. } = msg else {
            panic!("expected ws-frame");
        };
        assert!(!is_binary);
        assert_eq!(decode_ws_payload(&data).unwrap(), b"hi");
    }

    #[test]
    fn test_unknown_type_is_recoverable() {
        let err = ControlMessage::parse(r#"{"type":"bogus","id":"x"}"#).unwrap_err();
        assert!(!err.is_fatal());
        let err = ControlMessage::parse("not json").unwrap_err();
        assert!(!err.is_fatal());
        let err = ControlMessage::parse(r#"{"type":"end"}"#).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_chunk_layout() {
        let frame = ChunkFrame::encode("ab", b"xyz");
        assert_eq!(&frame[..4], b"CHNK");
        assert_eq!(&frame[4..8], &[0, 0, 0, 2]);
        assert_eq!(&frame[8..12], &[0, 0, 0, 3]);
        assert_eq!(&frame[12..], b"abxyz");
    }

    #[test]
    fn test_decode_whole_frame() {
        let mut dec = decoder();
        dec.push(&ChunkFrame::encode("req-1", b"hello"));
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.id, "req-1");
        assert_eq!(&frame.payload[..], b"hello");
        assert!(dec.next_frame().unwrap().is_none());
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_decode_split_matches_whole() {
        let wire = ChunkFrame::encode("req-1", b"split across deliveries");

        let mut whole = decoder();
        whole.push(&wire);
        let expected = whole.next_frame().unwrap().unwrap();

        // Header separate from payload.
        let mut dec = decoder();
        dec.push(&wire[..CHUNK_HEADER_LEN]);
        assert!(dec.next_frame().unwrap().is_none());
        dec.push(&wire[CHUNK_HEADER_LEN..]);
        assert_eq!(dec.next_frame().unwrap().unwrap(), expected);

        // One byte at a time.
        let mut dec = decoder();
        let mut got = None;
        for byte in wire.iter() {
            dec.push(std::slice::from_ref(byte));
            if let Some(frame) = dec.next_frame().unwrap() {
                got = Some(frame);
            }
        }
        assert_eq!(got.unwrap(), expected);
    }

    #[test]
    fn test_decode_concatenated_frames() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&ChunkFrame::encode("a", b"one"));
        wire.extend_from_slice(&ChunkFrame::encode("b", b""));
        wire.extend_from_slice(&ChunkFrame::encode("a", b"three"));
        let tail = ChunkFrame::encode("c", b"partial");
        wire.extend_from_slice(&tail[..5]);

        let mut dec = decoder();
        dec.push(&wire);
        let ids: Vec<(String, Bytes)> = std::iter::from_fn(|| dec.next_frame().unwrap())
            .map(|f| (f.id, f.payload))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("a".to_string(), Bytes::from_static(b"one")),
                ("b".to_string(), Bytes::new()),
                ("a".to_string(), Bytes::from_static(b"three")),
            ]
        );
        assert_eq!(dec.buffered(), 5);
        dec.push(&tail[5..]);
        assert_eq!(&dec.next_frame().unwrap().unwrap().payload[..], b"partial");
    }

    #[test]
    fn test_decode_bad_magic_is_fatal() {
        let mut dec = decoder();
        dec.push(b"CH");
        assert!(dec.next_frame().unwrap().is_none());
        dec.push(b"UNKxxxxxxxxx");
        let err = dec.next_frame().unwrap_err();
        assert!(matches!(err, FrameError::BadMagic(m) if &m == b"CHUN"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut dec = ChunkDecoder::new(8);
        dec.push(&ChunkFrame::encode("id", b"more than eight"));
        assert!(matches!(
            dec.next_frame(),
            Err(FrameError::FrameTooLarge { max: 8, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_long_id() {
        let mut dec = decoder();
        let mut header = BytesMut::new();
        header.put_slice(CHUNK_MAGIC);
        header.put_u32(10_000);
        header.put_u32(0);
        dec.push(&header);
        assert!(matches!(
            dec.next_frame(),
            Err(FrameError::IdTooLong { len: 10_000, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_non_utf8_id() {
        let mut wire = BytesMut::new();
        wire.put_slice(CHUNK_MAGIC);
        wire.put_u32(2);
        wire.put_u32(1);
        wire.put_slice(&[0xff, 0xfe, b'x']);
        let mut dec = decoder();
        dec.push(&wire);
        assert!(matches!(dec.next_frame(), Err(FrameError::InvalidId)));
    }

    #[test]
    fn test_headers_round_trip_through_http() {
        let mut map = HeaderMap::new();
        map.insert("content-type", HeaderValue::from_static("text/html"));
        map.append("set-cookie", HeaderValue::from_static("a=1"));
        map.append("set-cookie", HeaderValue::from_static("b=2"));

        let wire = headers_from_http(&map);
        assert_eq!(wire["content-type"], HeaderField::One("text/html".into()));
        assert_eq!(
            wire["set-cookie"],
            HeaderField::Many(vec!["a=1".into(), "b=2".into()])
        );

        let mut out = HeaderMap::new();
        apply_headers(&mut out, &wire, &["content-type"]);
        assert!(out.get("content-type").is_none());
        assert_eq!(out.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_apply_headers_skips_invalid() {
        let mut wire = Headers::new();
        wire.insert("bad name".into(), HeaderField::One("x".into()));
        wire.insert("X-Ok".into(), HeaderField::One("fine".into()));
        wire.insert("x-bad-value".into(), HeaderField::One("a\nb".into()));
        let mut out = HeaderMap::new();
        apply_headers(&mut out, &wire, &[]);
        assert_eq!(out.len(), 1);
        assert_eq!(out["x-ok"], "fine");
    }
}
