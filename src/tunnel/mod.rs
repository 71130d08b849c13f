//! Reverse tunnel over a single multiplexed WebSocket.
//!
//! The relay (`backhaul serve`) accepts one control connection from the
//! private tunnel client and forwards every public HTTP request and
//! WebSocket through it. Streams are tagged with a correlation id; JSON
//! control messages carry heads, ends and WebSocket frames, and binary
//! `CHNK` frames carry HTTP body bytes.
//!
//! ```text
//! public client ──► ingress ──► session (writer) ══► tunnel client ──► backend
//! public client ◄── streams ◄── demux ◄── relay (reader) ◄══ tunnel client
//! ```
//!
//! - `frame`:   control messages, chunk frames, incremental decoder
//! - `streams`: correlation id → HTTP / WebSocket stream state
//! - `session`: one control connection, auth state, the single-session slot
//! - `ingress`: public requests and upgrades → streams + control messages
//! - `demux`:   tunnel traffic → stream table lookups
//! - `relay`:   router, control upgrade, auth handshake, read/write loops
//! - `client`:  the private end (`backhaul connect`)

pub mod client;
pub mod demux;
pub mod frame;
pub mod ingress;
pub mod relay;
pub mod session;
pub mod streams;
