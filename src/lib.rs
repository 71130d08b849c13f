#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! backhaul library: the relay server and tunnel client behind the binary.
//!
//! - `tunnel` : wire format, stream table, session, relay router, client
//! - `auth` : shared-token check for the control connection
//! - `config` : configuration loading
//! - `error` : typed errors
//! - `state` : state shared by the relay's handlers

pub mod auth;
pub mod config;
pub mod error;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use state::AppState;
pub use tunnel::relay::router;
