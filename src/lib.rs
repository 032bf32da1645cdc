#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! camlink library — the tunnel proxy and device agent as reusable modules.
//!
//! - `protocol` — wire codec: text envelopes, binary chunk frames
//! - `tunnel` — sessions, registry, gateway, and the device-side agent
//! - `recordings` — agent filesystem provider for the on-disk video layout
//! - `routes` — proxy HTTP surface
//! - `auth` — constant-time shared-secret comparison
//! - `config` — TOML + env-var configuration

pub mod auth;
pub mod config;
pub mod protocol;
pub mod recordings;
pub mod routes;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use routes::ProxyState;
pub use tunnel::registry::DeviceRegistry;
pub use tunnel::session::{CloseReason, DeviceSession};
