//! Daemon IPC: the authenticated control API and its transports.
//!
//! The daemon exposes an HTTP/JSON API over a local IPC endpoint (Unix
//! domain socket, or named pipe on Windows) and a loopback TCP listener.
//! The CLI connects as a client to manage the core process and the OS
//! proxy/DNS settings.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   Unix socket / pipe / TCP   ┌──────────────┐
//! │   CLI    │─────────────────────────────▶│  Control API │
//! └──────────┘  HTTP/1.1 + JSON + Ed25519   │  (axum)      │
//!                                           └──────┬───────┘
//!                                  ┌───────────────┼───────────────┐
//!                           ┌──────▼──────┐ ┌──────▼──────┐ ┌──────▼──────┐
//!                           │  AuthGate   │ │ Supervisor  │ │ SystemConf. │
//!                           └─────────────┘ └─────────────┘ └─────────────┘
//! ```

pub mod client;
#[cfg(windows)]
pub mod pipe;
pub mod server;
pub mod transport;
pub mod types;

pub use client::{Endpoint, IpcClient, IpcClientError};
pub use server::{ApiState, router};
pub use transport::{Transport, TransportError};
pub use types::*;
