#![deny(unsafe_code)]

//! coresentry core runtime.
//!
//! Supervises the core proxy process and exposes the authenticated control
//! API that the unprivileged CLI uses to drive it. The daemon runs with
//! elevated privileges; every mutating request must carry a fresh Ed25519
//! signature from the operator-installed key.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future: the return type for async
/// trait methods that require dynamic dispatch (`dyn Trait`).
///
/// Native `async fn` in traits produces opaque return types that are not
/// object-safe, so traits consumed via `Arc<dyn Trait>` return a concrete
/// `Pin<Box<dyn Future>>` instead.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Ed25519 timestamp-signature request authentication.
pub mod auth;
/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Async daemon runtime: wiring, listeners, shutdown.
pub mod daemon;
/// Control API router, transports, and client.
pub mod ipc;
/// Tracing subscriber setup.
pub mod logging;
/// Core process lifecycle, monitoring, and crash recovery.
pub mod supervisor;
/// OS proxy and DNS configuration collaborator.
pub mod sys;

pub use auth::AuthGate;
pub use daemon::Daemon;
pub use ipc::{Endpoint, IpcClient};
pub use supervisor::{CoreSupervisor, ProcessInfo, SupervisorError, SupervisorState};
pub use sys::SystemConfigurator;
