#![deny(unsafe_code)]

//! Shared test utilities for the coresentry workspace.
//!
//! Provides config builders, mock core executables, scripted collaborators
//! and signing keys so that individual crate tests stay concise and
//! consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! coresentry-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod keys;
#[cfg(unix)]
pub mod mock_core;
pub mod process_table;
pub mod system;
pub mod tracing_setup;
