//! Tracing initialisation helpers for tests.
//!
//! Supervisor tests are timing-sensitive and hard to debug blind, so call
//! [`init_test_tracing`] at the top of them. The subscriber is installed at
//! most once per process.

use tracing_subscriber::EnvFilter;

/// Default directive when `RUST_LOG` is unset.
const DEFAULT_DIRECTIVE: &str = "warn,coresentry_core=debug";

/// Install a subscriber that writes to the test-harness writer and
/// respects `RUST_LOG`. Later calls are ignored.
///
/// # Example
///
/// ```ignore
/// #[tokio::test]
/// async fn my_test() {
///     coresentry_test_utils::tracing_setup::init_test_tracing();
///     tracing::info!("captured by the harness");
/// }
/// ```
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
        )
        .with_test_writer()
        .try_init();
}
