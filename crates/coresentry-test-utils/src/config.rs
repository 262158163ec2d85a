//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries. The builder starts from
//! timings short enough for a supervisor test to finish in a few seconds.

use std::path::{Path, PathBuf};

use coresentry_config::{AppConfig, TerminationPolicy};

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .core_binary(mock.ready())
///     .max_restart_attempts(1)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.core.startup_timeout_ms = 5_000;
        config.core.startup_poll_ms = 20;
        config.core.monitor_interval_ms = 50;
        config.core.restart_backoff_ms = 10;
        config.core.restart_settle_ms = 10;
        config.daemon.tcp_enabled = false;
        Self { config }
    }

    pub fn core_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.core.binary = Some(path.into());
        self
    }

    pub fn core_env(mut self, key: &str, value: &str) -> Self {
        self.config.core.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn termination(mut self, policy: TerminationPolicy) -> Self {
        self.config.core.termination = policy;
        self
    }

    pub fn startup_timeout_ms(mut self, ms: u64) -> Self {
        self.config.core.startup_timeout_ms = ms;
        self
    }

    pub fn monitor_interval_ms(mut self, ms: u64) -> Self {
        self.config.core.monitor_interval_ms = ms;
        self
    }

    pub fn max_restart_attempts(mut self, n: u32) -> Self {
        self.config.core.max_restart_attempts = n;
        self
    }

    pub fn memory_warn_bytes(mut self, bytes: u64) -> Self {
        self.config.core.memory_warn_bytes = bytes;
        self
    }

    pub fn autostart(mut self, enabled: bool) -> Self {
        self.config.core.autostart = enabled;
        self
    }

    /// Put the control socket and key directory under `dir`.
    pub fn state_dir(mut self, dir: &Path) -> Self {
        self.config.daemon.listen_addr = dir.join("ctl.sock").display().to_string();
        self.config.auth.key_dir = Some(dir.join("keys"));
        self
    }

    /// Also bind loopback TCP on an ephemeral port.
    pub fn with_tcp(mut self) -> Self {
        self.config.daemon.tcp_enabled = true;
        self.config.daemon.tcp_port = 0;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
