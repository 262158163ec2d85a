#![deny(unsafe_code)]

//! Configuration loading and validation for coresentry.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure and
//! [`config_dir`] for locating the service's on-disk state (the trusted key).

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable that overrides the configuration directory.
pub const CONFIG_DIR_ENV: &str = "CORESENTRY_CONFIG_DIR";

/// Directory name used under the configuration directory.
pub const APP_DIR_NAME: &str = "coresentry";

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Control transport configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Supervised core process configuration.
    #[serde(default)]
    pub core: CoreConfig,

    /// Request authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the control transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Local IPC endpoint: a domain socket path on POSIX, a named pipe on Windows.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Whether the loopback TCP listener is bound as well.
    #[serde(default = "default_tcp_enabled")]
    pub tcp_enabled: bool,

    /// Host of the loopback TCP listener.
    #[serde(default = "default_tcp_addr")]
    pub tcp_addr: String,

    /// Port of the loopback TCP listener.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tcp_enabled: default_tcp_enabled(),
            tcp_addr: default_tcp_addr(),
            tcp_port: default_tcp_port(),
        }
    }
}

fn default_listen_addr() -> String {
    if cfg!(windows) {
        r"\\.\pipe\coresentry\service".to_string()
    } else {
        "/tmp/coresentry-service.sock".to_string()
    }
}

fn default_tcp_enabled() -> bool {
    true
}

fn default_tcp_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_tcp_port() -> u16 {
    if cfg!(windows) { 10001 } else { 10010 }
}

/// How the supervisor terminates the core process on Stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationPolicy {
    /// Kill every process whose image name matches the core executable.
    ///
    /// Robust to PID drift, but can hit an unrelated process sharing the name.
    #[default]
    ByName,
    /// Kill only the spawned child, or the adopted PID when one was adopted.
    TrackedPid,
}

/// Configuration for the supervised core process.
///
/// ## TOML Example
///
/// ```toml
/// [core]
/// binary = "/opt/proxy/bin/core"
/// args = ["-d", "/opt/proxy/data"]
/// output_encoding = "gbk"
/// termination = "by-name"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Path to the core executable. Start fails while this is unset.
    #[serde(default)]
    pub binary: Option<PathBuf>,

    /// Arguments passed to the core executable.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment entries for the core, on top of the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Output substring the core emits once its data plane is ready.
    #[serde(default = "default_success_marker")]
    pub success_marker: String,

    /// Output substring the core emits on a fatal initialization error.
    #[serde(default = "default_fatal_marker")]
    pub fatal_marker: String,

    /// Legacy encoding label (e.g. `"gbk"`) the core's output is decoded from.
    #[serde(default)]
    pub output_encoding: Option<String>,

    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    #[serde(default = "default_startup_poll_ms")]
    pub startup_poll_ms: u64,

    /// Period of the process-table scan while the core is running.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Consecutive crash restarts allowed before auto-restart gives up.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,

    /// Base delay after a failed restart attempt; attempt `n` waits `n * base`.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// Pause between Stop and Start during a restart.
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,

    /// A run lasting at least this long resets the restart budget.
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,

    /// Resident memory above which a health check logs a warning.
    #[serde(default = "default_memory_warn_bytes")]
    pub memory_warn_bytes: u64,

    /// Cap on each captured output stream; the oldest bytes are discarded.
    #[serde(default = "default_output_buffer_bytes")]
    pub output_buffer_bytes: usize,

    #[serde(default)]
    pub termination: TerminationPolicy,

    /// Start the core as soon as the daemon is up.
    #[serde(default)]
    pub autostart: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            binary: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            success_marker: default_success_marker(),
            fatal_marker: default_fatal_marker(),
            output_encoding: None,
            startup_timeout_ms: default_startup_timeout_ms(),
            startup_poll_ms: default_startup_poll_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            max_restart_attempts: default_max_restart_attempts(),
            restart_backoff_ms: default_restart_backoff_ms(),
            restart_settle_ms: default_restart_settle_ms(),
            stable_after_secs: default_stable_after_secs(),
            memory_warn_bytes: default_memory_warn_bytes(),
            output_buffer_bytes: default_output_buffer_bytes(),
            termination: TerminationPolicy::default(),
            autostart: false,
        }
    }
}

impl CoreConfig {
    /// Image name of the core executable as it appears in the process table.
    ///
    /// On Windows the `.exe` suffix is appended when the configured path lacks it.
    pub fn process_name(&self) -> Option<String> {
        let name = self.binary.as_deref()?.file_name()?.to_string_lossy().to_string();
        if cfg!(windows) && !name.to_ascii_lowercase().ends_with(".exe") {
            Some(format!("{name}.exe"))
        } else {
            Some(name)
        }
    }
}

fn default_success_marker() -> String {
    "Start initial Compatible provider default".to_string()
}

fn default_fatal_marker() -> String {
    "level=fatal".to_string()
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

fn default_startup_poll_ms() -> u64 {
    500
}

fn default_monitor_interval_ms() -> u64 {
    1_000
}

fn default_max_restart_attempts() -> u32 {
    3
}

fn default_restart_backoff_ms() -> u64 {
    1_000
}

fn default_restart_settle_ms() -> u64 {
    100
}

fn default_stable_after_secs() -> u64 {
    60
}

fn default_memory_warn_bytes() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_output_buffer_bytes() -> usize {
    4 * 1024 * 1024 // 4 MiB
}

/// Request authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Directory holding `public_key.pem`. Defaults to `<config_dir>/coresentry/keys`.
    #[serde(default)]
    pub key_dir: Option<PathBuf>,

    /// Maximum accepted distance between a request timestamp and now.
    #[serde(default = "default_max_drift_secs")]
    pub max_drift_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_dir: None,
            max_drift_secs: default_max_drift_secs(),
        }
    }
}

impl AuthConfig {
    /// Resolve the key directory, falling back to the platform config directory.
    pub fn resolved_key_dir(&self) -> PathBuf {
        self.key_dir
            .clone()
            .unwrap_or_else(|| config_dir().join(APP_DIR_NAME).join("keys"))
    }
}

fn default_max_drift_secs() -> u64 {
    60
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Append log output to this file instead of stdout.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve the service configuration directory.
///
/// Resolution order: the `CORESENTRY_CONFIG_DIR` variable, the platform user
/// configuration directory, then `$HOME/.config`.
pub fn config_dir() -> PathBuf {
    resolve_config_dir(
        std::env::var_os(CONFIG_DIR_ENV),
        std::env::var_os("HOME"),
        dirs::config_dir(),
    )
}

fn resolve_config_dir(
    override_dir: Option<OsString>,
    home: Option<OsString>,
    platform_dir: Option<PathBuf>,
) -> PathBuf {
    if let Some(dir) = override_dir.filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    let home = home.filter(|h| !h.is_empty()).map(PathBuf::from);

    // A root-owned launchd service usually starts without HOME.
    if cfg!(target_os = "macos") && home.is_none() {
        return PathBuf::from("/var/root/Library/Application Support");
    }
    if let Some(dir) = platform_dir {
        return dir;
    }
    home.unwrap_or_else(|| PathBuf::from("/")).join(".config")
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Load the file if it exists, otherwise return the defaults.
    pub async fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if tokio::fs::try_exists(path).await? {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.listen_addr.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.listen_addr must not be empty".to_string(),
            ));
        }
        if self.daemon.tcp_enabled {
            if self.daemon.tcp_port == 0 {
                return Err(ConfigError::Validation(
                    "daemon.tcp_port must be non-zero".to_string(),
                ));
            }
            match self.daemon.tcp_addr.parse::<std::net::IpAddr>() {
                Ok(ip) if ip.is_loopback() => {}
                Ok(ip) => {
                    return Err(ConfigError::Validation(format!(
                        "daemon.tcp_addr must be a loopback address, got {ip}"
                    )));
                }
                Err(_) => {
                    return Err(ConfigError::Validation(format!(
                        "daemon.tcp_addr must be an IP address, got {:?}",
                        self.daemon.tcp_addr
                    )));
                }
            }
        }

        let core = &self.core;
        if let Some(binary) = &core.binary {
            if binary.file_name().is_none() {
                return Err(ConfigError::Validation(format!(
                    "core.binary must name an executable, got {:?}",
                    binary.display().to_string()
                )));
            }
        }
        if core.success_marker.is_empty() {
            return Err(ConfigError::Validation(
                "core.success_marker must not be empty".to_string(),
            ));
        }
        if core.fatal_marker.is_empty() {
            return Err(ConfigError::Validation(
                "core.fatal_marker must not be empty".to_string(),
            ));
        }
        if core.startup_poll_ms == 0 || core.monitor_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "core.startup_poll_ms and core.monitor_interval_ms must be non-zero".to_string(),
            ));
        }
        if core.startup_timeout_ms < core.startup_poll_ms {
            return Err(ConfigError::Validation(format!(
                "core.startup_timeout_ms ({}) must be at least core.startup_poll_ms ({})",
                core.startup_timeout_ms, core.startup_poll_ms
            )));
        }
        if core.output_buffer_bytes < 4096 {
            return Err(ConfigError::Validation(
                "core.output_buffer_bytes must be at least 4096".to_string(),
            ));
        }
        if let Some(label) = &core.output_encoding {
            if label.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "core.output_encoding must not be empty when set".to_string(),
                ));
            }
        }

        if self.auth.max_drift_secs == 0 {
            return Err(ConfigError::Validation(
                "auth.max_drift_secs must be non-zero".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.daemon.tcp_enabled);
        assert_eq!(config.daemon.tcp_addr, "127.0.0.1");
        assert_eq!(config.core.startup_timeout_ms, 30_000);
        assert_eq!(config.core.max_restart_attempts, 3);
        assert_eq!(config.core.termination, TerminationPolicy::ByName);
        assert_eq!(config.auth.max_drift_secs, 60);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert!(config.core.binary.is_none());
        assert_eq!(config.core.success_marker, "Start initial Compatible provider default");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [daemon]
            listen_addr = "/run/coresentry/control.sock"
            tcp_enabled = false

            [core]
            binary = "/opt/proxy/bin/core"
            args = ["-d", "/opt/proxy/data"]
            output_encoding = "gbk"
            termination = "tracked-pid"
            startup_timeout_ms = 5000
            autostart = true

            [core.env]
            SAFE_PATHS = "/opt/proxy"

            [auth]
            key_dir = "/etc/coresentry/keys"
            max_drift_secs = 30

            [logging]
            level = "debug"
            file = "/var/log/coresentry.log"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.daemon.listen_addr, "/run/coresentry/control.sock");
        assert!(!config.daemon.tcp_enabled);
        assert_eq!(config.core.args, vec!["-d", "/opt/proxy/data"]);
        assert_eq!(config.core.output_encoding.as_deref(), Some("gbk"));
        assert_eq!(config.core.termination, TerminationPolicy::TrackedPid);
        assert_eq!(config.core.startup_timeout_ms, 5000);
        assert!(config.core.autostart);
        assert_eq!(config.core.env.get("SAFE_PATHS").unwrap(), "/opt/proxy");
        assert_eq!(
            config.auth.resolved_key_dir(),
            PathBuf::from("/etc/coresentry/keys")
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_zero_tcp_port() {
        let toml = r#"
            [daemon]
            tcp_port = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_zero_tcp_port_allowed_when_tcp_disabled() {
        let toml = r#"
            [daemon]
            tcp_enabled = false
            tcp_port = 0
        "#;
        assert!(AppConfig::parse(toml).is_ok());
    }

    #[test]
    fn test_validation_rejects_non_loopback_tcp_addr() {
        let toml = r#"
            [daemon]
            tcp_addr = "0.0.0.0"
        "#;
        let err = AppConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }

    #[test]
    fn test_validation_rejects_empty_listen_addr() {
        let toml = r#"
            [daemon]
            listen_addr = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_timeout_below_poll() {
        let toml = r#"
            [core]
            startup_timeout_ms = 100
            startup_poll_ms = 500
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_markers() {
        let toml = r#"
            [core]
            fatal_marker = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_termination_policy() {
        let toml = r#"
            [core]
            termination = "politely"
        "#;
        assert!(matches!(AppConfig::parse(toml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validation_rejects_bad_log_level() {
        let toml = r#"
            [logging]
            level = "loud"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_drift() {
        let toml = r#"
            [auth]
            max_drift_secs = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_process_name_from_binary() {
        let mut core = CoreConfig::default();
        assert_eq!(core.process_name(), None);

        core.binary = Some(PathBuf::from("/opt/proxy/bin/mihomo"));
        let name = core.process_name().unwrap();
        if cfg!(windows) {
            assert_eq!(name, "mihomo.exe");
        } else {
            assert_eq!(name, "mihomo");
        }
    }

    #[test]
    fn test_config_dir_override_wins() {
        let dir = resolve_config_dir(
            Some(OsString::from("/srv/state")),
            Some(OsString::from("/home/alice")),
            Some(PathBuf::from("/home/alice/.config")),
        );
        assert_eq!(dir, PathBuf::from("/srv/state"));
    }

    #[test]
    fn test_config_dir_empty_override_ignored() {
        let dir = resolve_config_dir(
            Some(OsString::new()),
            Some(OsString::from("/home/alice")),
            Some(PathBuf::from("/home/alice/.config")),
        );
        assert_eq!(dir, PathBuf::from("/home/alice/.config"));
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_config_dir_falls_back_to_home() {
        let dir = resolve_config_dir(None, Some(OsString::from("/home/bob")), None);
        assert_eq!(dir, PathBuf::from("/home/bob/.config"));
    }

    // ── Async file-based loading ──────────────────────────────────────

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("coresentry.toml");
        tokio::fs::write(&path, b"[daemon]\ntcp_port = 4242\n")
            .await
            .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.daemon.tcp_port, 4242);
    }

    #[tokio::test]
    async fn test_load_or_default_missing_file() {
        let tmp = TempDir::new().unwrap();
        let config = AppConfig::load_or_default(&tmp.path().join("absent.toml"))
            .await
            .unwrap();
        assert_eq!(config.core.max_restart_attempts, 3);
    }

    #[tokio::test]
    async fn test_load_nonexistent_file() {
        let result = AppConfig::load(Path::new("/nonexistent/file.toml")).await;
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[tokio::test]
    async fn test_load_invalid_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, b"not valid toml [[[").await.unwrap();

        let result = AppConfig::load(&path).await;
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("bad value".to_string());
        assert_eq!(err.to_string(), "validation error: bad value");
    }
}
