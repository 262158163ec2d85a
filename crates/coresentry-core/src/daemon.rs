//! Core daemon process: startup, shutdown, and main event loop.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use coresentry_config::AppConfig;

use crate::auth::{AuthError, AuthGate};
use crate::build_info;
use crate::ipc::{ApiState, Transport, TransportError, router};
use crate::supervisor::CoreSupervisor;
use crate::supervisor::process_table::{OsProcessTable, ProcessTable};
use crate::sys::{self, SystemConfigurator};

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// The main coresentry daemon.
pub struct Daemon {
    config: AppConfig,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    system: Arc<dyn SystemConfigurator>,
    process_table: Arc<dyn ProcessTable>,
}

/// Live components of a launched daemon.
pub struct DaemonHandle {
    pub auth: Arc<AuthGate>,
    pub supervisor: CoreSupervisor,
    transport: Transport,
}

impl DaemonHandle {
    /// Address of the local IPC listener.
    pub fn local_addr(&self) -> Option<&str> {
        self.transport.local_addr()
    }

    /// Address of the loopback TCP listener, when enabled.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.transport.tcp_addr()
    }

    /// Stop the core and close every listener.
    pub async fn stop(mut self) {
        if let Err(e) = self.supervisor.stop().await {
            error!(error = %e, "Failed to stop core during shutdown");
        }
        self.transport.shutdown().await;
    }
}

impl Daemon {
    /// Create a new daemon instance with the given configuration.
    pub fn new(config: AppConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            shutdown_tx,
            system: sys::platform(),
            process_table: Arc::new(OsProcessTable::new()),
        }
    }

    /// Replace the OS configuration collaborator.
    pub fn with_system(mut self, system: Arc<dyn SystemConfigurator>) -> Self {
        self.system = system;
        self
    }

    /// Replace the process table the supervisor queries.
    pub fn with_process_table(mut self, table: Arc<dyn ProcessTable>) -> Self {
        self.process_table = table;
        self
    }

    /// Build every component and bind the control listeners.
    ///
    /// A bind failure is fatal. A missing or unreadable trusted key is not:
    /// authenticated requests fail until a key is installed.
    pub async fn launch(&self) -> Result<DaemonHandle, DaemonError> {
        info!(version = %build_info::version_string(), "coresentry daemon starting");

        let key_dir = self.config.auth.resolved_key_dir();
        let max_drift = Duration::from_secs(self.config.auth.max_drift_secs);
        let auth = match AuthGate::open(&key_dir, max_drift) {
            Ok(gate) => gate,
            Err(e @ AuthError::Io { .. }) => return Err(DaemonError::Auth(e)),
            Err(e) => {
                warn!(error = %e, "Trusted public key is unusable, service is uninitialized");
                AuthGate::new(&key_dir, max_drift)
            }
        };
        let auth = Arc::new(auth);

        let supervisor = CoreSupervisor::with_process_table(
            self.config.core.clone(),
            Arc::clone(&self.process_table),
        );
        let state = Arc::new(ApiState {
            auth: Arc::clone(&auth),
            supervisor: supervisor.clone(),
            system: Arc::clone(&self.system),
        });

        let mut transport = Transport::new(router(state));
        if let Err(e) = self.bind(&mut transport).await {
            transport.shutdown().await;
            return Err(e);
        }

        if self.config.core.autostart {
            info!("Autostarting core");
            if let Err(e) = supervisor.start().await {
                error!(error = %e, "Core autostart failed");
            }
        }

        Ok(DaemonHandle {
            auth,
            supervisor,
            transport,
        })
    }

    async fn bind(&self, transport: &mut Transport) -> Result<(), DaemonError> {
        let daemon = &self.config.daemon;
        transport.bind_local(&daemon.listen_addr).await?;
        if daemon.tcp_enabled {
            let ip: IpAddr = daemon
                .tcp_addr
                .parse()
                .map_err(|_| TransportError::InvalidAddress(daemon.tcp_addr.clone()))?;
            transport.bind_tcp(SocketAddr::new(ip, daemon.tcp_port)).await?;
        }
        Ok(())
    }

    /// Run the daemon until a shutdown signal is received.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = self.launch().await?;

        // Main event loop: wait for shutdown signal
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping daemon");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received, initiating graceful shutdown");
            }
        }

        handle.stop().await;
        info!("Daemon stopped");
        Ok(())
    }

    /// Request a graceful shutdown of the daemon.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    /// Get a reference to the daemon's configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("control transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("key store unavailable: {0}")]
    Auth(AuthError),
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ipc::{Endpoint, IpcClient};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.daemon.listen_addr = tmp.path().join("ctl.sock").display().to_string();
        config.daemon.tcp_enabled = true;
        config.daemon.tcp_port = 0;
        config.auth.key_dir = Some(tmp.path().join("keys"));
        config
    }

    #[tokio::test]
    async fn test_launch_binds_both_listeners() {
        let tmp = TempDir::new().unwrap();
        let daemon = Daemon::new(test_config(&tmp));
        let handle = daemon.launch().await.unwrap();

        assert!(!handle.auth.is_initialized());
        assert!(tmp.path().join("keys").is_dir());

        let client = IpcClient::new(Endpoint::local(handle.local_addr().unwrap()));
        assert_eq!(client.ping().await.unwrap().message, "pong");

        let tcp = IpcClient::new(Endpoint::Tcp(handle.tcp_addr().unwrap()));
        assert_eq!(tcp.ping().await.unwrap().message, "pong");

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let mut config = test_config(&tmp);
        config.daemon.listen_addr = blocker.join("ctl.sock").display().to_string();
        let result = Daemon::new(config).launch().await;
        assert!(matches!(result, Err(DaemonError::Transport(_))));
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.daemon.tcp_enabled = false;
        let daemon = Arc::new(Daemon::new(config));

        let runner = Arc::clone(&daemon);
        let task = tokio::spawn(async move { runner.run().await });

        let sock = tmp.path().join("ctl.sock");
        for _ in 0..50 {
            if sock.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        daemon.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(!sock.exists());
    }
}
