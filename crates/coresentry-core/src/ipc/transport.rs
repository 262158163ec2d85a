//! Listener management for the control API.
//!
//! A [`Transport`] owns at most one local IPC listener (Unix domain socket,
//! or named pipe on Windows) and one loopback TCP listener, all serving the
//! same router. Binding a kind that is already bound first closes the old
//! listener, so a listener can be replaced without restarting the daemon.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a closing listener may take to drain connections.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Errors from binding control listeners.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind control listener at {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),
}

/// A running listener task and the means to stop it.
struct ServerHandle {
    addr: String,
    socket_file: Option<PathBuf>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    fn spawn<L>(listener: L, router: axum::Router, addr: String, socket_file: Option<PathBuf>) -> Self
    where
        L: axum::serve::Listener,
        L::Addr: std::fmt::Debug,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });
        Self {
            addr,
            socket_file,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn close(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match tokio::time::timeout(CLOSE_GRACE, &mut self.task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(addr = %self.addr, error = %e, "Control listener exited with error"),
            Ok(Err(e)) => warn!(addr = %self.addr, error = %e, "Control listener task failed"),
            Err(_) => {
                warn!(addr = %self.addr, "Control listener did not drain in time, aborting");
                self.task.abort();
            }
        }
        if let Some(path) = &self.socket_file {
            std::fs::remove_file(path).ok();
        }
        info!(addr = %self.addr, "Control listener closed");
    }
}

/// Owner of all active control listeners.
pub struct Transport {
    router: axum::Router,
    local: Option<ServerHandle>,
    tcp: Option<ServerHandle>,
    tcp_addr: Option<SocketAddr>,
}

impl Transport {
    pub fn new(router: axum::Router) -> Self {
        Self {
            router,
            local: None,
            tcp: None,
            tcp_addr: None,
        }
    }

    /// Address of the bound local listener, if any.
    pub fn local_addr(&self) -> Option<&str> {
        self.local.as_ref().map(|h| h.addr.as_str())
    }

    /// Address of the bound TCP listener, if any.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Bind the local IPC listener, replacing any previous one.
    ///
    /// On Unix the parent directory is created, a stale socket file is
    /// removed, and the new socket is made world read/write so the
    /// unprivileged client can connect.
    #[cfg(unix)]
    pub async fn bind_local(&mut self, path: &str) -> Result<(), TransportError> {
        use std::os::unix::fs::PermissionsExt;

        if path.is_empty() {
            return Err(TransportError::InvalidAddress(path.to_string()));
        }
        if let Some(old) = self.local.take() {
            old.close().await;
        }

        let bind_err = |source| TransportError::Bind {
            addr: path.to_string(),
            source,
        };
        let socket_path = PathBuf::from(path);
        if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(bind_err)?;
        }
        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!(path, "Removed stale control socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }

        let listener = tokio::net::UnixListener::bind(&socket_path).map_err(bind_err)?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o666))
            .map_err(bind_err)?;

        info!(path, "Control socket listening");
        self.local = Some(ServerHandle::spawn(
            listener,
            self.router.clone(),
            path.to_string(),
            Some(socket_path),
        ));
        Ok(())
    }

    /// Bind the local IPC listener, replacing any previous one.
    #[cfg(windows)]
    pub async fn bind_local(&mut self, path: &str) -> Result<(), TransportError> {
        if path.is_empty() {
            return Err(TransportError::InvalidAddress(path.to_string()));
        }
        if let Some(old) = self.local.take() {
            old.close().await;
        }

        let listener = super::pipe::PipeListener::bind(path).map_err(|source| TransportError::Bind {
            addr: path.to_string(),
            source,
        })?;
        info!(path, "Control pipe listening");
        self.local = Some(ServerHandle::spawn(
            listener,
            self.router.clone(),
            path.to_string(),
            None,
        ));
        Ok(())
    }

    /// Bind the loopback TCP listener, replacing any previous one. Returns
    /// the bound address, which differs from `addr` when port 0 was given.
    pub async fn bind_tcp(&mut self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        if !addr.ip().is_loopback() {
            return Err(TransportError::InvalidAddress(addr.to_string()));
        }
        if let Some(old) = self.tcp.take() {
            old.close().await;
            self.tcp_addr = None;
        }

        let bind_err = |source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(bind_err)?;
        let bound = listener.local_addr().map_err(bind_err)?;

        info!(addr = %bound, "Control TCP listener listening");
        self.tcp = Some(ServerHandle::spawn(
            listener,
            self.router.clone(),
            bound.to_string(),
            None,
        ));
        self.tcp_addr = Some(bound);
        Ok(bound)
    }

    /// Close every listener.
    pub async fn shutdown(&mut self) {
        if let Some(local) = self.local.take() {
            local.close().await;
        }
        if let Some(tcp) = self.tcp.take() {
            tcp.close().await;
        }
        self.tcp_addr = None;
    }
}
