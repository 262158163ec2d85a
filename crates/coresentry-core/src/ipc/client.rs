//! IPC client that talks to the daemon over a local socket, named pipe or
//! loopback TCP.
//!
//! Provides a typed client for the CLI. Requests are signed when the
//! client holds a signing key. Uses `hyper` for HTTP/1.1 over whichever
//! stream the endpoint yields.

use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::SystemTime;

use ed25519_dalek::SigningKey;
use hyper::StatusCode;
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::types::*;
use crate::auth::{SIGNATURE_HEADER, TIMESTAMP_HEADER, sign_request};
use crate::supervisor::ProcessInfo;
use crate::sys::{DeviceScope, ProxyStatus};

/// Errors from the IPC client.
#[derive(Debug, thiserror::Error)]
pub enum IpcClientError {
    #[error("failed to connect to daemon at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("daemon is not running (nothing listening at {0})")]
    NotRunning(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("daemon returned error: {0}")]
    DaemonError(String),
}

/// Where the daemon's control API listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    #[cfg(windows)]
    Pipe(String),
    Tcp(SocketAddr),
}

impl Endpoint {
    /// The platform's local IPC endpoint at `addr`.
    pub fn local(addr: &str) -> Self {
        #[cfg(unix)]
        {
            Self::Unix(PathBuf::from(addr))
        }
        #[cfg(windows)]
        {
            Self::Pipe(addr.to_string())
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "{}", path.display()),
            #[cfg(windows)]
            Self::Pipe(name) => f.write_str(name),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Client for the daemon's control API.
pub struct IpcClient {
    endpoint: Endpoint,
    signing_key: Option<SigningKey>,
}

impl IpcClient {
    /// Create a client that sends unsigned requests.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            signing_key: None,
        }
    }

    /// Sign every request with `key`.
    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send one request and return the status and body.
    async fn request(
        &self,
        method: hyper::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), IpcClientError> {
        let endpoint = self.endpoint.to_string();
        let connect_err = |source: std::io::Error| {
            if matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            ) {
                IpcClientError::NotRunning(endpoint.clone())
            } else {
                IpcClientError::Connect {
                    endpoint: endpoint.clone(),
                    source,
                }
            }
        };

        let req = self.build_request(method, path, body)?;
        debug!(endpoint = %self.endpoint, path, "IPC request");

        match &self.endpoint {
            #[cfg(unix)]
            Endpoint::Unix(socket) => {
                let stream = tokio::net::UnixStream::connect(socket)
                    .await
                    .map_err(connect_err)?;
                send_over(stream, req).await
            }
            #[cfg(windows)]
            Endpoint::Pipe(name) => {
                let stream = tokio::net::windows::named_pipe::ClientOptions::new()
                    .open(name)
                    .map_err(connect_err)?;
                send_over(stream, req).await
            }
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(connect_err)?;
                send_over(stream, req).await
            }
        }
    }

    fn build_request(
        &self,
        method: hyper::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<hyper::Request<http_body_util::Full<Bytes>>, IpcClientError> {
        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(path)
            .header("host", "localhost");

        if let Some(key) = &self.signing_key {
            let (timestamp, signature) = sign_request(key, SystemTime::now());
            builder = builder
                .header(TIMESTAMP_HEADER, timestamp)
                .header(SIGNATURE_HEADER, signature);
        }
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }

        builder
            .body(http_body_util::Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| IpcClientError::Request(format!("failed to build request: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, IpcClientError> {
        let (status, body) = self.request(hyper::Method::GET, path, None).await?;
        decode_json(path, status, &body)
    }

    async fn post_envelope(
        &self,
        path: &str,
        body: Option<&ControlRequest>,
    ) -> Result<Response, IpcClientError> {
        let (status, body) = self.post(path, body).await?;
        decode_json(path, status, &body)
    }

    /// POST to an endpoint that answers 204 on success.
    async fn post_no_content(
        &self,
        path: &str,
        body: &ControlRequest,
    ) -> Result<(), IpcClientError> {
        let (status, body) = self.post(path, Some(body)).await?;
        if status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        decode_json::<Response>(path, status, &body).map(|_| ())
    }

    async fn post(
        &self,
        path: &str,
        body: Option<&ControlRequest>,
    ) -> Result<(StatusCode, Bytes), IpcClientError> {
        let bytes = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| IpcClientError::Parse(format!("failed to serialize request: {e}")))?;
        self.request(hyper::Method::POST, path, bytes).await
    }

    // ── Typed API methods ──────────────────────────────────────────────

    /// Unauthenticated liveness probe.
    pub async fn ping(&self) -> Result<Response, IpcClientError> {
        self.get_json("/ping").await
    }

    /// Check that this client's signature is accepted.
    pub async fn test(&self) -> Result<Response, IpcClientError> {
        self.get_json("/test").await
    }

    pub async fn core_status(&self) -> Result<ProcessInfo, IpcClientError> {
        self.get_json("/core").await
    }

    pub async fn core_health(&self) -> Result<Response, IpcClientError> {
        self.get_json("/core/health").await
    }

    pub async fn core_start(&self) -> Result<Response, IpcClientError> {
        self.post_envelope("/core/start", None).await
    }

    pub async fn core_stop(&self) -> Result<Response, IpcClientError> {
        self.post_envelope("/core/stop", None).await
    }

    pub async fn core_restart(&self) -> Result<Response, IpcClientError> {
        self.post_envelope("/core/restart", None).await
    }

    pub async fn proxy_status(&self) -> Result<ProxyStatus, IpcClientError> {
        self.get_json("/sysproxy/status").await
    }

    pub async fn set_pac(&self, url: &str, scope: &DeviceScope) -> Result<(), IpcClientError> {
        let req = ControlRequest {
            url: url.to_string(),
            ..scoped_request(scope)
        };
        self.post_no_content("/sysproxy/pac", &req).await
    }

    pub async fn set_proxy(
        &self,
        server: &str,
        bypass: &str,
        scope: &DeviceScope,
    ) -> Result<(), IpcClientError> {
        let req = ControlRequest {
            server: server.to_string(),
            bypass: bypass.to_string(),
            ..scoped_request(scope)
        };
        self.post_no_content("/sysproxy/proxy", &req).await
    }

    pub async fn disable_proxy(&self, scope: &DeviceScope) -> Result<(), IpcClientError> {
        self.post_no_content("/sysproxy/disable", &scoped_request(scope))
            .await
    }

    pub async fn set_dns(&self, device: &str, servers: &[String]) -> Result<Response, IpcClientError> {
        let req = ControlRequest {
            device: device.to_string(),
            servers: servers.to_vec(),
            ..ControlRequest::default()
        };
        self.post_envelope("/sys/dns/set", Some(&req)).await
    }
}

fn scoped_request(scope: &DeviceScope) -> ControlRequest {
    ControlRequest {
        device: scope.device.clone().unwrap_or_default(),
        only_active_device: scope.only_active,
        ..ControlRequest::default()
    }
}

async fn send_over<S>(
    stream: S,
    req: hyper::Request<http_body_util::Full<Bytes>>,
) -> Result<(StatusCode, Bytes), IpcClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| IpcClientError::Request(format!("HTTP handshake failed: {e}")))?;

    // Drive the connection in the background
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::warn!(error = %e, "IPC connection error");
        }
    });

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| IpcClientError::Request(format!("request failed: {e}")))?;
    let status = resp.status();
    let body = http_body_util::BodyExt::collect(resp.into_body())
        .await
        .map_err(|e| IpcClientError::Request(format!("failed to read response body: {e}")))?
        .to_bytes();
    Ok((status, body))
}

/// Decode a JSON body, turning an error envelope into
/// [`IpcClientError::DaemonError`].
fn decode_json<T: DeserializeOwned>(
    path: &str,
    status: StatusCode,
    body: &[u8],
) -> Result<T, IpcClientError> {
    if let Ok(envelope) = serde_json::from_slice::<Response>(body) {
        if envelope.is_error() {
            return Err(IpcClientError::DaemonError(envelope.message));
        }
    }
    if !status.is_success() {
        return Err(IpcClientError::Request(format!("unexpected status: {status}")));
    }
    serde_json::from_slice(body).map_err(|e| IpcClientError::Parse(format!("{path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_envelope_becomes_daemon_error() {
        let body = br#"{"status":"error","message":"core process is not running"}"#;
        let result = decode_json::<ProcessInfo>("/core", StatusCode::OK, body);
        match result {
            Err(IpcClientError::DaemonError(msg)) => assert_eq!(msg, "core process is not running"),
            other => panic!("expected daemon error, got {other:?}"),
        }
    }

    #[test]
    fn test_success_envelope_decodes() {
        let body = br#"{"status":"","message":"pong"}"#;
        let resp: Response = decode_json("/ping", StatusCode::OK, body).unwrap();
        assert_eq!(resp, Response::new("", "pong"));
    }

    #[test]
    fn test_unexpected_status_without_envelope() {
        let result = decode_json::<Response>("/nope", StatusCode::NOT_FOUND, b"");
        assert!(matches!(result, Err(IpcClientError::Request(_))));
    }

    #[test]
    fn test_scoped_request_carries_device() {
        let scope = DeviceScope {
            device: Some("Wi-Fi".to_string()),
            only_active: true,
        };
        let req = scoped_request(&scope);
        assert_eq!(req.device, "Wi-Fi");
        assert!(req.only_active_device);
    }

    #[test]
    fn test_signed_request_has_headers() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let client = IpcClient::new(Endpoint::Tcp("127.0.0.1:1".parse().unwrap()))
            .with_signing_key(key);
        let req = client
            .build_request(hyper::Method::GET, "/test", None)
            .unwrap();
        assert!(req.headers().contains_key(TIMESTAMP_HEADER));
        assert!(req.headers().contains_key(SIGNATURE_HEADER));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_socket_is_not_running() {
        let tmp = tempfile::TempDir::new().unwrap();
        let client = IpcClient::new(Endpoint::local(
            tmp.path().join("absent.sock").to_str().unwrap(),
        ));
        let result = client.ping().await;
        assert!(matches!(result, Err(IpcClientError::NotRunning(_))));
    }
}
