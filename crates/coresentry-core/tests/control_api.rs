//! End-to-end control API over real listeners.

#![cfg(unix)]

use std::sync::Arc;

use coresentry_core::daemon::Daemon;
use coresentry_core::ipc::{Endpoint, IpcClient, IpcClientError, Transport, router};
use coresentry_core::sys::DeviceScope;
use coresentry_core::{AuthGate, CoreSupervisor, SupervisorState};
use coresentry_test_utils::config::TestConfigBuilder;
use coresentry_test_utils::keys::TestKeys;
use coresentry_test_utils::mock_core::MockCore;
use coresentry_test_utils::system::FakeSystem;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

#[test_log::test(tokio::test)]
async fn signed_client_drives_the_core_over_the_socket() {
    let state_dir = TempDir::new().unwrap();
    let mock = MockCore::new();
    let config = TestConfigBuilder::new()
        .state_dir(state_dir.path())
        .with_tcp()
        .core_binary(mock.ready())
        .build();
    let system = Arc::new(FakeSystem::new());
    let daemon = Daemon::new(config).with_system(system.clone());
    let handle = daemon.launch().await.unwrap();

    let keys = TestKeys::generate();
    keys.install(&handle.auth);

    let endpoint = Endpoint::local(handle.local_addr().unwrap());
    let client = IpcClient::new(endpoint).with_signing_key(keys.signing.clone());

    assert_eq!(client.test().await.unwrap().message, "auth success");

    match client.core_status().await {
        Err(IpcClientError::DaemonError(msg)) => assert_eq!(msg, "core process is not running"),
        other => panic!("expected not running, got {other:?}"),
    }

    assert_eq!(client.core_start().await.unwrap().message, "core started");
    assert_eq!(handle.supervisor.state(), SupervisorState::Running);

    let info = client.core_status().await.unwrap();
    assert_eq!(Some(info.pid), handle.supervisor.pid());
    assert_eq!(client.core_health().await.unwrap().message, "healthy");

    match client.core_start().await {
        Err(IpcClientError::DaemonError(msg)) => assert_eq!(msg, "core process is already running"),
        other => panic!("expected already running, got {other:?}"),
    }

    let tcp = IpcClient::new(Endpoint::Tcp(handle.tcp_addr().unwrap()))
        .with_signing_key(keys.signing.clone());
    assert_eq!(tcp.core_stop().await.unwrap().message, "core stopped");
    assert_eq!(handle.supervisor.state(), SupervisorState::Idle);

    let scope = DeviceScope {
        device: Some("Wi-Fi".to_string()),
        only_active: false,
    };
    client.set_proxy("127.0.0.1:7890", "localhost", &scope).await.unwrap();
    client.disable_proxy(&DeviceScope::default()).await.unwrap();
    client
        .set_dns("Wi-Fi", &["1.1.1.1".to_string()])
        .await
        .unwrap();
    assert_eq!(
        system.calls(),
        vec![
            "proxy 127.0.0.1:7890 [localhost] Wi-Fi".to_string(),
            "disable <all>".to_string(),
            "dns Wi-Fi 1.1.1.1".to_string(),
        ]
    );

    handle.stop().await;
}

#[test_log::test(tokio::test)]
async fn unsigned_and_foreign_clients_are_rejected() {
    let state_dir = TempDir::new().unwrap();
    let config = TestConfigBuilder::new().state_dir(state_dir.path()).build();
    let daemon = Daemon::new(config).with_system(Arc::new(FakeSystem::new()));
    let handle = daemon.launch().await.unwrap();
    let endpoint = Endpoint::local(handle.local_addr().unwrap());

    // No key installed yet.
    let trusted = TestKeys::from_seed(1);
    let early = IpcClient::new(endpoint.clone()).with_signing_key(trusted.signing.clone());
    assert!(matches!(early.test().await, Err(IpcClientError::DaemonError(_))));

    trusted.install(&handle.auth);
    assert_eq!(early.test().await.unwrap().message, "auth success");

    let unsigned = IpcClient::new(endpoint.clone());
    assert_eq!(unsigned.ping().await.unwrap().message, "pong");
    match unsigned.core_start().await {
        Err(IpcClientError::DaemonError(msg)) => assert_eq!(msg, "missing authentication headers"),
        other => panic!("expected rejection, got {other:?}"),
    }

    let foreign = IpcClient::new(endpoint).with_signing_key(TestKeys::from_seed(2).signing);
    match foreign.test().await {
        Err(IpcClientError::DaemonError(msg)) => assert_eq!(msg, "signature verification failed"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(handle.supervisor.state(), SupervisorState::Idle);

    handle.stop().await;
}

#[test_log::test(tokio::test)]
async fn installed_key_survives_a_daemon_restart() {
    let state_dir = TempDir::new().unwrap();
    let keys = TestKeys::from_seed(9);

    let config = TestConfigBuilder::new().state_dir(state_dir.path()).build();
    let first = Daemon::new(config.clone()).launch().await.unwrap();
    keys.install(&first.auth);
    first.stop().await;

    let second = Daemon::new(config).launch().await.unwrap();
    assert!(second.auth.is_initialized());
    let client = IpcClient::new(Endpoint::local(second.local_addr().unwrap()))
        .with_signing_key(keys.signing);
    assert_eq!(client.test().await.unwrap().message, "auth success");
    second.stop().await;
}

#[test_log::test(tokio::test)]
async fn stale_socket_file_is_replaced() {
    let dir = TempDir::new().unwrap();
    let sock = dir.path().join("ctl.sock");

    // Leave a socket file behind, as a crashed daemon would.
    drop(std::os::unix::net::UnixListener::bind(&sock).unwrap());
    assert!(sock.exists());

    let gate = Arc::new(AuthGate::new(dir.path().join("keys"), std::time::Duration::from_secs(60)));
    let state = Arc::new(coresentry_core::ipc::ApiState {
        auth: gate,
        supervisor: CoreSupervisor::new(Default::default()),
        system: Arc::new(FakeSystem::new()),
    });
    let mut transport = Transport::new(router(state));
    transport.bind_local(sock.to_str().unwrap()).await.unwrap();

    let client = IpcClient::new(Endpoint::local(sock.to_str().unwrap()));
    assert_eq!(client.ping().await.unwrap().message, "pong");

    // Rebinding the same path replaces the live listener in place.
    transport.bind_local(sock.to_str().unwrap()).await.unwrap();
    assert_eq!(client.ping().await.unwrap().message, "pong");

    transport.shutdown().await;
    assert!(matches!(client.ping().await, Err(IpcClientError::NotRunning(_))));
}
