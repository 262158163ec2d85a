//! Supervisor lifecycle against real child processes.
//!
//! Each test runs its own uniquely named mock core, so name-based
//! termination from one test never touches another test's process.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use coresentry_config::TerminationPolicy;
use coresentry_core::supervisor::process_table::{
    OsProcessTable, ProcessEntry, ProcessStat, ProcessTable,
};
use coresentry_core::{CoreSupervisor, SupervisorError, SupervisorState};
use coresentry_test_utils::config::TestConfigBuilder;
use coresentry_test_utils::mock_core::MockCore;
use coresentry_test_utils::process_table::FakeProcessTable;
use pretty_assertions::assert_eq;

fn process_name(path: &std::path::Path) -> String {
    path.file_name().unwrap().to_string_lossy().to_string()
}

async fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[test_log::test(tokio::test)]
async fn start_reaches_running_and_second_start_is_rejected() {
    let mock = MockCore::new();
    let script = mock.ready();
    let config = TestConfigBuilder::new().core_binary(&script).build();
    let supervisor = CoreSupervisor::new(config.core);

    supervisor.start().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Running);
    let pid = supervisor.pid().unwrap();

    assert!(matches!(
        supervisor.start().await,
        Err(SupervisorError::AlreadyRunning)
    ));
    assert_eq!(mock.spawn_count(&script), 1);
    assert_eq!(supervisor.pid(), Some(pid));

    let info = supervisor.process_info().await.unwrap();
    assert_eq!(info.pid, pid);
    assert!(info.memory > 0);
    assert!(supervisor.is_healthy().await);

    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert_eq!(supervisor.pid(), None);

    let remaining = OsProcessTable::new()
        .find_by_name(&process_name(&script))
        .await
        .unwrap();
    assert!(remaining.is_empty(), "core still running: {remaining:?}");
}

#[test_log::test(tokio::test)]
async fn concurrent_starts_spawn_once() {
    let mock = MockCore::new();
    let script = mock.ready();
    let config = TestConfigBuilder::new().core_binary(&script).build();
    let supervisor = CoreSupervisor::new(config.core);

    let (a, b) = tokio::join!(supervisor.start(), supervisor.start());
    let outcomes = [a.is_ok(), b.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    assert_eq!(mock.spawn_count(&script), 1);

    supervisor.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn fatal_marker_fails_start_with_message() {
    let mock = MockCore::new();
    let config = TestConfigBuilder::new()
        .core_binary(mock.fatal("listen tcp :7890: bind: address already in use"))
        .build();
    let supervisor = CoreSupervisor::new(config.core);

    match supervisor.start().await {
        Err(SupervisorError::StartupFatal(msg)) => {
            assert_eq!(msg, "listen tcp :7890: bind: address already in use");
        }
        other => panic!("expected fatal startup, got {other:?}"),
    }
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert_eq!(supervisor.pid(), None);
}

#[test_log::test(tokio::test)]
async fn silent_core_times_out_and_is_killed() {
    let mock = MockCore::new();
    let script = mock.silent();
    let config = TestConfigBuilder::new()
        .core_binary(&script)
        .startup_timeout_ms(300)
        .build();
    let supervisor = CoreSupervisor::new(config.core);

    assert!(matches!(
        supervisor.start().await,
        Err(SupervisorError::StartupTimeout(_))
    ));
    assert_eq!(supervisor.state(), SupervisorState::Idle);

    let name = process_name(&script);
    let table = OsProcessTable::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if table.find_by_name(&name).await.unwrap().is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed-out core was not killed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[test_log::test(tokio::test)]
async fn early_exit_fails_start_without_waiting_for_timeout() {
    let mock = MockCore::new();
    let config = TestConfigBuilder::new()
        .core_binary(mock.exit_immediately())
        .startup_timeout_ms(10_000)
        .build();
    let supervisor = CoreSupervisor::new(config.core);

    let started = std::time::Instant::now();
    assert!(matches!(
        supervisor.start().await,
        Err(SupervisorError::StartupFatal(_))
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test_log::test(tokio::test)]
async fn crashing_core_exhausts_restart_budget() {
    let mock = MockCore::new();
    let script = mock.ready_then_exit(Duration::from_millis(300));
    let config = TestConfigBuilder::new()
        .core_binary(&script)
        .max_restart_attempts(3)
        .build();
    let supervisor = CoreSupervisor::new(config.core);

    supervisor.start().await.unwrap();
    wait_until("failed state", Duration::from_secs(15), || {
        supervisor.state() == SupervisorState::Failed
    })
    .await;

    // Initial spawn plus three restarts.
    assert_eq!(mock.spawn_count(&script), 4);
    assert_eq!(supervisor.pid(), None);
    assert!(!supervisor.is_healthy().await);

    // An explicit start is still accepted after giving up.
    assert!(supervisor.start().await.is_ok());
    supervisor.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn stop_during_recovery_cancels_it() {
    let mock = MockCore::new();
    let script = mock.ready_then_exit(Duration::from_millis(200));
    let mut config = TestConfigBuilder::new()
        .core_binary(&script)
        .max_restart_attempts(50)
        .build();
    config.core.restart_settle_ms = 200;
    let supervisor = CoreSupervisor::new(config.core);

    supervisor.start().await.unwrap();
    wait_until("crash recovery", Duration::from_secs(5), || {
        mock.spawn_count(&script) >= 2
    })
    .await;

    supervisor.stop().await.unwrap();
    let spawned = mock.spawn_count(&script);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert!(mock.spawn_count(&script) <= spawned + 1);
}

#[test_log::test(tokio::test)]
async fn restart_replaces_the_process() {
    let mock = MockCore::new();
    let script = mock.ready();
    let config = TestConfigBuilder::new().core_binary(&script).build();
    let supervisor = CoreSupervisor::new(config.core);

    supervisor.start().await.unwrap();
    let first = supervisor.pid().unwrap();

    supervisor.restart().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Running);
    let second = supervisor.pid().unwrap();
    assert_ne!(first, second);
    assert_eq!(mock.spawn_count(&script), 2);

    supervisor.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn restart_when_idle_starts_the_core() {
    let mock = MockCore::new();
    let config = TestConfigBuilder::new().core_binary(mock.ready()).build();
    let supervisor = CoreSupervisor::new(config.core);

    supervisor.restart().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Running);
    supervisor.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn poller_adopts_a_new_pid() {
    let mock = MockCore::new();
    let script = mock.ready();
    let table = Arc::new(FakeProcessTable::new());
    let config = TestConfigBuilder::new().core_binary(&script).build();
    let supervisor = CoreSupervisor::with_process_table(config.core, table.clone());

    supervisor.start().await.unwrap();
    let spawned = supervisor.pid().unwrap();

    let adopted = 4_000_000;
    let adopted_start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    table.set_entries(
        &process_name(&script),
        vec![ProcessEntry {
            pid: adopted,
            start_time: Some(adopted_start),
        }],
    );
    table.set_stat(
        adopted,
        ProcessStat {
            rss: 3 * 1024 * 1024,
            start_time: Some(adopted_start),
        },
    );

    wait_until("pid adoption", Duration::from_secs(5), || {
        supervisor.pid() == Some(adopted)
    })
    .await;
    assert_eq!(supervisor.state(), SupervisorState::Running);

    let info = supervisor.process_info().await.unwrap();
    assert_eq!(info.pid, adopted);
    assert_eq!(info.memory_format, "3.00 MB");
    assert_eq!(info.start_time.timestamp(), 1_700_000_000);

    table.clear();
    wait_until("re-adoption of the real child", Duration::from_secs(5), || {
        supervisor.pid() == Some(spawned)
    })
    .await;
    supervisor.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn core_handing_off_to_a_successor_is_adopted() {
    let mock = MockCore::new();
    let script = mock.hand_off(Duration::from_millis(300));
    let config = TestConfigBuilder::new().core_binary(&script).build();
    let supervisor = CoreSupervisor::new(config.core);

    supervisor.start().await.unwrap();
    let first = supervisor.pid().unwrap();

    wait_until("successor adoption", Duration::from_secs(5), || {
        matches!(supervisor.pid(), Some(pid) if pid != first)
    })
    .await;
    let successor = supervisor.pid().unwrap();

    // Several poll periods later nothing has been restarted.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(supervisor.state(), SupervisorState::Running);
    assert_eq!(supervisor.pid(), Some(successor));
    assert_eq!(mock.spawn_count(&script), 2);
    assert_eq!(supervisor.process_info().await.unwrap().pid, successor);
    assert!(supervisor.is_healthy().await);

    supervisor.stop().await.unwrap();
    let left = OsProcessTable::new()
        .find_by_name(&process_name(&script))
        .await
        .unwrap();
    assert!(left.is_empty(), "successor survived stop: {left:?}");
}

#[test_log::test(tokio::test)]
async fn clean_exit_without_successor_is_restarted() {
    let mock = MockCore::new();
    let script = mock.ready_then_exit_cleanly(Duration::from_millis(300));
    let config = TestConfigBuilder::new()
        .core_binary(&script)
        .max_restart_attempts(1)
        .build();
    let supervisor = CoreSupervisor::new(config.core);

    supervisor.start().await.unwrap();
    wait_until("failed state", Duration::from_secs(10), || {
        supervisor.state() == SupervisorState::Failed
    })
    .await;
    assert_eq!(mock.spawn_count(&script), 2);

    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

#[test_log::test(tokio::test)]
async fn vanished_core_is_restarted() {
    let mock = MockCore::new();
    let script = mock.ready();
    let table = Arc::new(FakeProcessTable::new());
    let config = TestConfigBuilder::new()
        .core_binary(&script)
        .max_restart_attempts(1)
        .build();
    let supervisor = CoreSupervisor::with_process_table(config.core, table.clone());

    supervisor.start().await.unwrap();
    table.set_entries(&process_name(&script), Vec::new());

    wait_until("failed state", Duration::from_secs(10), || {
        supervisor.state() == SupervisorState::Failed
    })
    .await;
    assert_eq!(mock.spawn_count(&script), 2);

    table.clear();
    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

#[test_log::test(tokio::test)]
async fn table_query_errors_are_not_crashes() {
    let mock = MockCore::new();
    let script = mock.ready();
    let table = Arc::new(FakeProcessTable::new());
    let config = TestConfigBuilder::new().core_binary(&script).build();
    let supervisor = CoreSupervisor::with_process_table(config.core, table.clone());

    supervisor.start().await.unwrap();
    table.set_failing(true);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(supervisor.state(), SupervisorState::Running);
    assert_eq!(mock.spawn_count(&script), 1);
    assert!(!supervisor.is_healthy().await);

    table.set_failing(false);
    assert!(supervisor.is_healthy().await);
    supervisor.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn tracked_pid_stop_kills_only_the_child() {
    let mock = MockCore::new();
    let script = mock.ready();
    let config = TestConfigBuilder::new()
        .core_binary(&script)
        .termination(TerminationPolicy::TrackedPid)
        .build();
    let supervisor = CoreSupervisor::new(config.core);

    supervisor.start().await.unwrap();
    let pid = supervisor.pid().unwrap();
    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Idle);

    let table = OsProcessTable::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while table.stat(pid).await.unwrap().is_some() {
        assert!(tokio::time::Instant::now() < deadline, "child {pid} survived stop");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[test_log::test(tokio::test)]
async fn configured_env_reaches_the_core() {
    let mock = MockCore::new();
    let config = TestConfigBuilder::new()
        .core_binary(mock.env_dump())
        .core_env("CORESENTRY_TEST_MARK", "42")
        .build();
    let supervisor = CoreSupervisor::new(config.core);

    supervisor.start().await.unwrap();
    let env = std::fs::read_to_string(mock.dir().join("env.out")).unwrap();
    assert!(env.lines().any(|l| l == "CORESENTRY_TEST_MARK=42"));
    assert!(env.lines().any(|l| l == "DISABLE_LOOPBACK_DETECTOR=true"));
    supervisor.stop().await.unwrap();
}
