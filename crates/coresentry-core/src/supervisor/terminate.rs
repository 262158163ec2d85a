//! Killing the core process by image name or by PID.
//!
//! Both paths shell out to the platform kill tool and then poll the process
//! table until the target is gone. Killing by name also hits unrelated
//! processes that share the executable name. On POSIX the name is matched
//! exactly against the process name, the same `comm` the poller reads, and
//! the daemon itself is never a target.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::SupervisorError;
use super::process_table::ProcessTable;

/// How many times the process table is polled after a kill.
pub const CONFIRM_ATTEMPTS: u32 = 5;

/// Delay between confirmation polls.
pub const CONFIRM_INTERVAL: Duration = Duration::from_millis(100);

/// What a kill command targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillTarget<'a> {
    Name(&'a str),
    Pid(u32),
}

/// A platform kill invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillCommand {
    pub program: &'static str,
    pub args: Vec<String>,
}

/// Build the kill invocation for the current platform.
pub fn kill_command(target: &KillTarget<'_>) -> KillCommand {
    if cfg!(windows) {
        let args = match target {
            KillTarget::Name(name) => vec!["/F".into(), "/IM".into(), name.to_string()],
            KillTarget::Pid(pid) => vec!["/F".into(), "/PID".into(), pid.to_string()],
        };
        KillCommand {
            program: "taskkill",
            args,
        }
    } else {
        match target {
            KillTarget::Name(name) => KillCommand {
                program: "pkill",
                args: vec!["-x".into(), exact_name_pattern(name)],
            },
            KillTarget::Pid(pid) => KillCommand {
                program: "kill",
                args: vec!["-9".into(), pid.to_string()],
            },
        }
    }
}

/// `pkill -x` still takes a regex, so metacharacters in the name are
/// escaped. Linux reports at most 15 bytes of the name.
fn exact_name_pattern(name: &str) -> String {
    #[cfg(target_os = "linux")]
    let name = super::process_table::truncate_comm(name);

    let mut pattern = String::with_capacity(name.len());
    for c in name.chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern
}

/// Whether a failed kill only means "nothing matched".
///
/// `pkill` exits 1 when no process matched; `taskkill` exits 128 or reports
/// that the process was not found, in English or in the Chinese locale.
pub fn is_no_match(exit_code: Option<i32>, output: &str) -> bool {
    if cfg!(windows) {
        exit_code == Some(128) || output.contains("没有找到进程") || output.contains("not found")
    } else {
        exit_code == Some(1)
    }
}

/// Kill every process named `name` except the daemon itself and wait until
/// none is listed.
pub async fn terminate_by_name(table: &dyn ProcessTable, name: &str) -> Result<(), SupervisorError> {
    let own_pid = std::process::id();

    match table.find_by_name(name).await {
        Ok(listed) if listed.iter().any(|e| e.pid == own_pid) => {
            warn!(name, pid = own_pid, "Daemon shares the core's process name, killing cores by PID");
            for entry in listed.iter().filter(|e| e.pid != own_pid) {
                run_kill(&KillTarget::Pid(entry.pid)).await?;
            }
        }
        _ => run_kill(&KillTarget::Name(name)).await?,
    }

    for attempt in 1..=CONFIRM_ATTEMPTS {
        match table.find_by_name(name).await {
            Ok(found) if found.iter().all(|e| e.pid == own_pid) => {
                info!(name, "Core process terminated");
                return Ok(());
            }
            Ok(found) => debug!(name, attempt, remaining = found.len(), "Waiting for core to exit"),
            Err(e) => warn!(name, error = %e, "Process table query failed during termination"),
        }
        tokio::time::sleep(CONFIRM_INTERVAL).await;
    }

    Err(SupervisorError::TerminationFailed(format!(
        "process {name} still present after kill"
    )))
}

/// Kill a single PID and wait until it is gone.
pub async fn terminate_pid(table: &dyn ProcessTable, pid: u32) -> Result<(), SupervisorError> {
    if let Err(e) = run_kill(&KillTarget::Pid(pid)).await {
        // The pid may already be gone, which is what we want.
        if matches!(table.stat(pid).await, Ok(None)) {
            return Ok(());
        }
        return Err(e);
    }

    for _ in 0..CONFIRM_ATTEMPTS {
        if matches!(table.stat(pid).await, Ok(None)) {
            info!(pid, "Core process terminated");
            return Ok(());
        }
        tokio::time::sleep(CONFIRM_INTERVAL).await;
    }

    Err(SupervisorError::TerminationFailed(format!(
        "pid {pid} still present after kill"
    )))
}

async fn run_kill(target: &KillTarget<'_>) -> Result<(), SupervisorError> {
    let command = kill_command(target);
    debug!(program = command.program, args = ?command.args, "Running kill command");

    let output = tokio::process::Command::new(command.program)
        .args(&command.args)
        .output()
        .await
        .map_err(|e| {
            SupervisorError::TerminationFailed(format!("failed to run {}: {e}", command.program))
        })?;

    if output.status.success() {
        return Ok(());
    }

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    let text = if cfg!(windows) {
        encoding_rs::GBK.decode(&combined).0.into_owned()
    } else {
        String::from_utf8_lossy(&combined).into_owned()
    };

    if is_no_match(output.status.code(), &text) {
        debug!(target = ?target, "Kill matched no process");
        return Ok(());
    }

    Err(SupervisorError::TerminationFailed(format!(
        "{} exited with {}: {}",
        command.program,
        output.status,
        text.trim()
    )))
}
