//! Shell-script stand-ins for the core executable.
//!
//! Each script gets a unique, fixed-width file name so that name-based
//! termination (`pkill -x`) and process-table lookups from parallel tests
//! never hit each other's processes. Names stay below the 15-byte `comm`
//! limit. Scripts must not `exec`, or the process would be renamed.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tempfile::TempDir;

/// Default ready line of the real core.
pub const READY_LINE: &str = "Start initial Compatible provider default";

static NEXT_SCRIPT: AtomicU32 = AtomicU32::new(0);

/// A temp directory of mock core scripts. Dropping it deletes them.
pub struct MockCore {
    dir: TempDir,
}

impl MockCore {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("failed to create mock core dir"),
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Prints the ready line and keeps running.
    pub fn ready(&self) -> PathBuf {
        self.script(&format!("echo '{READY_LINE}'\nwhile true; do sleep 1; done"))
    }

    /// Prints a fatal log line carrying `message`, then exits 1.
    pub fn fatal(&self, message: &str) -> PathBuf {
        self.script(&format!(
            "echo 'time=\"2024-01-01T00:00:00Z\" level=info msg=\"loading config\"'\n\
             echo 'time=\"2024-01-01T00:00:00Z\" level=fatal msg=\"{message}\"'\n\
             exit 1"
        ))
    }

    /// Runs without ever printing a marker.
    pub fn silent(&self) -> PathBuf {
        self.script("while true; do sleep 1; done")
    }

    /// Prints the ready line, runs for `after`, then exits 1.
    pub fn ready_then_exit(&self, after: Duration) -> PathBuf {
        self.script(&format!(
            "echo '{READY_LINE}'\nsleep {:.3}\nexit 1",
            after.as_secs_f64()
        ))
    }

    /// Prints the ready line, runs for `after`, then exits 0 with no
    /// successor.
    pub fn ready_then_exit_cleanly(&self, after: Duration) -> PathBuf {
        self.script(&format!(
            "echo '{READY_LINE}'\nsleep {:.3}\nexit 0",
            after.as_secs_f64()
        ))
    }

    /// Prints the ready line, starts a successor of itself under the same
    /// name, and exits 0 after `after`. The successor keeps running without
    /// printing anything. Both count as spawns.
    pub fn hand_off(&self, after: Duration) -> PathBuf {
        self.script(&format!(
            "if [ \"$1\" = successor ]; then\n  while true; do sleep 1; done\nfi\n\
             echo '{READY_LINE}'\n\"$0\" successor &\nsleep {:.3}\nexit 0",
            after.as_secs_f64()
        ))
    }

    /// Exits 2 immediately without output.
    pub fn exit_immediately(&self) -> PathBuf {
        self.script("exit 2")
    }

    /// Prints the ready line, then writes its environment to `env.out`.
    pub fn env_dump(&self) -> PathBuf {
        let out = self.dir().join("env.out");
        self.script(&format!(
            "env > '{}'\necho '{READY_LINE}'\nwhile true; do sleep 1; done",
            out.display()
        ))
    }

    /// How many times `script` has been started.
    pub fn spawn_count(&self, script: &Path) -> usize {
        std::fs::read_to_string(Self::counter_path(script))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn counter_path(script: &Path) -> PathBuf {
        script.with_extension("spawns")
    }

    fn script(&self, body: &str) -> PathBuf {
        let n = NEXT_SCRIPT.fetch_add(1, Ordering::SeqCst);
        let name = format!("cs{:05}{:04}x", std::process::id() % 100_000, n % 10_000);
        let path = self.dir().join(name);
        let counter = Self::counter_path(&path);

        let content = format!(
            "#!/bin/sh\necho spawn >> '{}'\n{body}\n",
            counter.display()
        );
        std::fs::write(&path, content).expect("failed to write mock core");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod mock core");
        path
    }
}

impl Default for MockCore {
    fn default() -> Self {
        Self::new()
    }
}
