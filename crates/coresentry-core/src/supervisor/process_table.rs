//! OS process table queries used for crash polling, PID adoption and
//! memory reporting.
//!
//! The supervisor only talks to the [`ProcessTable`] trait so tests can
//! substitute a scripted table. [`OsProcessTable`] reads `/proc` on Linux,
//! shells out to `ps` on other Unix systems and to `tasklist` on Windows.

use std::io;
#[cfg(target_os = "linux")]
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::BoxFuture;

/// A process whose image name matched a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Creation time, when the platform reports it.
    pub start_time: Option<SystemTime>,
}

/// Resource snapshot of a single process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStat {
    /// Resident set size in bytes.
    pub rss: u64,
    pub start_time: Option<SystemTime>,
}

/// Read access to the OS process table.
pub trait ProcessTable: Send + Sync {
    /// All processes whose image name equals `name`.
    fn find_by_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, io::Result<Vec<ProcessEntry>>>;

    /// Memory and start time of `pid`, or `None` if it does not exist.
    fn stat(&self, pid: u32) -> BoxFuture<'_, io::Result<Option<ProcessStat>>>;
}

/// Process table backed by the running operating system.
#[derive(Debug, Clone)]
pub struct OsProcessTable {
    #[cfg(target_os = "linux")]
    proc_root: PathBuf,
}

impl Default for OsProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OsProcessTable {
    pub fn new() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Read from an alternative procfs mount.
    #[cfg(target_os = "linux")]
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

// ── Linux: procfs ───────────────────────────────────────────────────────

/// The kernel truncates `comm` to 15 bytes.
#[cfg(target_os = "linux")]
const MAX_COMM_LEN: usize = 15;

/// `sysconf(_SC_CLK_TCK)` on every mainstream Linux target.
#[cfg(target_os = "linux")]
const CLOCK_TICKS_PER_SEC: u64 = 100;

#[cfg(target_os = "linux")]
impl ProcessTable for OsProcessTable {
    fn find_by_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, io::Result<Vec<ProcessEntry>>> {
        let proc_root = self.proc_root.clone();
        let name = name.to_string();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || scan_proc(&proc_root, &name))
                .await
                .map_err(io::Error::other)?
        })
    }

    fn stat(&self, pid: u32) -> BoxFuture<'_, io::Result<Option<ProcessStat>>> {
        let proc_root = self.proc_root.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || stat_proc(&proc_root, pid))
                .await
                .map_err(io::Error::other)?
        })
    }
}

#[cfg(target_os = "linux")]
fn scan_proc(proc_root: &Path, name: &str) -> io::Result<Vec<ProcessEntry>> {
    let wanted = truncate_comm(name);
    let boot_time = read_boot_time(proc_root);
    let mut found = Vec::new();

    for entry in std::fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        // Processes can exit mid-scan.
        let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        if comm.trim_end_matches('\n') != wanted {
            continue;
        }
        let stat = std::fs::read_to_string(entry.path().join("stat")).unwrap_or_default();
        // An exited but unreaped child is not a running core.
        if parse_state(&stat) == Some('Z') {
            continue;
        }
        found.push(ProcessEntry {
            pid,
            start_time: start_time_from_stat(&stat, boot_time),
        });
    }

    found.sort_by_key(|e| e.pid);
    Ok(found)
}

#[cfg(target_os = "linux")]
fn stat_proc(proc_root: &Path, pid: u32) -> io::Result<Option<ProcessStat>> {
    let status = match std::fs::read_to_string(proc_root.join(pid.to_string()).join("status")) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(Some(ProcessStat {
        rss: parse_vm_rss(&status).unwrap_or(0),
        start_time: read_start_time(proc_root, pid, read_boot_time(proc_root)),
    }))
}

#[cfg(target_os = "linux")]
pub(crate) fn truncate_comm(name: &str) -> &str {
    if name.len() <= MAX_COMM_LEN {
        return name;
    }
    let mut end = MAX_COMM_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// `VmRSS:     1234 kB` → bytes.
#[cfg(target_os = "linux")]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line["VmRSS:".len()..]
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb * 1024)
}

#[cfg(target_os = "linux")]
fn read_boot_time(proc_root: &Path) -> Option<u64> {
    let stat = std::fs::read_to_string(proc_root.join("stat")).ok()?;
    stat.lines()
        .find_map(|l| l.strip_prefix("btime "))
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(target_os = "linux")]
fn read_start_time(proc_root: &Path, pid: u32, boot_time: Option<u64>) -> Option<SystemTime> {
    let stat = std::fs::read_to_string(proc_root.join(pid.to_string()).join("stat")).ok()?;
    start_time_from_stat(&stat, boot_time)
}

#[cfg(target_os = "linux")]
fn start_time_from_stat(stat: &str, boot_time: Option<u64>) -> Option<SystemTime> {
    let ticks: u64 = stat_fields(stat)?.nth(19)?.parse().ok()?;
    let secs = boot_time? + ticks / CLOCK_TICKS_PER_SEC;
    Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs))
}

#[cfg(target_os = "linux")]
fn parse_state(stat: &str) -> Option<char> {
    stat_fields(stat)?.next()?.chars().next()
}

/// Fields of `/proc/<pid>/stat` from field 3 (state) on. The comm field may
/// contain spaces and parentheses, so splitting starts after the last `)`.
#[cfg(target_os = "linux")]
fn stat_fields(stat: &str) -> Option<std::str::SplitWhitespace<'_>> {
    Some(stat[stat.rfind(')')? + 1..].split_whitespace())
}

// ── Other Unix: ps ──────────────────────────────────────────────────────

#[cfg(all(unix, not(target_os = "linux")))]
impl ProcessTable for OsProcessTable {
    fn find_by_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, io::Result<Vec<ProcessEntry>>> {
        Box::pin(async move {
            let output = tokio::process::Command::new("ps")
                .args(["-axo", "pid=,comm="])
                .output()
                .await?;
            if !output.status.success() {
                return Err(io::Error::other(format!("ps exited with {}", output.status)));
            }
            let listing = String::from_utf8_lossy(&output.stdout);
            Ok(parse_ps_listing(&listing, name)
                .into_iter()
                .map(|pid| ProcessEntry {
                    pid,
                    start_time: None,
                })
                .collect())
        })
    }

    fn stat(&self, pid: u32) -> BoxFuture<'_, io::Result<Option<ProcessStat>>> {
        Box::pin(async move {
            let output = tokio::process::Command::new("ps")
                .args(["-o", "rss=,etime=", "-p", &pid.to_string()])
                .output()
                .await?;
            // ps exits non-zero when the pid does not exist.
            if !output.status.success() {
                return Ok(None);
            }
            let line = String::from_utf8_lossy(&output.stdout);
            let mut fields = line.split_whitespace();
            let Some(rss_kb) = fields.next().and_then(|v| v.parse::<u64>().ok()) else {
                return Ok(None);
            };
            let start_time = fields
                .next()
                .and_then(parse_etime)
                .and_then(|elapsed| SystemTime::now().checked_sub(elapsed));
            Ok(Some(ProcessStat {
                rss: rss_kb * 1024,
                start_time,
            }))
        })
    }
}

/// Parse `ps -axo pid=,comm=` output. `comm` may be a full path.
#[cfg(any(test, all(unix, not(target_os = "linux"))))]
fn parse_ps_listing(listing: &str, name: &str) -> Vec<u32> {
    listing
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, comm) = line.split_once(char::is_whitespace)?;
            let comm = comm.trim();
            let base = comm.rsplit('/').next().unwrap_or(comm);
            (base == name).then(|| pid.parse().ok()).flatten()
        })
        .collect()
}

/// `[[dd-]hh:]mm:ss` → duration.
#[cfg(any(test, all(unix, not(target_os = "linux"))))]
fn parse_etime(etime: &str) -> Option<std::time::Duration> {
    let (days, clock) = match etime.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, etime),
    };
    let mut secs = 0u64;
    for part in clock.split(':') {
        secs = secs * 60 + part.parse::<u64>().ok()?;
    }
    Some(std::time::Duration::from_secs(days * 86_400 + secs))
}

// ── Windows: tasklist ───────────────────────────────────────────────────

#[cfg(windows)]
impl ProcessTable for OsProcessTable {
    fn find_by_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, io::Result<Vec<ProcessEntry>>> {
        Box::pin(async move {
            let rows = tasklist(&format!("IMAGENAME eq {name}")).await?;
            Ok(rows
                .into_iter()
                .filter(|row| row.image.eq_ignore_ascii_case(name))
                .map(|row| ProcessEntry {
                    pid: row.pid,
                    start_time: None,
                })
                .collect())
        })
    }

    fn stat(&self, pid: u32) -> BoxFuture<'_, io::Result<Option<ProcessStat>>> {
        Box::pin(async move {
            let rows = tasklist(&format!("PID eq {pid}")).await?;
            Ok(rows
                .into_iter()
                .find(|row| row.pid == pid)
                .map(|row| ProcessStat {
                    rss: row.rss,
                    start_time: None,
                }))
        })
    }
}

#[cfg(any(test, windows))]
#[derive(Debug, PartialEq, Eq)]
struct TasklistRow {
    image: String,
    pid: u32,
    rss: u64,
}

#[cfg(windows)]
async fn tasklist(filter: &str) -> io::Result<Vec<TasklistRow>> {
    let output = tokio::process::Command::new("tasklist")
        .args(["/FO", "CSV", "/NH", "/FI", filter])
        .output()
        .await?;
    if !output.status.success() {
        return Err(io::Error::other(format!("tasklist exited with {}", output.status)));
    }
    let (text, _, _) = encoding_rs::GBK.decode(&output.stdout);
    Ok(text.lines().filter_map(parse_tasklist_row).collect())
}

/// `"core.exe","1234","Console","1","12,345 K"`. Informational lines such
/// as "INFO: No tasks are running" are not CSV and are skipped.
#[cfg(any(test, windows))]
fn parse_tasklist_row(line: &str) -> Option<TasklistRow> {
    let fields: Vec<&str> = line
        .trim()
        .strip_prefix('"')?
        .strip_suffix('"')?
        .split("\",\"")
        .collect();
    if fields.len() < 5 {
        return None;
    }
    let kb: u64 = fields[4]
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some(TasklistRow {
        image: fields[0].to_string(),
        pid: fields[1].parse().ok()?,
        rss: kb * 1024,
    })
}
