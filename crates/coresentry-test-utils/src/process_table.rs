//! Scriptable process table.
//!
//! [`FakeProcessTable`] answers from per-name and per-PID overrides and
//! falls through to the real OS table for everything else, so a test can
//! run a genuine mock core while faking a PID change or a disappearance.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use coresentry_core::BoxFuture;
use coresentry_core::supervisor::process_table::{
    OsProcessTable, ProcessEntry, ProcessStat, ProcessTable,
};

#[derive(Default)]
pub struct FakeProcessTable {
    os: OsProcessTable,
    names: Mutex<HashMap<String, Vec<ProcessEntry>>>,
    stats: Mutex<HashMap<u32, ProcessStat>>,
    failing: AtomicBool,
}

impl FakeProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report exactly `entries` for `name`. An empty list makes the process
    /// look vanished.
    pub fn set_entries(&self, name: &str, entries: Vec<ProcessEntry>) {
        self.names
            .lock()
            .unwrap()
            .insert(name.to_string(), entries);
    }

    pub fn set_stat(&self, pid: u32, stat: ProcessStat) {
        self.stats.lock().unwrap().insert(pid, stat);
    }

    /// Make every query fail with an IO error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Drop all overrides and answer from the OS again.
    pub fn clear(&self) {
        self.names.lock().unwrap().clear();
        self.stats.lock().unwrap().clear();
        self.set_failing(false);
    }

    fn check(&self) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(io::Error::other("process table unavailable"))
        } else {
            Ok(())
        }
    }
}

impl ProcessTable for FakeProcessTable {
    fn find_by_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, io::Result<Vec<ProcessEntry>>> {
        Box::pin(async move {
            self.check()?;
            let scripted = self.names.lock().unwrap().get(name).cloned();
            match scripted {
                Some(entries) => Ok(entries),
                None => self.os.find_by_name(name).await,
            }
        })
    }

    fn stat(&self, pid: u32) -> BoxFuture<'_, io::Result<Option<ProcessStat>>> {
        Box::pin(async move {
            self.check()?;
            let scripted = self.stats.lock().unwrap().get(&pid).copied();
            match scripted {
                Some(stat) => Ok(Some(stat)),
                None => self.os.stat(pid).await,
            }
        })
    }
}
