//! Caller credential snapshots with pid-reuse protection.
//!
//! Every privileged request captures the caller's identity exactly once
//! in a [`CredentialSnapshot`]. The snapshot pairs the pid with a
//! [`ProcessToken`] taken from the process table, so a pid that is
//! recycled while the request is suspended behind the authorization
//! gate cannot impersonate the original caller: liveness is
//! re-validated against the token at every resume point, not at
//! initial dispatch.

use std::collections::HashSet;
use std::sync::RwLock;

use tracing::debug;

/// Identity token for one incarnation of a process.
///
/// Two tokens compare equal only if they name the same pid *and* the
/// same process start time, which is stable for the lifetime of the
/// process and changes when the pid is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessToken {
    /// Process id.
    pub pid: i32,
    /// Kernel start time of the process (clock ticks since boot).
    pub start_time: u64,
}

/// Source of process liveness facts.
///
/// Abstracted so the engine can be driven deterministically in tests
/// without a live process table.
pub trait ProcessMonitor: Send + Sync {
    /// Capture a token for `pid`, or `None` if the process is gone.
    fn capture(&self, pid: i32) -> Option<ProcessToken>;

    /// Returns `true` if the process named by `token` is still the
    /// same incarnation and still alive.
    fn is_alive(&self, token: &ProcessToken) -> bool;
}

/// Process monitor backed by `/proc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsMonitor;

impl ProcfsMonitor {
    /// Create a new procfs-backed monitor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Read the start time (field 22 of `/proc/<pid>/stat`).
    ///
    /// The comm field may contain spaces and parentheses, so parsing
    /// starts after the last `)`.
    fn start_time(pid: i32) -> Option<u64> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let rest = &stat[stat.rfind(')')? + 1..];
        // `rest` begins at field 3 (state); starttime is field 22.
        rest.split_whitespace().nth(19)?.parse().ok()
    }
}

impl ProcessMonitor for ProcfsMonitor {
    fn capture(&self, pid: i32) -> Option<ProcessToken> {
        if pid <= 0 {
            return None;
        }
        let start_time = Self::start_time(pid)?;
        Some(ProcessToken { pid, start_time })
    }

    fn is_alive(&self, token: &ProcessToken) -> bool {
        Self::start_time(token.pid) == Some(token.start_time)
    }
}

/// In-memory process monitor for testing.
///
/// Pids registered as live produce tokens with a fixed start time;
/// removing a pid makes every previously captured token dead.
#[derive(Debug, Default)]
pub struct StaticProcessMonitor {
    live: RwLock<HashSet<i32>>,
}

impl StaticProcessMonitor {
    /// Create a monitor with no live processes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `pid` as live.
    pub fn add(&self, pid: i32) {
        self.live.write().expect("lock poisoned").insert(pid);
    }

    /// Mark `pid` as exited.
    pub fn remove(&self, pid: i32) {
        self.live.write().expect("lock poisoned").remove(&pid);
    }
}

impl ProcessMonitor for StaticProcessMonitor {
    fn capture(&self, pid: i32) -> Option<ProcessToken> {
        self.live
            .read()
            .expect("lock poisoned")
            .contains(&pid)
            .then_some(ProcessToken { pid, start_time: 0 })
    }

    fn is_alive(&self, token: &ProcessToken) -> bool {
        self.live
            .read()
            .expect("lock poisoned")
            .contains(&token.pid)
    }
}

/// Immutable capture of a caller's identity, taken once per privileged
/// request and destroyed when the call (or its continuation) finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSnapshot {
    /// Effective uid of the caller.
    pub uid: u32,
    /// Pid of the caller.
    pub pid: i32,
    /// Liveness token, `None` if the process was already gone at
    /// capture time.
    pub process: Option<ProcessToken>,
}

impl CredentialSnapshot {
    /// Capture a snapshot for the given identity.
    pub fn capture(uid: u32, pid: i32, monitor: &dyn ProcessMonitor) -> Self {
        let process = monitor.capture(pid);
        if process.is_none() {
            debug!(uid, pid, "caller process gone at credential capture");
        }
        Self { uid, pid, process }
    }

    /// Re-validate that the captured process is still alive.
    ///
    /// A snapshot whose capture already failed is never alive.
    #[must_use]
    pub fn is_alive(&self, monitor: &dyn ProcessMonitor) -> bool {
        self.process
            .as_ref()
            .is_some_and(|token| monitor.is_alive(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn procfs_captures_own_process() {
        let monitor = ProcfsMonitor::new();
        let pid = std::process::id() as i32;
        let token = monitor.capture(pid).expect("own process must exist");
        assert_eq!(token.pid, pid);
        assert!(monitor.is_alive(&token));
    }

    #[test]
    fn procfs_rejects_invalid_pid() {
        let monitor = ProcfsMonitor::new();
        assert!(monitor.capture(0).is_none());
        assert!(monitor.capture(-1).is_none());
    }

    #[test]
    fn static_monitor_tracks_liveness() {
        let monitor = StaticProcessMonitor::new();
        monitor.add(100);

        let snapshot = CredentialSnapshot::capture(1000, 100, &monitor);
        assert!(snapshot.is_alive(&monitor));

        monitor.remove(100);
        assert!(!snapshot.is_alive(&monitor));
    }

    #[test]
    fn snapshot_of_dead_process_is_never_alive() {
        let monitor = StaticProcessMonitor::new();
        let snapshot = CredentialSnapshot::capture(1000, 100, &monitor);
        assert!(snapshot.process.is_none());

        // Even if the pid is reused later, the old snapshot stays dead.
        monitor.add(100);
        assert!(!snapshot.is_alive(&monitor));
    }
}
