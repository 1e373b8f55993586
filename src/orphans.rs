//! Finding and reaping unmanaged instances of the managed process.
//!
//! An orphan is any process whose command line matches the run signature but
//! whose parent is not the live supervisor. `start` and `stop` reap them,
//! `status` only reports them.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use tracing::warn;

use crate::inspector::{ProcessInfo, ProcessInspector, Signal};

pub const ORPHAN_GRACE: Duration = Duration::from_secs(1);

/// Processes running the managed invocation that the live supervisor does not own.
///
/// `supervisor_pid` must only be passed when the PID store reports it live.
pub fn find_orphans(
    inspector: &dyn ProcessInspector,
    signature: &Regex,
    supervisor_pid: Option<u32>,
) -> Result<Vec<ProcessInfo>> {
    let own_pid = std::process::id();
    let orphans = inspector
        .list()?
        .into_iter()
        .filter(|p| p.pid != own_pid && p.ppid != own_pid)
        .filter(|p| Some(p.ppid) != supervisor_pid && Some(p.pid) != supervisor_pid)
        .filter(|p| signature.is_match(&p.command))
        .collect();
    Ok(orphans)
}

pub struct Reconciler<'a> {
    inspector: &'a dyn ProcessInspector,
    signature: &'a Regex,
    grace: Duration,
}

impl<'a> Reconciler<'a> {
    pub fn new(inspector: &'a dyn ProcessInspector, signature: &'a Regex) -> Self {
        Self {
            inspector,
            signature,
            grace: ORPHAN_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// SIGTERM every orphan, wait out the grace period, SIGKILL survivors.
    ///
    /// Every reaped process is reported with a warning. Returns what was reaped.
    pub fn kill_orphans(&self, supervisor_pid: Option<u32>) -> Result<Vec<ProcessInfo>> {
        let orphans = find_orphans(self.inspector, self.signature, supervisor_pid)?;
        if orphans.is_empty() {
            return Ok(orphans);
        }

        for orphan in &orphans {
            warn!(
                pid = orphan.pid,
                ppid = orphan.ppid,
                command = %orphan.command,
                "terminating unmanaged instance"
            );
            if let Err(err) = self.inspector.signal(orphan.pid, Signal::Terminate) {
                warn!(pid = orphan.pid, error = %err, "SIGTERM failed");
            }
        }

        if !self.grace.is_zero() {
            thread::sleep(self.grace);
        }

        for orphan in &orphans {
            if !self.inspector.is_alive(orphan.pid) {
                continue;
            }
            warn!(pid = orphan.pid, "unmanaged instance ignored SIGTERM; sending SIGKILL");
            if let Err(err) = self.inspector.signal(orphan.pid, Signal::Kill) {
                warn!(pid = orphan.pid, error = %err, "SIGKILL failed");
            }
        }

        Ok(orphans)
    }
}

/// Human-readable orphan report for `status`.
pub fn describe(orphans: &[ProcessInfo]) -> Vec<String> {
    orphans
        .iter()
        .map(|p| format!("  [PID {}, parent {}] {}", p.pid, p.ppid, p.command))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::fake::FakeInspector;

    fn signature() -> Regex {
        Regex::new(r"(^|[\s/])gatewayd\s+run(\s|$)").expect("regex")
    }

    #[test]
    fn child_of_supervisor_is_never_an_orphan() {
        let inspector = FakeInspector::default();
        inspector.spawn(100, 1, "shepherd supervise");
        inspector.spawn(101, 100, "/usr/bin/gatewayd run");
        inspector.spawn(200, 1, "gatewayd run --port 5002");
        inspector.spawn(300, 42, "gatewayd status");

        let orphans = find_orphans(&inspector, &signature(), Some(100)).expect("find");
        let pids: Vec<u32> = orphans.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![200]);
    }

    #[test]
    fn without_live_supervisor_every_match_is_an_orphan() {
        let inspector = FakeInspector::default();
        inspector.spawn(101, 100, "gatewayd run");
        inspector.spawn(200, 1, "gatewayd run");

        let orphans = find_orphans(&inspector, &signature(), None).expect("find");
        assert_eq!(orphans.len(), 2);
    }

    #[test]
    fn kill_escalates_for_stubborn_orphans() {
        let inspector = FakeInspector::default();
        inspector.spawn(200, 1, "gatewayd run");
        inspector.spawn(201, 1, "gatewayd run");
        inspector.make_stubborn(201);

        let sig = signature();
        let reconciler = Reconciler::new(&inspector, &sig).with_grace(Duration::ZERO);
        let reaped = reconciler.kill_orphans(None).expect("kill");

        assert_eq!(reaped.len(), 2);
        assert!(!inspector.is_alive(200));
        assert!(!inspector.is_alive(201));
        let signals = inspector.signals.borrow();
        assert!(signals.contains(&(200, Signal::Terminate)));
        assert!(!signals.contains(&(200, Signal::Kill)));
        assert!(signals.contains(&(201, Signal::Kill)));
    }

    #[test]
    fn nothing_to_reap_sends_no_signals() {
        let inspector = FakeInspector::default();
        inspector.spawn(300, 1, "gatewayd status");
        let sig = signature();
        let reaped = Reconciler::new(&inspector, &sig)
            .with_grace(Duration::ZERO)
            .kill_orphans(None)
            .expect("kill");
        assert!(reaped.is_empty());
        assert!(inspector.signals.borrow().is_empty());
    }
}
