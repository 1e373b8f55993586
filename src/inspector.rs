//! Process enumeration and signalling.
//!
//! Everything platform-specific about processes lives behind [`ProcessInspector`]
//! so the reconciler, PID store and lifecycle commands can run against a fake.

use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};

/// One entry of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

pub trait ProcessInspector {
    /// Snapshot of every process visible to the current user.
    fn list(&self) -> Result<Vec<ProcessInfo>>;
    /// Whether a process with this id currently exists.
    fn is_alive(&self, pid: u32) -> bool;
    fn signal(&self, pid: u32, signal: Signal) -> Result<()>;
    /// Signal every member of the process group led by `pgid`.
    fn signal_group(&self, pgid: u32, signal: Signal) -> Result<()>;
}

/// The real process table, via `ps` and `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInspector;

impl ProcessInspector for SystemInspector {
    fn list(&self) -> Result<Vec<ProcessInfo>> {
        let output = Command::new("ps")
            .args(["-axww", "-o", "pid=,ppid=,args="])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .context("failed to run ps")?;
        if !output.status.success() {
            bail!(
                "ps exited with status {}",
                output.status.code().unwrap_or(-1)
            );
        }
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn is_alive(&self, pid: u32) -> bool {
        process_alive(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        send_signal(pid as i32, signal)
            .with_context(|| format!("failed to send {:?} to pid {}", signal, pid))
    }

    fn signal_group(&self, pgid: u32, signal: Signal) -> Result<()> {
        send_signal(-(pgid as i32), signal)
            .with_context(|| format!("failed to send {:?} to process group {}", signal, pgid))
    }
}

/// Parse `ps -o pid=,ppid=,args=` output; malformed lines are skipped.
pub fn parse_ps_output(raw: &str) -> Vec<ProcessInfo> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.trim_start().splitn(2, char::is_whitespace);
            let pid = parts.next()?.parse().ok()?;
            let rest = parts.next()?.trim_start();
            let mut parts = rest.splitn(2, char::is_whitespace);
            let ppid = parts.next()?.parse().ok()?;
            let command = parts.next().unwrap_or("").trim().to_string();
            Some(ProcessInfo { pid, ppid, command })
        })
        .collect()
}

/// Check if a process is alive.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_signal(target: i32, signal: Signal) -> std::io::Result<()> {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let result = unsafe { libc::kill(target as libc::pid_t, signo) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_signal(_target: i32, _signal: Signal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are only supported on unix platforms",
    ))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ps_lines() {
        let raw = "    1     0 /sbin/init\n  812     1 gatewayd gateway run --port 5002\n  913   812 \n garbage line\n";
        let procs = parse_ps_output(raw);
        assert_eq!(procs.len(), 3);
        assert_eq!(
            procs[1],
            ProcessInfo {
                pid: 812,
                ppid: 1,
                command: "gatewayd gateway run --port 5002".to_string(),
            }
        );
        assert_eq!(procs[2].command, "");
    }

    #[test]
    fn current_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
    }
}
