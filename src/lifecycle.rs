//! Lifecycle commands: start, stop, restart, status and logs.
//!
//! Mutating commands run under the exclusive lock and talk to the supervising
//! loop only through the PID file and signals.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::{
    cli::LogsOpts,
    config::{CONFIG_ENV, SupervisorConfig},
    inspector::{ProcessInfo, ProcessInspector, Signal, SystemInspector},
    lock::LockHandle,
    log_rotate,
    orphans::{self, ORPHAN_GRACE, Reconciler},
    pid_store::{PidStore, SupervisorState, now_ms},
};

const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const FOLLOW_POLL_MS: u64 = 400;
const TAIL_MAX_BYTES: u64 = 1024 * 1024;

/// Launches the detached supervising loop and returns its pid.
pub trait Spawner {
    fn spawn_supervisor(&self, cfg: &SupervisorConfig) -> Result<u32>;
}

/// Re-executes the current binary as `shepherd supervise` in its own process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSpawner;

/// The detached loop gets no stdio: an inherited log descriptor would keep
/// pointing at `<log>.1` after the first rotation. It writes through
/// `init_file_tracing` instead.
fn supervisor_command(exe: &Path, cfg: &SupervisorConfig) -> Command {
    let mut cmd = Command::new(exe);
    cmd.arg("supervise")
        .env(CONFIG_ENV, &cfg.config_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

impl Spawner for DetachedSpawner {
    fn spawn_supervisor(&self, cfg: &SupervisorConfig) -> Result<u32> {
        let exe = std::env::current_exe().context("failed to resolve shepherd binary")?;
        let log_path = cfg.log_path();

        let mut child = supervisor_command(&exe, cfg)
            .spawn()
            .context("failed to start supervisor")?;
        let pid = child.id();

        // Give the loop a moment to fail on bad config before reporting success.
        thread::sleep(Duration::from_millis(300));
        if let Some(status) = child.try_wait()? {
            anyhow::bail!(
                "supervisor exited immediately ({}); see {}",
                status,
                log_path.display()
            );
        }
        Ok(pid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartReport {
    AlreadyRunning {
        pid: u32,
    },
    Started {
        pid: u32,
        log_path: PathBuf,
        reaped: Vec<ProcessInfo>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Supervisor pid that was stopped, if one was running.
    pub stopped: Option<u32>,
    /// Whether SIGKILL was needed.
    pub forced: bool,
    pub reaped: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: Option<SupervisorState>,
    pub orphans: Vec<ProcessInfo>,
    /// Output of the managed binary's own status command, when running.
    pub delegated: Option<Result<String, String>>,
}

pub struct Controller<'a> {
    cfg: &'a SupervisorConfig,
    inspector: &'a dyn ProcessInspector,
    spawner: &'a dyn Spawner,
    pid_store: PidStore,
    poll_interval: Duration,
    orphan_grace: Duration,
}

impl<'a> Controller<'a> {
    pub fn new(
        cfg: &'a SupervisorConfig,
        inspector: &'a dyn ProcessInspector,
        spawner: &'a dyn Spawner,
    ) -> Self {
        Self {
            cfg,
            inspector,
            spawner,
            pid_store: PidStore::new(cfg.pid_path()),
            poll_interval: STOP_POLL_INTERVAL,
            orphan_grace: ORPHAN_GRACE,
        }
    }

    pub fn with_timing(mut self, poll_interval: Duration, orphan_grace: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.orphan_grace = orphan_grace;
        self
    }

    pub fn pid_store(&self) -> &PidStore {
        &self.pid_store
    }

    fn lock(&self) -> Result<LockHandle> {
        self.cfg.ensure_state_dir()?;
        Ok(LockHandle::acquire(&self.cfg.lock_path())?)
    }

    pub fn start(&self) -> Result<StartReport> {
        let _lock = self.lock()?;
        self.start_locked()
    }

    pub fn stop(&self) -> Result<StopReport> {
        let _lock = self.lock()?;
        self.stop_locked()
    }

    /// Stop, pause, start, all under one lock acquisition so no other
    /// lifecycle command can slip in between the halves.
    pub fn restart(&self, pause: Duration) -> Result<(StopReport, StartReport)> {
        let _lock = self.lock()?;
        let stopped = self.stop_locked()?;
        if !pause.is_zero() {
            thread::sleep(pause);
        }
        let started = self.start_locked()?;
        Ok((stopped, started))
    }

    fn start_locked(&self) -> Result<StartReport> {
        if let Some(state) = self.pid_store.live(self.inspector)? {
            return Ok(StartReport::AlreadyRunning { pid: state.pid });
        }

        let signature = self.cfg.run_signature()?;
        let reaped = Reconciler::new(self.inspector, &signature)
            .with_grace(self.orphan_grace)
            .kill_orphans(None)?;

        let log_path = self.cfg.log_path();
        log_rotate::rotate_if_needed(&log_path, self.cfg.log_max_bytes)?;

        let pid = self.spawner.spawn_supervisor(self.cfg)?;
        if let Err(err) = self.pid_store.write(pid) {
            // An unrecorded supervisor is invisible to every later command.
            warn!(pid, "could not record supervisor pid; killing it");
            if let Err(kill_err) = self.inspector.signal_group(pid, Signal::Kill) {
                warn!(pid, error = %kill_err, "SIGKILL to unrecorded supervisor failed");
            }
            return Err(err.context("failed to record supervisor pid"));
        }
        debug!(pid, "supervisor recorded");

        Ok(StartReport::Started {
            pid,
            log_path,
            reaped,
        })
    }

    fn stop_locked(&self) -> Result<StopReport> {
        let Some(state) = self.pid_store.live(self.inspector)? else {
            let reaped = self.reap_orphans()?;
            return Ok(StopReport {
                stopped: None,
                forced: false,
                reaped,
            });
        };
        let pid = state.pid;

        if let Err(err) = self.inspector.signal(pid, Signal::Terminate) {
            warn!(pid, error = %err, "SIGTERM to supervisor failed");
        }

        let polls = self.cfg.stop_timeout.as_secs().max(1);
        let mut exited = false;
        for _ in 0..polls {
            if !self.poll_interval.is_zero() {
                thread::sleep(self.poll_interval);
            }
            if !self.inspector.is_alive(pid) {
                exited = true;
                break;
            }
        }

        let forced = !exited;
        if forced {
            warn!(
                pid,
                timeout_secs = polls,
                "supervisor did not exit after SIGTERM; sending SIGKILL"
            );
            if let Err(err) = self.inspector.signal_group(pid, Signal::Kill) {
                warn!(pid, error = %err, "SIGKILL to supervisor process group failed");
            }
            if self.inspector.is_alive(pid) {
                if let Err(err) = self.inspector.signal(pid, Signal::Kill) {
                    warn!(pid, error = %err, "SIGKILL to supervisor failed");
                }
            }
        }

        self.pid_store.clear()?;
        let reaped = self.reap_orphans()?;

        Ok(StopReport {
            stopped: Some(pid),
            forced,
            reaped,
        })
    }

    /// Kill run instances nobody supervises. Liveness is rechecked right here.
    fn reap_orphans(&self) -> Result<Vec<ProcessInfo>> {
        let signature = match self.cfg.run_signature() {
            Ok(signature) => signature,
            Err(err) => {
                warn!("skipping orphan cleanup: {:#}", err);
                return Ok(Vec::new());
            }
        };
        let live = self.pid_store.live(self.inspector)?.map(|s| s.pid);
        Reconciler::new(self.inspector, &signature)
            .with_grace(self.orphan_grace)
            .kill_orphans(live)
    }

    /// Read-only report. Orphans are listed, never killed.
    pub fn status(&self) -> Result<StatusReport> {
        let state = self.pid_store.live(self.inspector)?;
        let orphans = match self.cfg.run_signature() {
            Ok(signature) => {
                orphans::find_orphans(self.inspector, &signature, state.map(|s| s.pid))?
            }
            Err(err) => {
                warn!("skipping orphan check: {:#}", err);
                Vec::new()
            }
        };
        let delegated = state
            .is_some()
            .then(|| self.query_service_status().map_err(|err| format!("{:#}", err)));

        Ok(StatusReport {
            state,
            orphans,
            delegated,
        })
    }

    fn query_service_status(&self) -> Result<String> {
        let binary = self.cfg.binary_path()?;
        let mut child = Command::new(&binary)
            .args(&self.cfg.service.status_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run {}", binary.display()))?;

        // Drain both pipes while polling so a chatty command never blocks on a full pipe.
        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());

        let deadline = Instant::now() + STATUS_TIMEOUT;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!(
                    "status command did not finish within {}s",
                    STATUS_TIMEOUT.as_secs()
                );
            }
            thread::sleep(Duration::from_millis(100));
        };

        let stdout = collect_pipe(stdout);
        let stderr = collect_pipe(stderr);
        if !status.success() {
            anyhow::bail!("status command exited with {}: {}", status, stderr.trim());
        }
        let text = stdout.trim_end();
        if text.is_empty() {
            return Ok(stderr.trim_end().to_string());
        }
        Ok(text.to_string())
    }
}

fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn collect_pipe(handle: thread::JoinHandle<Vec<u8>>) -> String {
    let bytes = handle.join().unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn run_start(controller: &Controller) -> Result<()> {
    print_start(&controller.start()?);
    Ok(())
}

pub fn run_stop(controller: &Controller) -> Result<()> {
    print_stop(&controller.stop()?);
    Ok(())
}

pub fn run_restart(controller: &Controller, pause: Duration) -> Result<()> {
    let (stopped, started) = controller.restart(pause)?;
    print_stop(&stopped);
    print_start(&started);
    Ok(())
}

pub fn run_status(controller: &Controller) -> Result<()> {
    let report = controller.status()?;
    match report.state {
        Some(state) => {
            print!("✓ shepherd running [PID {}]", state.pid);
            if state.started_at > 0 {
                print!(" - up {}", format_runtime(state.started_at));
                if let Some(started) = format_started(state.started_at) {
                    print!(" (since {})", started);
                }
            }
            println!();
        }
        None => println!("✗ shepherd not running"),
    }

    match &report.delegated {
        Some(Ok(text)) if !text.is_empty() => {
            println!();
            for line in text.lines() {
                println!("  {}", line);
            }
        }
        Some(Err(err)) => eprintln!("WARN service status unavailable: {}", err),
        _ => {}
    }

    if !report.orphans.is_empty() {
        println!();
        println!(
            "⚠ {} unmanaged instance(s) running outside shepherd:",
            report.orphans.len()
        );
        for line in orphans::describe(&report.orphans) {
            println!("{}", line);
        }
        println!("  Run `shepherd stop` or `shepherd restart` to clean them up.");
    }
    Ok(())
}

fn print_start(report: &StartReport) {
    match report {
        StartReport::AlreadyRunning { pid } => {
            println!("✓ shepherd already running [PID {}]", pid);
        }
        StartReport::Started {
            pid,
            log_path,
            reaped,
        } => {
            if !reaped.is_empty() {
                println!("Killed {} unmanaged instance(s) before starting.", reaped.len());
            }
            println!("✓ shepherd started [PID {}]", pid);
            println!("  Logs: {}", log_path.display());
        }
    }
}

fn print_stop(report: &StopReport) {
    match report.stopped {
        Some(pid) if report.forced => println!("✓ shepherd killed [PID {}] (did not exit after SIGTERM)", pid),
        Some(pid) => println!("✓ shepherd stopped [PID {}]", pid),
        None => println!("✓ shepherd was not running"),
    }
    if !report.reaped.is_empty() {
        println!("Killed {} unmanaged instance(s).", report.reaped.len());
    }
}

fn format_runtime(started_at: u128) -> String {
    let elapsed_secs = (now_ms().saturating_sub(started_at) / 1000) as u64;

    if elapsed_secs < 60 {
        format!("{}s", elapsed_secs)
    } else if elapsed_secs < 3600 {
        format!("{}m {}s", elapsed_secs / 60, elapsed_secs % 60)
    } else if elapsed_secs < 86400 {
        format!("{}h {}m", elapsed_secs / 3600, (elapsed_secs % 3600) / 60)
    } else {
        format!("{}d {}h", elapsed_secs / 86400, (elapsed_secs % 86400) / 3600)
    }
}

fn format_started(started_at: u128) -> Option<String> {
    let millis = i64::try_from(started_at).ok()?;
    let utc = chrono::DateTime::from_timestamp_millis(millis)?;
    Some(
        utc.with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    )
}

/// `shepherd logs`: print the tail, then keep streaming appended lines.
pub fn run_logs(cfg: &SupervisorConfig, opts: &LogsOpts) -> Result<()> {
    let path = cfg.log_path();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if !path.exists() {
        if opts.no_follow {
            println!("No log yet at {}", path.display());
            return Ok(());
        }
        eprintln!("Waiting for {} (Ctrl+C to stop)...", path.display());
    }

    let mut pos = print_tail(&path, opts.lines, &mut out)?;
    if opts.no_follow {
        return Ok(());
    }

    loop {
        thread::sleep(Duration::from_millis(FOLLOW_POLL_MS));
        pos = print_new_lines(&path, pos, &mut out)?;
    }
}

/// Print the last `lines` lines of `path`; returns the offset to follow from.
fn print_tail(path: &Path, lines: usize, out: &mut impl Write) -> Result<u64> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("failed to open {}", path.display())),
    };
    let len = file.metadata()?.len();
    if len > TAIL_MAX_BYTES {
        file.seek(SeekFrom::End(-(TAIL_MAX_BYTES as i64)))?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let text = String::from_utf8_lossy(&buf);
    let all: Vec<&str> = text.lines().collect();
    let skip = all.len().saturating_sub(lines);
    for line in &all[skip..] {
        writeln!(out, "{}", line)?;
    }
    out.flush()?;
    Ok(len)
}

/// Print whatever was appended since `pos`. A shrunken file means it was
/// rotated, so reading restarts from the top of the fresh file.
fn print_new_lines(path: &Path, mut pos: u64, out: &mut impl Write) -> Result<u64> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("failed to open {}", path.display())),
    };
    let len = file.metadata()?.len();
    if len < pos {
        pos = 0;
    }
    if len == pos {
        return Ok(pos);
    }

    let mut reader = BufReader::new(file);
    reader
        .seek(SeekFrom::Start(pos))
        .with_context(|| format!("failed to seek {}", path.display()))?;
    let mut buf = String::new();
    while reader.read_line(&mut buf)? != 0 {
        if !buf.ends_with('\n') {
            // Partial line still being written; pick it up next poll.
            break;
        }
        pos += buf.len() as u64;
        write!(out, "{}", buf)?;
        buf.clear();
    }
    out.flush()?;
    Ok(pos)
}

/// Build a controller over the real process table.
pub fn system_controller<'a>(cfg: &'a SupervisorConfig) -> Controller<'a> {
    Controller::new(cfg, &SystemInspector, &DetachedSpawner)
}
