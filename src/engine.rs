//! The supervising loop.
//!
//! Runs inside the detached `shepherd supervise` process and owns the managed
//! child for its whole life: rotate, launch, wait, account the exit, then retry
//! after a delay or give up once the crash-loop budget is spent. Shutdown
//! signals are folded into a watch channel that every suspension point selects
//! against, so the child is always stopped before the loop returns.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tokio::{
    process::{Child, Command},
    sync::watch,
};
use tracing::{error, info, warn};

use crate::{
    config::{self, SUPERVISED_ENV, SupervisorConfig},
    log_rotate,
    pid_store::PidStore,
    restart::{Decision, RestartCounter, RestartPolicy},
};

/// How long a forwarded SIGTERM may take before the child is killed.
pub const CHILD_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Starts one instance of the managed process.
pub trait Launcher {
    fn launch(&mut self) -> Result<Child>;
}

impl<L: Launcher + ?Sized> Launcher for &mut L {
    fn launch(&mut self) -> Result<Child> {
        (**self).launch()
    }
}

/// Launches the configured binary with its output appended to the log.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env_file: Option<PathBuf>,
    env: HashMap<String, String>,
    log_path: PathBuf,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>, log_path: &Path) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env_file: None,
            env: HashMap::new(),
            log_path: log_path.to_path_buf(),
        }
    }

    pub fn from_config(cfg: &SupervisorConfig) -> Result<Self> {
        let binary = cfg.binary_name()?;
        let program = if binary.contains('/') || binary.starts_with('~') {
            config::expand_path(binary).display().to_string()
        } else {
            binary.to_string()
        };

        Ok(Self {
            program,
            args: cfg.service.run_args.clone(),
            working_dir: cfg.service.working_dir.as_deref().map(config::expand_path),
            env_file: cfg.service.env_file.as_deref().map(config::expand_path),
            env: cfg.service.env.clone(),
            log_path: cfg.log_path(),
        })
    }
}

impl Launcher for CommandLauncher {
    fn launch(&mut self) -> Result<Child> {
        let stdout = log_rotate::open_append(&self.log_path)?;
        let stderr = stdout
            .try_clone()
            .with_context(|| format!("failed to clone {}", self.log_path.display()))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .env(SUPERVISED_ENV, "1");

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        // Re-read on every launch so edits take effect at the next restart.
        cmd.envs(config::service_env(self.env_file.as_deref(), &self.env)?);

        cmd.spawn()
            .with_context(|| format!("failed to start {}", self.program))
    }
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Crash-loop budget exhausted.
    GivenUp { attempts: u32 },
    /// A shutdown signal stopped the loop (and its child).
    Shutdown,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::GivenUp { .. } => 1,
            Outcome::Shutdown => 0,
        }
    }
}

pub struct Engine<L> {
    launcher: L,
    counter: RestartCounter,
    policy: RestartPolicy,
    pid_store: PidStore,
    log_path: PathBuf,
    log_max_bytes: u64,
    child_stop_timeout: Duration,
}

impl<L: Launcher> Engine<L> {
    pub fn new(launcher: L, policy: RestartPolicy, pid_store: PidStore, log_path: &Path) -> Self {
        Self {
            launcher,
            counter: RestartCounter::new(policy),
            policy,
            pid_store,
            log_path: log_path.to_path_buf(),
            log_max_bytes: 0,
            child_stop_timeout: CHILD_STOP_TIMEOUT,
        }
    }

    pub fn with_log_max_bytes(mut self, max_bytes: u64) -> Self {
        self.log_max_bytes = max_bytes;
        self
    }

    pub fn with_child_stop_timeout(mut self, timeout: Duration) -> Self {
        self.child_stop_timeout = timeout;
        self
    }

    /// Run until the budget is exhausted or `shutdown` flips to true.
    ///
    /// The PID store entry is removed on every way out.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Outcome {
        let outcome = self.supervise(&mut shutdown).await;
        if let Err(err) = self.pid_store.clear() {
            warn!(error = %err, "failed to remove pid file");
        }
        match outcome {
            Outcome::GivenUp { attempts } => error!(
                attempts,
                window_secs = self.policy.window.as_secs(),
                "managed process crashed {} times within the restart window; giving up (run `shepherd start` to try again)",
                attempts
            ),
            Outcome::Shutdown => info!("supervisor stopped"),
        }
        outcome
    }

    async fn supervise(&mut self, shutdown: &mut watch::Receiver<bool>) -> Outcome {
        loop {
            if *shutdown.borrow() {
                return Outcome::Shutdown;
            }

            match log_rotate::rotate_if_needed(&self.log_path, self.log_max_bytes) {
                Ok(true) => info!(path = %self.log_path.display(), "log rotated"),
                Ok(false) => {}
                Err(err) => warn!(error = %err, "log rotation failed"),
            }

            let started = Instant::now();
            match self.launcher.launch() {
                Ok(mut child) => {
                    let pid = child.id();
                    info!(pid, "managed process started");
                    tokio::select! {
                        status = child.wait() => log_exit(pid, status, started.elapsed()),
                        _ = cancelled(shutdown) => {
                            self.stop_child(&mut child).await;
                            return Outcome::Shutdown;
                        }
                    }
                }
                Err(err) => error!("launch failed: {:#}", err),
            }

            match self.counter.record_exit(started.elapsed()) {
                Decision::GiveUp { attempts } => return Outcome::GivenUp { attempts },
                Decision::Retry { attempt, delay } => {
                    warn!(
                        attempt,
                        max_restarts = self.policy.max_restarts,
                        delay_secs = delay.as_secs(),
                        "restarting managed process"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancelled(shutdown) => return Outcome::Shutdown,
                    }
                }
            }
        }
    }

    /// Forward SIGTERM, wait up to the stop timeout, then SIGKILL.
    async fn stop_child(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            return;
        };
        info!(pid, "forwarding SIGTERM to managed process");
        if let Err(err) = terminate(pid) {
            warn!(pid, error = %err, "SIGTERM failed");
        }
        match tokio::time::timeout(self.child_stop_timeout, child.wait()).await {
            Ok(status) => {
                log_exit(Some(pid), status, Duration::ZERO);
            }
            Err(_) => {
                warn!(
                    pid,
                    timeout_secs = self.child_stop_timeout.as_secs(),
                    "managed process ignored SIGTERM; killing"
                );
                if let Err(err) = child.kill().await {
                    warn!(pid, error = %err, "SIGKILL failed");
                }
            }
        }
    }
}

/// Resolves once shutdown was requested. A dropped sender never resolves.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn log_exit(pid: Option<u32>, status: std::io::Result<ExitStatus>, uptime: Duration) {
    match status {
        Ok(status) if status.success() => {
            info!(pid, uptime_secs = uptime.as_secs(), "managed process exited cleanly")
        }
        Ok(status) => warn!(
            pid,
            uptime_secs = uptime.as_secs(),
            "managed process exited: {}",
            status
        ),
        Err(err) => error!(pid, error = %err, "failed to wait for managed process"),
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> std::io::Result<()> {
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are only supported on unix platforms",
    ))
}

/// Completes when the supervisor receives SIGTERM, SIGINT, SIGHUP or SIGQUIT.
#[cfg(unix)]
pub struct ShutdownSignals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    /// Must be called inside a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
            _ = self.hup.recv() => "SIGHUP",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}

#[cfg(not(unix))]
pub struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> &'static str {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}

/// Entry point of `shepherd supervise`. Returns the process exit code.
pub fn run_supervisor(cfg: &SupervisorConfig) -> Result<i32> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(async {
        let mut signals = ShutdownSignals::install().context("failed to install signal handlers")?;
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            let name = signals.recv().await;
            info!(signal = name, "shutdown requested");
            let _ = tx.send(true);
        });

        info!(
            pid = std::process::id(),
            max_restarts = cfg.max_restarts,
            restart_delay_secs = cfg.restart_delay.as_secs(),
            restart_window_secs = cfg.restart_window.as_secs(),
            "supervisor running"
        );

        let engine = Engine::new(
            CommandLauncher::from_config(cfg)?,
            RestartPolicy::from_config(cfg),
            PidStore::new(cfg.pid_path()),
            &cfg.log_path(),
        )
        .with_log_max_bytes(cfg.log_max_bytes);

        Ok(engine.run(rx).await.exit_code())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
    }

    fn policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            delay: Duration::ZERO,
            window: Duration::from_secs(300),
        }
    }

    fn sh(script: &str, log: &Path) -> CommandLauncher {
        CommandLauncher::new("sh", vec!["-c".to_string(), script.to_string()], log)
    }

    #[test]
    fn rapid_exits_end_in_given_up_with_pid_cleared() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("shepherd.log");
        let pid_store = PidStore::new(dir.path().join("shepherd.pid"));
        pid_store.write(std::process::id()).expect("seed pid");

        let engine = Engine::new(
            sh("echo launched; exit 3", &log),
            policy(3),
            pid_store.clone(),
            &log,
        );
        let (_tx, rx) = watch::channel(false);
        let outcome = runtime().block_on(engine.run(rx));

        assert_eq!(outcome, Outcome::GivenUp { attempts: 3 });
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(pid_store.read().expect("read"), None);
        let contents = fs::read_to_string(&log).expect("read log");
        assert_eq!(contents.matches("launched").count(), 3);
    }

    struct FailingLauncher {
        attempts: u32,
    }

    impl Launcher for FailingLauncher {
        fn launch(&mut self) -> Result<Child> {
            self.attempts += 1;
            anyhow::bail!("binary 'missing' not found")
        }
    }

    #[test]
    fn launch_failures_count_toward_budget() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("shepherd.log");
        let mut launcher = FailingLauncher { attempts: 0 };
        let engine = Engine::new(
            &mut launcher,
            policy(4),
            PidStore::new(dir.path().join("shepherd.pid")),
            &log,
        );
        let (_tx, rx) = watch::channel(false);
        let outcome = runtime().block_on(engine.run(rx));
        assert_eq!(outcome, Outcome::GivenUp { attempts: 4 });
        assert_eq!(launcher.attempts, 4);
    }

    #[test]
    fn shutdown_stops_running_child() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("shepherd.log");
        let pid_store = PidStore::new(dir.path().join("shepherd.pid"));
        pid_store.write(std::process::id()).expect("seed pid");

        let engine = Engine::new(
            CommandLauncher::new("sleep", vec!["30".to_string()], &log),
            policy(3),
            pid_store.clone(),
            &log,
        )
        .with_child_stop_timeout(Duration::from_secs(5));

        let started = Instant::now();
        let outcome = runtime().block_on(async {
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = tx.send(true);
            });
            engine.run(rx).await
        });

        assert_eq!(outcome, Outcome::Shutdown);
        assert_eq!(outcome.exit_code(), 0);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(pid_store.read().expect("read"), None);
    }

    #[test]
    fn shutdown_interrupts_restart_delay() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("shepherd.log");
        let slow = RestartPolicy {
            max_restarts: 5,
            delay: Duration::from_secs(60),
            window: Duration::from_secs(300),
        };
        let engine = Engine::new(
            sh("exit 1", &log),
            slow,
            PidStore::new(dir.path().join("shepherd.pid")),
            &log,
        );

        let started = Instant::now();
        let outcome = runtime().block_on(async {
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let _ = tx.send(true);
            });
            engine.run(rx).await
        });
        assert_eq!(outcome, Outcome::Shutdown);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn log_rotates_between_attempts() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("shepherd.log");
        let engine = Engine::new(
            sh("echo 0123456789; exit 1", &log),
            policy(2),
            PidStore::new(dir.path().join("shepherd.pid")),
            &log,
        )
        .with_log_max_bytes(5);

        let (_tx, rx) = watch::channel(false);
        runtime().block_on(engine.run(rx));

        let backup = log_rotate::rotated_path(&log);
        assert_eq!(fs::read_to_string(&backup).expect("backup"), "0123456789\n");
        assert_eq!(fs::read_to_string(&log).expect("current"), "0123456789\n");
    }

    #[test]
    fn child_sees_supervised_marker_and_env() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("shepherd.log");
        let env_file = dir.path().join("service.env");
        fs::write(&env_file, "GREETING=\"hello there\"\n").expect("write env");

        let mut launcher = sh("echo \"$SHEPHERD_SUPERVISED:$GREETING:$EXTRA\"", &log);
        launcher.env_file = Some(env_file);
        launcher.env = HashMap::from([("EXTRA".to_string(), "x".to_string())]);

        let engine = Engine::new(
            launcher,
            policy(1),
            PidStore::new(dir.path().join("shepherd.pid")),
            &log,
        );
        let (_tx, rx) = watch::channel(false);
        runtime().block_on(engine.run(rx));

        assert_eq!(
            fs::read_to_string(&log).expect("log"),
            "1:hello there:x\n"
        );
    }
}
