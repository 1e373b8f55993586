//! Supervisor configuration.
//!
//! Settings come from `~/.config/shepherd/shepherd.toml` (or `$SHEPHERD_CONFIG`),
//! and every scalar can be overridden from the environment. Values that fall back
//! to a default are recorded so `setup` can show the effective configuration
//! instead of silently masking a missing or broken entry.

use std::{
    collections::HashMap,
    fmt::Display,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use shellexpand::tilde;

/// Environment marker set on the managed child so the guard lets it through.
pub const SUPERVISED_ENV: &str = "SHEPHERD_SUPERVISED";
/// Overrides the config file location.
pub const CONFIG_ENV: &str = "SHEPHERD_CONFIG";

const DEFAULT_MAX_RESTARTS: u32 = 10;
const DEFAULT_RESTART_DELAY_SECS: u64 = 5;
const DEFAULT_RESTART_WINDOW_SECS: u64 = 300;
const DEFAULT_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RESTART_PAUSE_SECS: u64 = 2;

/// On-disk shape of shepherd.toml. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    max_restarts: Option<u32>,
    #[serde(default)]
    restart_delay_seconds: Option<u64>,
    #[serde(default)]
    restart_window_seconds: Option<u64>,
    #[serde(default)]
    log_max_bytes: Option<u64>,
    #[serde(default)]
    stop_timeout_seconds: Option<u64>,
    #[serde(default)]
    restart_pause_seconds: Option<u64>,
    #[serde(default)]
    state_dir: Option<String>,
    #[serde(default)]
    service: ServiceConfig,
    #[serde(default)]
    setup: SetupConfig,
}

/// The managed process.
///
/// ```toml
/// [service]
/// binary = "gatewayd"
/// run_args = ["gateway", "run"]
/// status_args = ["gateway", "status"]
/// env_file = "~/.gatewayd/.env"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Binary to execute (a name on PATH or a path).
    #[serde(default)]
    pub binary: Option<String>,
    /// Arguments that make the binary run in the foreground as a service.
    #[serde(default = "default_run_args")]
    pub run_args: Vec<String>,
    /// Arguments for the binary's own status report.
    #[serde(default = "default_status_args")]
    pub status_args: Vec<String>,
    /// Working directory for the managed process.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Extra environment for the managed process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// KEY=VALUE file loaded into the managed process environment.
    #[serde(default)]
    pub env_file: Option<String>,
    /// Regex matched against full command lines to find run instances.
    #[serde(default)]
    pub match_pattern: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            binary: None,
            run_args: default_run_args(),
            status_args: default_status_args(),
            working_dir: None,
            env: HashMap::new(),
            env_file: None,
            match_pattern: None,
        }
    }
}

fn default_run_args() -> Vec<String> {
    vec!["run".to_string()]
}

fn default_status_args() -> Vec<String> {
    vec!["status".to_string()]
}

/// Prerequisites and installer commands run by `shepherd setup`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupConfig {
    /// Files that must exist before the first start (e.g. generated config).
    #[serde(default)]
    pub required_files: Vec<String>,
    /// Environment variables that must be set.
    #[serde(default)]
    pub required_env: Vec<String>,
    /// Commands run in order; each is split like a shell would.
    #[serde(default)]
    pub commands: Vec<String>,
}

/// A setting that did not come from explicit configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallback {
    pub setting: &'static str,
    pub effective: String,
    pub reason: String,
}

/// Fully resolved configuration threaded through every component.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub restart_window: Duration,
    pub log_max_bytes: u64,
    pub stop_timeout: Duration,
    pub restart_pause: Duration,
    pub state_dir: PathBuf,
    pub service: ServiceConfig,
    pub setup: SetupConfig,
    pub config_path: PathBuf,
    pub fallbacks: Vec<Fallback>,
}

impl SupervisorConfig {
    /// Load from the default (or `$SHEPHERD_CONFIG`) path and the process environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| expand_path(&v))
            .unwrap_or_else(default_config_path);
        Self::load_from(&path, |key| std::env::var(key).ok())
    }

    /// Load from `path`, reading overrides through `lookup`.
    pub fn load_from(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut fallbacks = Vec::new();

        let file = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<FileConfig>(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            fallbacks.push(Fallback {
                setting: "config file",
                effective: "built-in defaults".to_string(),
                reason: format!("{} does not exist", path.display()),
            });
            FileConfig::default()
        };

        let max_restarts = resolve_setting(
            "max_restarts",
            "SHEPHERD_MAX_RESTARTS",
            file.max_restarts,
            DEFAULT_MAX_RESTARTS,
            &lookup,
            &mut fallbacks,
        );
        if max_restarts == 0 {
            bail!("max_restarts must be at least 1");
        }
        let restart_delay = resolve_setting(
            "restart_delay_seconds",
            "SHEPHERD_RESTART_DELAY_SECONDS",
            file.restart_delay_seconds,
            DEFAULT_RESTART_DELAY_SECS,
            &lookup,
            &mut fallbacks,
        );
        let restart_window = resolve_setting(
            "restart_window_seconds",
            "SHEPHERD_RESTART_WINDOW_SECONDS",
            file.restart_window_seconds,
            DEFAULT_RESTART_WINDOW_SECS,
            &lookup,
            &mut fallbacks,
        );
        let log_max_bytes = resolve_setting(
            "log_max_bytes",
            "SHEPHERD_LOG_MAX_BYTES",
            file.log_max_bytes,
            DEFAULT_LOG_MAX_BYTES,
            &lookup,
            &mut fallbacks,
        );
        let stop_timeout = resolve_setting(
            "stop_timeout_seconds",
            "SHEPHERD_STOP_TIMEOUT_SECONDS",
            file.stop_timeout_seconds,
            DEFAULT_STOP_TIMEOUT_SECS,
            &lookup,
            &mut fallbacks,
        );
        let restart_pause = resolve_setting(
            "restart_pause_seconds",
            "SHEPHERD_RESTART_PAUSE_SECONDS",
            file.restart_pause_seconds,
            DEFAULT_RESTART_PAUSE_SECS,
            &lookup,
            &mut fallbacks,
        );

        let state_dir = match lookup("SHEPHERD_STATE_DIR")
            .filter(|v| !v.trim().is_empty())
            .or(file.state_dir)
        {
            Some(raw) => expand_path(&raw),
            None => {
                let dir = global_config_dir();
                fallbacks.push(Fallback {
                    setting: "state_dir",
                    effective: dir.display().to_string(),
                    reason: "not configured".to_string(),
                });
                dir
            }
        };

        let mut service = file.service;
        if let Some(binary) = lookup("SHEPHERD_BINARY").filter(|v| !v.trim().is_empty()) {
            service.binary = Some(binary);
        }

        Ok(Self {
            max_restarts,
            restart_delay: Duration::from_secs(restart_delay),
            restart_window: Duration::from_secs(restart_window),
            log_max_bytes,
            stop_timeout: Duration::from_secs(stop_timeout),
            restart_pause: Duration::from_secs(restart_pause),
            state_dir,
            service,
            setup: file.setup,
            config_path: path.to_path_buf(),
            fallbacks,
        })
    }

    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join("shepherd.pid")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("shepherd.lock")
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir.join("shepherd.log")
    }

    pub fn ensure_state_dir(&self) -> Result<&Path> {
        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("failed to create {}", self.state_dir.display()))?;
        Ok(&self.state_dir)
    }

    /// Configured binary name, or a configuration error naming the key.
    pub fn binary_name(&self) -> Result<&str> {
        self.service
            .binary
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "service.binary is not configured (set it in {} or export SHEPHERD_BINARY)",
                    self.config_path.display()
                )
            })
    }

    /// Resolve the managed binary to an executable path.
    pub fn binary_path(&self) -> Result<PathBuf> {
        let name = self.binary_name()?;
        let path = Path::new(name);
        if path.is_absolute() && path.exists() {
            return Ok(path.to_path_buf());
        }

        let expanded = expand_path(name);
        if expanded.components().count() > 1 && expanded.exists() {
            return Ok(expanded);
        }

        which::which(name).with_context(|| format!("binary '{}' not found on PATH", name))
    }

    /// Pattern identifying command lines of the managed "run" invocation.
    pub fn run_signature(&self) -> Result<Regex> {
        if let Some(pattern) = self.service.match_pattern.as_deref() {
            return Regex::new(pattern)
                .with_context(|| format!("invalid service.match_pattern '{}'", pattern));
        }

        let name = self.binary_name()?;
        let base = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());

        let mut parts = vec![regex::escape(&base)];
        parts.extend(self.service.run_args.iter().map(|a| regex::escape(a)));
        let pattern = format!(r"(^|[\s/]){}(\s|$)", parts.join(r"\s+"));
        Regex::new(&pattern).context("failed to build run signature")
    }
}

fn resolve_setting<T>(
    setting: &'static str,
    env_key: &str,
    file_value: Option<T>,
    default: T,
    lookup: &impl Fn(&str) -> Option<String>,
    fallbacks: &mut Vec<Fallback>,
) -> T
where
    T: FromStr + Display + Copy,
{
    let mut rejected = None;
    if let Some(raw) = lookup(env_key) {
        match raw.trim().parse::<T>() {
            Ok(value) => return value,
            Err(_) => rejected = Some(raw),
        }
    }

    let invalid_env = rejected.is_some();
    let (value, reason) = match (file_value, rejected) {
        (Some(value), None) => return value,
        (Some(value), Some(raw)) => (
            value,
            format!("{}={:?} is not a valid value; using config file", env_key, raw),
        ),
        (None, Some(raw)) => (
            default,
            format!("{}={:?} is not a valid value; using default", env_key, raw),
        ),
        (None, None) => (default, "not configured; using default".to_string()),
    };

    if invalid_env {
        tracing::warn!(setting, effective = %value, "{}", reason);
    }
    fallbacks.push(Fallback {
        setting,
        effective: value.to_string(),
        reason,
    });
    value
}

/// Environment for the managed process: `env_file` entries first, then `env`
/// sorted by key, so explicit entries win over the file.
pub fn service_env(
    env_file: Option<&Path>,
    env: &HashMap<String, String>,
) -> Result<Vec<(String, String)>> {
    let mut vars = Vec::new();
    if let Some(path) = env_file {
        vars.extend(load_env_file(path)?);
    }
    let mut extra: Vec<_> = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    extra.sort();
    vars.extend(extra);
    Ok(vars)
}

/// Parse a dotenv-style file of `KEY=VALUE` lines.
pub fn load_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse_env_lines(&contents))
}

fn parse_env_lines(contents: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        vars.push((key.to_string(), value.to_string()));
    }
    vars
}

/// Global config directory: ~/.config/shepherd
pub fn global_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/shepherd")
}

pub fn default_config_path() -> PathBuf {
    global_config_dir().join("shepherd.toml")
}

pub fn expand_path(raw: &str) -> PathBuf {
    let tilde_expanded = tilde(raw).into_owned();
    let env_expanded = match shellexpand::env(&tilde_expanded) {
        Ok(val) => val.into_owned(),
        Err(_) => tilde_expanded,
    };
    PathBuf::from(env_expanded)
}
