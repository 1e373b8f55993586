//! `shepherd setup`: verify prerequisites, run installer commands, start.

use std::process::Command;

use anyhow::{Context, Result, bail};

use crate::{
    config::{Fallback, SetupConfig, SupervisorConfig, expand_path},
    lifecycle::{self, Controller},
};

pub fn run(cfg: &SupervisorConfig, controller: &Controller) -> Result<()> {
    check_prerequisites(&cfg.setup, |key| std::env::var_os(key).is_some())?;
    cfg.binary_name()?;

    for line in describe_fallbacks(&cfg.fallbacks) {
        eprintln!("{}", line);
    }

    for command in &cfg.setup.commands {
        run_setup_command(command)?;
    }

    lifecycle::run_start(controller)
}

/// Fail on the first missing file or variable, before anything is run.
pub fn check_prerequisites(setup: &SetupConfig, env_present: impl Fn(&str) -> bool) -> Result<()> {
    for raw in &setup.required_files {
        let path = expand_path(raw);
        if !path.exists() {
            bail!(
                "required file {} is missing (setup.required_files)",
                path.display()
            );
        }
    }
    for key in &setup.required_env {
        if !env_present(key) {
            bail!("required environment variable {} is not set (setup.required_env)", key);
        }
    }
    Ok(())
}

/// One warning line per setting that is running on a fallback value.
pub fn describe_fallbacks(fallbacks: &[Fallback]) -> Vec<String> {
    fallbacks
        .iter()
        .map(|f| format!("WARN {} = {} ({})", f.setting, f.effective, f.reason))
        .collect()
}

fn run_setup_command(command: &str) -> Result<()> {
    let parts = shell_words::split(command)
        .with_context(|| format!("failed to parse setup command: {}", command))?;
    let Some((program, args)) = parts.split_first() else {
        return Ok(());
    };

    println!("▶ {}", command);
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to run {}", program))?;
    if !status.success() {
        bail!("setup command `{}` failed with {}", command, status);
    }
    Ok(())
}
