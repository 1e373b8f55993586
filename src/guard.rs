//! Guard against launching the managed service outside the supervisor.
//!
//! `shepherd shim` prints a shell function named after the managed binary that
//! routes every invocation through `shepherd exec --`. Only the run invocation
//! is refused; everything else passes straight through.

use std::process::Command;

use anyhow::{Context, Result};

use crate::config::{SUPERVISED_ENV, SupervisorConfig};

/// Whether `args` contains the configured run arguments as a contiguous run of
/// positional arguments. Flags are ignored so `--verbose run` still matches.
pub fn is_run_invocation(run_args: &[String], args: &[String]) -> bool {
    if run_args.is_empty() {
        return false;
    }
    let positional: Vec<&str> = args
        .iter()
        .map(String::as_str)
        .filter(|a| !a.starts_with('-'))
        .collect();
    positional
        .windows(run_args.len())
        .any(|window| window.iter().zip(run_args).all(|(a, b)| *a == b.as_str()))
}

/// Refusal shown when someone starts the service by hand.
pub fn refusal_message(binary: &str, run_args: &[String]) -> String {
    format!(
        "Refusing to run `{binary} {}` directly: it is managed by shepherd.\n\
         Use `shepherd start`, `shepherd stop`, `shepherd restart` or `shepherd status` instead.",
        run_args.join(" ")
    )
}

/// `shepherd exec -- ARGS`: run the managed binary unless this is an
/// unsupervised run invocation. Returns the exit code to use.
pub fn exec(cfg: &SupervisorConfig, args: &[String]) -> Result<i32> {
    let supervised = std::env::var_os(SUPERVISED_ENV).is_some();
    if !supervised && is_run_invocation(&cfg.service.run_args, args) {
        eprintln!(
            "{}",
            refusal_message(cfg.binary_name()?, &cfg.service.run_args)
        );
        return Ok(1);
    }

    let binary = cfg.binary_path()?;
    let mut cmd = Command::new(&binary);
    cmd.args(args);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Only returns on failure.
        let err = cmd.exec();
        Err(err).with_context(|| format!("failed to exec {}", binary.display()))
    }

    #[cfg(not(unix))]
    {
        let status = cmd
            .status()
            .with_context(|| format!("failed to run {}", binary.display()))?;
        Ok(status.code().unwrap_or(1))
    }
}

/// Shell function that shadows the managed binary with the guard.
pub fn shim_script(binary: &str, shepherd_exe: &str) -> String {
    let name = std::path::Path::new(binary)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.to_string());
    let exe = shell_words::quote(shepherd_exe);
    format!(
        "# shepherd guard for {name}: add to ~/.bashrc or ~/.zshrc\n\
         {name}() {{\n    {exe} exec -- \"$@\"\n}}\n"
    )
}

pub fn print_shim(cfg: &SupervisorConfig) -> Result<()> {
    let binary = cfg.binary_name()?;
    let exe = std::env::current_exe().context("failed to resolve shepherd binary")?;
    print!("{}", shim_script(binary, &exe.to_string_lossy()));
    Ok(())
}
