use clap::{Args, Parser, Subcommand};

/// Command line interface for the shepherd supervisor.
#[derive(Parser, Debug)]
#[command(
    name = "shepherd",
    version,
    about = "Keep exactly one instance of a long-running service alive",
    subcommand_required = false,
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Check prerequisites, run installer commands, then start (default).",
        long_about = "Verifies the files and environment variables listed under [setup], prints every setting that fell back to a default, runs the configured installer commands in order, and finally performs `start`."
    )]
    Setup,
    #[command(
        about = "Start the background supervisor if it is not already running.",
        long_about = "Kills unmanaged instances of the service, rotates the log if needed, and launches the supervising loop in its own process group. Does nothing when a live supervisor is already recorded."
    )]
    Start,
    #[command(
        about = "Stop the supervisor and the service it manages.",
        long_about = "Sends SIGTERM to the supervisor, escalates to SIGKILL on its process group after the stop timeout, clears the PID file, and reaps any unmanaged instances left behind."
    )]
    Stop,
    #[command(about = "Stop, pause briefly, then start again.")]
    Restart,
    #[command(
        about = "Show whether the supervisor is running.",
        long_about = "Reports the supervisor pid and uptime, the service's own status output, and any unmanaged instances. Never changes anything."
    )]
    Status,
    #[command(about = "Print the supervisor log and follow new output.")]
    Logs(LogsOpts),
    #[command(
        about = "Run the managed binary, refusing its run command outside the supervisor.",
        long_about = "Used by the shell function printed by `shepherd shim`. Any invocation except the configured run arguments is passed through unchanged."
    )]
    Exec(ExecOpts),
    #[command(about = "Print a shell function that guards the managed binary.")]
    Shim,
    /// Runs the supervising loop in the foreground. Spawned by `start`.
    #[command(hide = true)]
    Supervise,
}

#[derive(Args, Debug, Clone)]
pub struct LogsOpts {
    /// Number of trailing lines to print first.
    #[arg(short = 'n', long, default_value_t = 50)]
    pub lines: usize,
    /// Print the tail and exit instead of following.
    #[arg(long)]
    pub no_follow: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ExecOpts {
    /// Arguments passed to the managed binary.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}
