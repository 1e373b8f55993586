use anyhow::Result;
use clap::Parser;
use shepherd::{
    cli::{Cli, Commands},
    config::SupervisorConfig,
    engine, guard, init_file_tracing, init_tracing, lifecycle, setup,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let supervise = matches!(cli.command, Some(Commands::Supervise));
    if !supervise {
        init_tracing();
    }

    let cfg = SupervisorConfig::load()?;
    let controller = lifecycle::system_controller(&cfg);

    match cli.command {
        Some(Commands::Setup) | None => {
            setup::run(&cfg, &controller)?;
        }
        Some(Commands::Start) => {
            lifecycle::run_start(&controller)?;
        }
        Some(Commands::Stop) => {
            lifecycle::run_stop(&controller)?;
        }
        Some(Commands::Restart) => {
            lifecycle::run_restart(&controller, cfg.restart_pause)?;
        }
        Some(Commands::Status) => {
            lifecycle::run_status(&controller)?;
        }
        Some(Commands::Logs(opts)) => {
            lifecycle::run_logs(&cfg, &opts)?;
        }
        Some(Commands::Exec(opts)) => {
            let code = guard::exec(&cfg, &opts.args)?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Some(Commands::Shim) => {
            guard::print_shim(&cfg)?;
        }
        Some(Commands::Supervise) => {
            // Stdio is /dev/null here; everything goes through the log.
            init_file_tracing(&cfg.log_path());
            std::panic::set_hook(Box::new(|info| {
                tracing::error!("supervisor panicked: {}", info);
            }));
            let code = match engine::run_supervisor(&cfg) {
                Ok(code) => code,
                Err(err) => {
                    tracing::error!("supervisor failed: {:#}", err);
                    1
                }
            };
            std::process::exit(code);
        }
    }

    Ok(())
}
