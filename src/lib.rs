pub mod cli;
pub mod config;
pub mod engine;
pub mod guard;
pub mod inspector;
pub mod lifecycle;
pub mod lock;
pub mod log_rotate;
pub mod orphans;
pub mod pid_store;
pub mod restart;
pub mod setup;

use std::{io::Write, path::Path};

const DEFAULT_FILTER: &str = "shepherd=info";

/// Initialize tracing with a default filter if `RUST_LOG` is unset.
pub fn init_tracing() {
    let filter_layer = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Tracing for the supervising loop: plain lines appended to the supervisor log.
///
/// The file is reopened per event so output follows rotation.
pub fn init_file_tracing(log_path: &Path) {
    let filter_layer = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    let path = log_path.to_path_buf();

    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .with_ansi(false)
        .with_writer(move || -> Box<dyn Write> {
            match log_rotate::open_append(&path) {
                Ok(file) => Box::new(file),
                Err(_) => Box::new(std::io::stderr()),
            }
        })
        .init();
}
