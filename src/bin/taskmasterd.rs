//! The supervisor daemon entry point (spec §4.6, §6).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use taskmasterd::registry::{current_config_path, install_signal_handlers, ControlSignal, Registry};

/// A process supervisor: launches, monitors and restarts long-lived programs.
#[derive(Parser, Debug)]
#[command(name = "taskmasterd")]
struct Args {
    /// Path to the INI-style configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/taskmasterd.conf")]
    config: PathBuf,

    /// Raise the log level to debug.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut registry = match Registry::load(args.config).await {
        Ok(registry) => registry,
        Err(err) => {
            log::error!("invalid configuration: {err}");
            return ExitCode::from(2);
        }
    };

    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    if let Err(err) = install_signal_handlers(tx) {
        log::error!("failed to install signal handlers: {err}");
        return ExitCode::from(1);
    }

    log::info!("taskmasterd started with {} program(s)", registry.program_names().len());

    while let Some(signal) = rx.recv().await {
        match signal {
            ControlSignal::Shutdown => {
                log::info!("received shutdown signal, stopping all programs");
                registry.shutdown().await;
                break;
            }
            ControlSignal::Reload => {
                log::info!("received reload signal, re-reading {}", current_config_path(&registry).display());
                if let Err(err) = registry.reload().await {
                    log::error!("reload failed, keeping prior configuration: {err}");
                }
            }
        }
    }

    ExitCode::from(0)
}
