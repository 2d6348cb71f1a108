mod check;
mod monitor;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use check::do_check;
use clap::{Parser, Subcommand};
use monitor::do_monitor;
use pmc_data::SessionConfig;
use pmc_extract::CommandLine;
use pmc_remote::Connection;
use tracing_subscriber::{fmt, EnvFilter};

/// Live hardware counter monitoring on top of `pmctrack`.
#[derive(Parser)]
#[command(name = "pmcview", about)]
struct Cli {
    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the monitoring command of every application.
    Command { session: PathBuf },
    /// Verify that the target machine can be monitored.
    Check { session: PathBuf },
    /// Run the session and print derived metrics as they arrive.
    ///
    /// SIGINT kills the monitoring command, SIGUSR1 pauses and SIGUSR2
    /// resumes the current application. SIGQUIT kills the monitored program
    /// and moves on to the next application.
    Monitor { session: PathBuf },
}

fn load(path: &Path) -> Result<SessionConfig> {
    SessionConfig::load(path).with_context(|| format!("loading session from {}", path.display()))
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let filter = EnvFilter::try_new(&args.log_level)
        .with_context(|| format!("invalid log level: {}", args.log_level))?;
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match args.command {
        Commands::Command { session } => {
            let config = load(&session)?;
            let connection = Connection::new(config.machine.clone());
            for (name, app) in config.application_names().iter().zip(&config.applications) {
                let command = CommandLine::build(&config, app);
                println!("{name}: {command}");
                if config.machine.is_remote() {
                    println!("  via: {}", connection.monitoring_command(command.args()).join(" "));
                }
            }
        }
        Commands::Check { session } => {
            do_check(&load(&session)?)?;
        }
        Commands::Monitor { session } => {
            let config = load(&session)?;
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;
            rt.block_on(do_monitor(config))?;
        }
    }

    Ok(())
}
