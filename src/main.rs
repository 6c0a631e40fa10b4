//! CLI entry point for erpes-daq
//!
//! - `run`: start the telemetry core from a configuration file and run until Ctrl-C
//! - `check`: validate a configuration file and exit
//! - `query`: fetch attributes from a running exchange server
//!
//! ```bash
//! erpes-daq run --config config/erpes.example.toml
//! erpes-daq query --address 127.0.0.1:5557 compressor_he_discharge_temp torr_main
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use erpes_daq::app::DaqApp;
use erpes_daq::config::Settings;
use erpes_daq::exchange::{ExchangeClient, Record};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "erpes-daq")]
#[command(about = "ARPES telemetry core and scan synchronization", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll instruments and serve the attribute exchange until Ctrl-C
    Run {
        /// Configuration file (TOML)
        #[arg(long)]
        config: PathBuf,
    },

    /// Validate a configuration file
    Check {
        /// Configuration file (TOML)
        #[arg(long)]
        config: PathBuf,
    },

    /// Fetch attributes from an exchange server
    Query {
        /// Server address
        #[arg(long, default_value = "127.0.0.1:5557")]
        address: String,

        /// Request timeout
        #[arg(long, default_value = "5s", value_parser = humantime_duration)]
        timeout: Duration,

        /// Attribute names; none fetches everything
        names: Vec<String>,
    },
}

fn humantime_duration(raw: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(raw).map_err(|e| e.to_string())
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let settings = Settings::load_from(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            init_logging(&settings.application.log_level);

            let app = DaqApp::start(settings).await?;
            info!(exchange = %app.exchange_addr(), "running; press Ctrl-C to stop");
            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            app.shutdown().await?;
        }
        Commands::Check { config } => {
            let settings = Settings::load_from(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            println!(
                "{}: {} instrument(s), {} alarm(s), capture set of {}",
                config.display(),
                settings.instruments.len(),
                settings.alarms.len(),
                settings.scan.capture.len()
            );
        }
        Commands::Query {
            address,
            timeout,
            names,
        } => {
            init_logging("warn");
            let mut client = ExchangeClient::new(&address).with_timeout(timeout);
            for record in client.fetch(&names).await? {
                match record {
                    Record::Found(attr) => {
                        let state = if attr.valid { "" } else { "  (stale)" };
                        println!(
                            "{:<32} {:>14} {:<6} {}{state}",
                            attr.name,
                            attr.value.to_string(),
                            attr.unit,
                            attr.timestamp.to_rfc3339()
                        );
                    }
                    Record::NotFound(name) => println!("{name:<32} not found"),
                }
            }
        }
    }

    Ok(())
}
