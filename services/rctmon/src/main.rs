//! rctmon binary

use clap::{Parser, Subcommand};
use common::LogConfig;
use errors::RctmonResult;
use std::path::PathBuf;

use rctmon::config::{Config, DEFAULT_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(author, version, about = "Collect RCT Power inverter readings for Prometheus and InfluxDB")]
struct Args {
    /// Verbose logging
    #[arg(short, long)]
    debug: bool,

    /// Log every byte sent to and received from the device
    #[arg(long)]
    frame_debug: bool,

    /// Configuration file
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the collector until SIGINT/SIGTERM
    Daemon,
    /// Validate and print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> RctmonResult<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    match args.command {
        Commands::Config => {
            print!("{}", config.redacted().to_yaml()?);
            Ok(())
        },
        Commands::Daemon => {
            common::init_with_config(LogConfig {
                service_name: "rctmon".to_string(),
                debug: args.debug,
                frame_debug: args.frame_debug,
                log_dir: config.logging.directory.clone(),
                enable_json: config.logging.json,
                ansi: true,
            })?;
            tracing::info!("Configuration loaded from {}", args.config.display());
            rctmon::daemon::run(config).await
        },
    }
}
