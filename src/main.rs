use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use steward::app::{load_catalog, App};
use steward::cli::{CheckCommand, Cli, Commands, ConfigPathArg};
use steward::config::Config;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let config = match Config::load(&args.config) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Failed to load config: {e}");
                    std::process::exit(1);
                }
            };

            config.init_logging();
            info!("steward starting");

            tokio::select! {
                result = App::run(config) => {
                    if let Err(e) = result {
                        error!(error = %e, "Fatal error");
                        std::process::exit(1);
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("Shutdown signal received");
                }
            }

            info!("steward stopped");
        }
        Commands::Check(CheckCommand::Config(args)) => {
            if let Err(e) = check_config(&args) {
                eprintln!("Config check failed: {e:#}");
                std::process::exit(1);
            }
            println!("Config OK");
        }
    }
}

fn check_config(args: &ConfigPathArg) -> anyhow::Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if let Some(catalog) = &config.catalog {
        load_catalog(std::path::Path::new(catalog))
            .with_context(|| format!("loading catalog {catalog}"))?;
        println!("Catalog OK ({catalog})");
    }

    Ok(())
}
