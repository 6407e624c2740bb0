mod commands;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use strata_kafka::{KafkaSink, KafkaSource};
use strata_transport::{AsyncMessageSink, AsyncMessageSource};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::BridgeConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print consumed payloads, acknowledging each in order
    Consume {
        /// Stop after this many messages
        #[arg(long)]
        max: Option<usize>,
    },
    /// Publish each line read from stdin
    Publish,
    /// Print source and sink status as JSON
    Status,
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("STRATA_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match BridgeConfig::new(cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, shutting down");
            }
            cancel.cancel();
        }
    });

    if let Err(err) = run(cli.command, &config, cancel).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: &BridgeConfig, cancel: CancellationToken) -> Result<()> {
    match command {
        Commands::Consume { max } => {
            let source = Arc::new(
                KafkaSource::new(config.source_config()).context("failed to create source")?,
            );
            let mut stdout = std::io::stdout().lock();
            let consumed = commands::consume(Arc::clone(&source), max, cancel, &mut stdout).await;
            close(source.close(), "source");
            consumed?;
        }
        Commands::Publish => {
            let sink =
                Arc::new(KafkaSink::new(config.sink_config()).context("failed to create sink")?);
            let input = BufReader::new(tokio::io::stdin());
            let confirmed = commands::publish(Arc::clone(&sink), input, cancel).await;
            close(sink.close(), "sink");
            println!("{}", confirmed?);
        }
        Commands::Status => {
            let source = KafkaSource::new(config.source_config()).context("failed to create source")?;
            let sink = KafkaSink::new(config.sink_config()).context("failed to create sink")?;
            let report = commands::status(&source, &sink).await;
            close(source.close(), "source");
            close(sink.close(), "sink");
            println!("{}", serde_json::to_string_pretty(&report?)?);
        }
    }
    Ok(())
}

fn close(result: Result<(), strata_core::CloseError>, what: &str) {
    if let Err(err) = result {
        warn!("closing {what}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["strata-bridge", "consume", "--max", "5"]).unwrap();
        match cli.command {
            Commands::Consume { max } => assert_eq!(max, Some(5)),
            _ => panic!("expected Consume command"),
        }

        let cli =
            Cli::try_parse_from(["strata-bridge", "--config", "bridge.toml", "publish"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("bridge.toml")));
        assert!(matches!(cli.command, Commands::Publish));

        let cli = Cli::try_parse_from(["strata-bridge", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));

        assert!(Cli::try_parse_from(["strata-bridge"]).is_err());
    }
}
