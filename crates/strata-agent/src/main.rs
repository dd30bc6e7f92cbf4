//! strata-agent
//!
//! Command line front end for strata-updater. Runs one-shot update
//! commands or stays resident and applies updates on a schedule.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use strata_updater::config_service::DEFAULT_CONFIG_SERVICE_URL;
use strata_updater::{Channel, ConfigServiceClient, UpdateConfig, UpdateManager};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata-agent")]
#[command(about = "Keeps a local installation in sync with its release channel")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Override the configured release channel
    #[arg(long, global = true)]
    channel: Option<Channel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compare the installed version with the channel's latest
    Check,
    /// Download and install the latest version
    Update,
    /// Point the installation back at an already installed version
    Rollback { version_hash: String },
    /// Show the channel's deploy history
    History {
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// List installed version directories
    Installed,
    /// Check an installed version against its manifest
    Validate { version_hash: String },
    /// Delete installed versions beyond the newest `keep`
    Cleanup {
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Print the latest version of every channel
    Manifest,
    /// Inspect or maintain the content cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Talk to the local configuration service
    Service {
        #[arg(long, default_value = DEFAULT_CONFIG_SERVICE_URL)]
        url: String,
        #[command(subcommand)]
        action: ServiceAction,
    },
    /// Stay resident and install updates as they are published
    Run {
        /// Only report available updates
        #[arg(long)]
        check_only: bool,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    Stats,
    Clear,
    Evict,
}

#[derive(Subcommand)]
enum ServiceAction {
    Installations,
    Profiles,
    Flags,
    Config { profile: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.json_logs);

    let mut config = match &args.config {
        Some(path) => UpdateConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => UpdateConfig::default(),
    };
    if let Some(channel) = args.channel {
        config.channel = channel;
    }

    // The config service needs no installation root.
    if let Command::Service { url, action } = &args.command {
        let client = ConfigServiceClient::new(config.network.build_client()?, url.clone());
        let value = match action {
            ServiceAction::Installations => client.get_installations().await?,
            ServiceAction::Profiles => serde_json::to_value(client.list_profiles().await?)?,
            ServiceAction::Flags => client.get_flags().await?,
            ServiceAction::Config { profile } => client.get_config(profile).await?,
        };
        return print_json(&value);
    }

    let manager = UpdateManager::new(config)
        .await
        .context("initializing update manager")?;
    let result = run_command(&manager, args.command).await;
    manager.shutdown();
    result
}

async fn run_command(manager: &UpdateManager, command: Command) -> Result<()> {
    let channel = manager.config().channel;
    match command {
        Command::Check => print_json(&manager.check_for_updates().await?),
        Command::Update => print_json(&manager.perform_update().await?),
        Command::Rollback { version_hash } => {
            print_json(&manager.rollback_to_version(&version_hash).await?)
        }
        Command::History { count } => {
            print_json(&manager.versions().version_history(channel, count).await?)
        }
        Command::Installed => print_json(&manager.installed_versions()?),
        Command::Validate { version_hash } => {
            let valid = manager.validate_installation(&version_hash).await;
            print_json(&serde_json::json!({ "version": version_hash, "valid": valid }))?;
            if !valid {
                anyhow::bail!("installation {version_hash} failed validation");
            }
            Ok(())
        }
        Command::Cleanup { keep } => print_json(&manager.cleanup_old_versions(keep).await?),
        Command::Manifest => print_json(&manager.versions().generate_manifest().await),
        Command::Cache { action } => match action {
            CacheAction::Stats => print_json(&manager.cache().stats().await?),
            CacheAction::Clear => {
                manager.clear_all_caches().await?;
                info!("Caches cleared");
                Ok(())
            }
            CacheAction::Evict => {
                let entries = manager.cache().evict_expired().await?;
                let histories = manager.versions().evict_stale_history().await;
                print_json(&serde_json::json!({
                    "evicted_entries": entries,
                    "evicted_histories": histories,
                }))
            }
        },
        Command::Run { check_only } => {
            manager.set_auto_update(!check_only);
            let mut events = manager.subscribe();
            let event_log = tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => match serde_json::to_string(&event) {
                            Ok(line) => info!(event = %line, "Update event"),
                            Err(e) => warn!("Failed to encode update event: {}", e),
                        },
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Update event log fell behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutting down...");
                signal.cancel();
            });

            info!(
                channel = %channel,
                auto_update = manager.auto_update_enabled(),
                "Agent running"
            );
            manager.run_periodic(&shutdown).await;
            event_log.abort();
            Ok(())
        }
        Command::Service { .. } => Ok(()),
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
