//! natprobe command-line front end
//!
//! `natprobe serve` runs the three-listener responder until Ctrl-C.
//! `natprobe detect` classifies this host against a running responder.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use natprobe::{NatDiscovery, NatResponder, ProbeConfig, ResponderConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// UDP NAT behavior discovery
#[derive(Parser, Debug)]
#[command(name = "natprobe", version, about)]
struct Cli {
    /// JSON configuration file (missing file = defaults)
    #[arg(short, long, env = "NATPROBE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the discovery responder
    Serve {
        /// IP all three listeners bind to
        #[arg(long)]
        bind: Option<IpAddr>,

        /// Cap on concurrent handlers per listener
        #[arg(long)]
        max_in_flight: Option<usize>,
    },

    /// Classify this host's NAT behavior
    Detect {
        /// Discovery server host name or IP
        #[arg(short, long, env = "NATPROBE_SERVER")]
        server: Option<String>,

        /// Attempts per probe batch
        #[arg(long)]
        attempts: Option<u32>,

        /// Per-attempt timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            max_in_flight,
        } => {
            let mut config = match &cli.config {
                Some(path) => ResponderConfig::load(path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => ResponderConfig::default(),
            };
            if let Some(ip) = bind {
                config.bind_ip = ip;
            }
            if let Some(max) = max_in_flight {
                config.max_in_flight_per_listener = max;
            }
            serve(config).await
        }
        Commands::Detect {
            server,
            attempts,
            timeout_ms,
            json,
        } => {
            let mut config = match &cli.config {
                Some(path) => {
                    ProbeConfig::load(path).with_context(|| format!("loading {}", path.display()))?
                }
                None => ProbeConfig::default(),
            };
            if let Some(server) = server {
                config.server_host = server;
            }
            if let Some(attempts) = attempts {
                config.max_probe_attempts = attempts;
            }
            if let Some(timeout_ms) = timeout_ms {
                config.probe_timeout_ms = timeout_ms;
            }
            detect(config, json).await
        }
    }
}

async fn serve(config: ResponderConfig) -> Result<()> {
    let handle = NatResponder::bind(&config)
        .await
        .context("starting responder")?
        .spawn();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    info!("Shutdown requested");
    handle.shutdown();
    Ok(())
}

async fn detect(config: ProbeConfig, json: bool) -> Result<()> {
    let report = NatDiscovery::new(config)?.run().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary());
        println!(
            "NAT type: {} (code {}, relay required: {})",
            report.classification,
            report.classification.code(),
            report.classification.requires_relay()
        );
    }

    Ok(())
}
