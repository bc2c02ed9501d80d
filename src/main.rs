//! voxlink - multiplayer session layer for a voxel sandbox
//!
//! Headless executable: host a flat test world over TCP, join one, or run a
//! host and client side by side over the in-process relay.

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::{SessionSettings, DEFAULT_SETTINGS_PATH};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Voxel sandbox multiplayer session host and client",
    long_about = None
)]
struct Args {
    /// Session settings file (TOML)
    #[arg(short, long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a flat world over TCP
    Host {
        /// Listen address (overrides the settings file)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Admit every peer that passes the gate without asking
        #[arg(long)]
        auto_accept: bool,
    },
    /// Join a TCP host
    Join {
        /// Host address
        addr: SocketAddr,

        /// Display name
        #[arg(long, default_value = "Player")]
        name: String,

        /// Handshake timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Run a host and a client in one process over the in-process relay
    Loopback {
        /// Display name of the client
        #[arg(long, default_value = "Player")]
        name: String,
    },
    /// Write the default settings file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting voxlink v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    if let Command::InitConfig = args.command {
        SessionSettings::default().save_to_path(&args.config)?;
        info!("Wrote default settings to {}", args.config.display());
        return Ok(());
    }

    let settings = SessionSettings::load_from_path(&args.config);
    match args.command {
        Command::Host { bind, auto_accept } => {
            let mut settings = settings;
            if let Some(bind) = bind {
                settings.bind = bind;
            }
            if auto_accept {
                settings.host.require_approval = false;
            }
            commands::run_host(settings).await
        }
        Command::Join {
            addr,
            name,
            timeout_secs,
        } => commands::run_join(settings, addr, &name, timeout_secs).await,
        Command::Loopback { name } => commands::run_loopback(settings, &name).await,
        Command::InitConfig => Ok(()),
    }
}
