//! meshdrop CLI
//!
//! Usage:
//!   meshdrop relay [--addr 0.0.0.0:3001]
//!   meshdrop create [--password <pw>] [--send <file>...] [--out <dir>]
//!   meshdrop join <room> [--password <pw>] [--send <file>...] [--out <dir>]

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use meshdrop_cli::{run_room, ClientOptions, RoomAction};
use meshdrop_config::Config;
use meshdrop_room::{RegistryConfig, RelayServer, RoomId};
use meshdrop_webrtc::SessionConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "meshdrop")]
#[command(about = "Share files directly between participants of a room", long_about = None)]
struct Cli {
    /// Signaling relay WebSocket URL (overrides config)
    #[arg(long, global = true)]
    relay: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Bind address (overrides config)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Create a new room and wait for participants
    Create {
        #[command(flatten)]
        room: RoomArgs,
    },
    /// Join an existing room by id
    Join {
        /// Six character room id
        room_id: String,
        #[command(flatten)]
        room: RoomArgs,
    },
}

#[derive(Args)]
struct RoomArgs {
    /// Room password
    #[arg(long)]
    password: Option<String>,
    /// File to offer to every participant (repeatable)
    #[arg(long = "send")]
    send: Vec<PathBuf>,
    /// Directory for received files (overrides config)
    #[arg(long)]
    out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load config")?;

    match cli.command {
        Commands::Relay { addr } => {
            let addr = addr.unwrap_or_else(|| config.relay.bind_address.clone());
            println!("Starting meshdrop relay on {}", addr);
            println!("Max room size: {}", config.relay.max_room_size);
            RelayServer::new(RegistryConfig::from(&config.relay), addr)
                .with_cleanup_interval(Duration::from_secs(config.relay.cleanup_interval_secs))
                .run()
                .await?;
        }
        Commands::Create { room } => {
            run_room(RoomAction::Create, options(&config, cli.relay, room)).await?;
        }
        Commands::Join { room_id, room } => {
            let room_id = RoomId::new(room_id);
            run_room(RoomAction::Join(room_id), options(&config, cli.relay, room)).await?;
        }
    }

    Ok(())
}

fn options(config: &Config, relay: Option<String>, args: RoomArgs) -> ClientOptions {
    ClientOptions {
        relay_url: relay.unwrap_or_else(|| config.signaling.relay_url.clone()),
        password: args.password,
        send: args.send,
        out_dir: args
            .out
            .unwrap_or_else(|| PathBuf::from(&config.transfer.download_dir)),
        stun_servers: config.signaling.stun_servers.clone(),
        session: SessionConfig::from(config),
    }
}
