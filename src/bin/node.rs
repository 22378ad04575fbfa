//! Replica node binary

use clap::{ArgGroup, Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use telestar::common::{parse_duration, Config, NodeConfig, NodeRole};
use telestar::Node;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "telestar-node")]
#[command(about = "telestar Binary Star replica")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a replica
    Serve(ServeArgs),
}

#[derive(Args)]
#[command(group(ArgGroup::new("role").required(true).args(["primary", "backup"])))]
struct ServeArgs {
    /// Start as the primary replica
    #[arg(short, long)]
    primary: bool,

    /// Start as the backup replica
    #[arg(short, long)]
    backup: bool,

    /// TCP address sensors connect to
    #[arg(long)]
    client: Option<SocketAddr>,

    /// Local UDP heartbeat address
    #[arg(long)]
    heartbeat: Option<SocketAddr>,

    /// Peer UDP heartbeat address
    #[arg(long)]
    peer_heartbeat: Option<SocketAddr>,

    /// Directory holding replica artifacts
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Peer storage directory to mirror artifacts into
    #[arg(long)]
    mirror_dir: Option<PathBuf>,

    /// Heartbeat interval (e.g. 1s, 250ms)
    #[arg(long, value_parser = parse_duration)]
    heartbeat_interval: Option<std::time::Duration>,

    /// Rolling average window in seconds
    #[arg(long)]
    window_secs: Option<u64>,

    /// JSON-lines journal of role transitions
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl ServeArgs {
    fn role(&self) -> NodeRole {
        if self.primary {
            NodeRole::Primary
        } else {
            NodeRole::Backup
        }
    }

    /// File settings for the same role, then CLI flags on top.
    fn apply(self, file: Option<NodeConfig>) -> NodeConfig {
        let role = self.role();
        let mut config = file
            .filter(|n| n.role == role)
            .unwrap_or_else(|| NodeConfig::for_role(role));

        if let Some(addr) = self.client {
            config.client_addr = addr;
        }
        if let Some(addr) = self.heartbeat {
            config.heartbeat_addr = addr;
        }
        if let Some(addr) = self.peer_heartbeat {
            config.peer_heartbeat_addr = addr;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(dir) = self.mirror_dir {
            config.replica_mirror_dir = Some(dir);
        }
        if let Some(interval) = self.heartbeat_interval {
            config.heartbeat_interval_ms = interval.as_millis() as u64;
        }
        if let Some(secs) = self.window_secs {
            config.window_secs = secs;
        }
        if let Some(path) = self.audit_log {
            config.audit_log = Some(path);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let file = Config::load()?;
            let log_level = args.log_level.clone().unwrap_or(file.log_level);

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| log_level.into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            let config = args.apply(file.node);
            tracing::info!("Data directory: {}", config.data_dir.display());

            let node = Node::bind(config).await?;
            node.serve().await?;
        }
    }

    Ok(())
}
