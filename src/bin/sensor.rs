//! Sensor client binary

use anyhow::Result;
use clap::Parser;
use telestar::common::Config;
use telestar::SensorClient;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "telestar-sensor")]
#[command(about = "telestar speed sensor")]
struct Args {
    /// Sensor ID
    #[arg(short, long)]
    id: Option<u32>,

    /// The two replica endpoints (comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Milliseconds to wait for each reply
    #[arg(long)]
    reply_timeout_ms: Option<u64>,

    /// Milliseconds between reading generations
    #[arg(long)]
    reading_interval_ms: Option<u64>,

    /// Silent cycles before switching endpoint
    #[arg(long)]
    silent_cycles: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let file = Config::load()?;
    let log_level = args.log_level.clone().unwrap_or(file.log_level);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = file.sensor.unwrap_or_default();
    if let Some(id) = args.id {
        config.sensor_id = id;
    }
    if !args.endpoints.is_empty() {
        config.endpoints = args.endpoints;
    }
    if let Some(ms) = args.reply_timeout_ms {
        config.reply_timeout_ms = ms;
    }
    if let Some(ms) = args.reading_interval_ms {
        config.reading_interval_ms = ms;
    }
    if let Some(n) = args.silent_cycles {
        config.silent_cycles_before_failover = n;
    }

    tracing::info!("Sensor {} endpoints: {:?}", config.sensor_id, config.endpoints);

    SensorClient::new(config)?.run().await?;
    Ok(())
}
