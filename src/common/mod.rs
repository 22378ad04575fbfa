//! Common utilities and types shared by nodes and sensors

pub mod audit;
pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;
pub mod wire;

pub use config::{Config, NodeConfig, NodeRole, SensorConfig};
pub use error::{Error, Result};
pub use utils::{crc32, parse_duration, timestamp_now, timestamp_now_millis};
