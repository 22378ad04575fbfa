//! # telestar
//!
//! Highly available telemetry aggregation built on a Binary Star pair:
//! - Two replica nodes, one Active and one Passive, exchanging heartbeats
//! - Failover only when a client request arrives after the peer went silent
//! - Sliding-window speed averages with per-sensor acknowledgement cursors
//! - Replicated state snapshots so a promoted backup keeps the sequence
//! - Sensors that retry every reading until it is echoed back
//!
//! ## Architecture
//!
//! ```text
//!   ┌────────────┐  UDP heartbeat (state code)  ┌────────────┐
//!   │  Primary   │ ◄──────────────────────────► │   Backup   │
//!   │  (Active)  │                              │ (Passive)  │
//!   └─────▲──────┘                              └─────▲──────┘
//!         │  TCP, newline-delimited frames            │
//!         │            (after failover)               │
//!   ┌─────┴──────────────────────┬────────────────────┘
//!   │                            │
//! ┌─┴──────────┐          ┌──────┴─────┐
//! │ Sensor 1   │   ...    │ Sensor N   │
//! │  + outbox  │          │  + outbox  │
//! └────────────┘          └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the pair
//! ```bash
//! telestar-node serve --primary --data-dir ./primary-data --mirror-dir ./backup-data
//! telestar-node serve --backup --data-dir ./backup-data --mirror-dir ./primary-data
//! ```
//!
//! ### Start a sensor
//! ```bash
//! telestar-sensor --id 1 --endpoints 127.0.0.1:5001,127.0.0.1:5002
//! ```

pub mod common;
pub mod node;
pub mod sensor;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use node::{Node, NodeCore};
pub use sensor::SensorClient;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
