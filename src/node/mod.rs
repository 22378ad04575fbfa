//! Replica node: failover state machine, heartbeats, aggregation and
//! replicated state

pub mod ack_window;
pub mod aggregator;
pub mod fsm;
pub mod heartbeat;
pub mod replication;
pub mod server;

pub use fsm::{Event, FailoverCoordinator, State};
pub use server::{Node, NodeCore};
