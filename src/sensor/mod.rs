//! Sensor client: reading generation and at-least-once delivery

pub mod client;
pub mod delivery;
pub mod generator;
pub mod outbox;

pub use client::SensorClient;
pub use delivery::DeliveryEngine;
