//! Timer-driven speed reading generator
//!
//! Runs on its own task and hands readings to the network loop through a
//! bounded channel, so the outbox has a single writer.

use crate::common::timestamp_now;
use crate::common::wire::{Reading, SensorId};
use rand::Rng;
use std::ops::Range;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Simulated speeds, km/h
pub const SPEED_RANGE: Range<i64> = 70..120;

pub struct ReadingGenerator {
    sensor_id: SensorId,
    next_sequence: u64,
    interval: Duration,
}

impl ReadingGenerator {
    pub fn new(sensor_id: SensorId, interval: Duration) -> Self {
        Self {
            sensor_id,
            next_sequence: 0,
            interval,
        }
    }

    /// Produce the next reading, stamped `now_secs`.
    pub fn next_reading(&mut self, now_secs: u64) -> Reading {
        let value = rand::thread_rng().gen_range(SPEED_RANGE);
        let reading = Reading::speed(self.sensor_id, self.next_sequence, value, now_secs);
        self.next_sequence += 1;
        reading
    }

    /// Emit one reading per interval until the receiver goes away.
    pub fn spawn(mut self, tx: mpsc::Sender<Reading>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reading = self.next_reading(timestamp_now());
                tracing::trace!("Generated {}", reading);
                if tx.send(reading).await.is_err() {
                    break;
                }
            }
        })
    }
}
