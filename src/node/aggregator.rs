//! Rolling-window telemetry aggregation
//!
//! One global window of recent speed readings, ordered by arrival. Every
//! accepted reading produces an [`AverageRecord`] carrying the truncated
//! integer mean of the window and the next node-global sequence number.

use crate::common::wire::{AverageRecord, Reading};
use std::collections::VecDeque;

pub struct TelemetryAggregator {
    window: VecDeque<Reading>,
    window_secs: u64,
    next_sequence: u64,
}

impl TelemetryAggregator {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window: VecDeque::new(),
            window_secs,
            next_sequence: 0,
        }
    }

    /// Rebuild from persisted parts.
    pub fn from_parts(window: Vec<Reading>, next_sequence: u64, window_secs: u64) -> Self {
        Self {
            window: window.into(),
            window_secs,
            next_sequence,
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Highest sequence ever assigned, if any.
    pub fn highest_sequence(&self) -> Option<u64> {
        self.next_sequence.checked_sub(1)
    }

    pub fn window(&self) -> impl Iterator<Item = &Reading> {
        self.window.iter()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Feed one reading. Returns `None` for a reading already present in the
    /// window (a retransmission), which is not aggregated twice.
    pub fn ingest(&mut self, reading: Reading) -> Option<AverageRecord> {
        if self.window.contains(&reading) {
            return None;
        }

        let newest = reading.timestamp;
        self.window.push_back(reading);
        self.evict_stale(newest);

        let sum: i128 = self.window.iter().map(|r| r.value as i128).sum();
        let mean = (sum / self.window.len() as i128) as i64;

        let record = AverageRecord {
            sequence: self.next_sequence,
            value: mean,
            timestamp: newest,
        };
        self.next_sequence += 1;
        Some(record)
    }

    /// Pop readings off the front while they are more than `window_secs`
    /// older than the arrival stamped `newest`. The arrival itself is never
    /// evicted.
    fn evict_stale(&mut self, newest: u64) {
        while self.window.len() > 1 {
            match self.window.front() {
                Some(front) if newest.saturating_sub(front.timestamp) > self.window_secs => {
                    self.window.pop_front();
                }
                _ => break,
            }
        }
    }
}
