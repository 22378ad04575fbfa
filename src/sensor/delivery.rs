//! Retry-until-acknowledged delivery with endpoint failover
//!
//! [`DeliveryEngine`] holds the sensor-side protocol state without doing any
//! I/O: which readings are still owed, which replica is current, and how many
//! consecutive cycles have gone unanswered. The network loop in
//! [`crate::sensor::client`] feeds it replies and asks it what to send.

use crate::common::wire::{AverageRecord, ClientFrame, Reading, SensorId, ServerFrame};
use crate::common::{Error, Result};
use crate::sensor::outbox::Outbox;
use std::collections::BTreeMap;

const RECENT_AVERAGES: usize = 64;

/// The two replica endpoints, visited round-robin.
#[derive(Debug, Clone)]
pub struct EndpointRing {
    endpoints: [String; 2],
    current: usize,
    switches: u64,
}

impl EndpointRing {
    pub fn new(endpoints: Vec<String>) -> Result<Self> {
        let endpoints: [String; 2] = endpoints.try_into().map_err(|v: Vec<String>| {
            Error::InvalidConfig(format!("exactly two endpoints required, got {}", v.len()))
        })?;
        Ok(Self {
            endpoints,
            current: 0,
            switches: 0,
        })
    }

    pub fn current(&self) -> &str {
        &self.endpoints[self.current]
    }

    pub fn advance(&mut self) -> &str {
        self.current = (self.current + 1) % self.endpoints.len();
        self.switches += 1;
        self.current()
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }
}

/// What a single reply meant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Echo of one of our readings; `removed` is false for a repeat echo
    ReadingAcked { sequence: u64, removed: bool },
    /// A derived average; `ack` must be sent back
    Average {
        record: AverageRecord,
        ack: ClientFrame,
    },
    /// Echo of a reading that is not ours
    Foreign { sensor_id: SensorId },
}

/// End-of-cycle verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleVerdict {
    Healthy,
    /// No replies yet, below the failover threshold
    Silent { consecutive: u32 },
    /// Switched to the named endpoint
    Failover { to: String },
}

pub struct DeliveryEngine {
    sensor_id: SensorId,
    outbox: Outbox,
    ring: EndpointRing,
    silent_cycles: u32,
    silent_threshold: u32,
    recent_averages: BTreeMap<u64, AverageRecord>,
}

impl DeliveryEngine {
    pub fn new(sensor_id: SensorId, endpoints: Vec<String>, silent_threshold: u32) -> Result<Self> {
        Ok(Self {
            sensor_id,
            outbox: Outbox::new(),
            ring: EndpointRing::new(endpoints)?,
            silent_cycles: 0,
            silent_threshold: silent_threshold.max(1),
            recent_averages: BTreeMap::new(),
        })
    }

    pub fn sensor_id(&self) -> SensorId {
        self.sensor_id
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn endpoint(&self) -> &str {
        self.ring.current()
    }

    pub fn switches(&self) -> u64 {
        self.ring.switches()
    }

    /// Most recent average received from any replica.
    pub fn latest_average(&self) -> Option<&AverageRecord> {
        self.recent_averages.values().next_back()
    }

    pub fn enqueue(&mut self, reading: Reading) {
        self.outbox.insert(reading);
    }

    /// Every outstanding reading, encoded for the wire.
    pub fn outgoing_frames(&self) -> Vec<String> {
        self.outbox.iter().map(Reading::to_string).collect()
    }

    /// Interpret one reply line.
    pub fn handle_reply(&mut self, line: &str) -> Result<ReplyOutcome> {
        match line.parse::<ServerFrame>()? {
            ServerFrame::ReadingAck(reading) if reading.sensor_id == self.sensor_id => {
                let removed = self.outbox.acknowledge(reading.sequence);
                Ok(ReplyOutcome::ReadingAcked {
                    sequence: reading.sequence,
                    removed,
                })
            }
            ServerFrame::ReadingAck(reading) => Ok(ReplyOutcome::Foreign {
                sensor_id: reading.sensor_id,
            }),
            ServerFrame::Average(record) => {
                let ack = ClientFrame::AverageAck {
                    sensor_id: self.sensor_id,
                    sequence: record.sequence,
                };
                self.remember(record.clone());
                Ok(ReplyOutcome::Average { record, ack })
            }
        }
    }

    fn remember(&mut self, record: AverageRecord) {
        self.recent_averages.insert(record.sequence, record);
        while self.recent_averages.len() > RECENT_AVERAGES {
            self.recent_averages.pop_first();
        }
    }

    /// Close a cycle that received `replies` frames. Switches endpoint once
    /// the configured number of consecutive cycles went unanswered.
    pub fn finish_cycle(&mut self, replies: usize) -> CycleVerdict {
        if replies > 0 {
            self.silent_cycles = 0;
            return CycleVerdict::Healthy;
        }

        self.silent_cycles += 1;
        if self.silent_cycles < self.silent_threshold {
            return CycleVerdict::Silent {
                consecutive: self.silent_cycles,
            };
        }

        self.silent_cycles = 0;
        let to = self.ring.advance().to_string();
        CycleVerdict::Failover { to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(threshold: u32) -> DeliveryEngine {
        DeliveryEngine::new(
            3,
            vec!["10.0.0.1:5001".into(), "10.0.0.2:5002".into()],
            threshold,
        )
        .unwrap()
    }

    #[test]
    fn test_ring_requires_two_endpoints() {
        assert!(EndpointRing::new(vec!["a:1".into()]).is_err());
        assert!(EndpointRing::new(vec!["a:1".into(), "b:2".into(), "c:3".into()]).is_err());
    }

    #[test]
    fn test_reading_removed_only_by_matching_echo() {
        let mut engine = engine(1);
        engine.enqueue(Reading::speed(3, 0, 80, 100));
        engine.enqueue(Reading::speed(3, 1, 90, 101));

        let out = engine.handle_reply("3,1,Speed,90,101").unwrap();
        assert_eq!(
            out,
            ReplyOutcome::ReadingAcked {
                sequence: 1,
                removed: true
            }
        );
        assert!(engine.outbox().contains(0));
        assert_eq!(engine.outgoing_frames(), vec!["3,0,Speed,80,100".to_string()]);

        let out = engine.handle_reply("4,0,Speed,80,100").unwrap();
        assert_eq!(out, ReplyOutcome::Foreign { sensor_id: 4 });
        assert!(engine.outbox().contains(0));
    }

    #[test]
    fn test_average_produces_ack() {
        let mut engine = engine(1);
        let out = engine.handle_reply("12,Average,85,200").unwrap();
        match out {
            ReplyOutcome::Average { record, ack } => {
                assert_eq!(record.sequence, 12);
                assert_eq!(ack.to_string(), "3,12,Average");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.latest_average().map(|a| a.value), Some(85));
        // averages never touch the reading outbox
        assert!(engine.outbox().is_empty());
    }

    #[test]
    fn test_recent_averages_bounded() {
        let mut engine = engine(1);
        for seq in 0..100u64 {
            engine
                .handle_reply(&format!("{},Average,80,{}", seq, 1_000 + seq))
                .unwrap();
        }
        assert_eq!(engine.recent_averages.len(), RECENT_AVERAGES);
        assert_eq!(engine.latest_average().map(|a| a.sequence), Some(99));
    }

    #[test]
    fn test_malformed_reply_is_error() {
        let mut engine = engine(1);
        assert!(engine.handle_reply("nonsense").is_err());
    }

    #[test]
    fn test_silent_cycle_switches_endpoint() {
        let mut engine = engine(1);
        assert_eq!(engine.endpoint(), "10.0.0.1:5001");
        assert_eq!(
            engine.finish_cycle(0),
            CycleVerdict::Failover {
                to: "10.0.0.2:5002".into()
            }
        );
        assert_eq!(engine.switches(), 1);
        engine.finish_cycle(0);
        assert_eq!(engine.endpoint(), "10.0.0.1:5001");
        assert_eq!(engine.switches(), 2);
    }

    #[test]
    fn test_two_silent_cycles_one_switch_with_threshold_two() {
        let mut engine = engine(2);
        assert_eq!(engine.finish_cycle(0), CycleVerdict::Silent { consecutive: 1 });
        assert_eq!(engine.switches(), 0);
        assert!(matches!(engine.finish_cycle(0), CycleVerdict::Failover { .. }));
        assert_eq!(engine.switches(), 1);
    }

    #[test]
    fn test_reply_resets_silence() {
        let mut engine = engine(2);
        engine.finish_cycle(0);
        assert_eq!(engine.finish_cycle(3), CycleVerdict::Healthy);
        assert_eq!(engine.finish_cycle(0), CycleVerdict::Silent { consecutive: 1 });
        assert_eq!(engine.switches(), 0);
    }

    #[test]
    fn test_outbox_survives_failover() {
        let mut engine = engine(1);
        engine.enqueue(Reading::speed(3, 0, 80, 100));
        engine.finish_cycle(0);
        assert_eq!(engine.outgoing_frames().len(), 1);
    }
}
