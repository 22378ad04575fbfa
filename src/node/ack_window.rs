//! Per-sensor acknowledgment windows over the average stream
//!
//! Every sensor has a cursor: the highest [`AverageRecord`] sequence it has
//! acknowledged. A sensor is sent every retained record above its cursor each
//! time it reports. Records below the lowest cursor of all known sensors are
//! garbage-collected.
//!
//! A cursor of `None` means the sensor arrived before any average existed and
//! has acknowledged nothing; it orders below every sequence, so such a sensor
//! holds back collection until it acknowledges.

use crate::common::wire::{AverageRecord, Reading, SensorId, ServerFrame};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
pub struct AckWindowManager {
    averages: BTreeMap<u64, AverageRecord>,
    cursors: BTreeMap<SensorId, Option<u64>>,
    /// Reading echoes not yet flushed, per sensor
    pending: HashMap<SensorId, BTreeMap<u64, Reading>>,
}

impl AckWindowManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        averages: BTreeMap<u64, AverageRecord>,
        cursors: BTreeMap<SensorId, Option<u64>>,
    ) -> Self {
        Self {
            averages,
            cursors,
            pending: HashMap::new(),
        }
    }

    pub fn averages(&self) -> &BTreeMap<u64, AverageRecord> {
        &self.averages
    }

    pub fn cursors(&self) -> &BTreeMap<SensorId, Option<u64>> {
        &self.cursors
    }

    pub fn is_known(&self, sensor: SensorId) -> bool {
        self.cursors.contains_key(&sensor)
    }

    pub fn last_acked(&self, sensor: SensorId) -> Option<u64> {
        self.cursors.get(&sensor).copied().flatten()
    }

    /// Start tracking a sensor on first contact. New sensors start caught up
    /// at `highest_assigned`. Returns true if the sensor was new.
    pub fn register(&mut self, sensor: SensorId, highest_assigned: Option<u64>) -> bool {
        if self.cursors.contains_key(&sensor) {
            return false;
        }
        tracing::info!(
            "New sensor {} starting at average {:?}",
            sensor,
            highest_assigned
        );
        self.cursors.insert(sensor, highest_assigned);
        true
    }

    pub fn record(&mut self, average: AverageRecord) {
        self.averages.insert(average.sequence, average);
    }

    /// Queue the echo that acknowledges a reading.
    pub fn queue_reading_ack(&mut self, reading: Reading) {
        self.pending
            .entry(reading.sensor_id)
            .or_default()
            .insert(reading.sequence, reading);
    }

    /// Everything owed to `sensor`: pending reading echoes, then every
    /// retained average above its cursor.
    pub fn outgoing(&mut self, sensor: SensorId) -> Vec<ServerFrame> {
        let mut frames: Vec<ServerFrame> = self
            .pending
            .remove(&sensor)
            .unwrap_or_default()
            .into_values()
            .map(ServerFrame::ReadingAck)
            .collect();

        let start = match self.cursors.get(&sensor).copied().flatten() {
            Some(acked) => acked.saturating_add(1),
            None => 0,
        };
        frames.extend(
            self.averages
                .range(start..)
                .map(|(_, avg)| ServerFrame::Average(avg.clone())),
        );
        frames
    }

    /// Apply an explicit acknowledgment and collect garbage. Sequences above
    /// `highest_assigned` are clamped. Returns the number of records collected.
    pub fn acknowledge(
        &mut self,
        sensor: SensorId,
        sequence: u64,
        highest_assigned: Option<u64>,
    ) -> usize {
        self.register(sensor, highest_assigned);

        let Some(highest) = highest_assigned else {
            tracing::warn!(
                "Sensor {} acknowledged average {} before any was assigned",
                sensor,
                sequence
            );
            return 0;
        };
        let sequence = if sequence > highest {
            tracing::warn!(
                "Sensor {} acknowledged unknown average {}, clamping to {}",
                sensor,
                sequence,
                highest
            );
            highest
        } else {
            sequence
        };

        if let Some(cursor) = self.cursors.get_mut(&sensor) {
            *cursor = (*cursor).max(Some(sequence));
        }
        self.collect_garbage()
    }

    /// Lowest cursor over all sensors; records below it are unreachable.
    pub fn gc_floor(&self) -> Option<u64> {
        self.cursors.values().copied().min().flatten()
    }

    pub fn collect_garbage(&mut self) -> usize {
        let Some(floor) = self.gc_floor() else {
            return 0;
        };
        let before = self.averages.len();
        self.averages = self.averages.split_off(&floor);
        let collected = before - self.averages.len();
        if collected > 0 {
            tracing::debug!("Collected {} averages below {}", collected, floor);
        }
        collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avg(sequence: u64) -> AverageRecord {
        AverageRecord {
            sequence,
            value: 80,
            timestamp: 1_000 + sequence,
        }
    }

    fn average_sequences(frames: &[ServerFrame]) -> Vec<u64> {
        frames
            .iter()
            .filter_map(|f| match f {
                ServerFrame::Average(a) => Some(a.sequence),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_new_sensor_starts_caught_up() {
        let mut acks = AckWindowManager::new();
        for seq in 0..5 {
            acks.record(avg(seq));
        }
        assert!(acks.register(9, Some(4)));
        assert!(!acks.register(9, Some(10)));
        assert_eq!(acks.last_acked(9), Some(4));
        acks.record(avg(5));
        assert_eq!(average_sequences(&acks.outgoing(9)), vec![5]);
    }

    #[test]
    fn test_outgoing_never_repeats_acked() {
        let mut acks = AckWindowManager::new();
        acks.register(1, None);
        for seq in 0..6 {
            acks.record(avg(seq));
        }
        assert_eq!(average_sequences(&acks.outgoing(1)), vec![0, 1, 2, 3, 4, 5]);
        acks.acknowledge(1, 3, Some(5));
        let sent = average_sequences(&acks.outgoing(1));
        assert_eq!(sent, vec![4, 5]);
        assert!(sent.iter().all(|s| *s > 3));
    }

    #[test]
    fn test_stale_ack_does_not_move_cursor_back() {
        let mut acks = AckWindowManager::new();
        acks.register(1, None);
        for seq in 0..4 {
            acks.record(avg(seq));
        }
        acks.acknowledge(1, 3, Some(3));
        acks.acknowledge(1, 1, Some(3));
        assert_eq!(acks.last_acked(1), Some(3));
    }

    #[test]
    fn test_reading_echoes_precede_averages() {
        let mut acks = AckWindowManager::new();
        acks.register(4, None);
        acks.queue_reading_ack(Reading::speed(4, 11, 90, 100));
        acks.queue_reading_ack(Reading::speed(4, 10, 91, 99));
        acks.record(avg(0));

        let frames = acks.outgoing(4);
        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], ServerFrame::ReadingAck(r) if r.sequence == 10));
        assert!(matches!(&frames[1], ServerFrame::ReadingAck(r) if r.sequence == 11));
        assert!(matches!(&frames[2], ServerFrame::Average(a) if a.sequence == 0));

        // echoes are flushed once
        assert_eq!(acks.outgoing(4).len(), 1);
    }

    #[test]
    fn test_gc_keeps_records_at_or_above_min_cursor() {
        let mut acks = AckWindowManager::new();
        acks.register(1, None);
        for seq in 0..10 {
            acks.record(avg(seq));
        }
        acks.register(2, Some(9));
        let collected = acks.acknowledge(1, 6, Some(9));
        assert_eq!(collected, 6);
        let floor = acks.gc_floor().unwrap();
        assert_eq!(floor, 6);
        assert!(acks.averages().keys().all(|s| *s >= floor));
    }

    #[test]
    fn test_ack_beyond_highest_is_clamped() {
        let mut acks = AckWindowManager::new();
        acks.register(1, None);
        acks.record(avg(0));
        acks.record(avg(1));
        acks.acknowledge(1, 1_000, Some(1));
        assert_eq!(acks.last_acked(1), Some(1));
    }

    #[test]
    fn test_ack_before_any_average_is_ignored() {
        let mut acks = AckWindowManager::new();
        assert_eq!(acks.acknowledge(3, 7, None), 0);
        assert!(acks.is_known(3));
        assert_eq!(acks.last_acked(3), None);
    }
}
