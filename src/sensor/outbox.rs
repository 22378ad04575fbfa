//! Readings sent but not yet acknowledged

use crate::common::wire::Reading;
use std::collections::BTreeMap;

/// Unacknowledged readings keyed by sequence. Entries leave only when the
/// node echoes them back; there is no size bound, so the outbox grows for as
/// long as no replica is reachable.
#[derive(Debug, Default)]
pub struct Outbox {
    entries: BTreeMap<u64, Reading>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reading: Reading) {
        self.entries.insert(reading.sequence, reading);
    }

    /// Drop the entry for `sequence`. Returns false if it was already gone.
    pub fn acknowledge(&mut self, sequence: u64) -> bool {
        self.entries.remove(&sequence).is_some()
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.entries.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Outstanding readings in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_stays_until_acked() {
        let mut outbox = Outbox::new();
        outbox.insert(Reading::speed(1, 0, 80, 100));
        outbox.insert(Reading::speed(1, 1, 85, 101));

        assert!(!outbox.acknowledge(7));
        assert_eq!(outbox.len(), 2);

        assert!(outbox.acknowledge(0));
        assert!(!outbox.contains(0));
        assert!(outbox.contains(1));
        assert!(!outbox.acknowledge(0));
    }

    #[test]
    fn test_iterates_in_sequence_order() {
        let mut outbox = Outbox::new();
        for seq in [5, 2, 9] {
            outbox.insert(Reading::speed(1, seq, 80, 100 + seq));
        }
        let order: Vec<u64> = outbox.iter().map(|r| r.sequence).collect();
        assert_eq!(order, vec![2, 5, 9]);
    }
}
