//! Node metrics
//!
//! Counters and gauges kept by the server loop and rendered in the
//! Prometheus text exposition format. The loop logs a rendering on every
//! heartbeat at `debug` level.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Point-in-time value
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Everything a replica counts about itself.
#[derive(Debug)]
pub struct NodeMetrics {
    pub readings_ingested: Counter,
    pub duplicate_readings: Counter,
    pub averages_emitted: Counter,
    pub averages_collected: Counter,
    pub malformed_frames: Counter,
    pub rejected_requests: Counter,
    pub heartbeats_sent: Counter,
    pub peer_events: Counter,
    pub snapshots_written: Counter,
    pub snapshot_failures: Counter,
    pub restores: Counter,

    /// Numeric FSM state (1..=4)
    pub fsm_state: Gauge,
    pub retained_averages: Gauge,
    pub known_sensors: Gauge,
    pub window_len: Gauge,

    start_time: Instant,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            readings_ingested: Counter::new(),
            duplicate_readings: Counter::new(),
            averages_emitted: Counter::new(),
            averages_collected: Counter::new(),
            malformed_frames: Counter::new(),
            rejected_requests: Counter::new(),
            heartbeats_sent: Counter::new(),
            peer_events: Counter::new(),
            snapshots_written: Counter::new(),
            snapshot_failures: Counter::new(),
            restores: Counter::new(),
            fsm_state: Gauge::new(),
            retained_averages: Gauge::new(),
            known_sensors: Gauge::new(),
            window_len: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("readings_ingested_total", "Readings accepted from sensors", &self.readings_ingested),
            ("duplicate_readings_total", "Retransmitted readings not re-aggregated", &self.duplicate_readings),
            ("averages_emitted_total", "Average records created", &self.averages_emitted),
            ("averages_collected_total", "Average records garbage-collected", &self.averages_collected),
            ("malformed_frames_total", "Frames dropped as malformed", &self.malformed_frames),
            ("rejected_requests_total", "Client requests refused by the failover gate", &self.rejected_requests),
            ("heartbeats_sent_total", "State heartbeats published", &self.heartbeats_sent),
            ("peer_events_total", "Peer heartbeats processed", &self.peer_events),
            ("snapshots_written_total", "Replica snapshots persisted", &self.snapshots_written),
            ("snapshot_failures_total", "Replica snapshot writes that failed", &self.snapshot_failures),
            ("restores_total", "Replica snapshots loaded", &self.restores),
        ];
        for (name, help, counter) in counters {
            write_metric(&mut out, name, help, "counter", counter.get());
        }

        let gauges = [
            ("fsm_state", "Failover state (1=primary 2=backup 3=active 4=passive)", &self.fsm_state),
            ("retained_averages", "Average records awaiting acknowledgment", &self.retained_averages),
            ("known_sensors", "Sensors with an acknowledgment cursor", &self.known_sensors),
            ("window_len", "Readings in the rolling window", &self.window_len),
        ];
        for (name, help, gauge) in gauges {
            write_metric(&mut out, name, help, "gauge", gauge.get());
        }

        write_metric(
            &mut out,
            "uptime_seconds",
            "Node uptime in seconds",
            "gauge",
            self.uptime_seconds(),
        );

        out
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn write_metric(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP telestar_{} {}", name, help);
    let _ = writeln!(out, "# TYPE telestar_{} {}", name, kind);
    let _ = writeln!(out, "telestar_{} {}", name, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();

        assert_eq!(counter.get(), 0);
        counter.inc();
        assert_eq!(counter.get(), 1);
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();

        assert_eq!(gauge.get(), 0);
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
        gauge.set(3);
        assert_eq!(gauge.get(), 3);
    }

    #[test]
    fn test_prometheus_rendering() {
        let metrics = NodeMetrics::new();
        metrics.readings_ingested.add(3);
        metrics.fsm_state.set(3);

        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE telestar_readings_ingested_total counter"));
        assert!(text.contains("telestar_readings_ingested_total 3\n"));
        assert!(text.contains("# TYPE telestar_fsm_state gauge"));
        assert!(text.contains("telestar_fsm_state 3\n"));
        assert!(text.contains("telestar_uptime_seconds"));
    }
}
