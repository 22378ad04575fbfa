//! Text wire grammar shared by sensors and nodes
//!
//! Every frame is one line of comma-separated UTF-8 fields:
//!
//! ```text
//! sensor -> node   reading      sensorId,sequence,Speed,value,timestamp
//! sensor -> node   average ack  sensorId,sequence,Average
//! node -> sensor   reading ack  (echo of the reading frame)
//! node -> sensor   average      sequence,Average,value,timestamp
//! ```
//!
//! Anything else is rejected as [`Error::Malformed`] and dropped by the receiver.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric sensor identity; the only tenant key the system knows.
pub type SensorId = u32;

const KIND_SPEED: &str = "Speed";
const KIND_AVERAGE: &str = "Average";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadingKind {
    Speed,
}

impl fmt::Display for ReadingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingKind::Speed => f.write_str(KIND_SPEED),
        }
    }
}

/// One telemetry sample, identified by `(sensor_id, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: SensorId,
    pub sequence: u64,
    pub kind: ReadingKind,
    pub value: i64,
    /// Unix seconds at generation time
    pub timestamp: u64,
}

impl Reading {
    pub fn speed(sensor_id: SensorId, sequence: u64, value: i64, timestamp: u64) -> Self {
        Self {
            sensor_id,
            sequence,
            kind: ReadingKind::Speed,
            value,
            timestamp,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{}",
            self.sensor_id, self.sequence, self.kind, self.value, self.timestamp
        )
    }
}

/// Rolling average computed by a node, keyed by a node-global sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AverageRecord {
    pub sequence: u64,
    pub value: i64,
    pub timestamp: u64,
}

impl fmt::Display for AverageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.sequence, KIND_AVERAGE, self.value, self.timestamp
        )
    }
}

/// Frames a sensor sends to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Reading(Reading),
    AverageAck { sensor_id: SensorId, sequence: u64 },
}

impl ClientFrame {
    pub fn sensor_id(&self) -> SensorId {
        match self {
            ClientFrame::Reading(r) => r.sensor_id,
            ClientFrame::AverageAck { sensor_id, .. } => *sensor_id,
        }
    }
}

impl fmt::Display for ClientFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientFrame::Reading(r) => fmt::Display::fmt(r, f),
            ClientFrame::AverageAck {
                sensor_id,
                sequence,
            } => write!(f, "{},{},{}", sensor_id, sequence, KIND_AVERAGE),
        }
    }
}

impl FromStr for ClientFrame {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let fields = split_fields(line);
        match fields.as_slice() {
            [sensor, seq, kind] if *kind == KIND_AVERAGE => Ok(ClientFrame::AverageAck {
                sensor_id: parse_field(sensor, "sensor id")?,
                sequence: parse_field(seq, "sequence")?,
            }),
            [_, _, _, _, _] => parse_reading(&fields).map(ClientFrame::Reading),
            _ => Err(Error::Malformed(format!(
                "unexpected client frame shape ({} fields): {:?}",
                fields.len(),
                line
            ))),
        }
    }
}

/// Frames a node sends to a sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    ReadingAck(Reading),
    Average(AverageRecord),
}

impl fmt::Display for ServerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerFrame::ReadingAck(r) => fmt::Display::fmt(r, f),
            ServerFrame::Average(a) => fmt::Display::fmt(a, f),
        }
    }
}

impl FromStr for ServerFrame {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let fields = split_fields(line);
        match fields.as_slice() {
            [seq, kind, value, ts] if *kind == KIND_AVERAGE => {
                Ok(ServerFrame::Average(AverageRecord {
                    sequence: parse_field(seq, "sequence")?,
                    value: parse_field(value, "value")?,
                    timestamp: parse_field(ts, "timestamp")?,
                }))
            }
            [_, _, _, _, _] => parse_reading(&fields).map(ServerFrame::ReadingAck),
            _ => Err(Error::Malformed(format!(
                "unexpected server frame shape ({} fields): {:?}",
                fields.len(),
                line
            ))),
        }
    }
}

fn split_fields(line: &str) -> Vec<&str> {
    line.trim_end_matches(['\r', '\n'])
        .split(',')
        .map(str::trim)
        .collect()
}

fn parse_reading(fields: &[&str]) -> Result<Reading> {
    if fields[2] != KIND_SPEED {
        return Err(Error::Malformed(format!("unknown reading kind: {}", fields[2])));
    }
    Ok(Reading::speed(
        parse_field(fields[0], "sensor id")?,
        parse_field(fields[1], "sequence")?,
        parse_field(fields[3], "value")?,
        parse_field(fields[4], "timestamp")?,
    ))
}

fn parse_field<T: FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::Malformed(format!("invalid {}: {:?}", what, raw)))
}
