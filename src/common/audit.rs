//! Failover journal
//!
//! Appends one JSON object per line for every role transition, fatal
//! condition and snapshot restore, so an operator can reconstruct which
//! replica was serving when. Writing is best effort: a journal that cannot
//! be written never stops the node.

use crate::node::fsm::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Transition,
    Fatal,
    Restore,
    Startup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub event: AuditEventType,
    pub from: Option<State>,
    pub to: State,
    pub message: String,
}

pub struct AuditLog {
    file: Option<File>,
}

impl AuditLog {
    /// Journal that records nothing.
    pub fn disabled() -> Self {
        Self { file: None }
    }

    /// Open (append) the journal. Failure to open is logged and yields a
    /// disabled journal.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::warn!("Audit log {} unavailable: {}", path.display(), e);
                None
            }
        };
        Self { file }
    }

    pub fn record(
        &mut self,
        event: AuditEventType,
        from: Option<State>,
        to: State,
        message: impl Into<String>,
    ) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event,
            from,
            to,
            message: message.into(),
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Audit entry not serializable: {}", e);
                return;
            }
        };
        if let Err(e) = writeln!(file, "{}", line) {
            tracing::warn!("Audit write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use tempfile::tempdir;

    #[test]
    fn test_journal_lines_parse_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("failover.jsonl");

        let mut log = AuditLog::open(&path);
        log.record(
            AuditEventType::Transition,
            Some(State::Passive),
            State::Active,
            "peer expired",
        );
        log.record(AuditEventType::Restore, None, State::Active, "sequence 12");
        drop(log);

        let lines: Vec<String> = BufReader::new(File::open(&path).unwrap())
            .lines()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEntry = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first.event, AuditEventType::Transition);
        assert_eq!(first.from, Some(State::Passive));
        assert_eq!(first.to, State::Active);
    }

    #[test]
    fn test_disabled_journal_is_silent() {
        let mut log = AuditLog::disabled();
        log.record(AuditEventType::Fatal, None, State::Active, "dual active");
    }
}
