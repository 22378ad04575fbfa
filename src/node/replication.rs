//! Replica state persistence and transfer
//!
//! The accepting replica persists four independent artifacts after every
//! loop cycle in which its state changed, then hands them to a
//! [`ReplicaTransport`] for delivery to the peer's storage. A replica taking
//! over loads whatever artifacts it finds; each one that is missing or
//! corrupt falls back to empty on its own.
//!
//! Artifact format: `[MAGIC (8)][CRC32 of payload, LE (4)][bincode payload]`.
//! Artifacts are written to a temp file and renamed into place.

use crate::common::wire::{AverageRecord, Reading, SensorId};
use crate::common::{crc32, Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Averages,
    Cursors,
    Window,
    Sequence,
}

impl Artifact {
    pub const ALL: [Artifact; 4] = [
        Artifact::Averages,
        Artifact::Cursors,
        Artifact::Window,
        Artifact::Sequence,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Artifact::Averages => "averages.snap",
            Artifact::Cursors => "cursors.snap",
            Artifact::Window => "window.snap",
            Artifact::Sequence => "sequence.snap",
        }
    }

    fn magic(self) -> &'static [u8; 8] {
        match self {
            Artifact::Averages => b"TSTAVG01",
            Artifact::Cursors => b"TSTCUR01",
            Artifact::Window => b"TSTWIN01",
            Artifact::Sequence => b"TSTSEQ01",
        }
    }
}

/// Everything a replica needs to resume serving.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub averages: BTreeMap<u64, AverageRecord>,
    pub cursors: BTreeMap<SensorId, Option<u64>>,
    pub window: Vec<Reading>,
    pub next_sequence: u64,
}

impl ReplicaSnapshot {
    /// Raise `next_sequence` above every restored sequence, so a stale or
    /// missing counter artifact cannot cause sequence reuse.
    pub fn reconcile(&mut self) {
        let floor = self
            .averages
            .keys()
            .copied()
            .chain(self.cursors.values().copied().flatten())
            .max()
            .map(|s| s + 1)
            .unwrap_or(0);
        if self.next_sequence < floor {
            tracing::warn!(
                "Sequence counter {} behind restored state, advancing to {}",
                self.next_sequence,
                floor
            );
            self.next_sequence = floor;
        }
    }
}

/// Result of a restore, including which artifacts fell back to empty.
#[derive(Debug, Clone, Default)]
pub struct Restored {
    pub snapshot: ReplicaSnapshot,
    pub fallbacks: Vec<Artifact>,
}

/// Out-of-process delivery of artifacts to the peer's storage.
pub trait ReplicaTransport: Send {
    fn name(&self) -> &str;
    fn ship(&mut self, files: &[PathBuf]) -> Result<()>;
}

/// Both replicas share one storage location; nothing to ship.
pub struct LocalOnly;

impl ReplicaTransport for LocalOnly {
    fn name(&self) -> &str {
        "local"
    }

    fn ship(&mut self, _files: &[PathBuf]) -> Result<()> {
        Ok(())
    }
}

/// Copies artifacts into the peer's data directory (e.g. a shared mount).
pub struct DirectoryMirror {
    target: PathBuf,
}

impl DirectoryMirror {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl ReplicaTransport for DirectoryMirror {
    fn name(&self) -> &str {
        "mirror"
    }

    fn ship(&mut self, files: &[PathBuf]) -> Result<()> {
        fs::create_dir_all(&self.target)
            .map_err(|e| Error::Transport(format!("{}: {}", self.target.display(), e)))?;
        for file in files {
            let name = file
                .file_name()
                .ok_or_else(|| Error::Transport(format!("not a file: {}", file.display())))?;
            let dest = self.target.join(name);
            let tmp = dest.with_extension("mirror.tmp");
            fs::copy(file, &tmp)
                .and_then(|_| fs::rename(&tmp, &dest))
                .map_err(|e| Error::Transport(format!("{}: {}", dest.display(), e)))?;
        }
        Ok(())
    }
}

pub struct ReplicationStore {
    dir: PathBuf,
    transport: Box<dyn ReplicaTransport>,
}

impl ReplicationStore {
    pub fn open(dir: impl AsRef<Path>, transport: Box<dyn ReplicaTransport>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, transport })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, artifact: Artifact) -> PathBuf {
        self.dir.join(artifact.file_name())
    }

    /// Write all four artifacts, then ship them to the peer.
    pub fn persist(&mut self, snapshot: &ReplicaSnapshot) -> Result<()> {
        let files = vec![
            self.write_artifact(Artifact::Averages, &snapshot.averages)?,
            self.write_artifact(Artifact::Cursors, &snapshot.cursors)?,
            self.write_artifact(Artifact::Window, &snapshot.window)?,
            self.write_artifact(Artifact::Sequence, &snapshot.next_sequence)?,
        ];
        self.transport.ship(&files)
    }

    /// Load every artifact independently; failures fall back to empty.
    pub fn load(&self) -> Restored {
        let mut fallbacks = Vec::new();
        let snapshot = ReplicaSnapshot {
            averages: self.load_or_default(Artifact::Averages, &mut fallbacks),
            cursors: self.load_or_default(Artifact::Cursors, &mut fallbacks),
            window: self.load_or_default(Artifact::Window, &mut fallbacks),
            next_sequence: self.load_or_default(Artifact::Sequence, &mut fallbacks),
        };
        let mut restored = Restored {
            snapshot,
            fallbacks,
        };
        restored.snapshot.reconcile();
        restored
    }

    fn load_or_default<T: DeserializeOwned + Default>(
        &self,
        artifact: Artifact,
        fallbacks: &mut Vec<Artifact>,
    ) -> T {
        match self.read_artifact(artifact) {
            Ok(Some(value)) => value,
            Ok(None) => {
                tracing::warn!(
                    "No {} artifact in {}, starting empty",
                    artifact.file_name(),
                    self.dir.display()
                );
                fallbacks.push(artifact);
                T::default()
            }
            Err(e) => {
                tracing::warn!(
                    "Unreadable {} artifact ({}), starting empty",
                    artifact.file_name(),
                    e
                );
                fallbacks.push(artifact);
                T::default()
            }
        }
    }

    /// Read one artifact. `Ok(None)` if it does not exist.
    pub fn read_artifact<T: DeserializeOwned>(&self, artifact: Artifact) -> Result<Option<T>> {
        let path = self.artifact_path(artifact);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() < HEADER_LEN {
            return Err(Error::Corrupted(format!("{} truncated", path.display())));
        }
        let (header, payload) = bytes.split_at(HEADER_LEN);
        if &header[..8] != artifact.magic() {
            return Err(Error::Corrupted(format!(
                "{} has invalid magic",
                path.display()
            )));
        }
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&header[8..]);
        let expected = u32::from_le_bytes(crc_bytes);
        let actual = crc32(payload);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        Ok(Some(bincode::deserialize(payload)?))
    }

    /// Write one artifact atomically and return its path.
    pub fn write_artifact<T: Serialize>(&self, artifact: Artifact, value: &T) -> Result<PathBuf> {
        let payload = bincode::serialize(value)?;
        let path = self.artifact_path(artifact);
        let tmp = path.with_extension("tmp");

        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(artifact.magic())?;
            writer.write_all(&crc32(&payload).to_le_bytes())?;
            writer.write_all(&payload)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> ReplicaSnapshot {
        let mut snap = ReplicaSnapshot::default();
        for seq in 3..6 {
            snap.averages.insert(
                seq,
                AverageRecord {
                    sequence: seq,
                    value: 80 + seq as i64,
                    timestamp: 1_000 + seq,
                },
            );
        }
        snap.cursors.insert(1, Some(3));
        snap.cursors.insert(2, None);
        snap.window.push(Reading::speed(1, 17, 88, 1_005));
        snap.next_sequence = 6;
        snap
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = ReplicationStore::open(dir.path(), Box::new(LocalOnly)).unwrap();
        let snap = sample();
        store.persist(&snap).unwrap();

        let restored = store.load();
        assert!(restored.fallbacks.is_empty());
        assert_eq!(restored.snapshot, snap);
    }

    #[test]
    fn test_missing_snapshot_starts_empty() {
        let dir = tempdir().unwrap();
        let store = ReplicationStore::open(dir.path().join("fresh"), Box::new(LocalOnly)).unwrap();
        let restored = store.load();
        assert_eq!(restored.snapshot, ReplicaSnapshot::default());
        assert_eq!(restored.fallbacks.len(), 4);
    }

    #[test]
    fn test_corrupt_artifact_falls_back_alone() {
        let dir = tempdir().unwrap();
        let mut store = ReplicationStore::open(dir.path(), Box::new(LocalOnly)).unwrap();
        store.persist(&sample()).unwrap();

        let path = store.artifact_path(Artifact::Window);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            store.read_artifact::<Vec<Reading>>(Artifact::Window),
            Err(Error::ChecksumMismatch { .. })
        ));
        let restored = store.load();
        assert_eq!(restored.fallbacks, vec![Artifact::Window]);
        assert!(restored.snapshot.window.is_empty());
        assert_eq!(restored.snapshot.averages.len(), 3);
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let dir = tempdir().unwrap();
        let store = ReplicationStore::open(dir.path(), Box::new(LocalOnly)).unwrap();
        store.write_artifact(Artifact::Cursors, &7u64).unwrap();
        fs::rename(
            store.artifact_path(Artifact::Cursors),
            store.artifact_path(Artifact::Sequence),
        )
        .unwrap();
        assert!(matches!(
            store.read_artifact::<u64>(Artifact::Sequence),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_lost_counter_reconciled() {
        let dir = tempdir().unwrap();
        let mut store = ReplicationStore::open(dir.path(), Box::new(LocalOnly)).unwrap();
        store.persist(&sample()).unwrap();
        fs::remove_file(store.artifact_path(Artifact::Sequence)).unwrap();

        let restored = store.load();
        assert_eq!(restored.fallbacks, vec![Artifact::Sequence]);
        assert_eq!(restored.snapshot.next_sequence, 6);
    }

    #[test]
    fn test_mirror_delivers_to_peer_dir() {
        let local = tempdir().unwrap();
        let peer = tempdir().unwrap();
        let mut store = ReplicationStore::open(
            local.path(),
            Box::new(DirectoryMirror::new(peer.path().join("replica"))),
        )
        .unwrap();
        store.persist(&sample()).unwrap();

        let peer_store =
            ReplicationStore::open(peer.path().join("replica"), Box::new(LocalOnly)).unwrap();
        let restored = peer_store.load();
        assert!(restored.fallbacks.is_empty());
        assert_eq!(restored.snapshot, sample());
    }
}
