//! Built-in [`SnapshotStore`] backends: in-memory and local JSON files.

use std::collections::HashMap;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};

use crate::error::SnapshotError;
use crate::snapshot::{SelectedSnapshot, SnapshotMetadata, SnapshotSelectionCriteria, SnapshotStore};

/// Snapshots kept in process memory. Useful for tests and ephemeral entities.
#[derive(Debug)]
pub struct InMemorySnapshotStore<S> {
    snapshots: HashMap<String, Vec<SelectedSnapshot<S>>>,
}

impl<S> Default for InMemorySnapshotStore<S> {
    fn default() -> Self {
        Self {
            snapshots: HashMap::new(),
        }
    }
}

impl<S> InMemorySnapshotStore<S> {
    /// Number of snapshots stored for `persistence_id`.
    pub fn count(&self, persistence_id: &str) -> usize {
        self.snapshots.get(persistence_id).map_or(0, Vec::len)
    }
}

impl<S: Clone + Send + 'static> SnapshotStore<S> for InMemorySnapshotStore<S> {
    fn load(
        &mut self,
        persistence_id: &str,
        criteria: SnapshotSelectionCriteria,
    ) -> Result<Option<SelectedSnapshot<S>>, SnapshotError> {
        let newest = self.snapshots.get(persistence_id).and_then(|all| {
            all.iter()
                .filter(|s| criteria.matches(&s.metadata))
                .max_by_key(|s| (s.metadata.sequence_nr, s.metadata.timestamp))
        });
        Ok(newest.cloned())
    }

    fn save(&mut self, metadata: &SnapshotMetadata, snapshot: &S) -> Result<(), SnapshotError> {
        require_persistence_id(metadata)?;
        self.snapshots
            .entry(metadata.persistence_id.clone())
            .or_default()
            .push(SelectedSnapshot {
                metadata: metadata.clone(),
                snapshot: snapshot.clone(),
            });
        Ok(())
    }

    fn delete(&mut self, metadata: &SnapshotMetadata) -> Result<(), SnapshotError> {
        if let Some(all) = self.snapshots.get_mut(&metadata.persistence_id) {
            all.retain(|s| !same_snapshot(&s.metadata, metadata));
        }
        Ok(())
    }

    fn delete_matching(
        &mut self,
        persistence_id: &str,
        criteria: SnapshotSelectionCriteria,
    ) -> Result<(), SnapshotError> {
        if let Some(all) = self.snapshots.get_mut(persistence_id) {
            all.retain(|s| !criteria.matches(&s.metadata));
        }
        Ok(())
    }
}

/// Snapshots must belong to a named entity.
fn require_persistence_id(metadata: &SnapshotMetadata) -> Result<(), SnapshotError> {
    if metadata.persistence_id.is_empty() {
        return Err(SnapshotError::Rejected("empty persistence id".into()));
    }
    Ok(())
}

/// Whether `stored` is the snapshot `target` names. A zero timestamp in
/// `target` matches any timestamp.
fn same_snapshot(stored: &SnapshotMetadata, target: &SnapshotMetadata) -> bool {
    stored.sequence_nr == target.sequence_nr
        && (target.timestamp == 0 || stored.timestamp == target.timestamp)
}

/// Snapshots stored as JSON files under a base directory.
///
/// Layout:
/// ```text
/// <base_dir>/
///     snapshots/
///         <escaped persistence_id>/
///             snapshot-<sequence_nr>-<timestamp>.json
/// ```
///
/// Writes are atomic via a temp-rename so a crash mid-write never leaves a
/// truncated snapshot behind. A file that fails to deserialize is logged
/// and skipped, and the next older snapshot is tried instead.
#[derive(Debug, Clone)]
pub struct LocalSnapshotStore<S> {
    base_dir: PathBuf,
    _marker: PhantomData<fn() -> S>,
}

impl<S> LocalSnapshotStore<S> {
    /// Create a store rooted at `base_dir`. Directories are created lazily.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            _marker: PhantomData,
        }
    }

    /// Directory holding every snapshot of `persistence_id`.
    ///
    /// # Returns
    ///
    /// `<base_dir>/snapshots/<escaped persistence_id>`
    pub fn snapshot_dir(&self, persistence_id: &str) -> PathBuf {
        self.base_dir
            .join("snapshots")
            .join(escape_persistence_id(persistence_id))
    }

    /// Path of the file holding the snapshot described by `metadata`.
    pub fn snapshot_path(&self, metadata: &SnapshotMetadata) -> PathBuf {
        self.snapshot_dir(&metadata.persistence_id).join(format!(
            "snapshot-{}-{}.json",
            metadata.sequence_nr, metadata.timestamp
        ))
    }

    /// List the metadata of every snapshot file of `persistence_id`,
    /// newest first.
    fn list(&self, persistence_id: &str) -> io::Result<Vec<SnapshotMetadata>> {
        let dir = self.snapshot_dir(persistence_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some((sequence_nr, timestamp)) = name.to_str().and_then(parse_file_name) {
                found.push(SnapshotMetadata {
                    persistence_id: persistence_id.to_owned(),
                    sequence_nr,
                    timestamp,
                });
            }
        }
        found.sort_by(|a, b| {
            (b.sequence_nr, b.timestamp).cmp(&(a.sequence_nr, a.timestamp))
        });
        Ok(found)
    }
}

impl<S> SnapshotStore<S> for LocalSnapshotStore<S>
where
    S: Serialize + DeserializeOwned + Send + 'static,
{
    fn load(
        &mut self,
        persistence_id: &str,
        criteria: SnapshotSelectionCriteria,
    ) -> Result<Option<SelectedSnapshot<S>>, SnapshotError> {
        for metadata in self.list(persistence_id)? {
            if !criteria.matches(&metadata) {
                continue;
            }
            let path = self.snapshot_path(&metadata);
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                // Deleted between listing and reading.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<S>(&bytes) {
                Ok(snapshot) => return Ok(Some(SelectedSnapshot { metadata, snapshot })),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to deserialize snapshot; trying an older one"
                    );
                }
            }
        }
        Ok(None)
    }

    fn save(&mut self, metadata: &SnapshotMetadata, snapshot: &S) -> Result<(), SnapshotError> {
        require_persistence_id(metadata)?;
        let dir = self.snapshot_dir(&metadata.persistence_id);
        std::fs::create_dir_all(&dir)?;

        let path = self.snapshot_path(metadata);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(snapshot)?;
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn delete(&mut self, metadata: &SnapshotMetadata) -> Result<(), SnapshotError> {
        for stored in self.list(&metadata.persistence_id)? {
            if same_snapshot(&stored, metadata) {
                remove_if_present(&self.snapshot_path(&stored))?;
            }
        }
        Ok(())
    }

    fn delete_matching(
        &mut self,
        persistence_id: &str,
        criteria: SnapshotSelectionCriteria,
    ) -> Result<(), SnapshotError> {
        for stored in self.list(persistence_id)? {
            if criteria.matches(&stored) {
                remove_if_present(&self.snapshot_path(&stored))?;
            }
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Parse `snapshot-<seq>-<ts>.json` into `(seq, ts)`.
fn parse_file_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_prefix("snapshot-")?.strip_suffix(".json")?;
    let (seq, ts) = stem.split_once('-')?;
    Some((seq.parse().ok()?, ts.parse().ok()?))
}

/// Make a persistence id safe to use as a single directory name.
///
/// ASCII alphanumerics, `-`, `_` and `.` pass through; every other byte is
/// percent-encoded, so distinct ids never collide. The empty id maps to a
/// lone `%`, which no other id produces.
fn escape_persistence_id(persistence_id: &str) -> String {
    if persistence_id.is_empty() {
        return "%".to_owned();
    }
    let mut out = String::with_capacity(persistence_id.len());
    for byte in persistence_id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            // A leading dot would make the directory hidden or `..`.
            b'.' if !out.is_empty() => out.push('.'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pid: &str, seq: u64, ts: u64) -> SnapshotMetadata {
        SnapshotMetadata {
            persistence_id: pid.into(),
            sequence_nr: seq,
            timestamp: ts,
        }
    }

    #[test]
    fn in_memory_picks_newest_matching() {
        let mut store = InMemorySnapshotStore::<u32>::default();
        store.save(&meta("p", 1, 10), &1).expect("save");
        store.save(&meta("p", 4, 40), &4).expect("save");
        store.save(&meta("p", 8, 80), &8).expect("save");

        let criteria = SnapshotSelectionCriteria {
            max_sequence_nr: u64::MAX,
            max_timestamp: 50,
        };
        let selected = store.load("p", criteria).expect("load").expect("some");
        assert_eq!(selected.snapshot, 4);
        assert!(store.load("other", criteria).expect("load").is_none());
    }

    #[test]
    fn in_memory_delete_with_zero_timestamp_matches_any() {
        let mut store = InMemorySnapshotStore::<u32>::default();
        store.save(&meta("p", 3, 33), &3).expect("save");
        store.delete(&meta("p", 3, 0)).expect("delete");
        assert_eq!(store.count("p"), 0);
    }

    #[test]
    fn in_memory_delete_matching_keeps_newer() {
        let mut store = InMemorySnapshotStore::<u32>::default();
        for seq in 1..=4 {
            store.save(&meta("p", seq, seq), &(seq as u32)).expect("save");
        }
        store
            .delete_matching("p", SnapshotSelectionCriteria::LATEST.limit(2))
            .expect("delete");
        assert_eq!(store.count("p"), 2);
    }

    #[test]
    fn local_snapshot_path_is_escaped() {
        let store = LocalSnapshotStore::<u32>::new("/data/app");
        let path = store.snapshot_path(&meta("orders/o-1", 7, 99));
        assert_eq!(
            path,
            PathBuf::from("/data/app/snapshots/orders%2Fo-1/snapshot-7-99.json")
        );
    }

    #[test]
    fn escape_never_yields_dot_dir() {
        assert_eq!(escape_persistence_id(".."), "%2E.");
        assert_eq!(escape_persistence_id("a.b"), "a.b");
    }

    #[test]
    fn empty_id_gets_its_own_directory() {
        let store = LocalSnapshotStore::<u32>::new("/data/app");
        assert_eq!(store.snapshot_dir(""), PathBuf::from("/data/app/snapshots/%"));
        assert_ne!(escape_persistence_id(""), escape_persistence_id("%"));
    }

    #[test]
    fn saving_without_persistence_id_is_rejected() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut local = LocalSnapshotStore::<u32>::new(dir.path());
        let err = local.save(&meta("", 1, 1), &5).expect_err("empty id must be rejected");
        assert!(matches!(err, SnapshotError::Rejected(_)));
        assert!(!dir.path().join("snapshots").exists(), "nothing is written");

        let mut memory = InMemorySnapshotStore::<u32>::default();
        let err = memory.save(&meta("", 1, 1), &5).expect_err("empty id must be rejected");
        assert!(matches!(err, SnapshotError::Rejected(_)));
        assert_eq!(memory.count(""), 0);
    }

    #[test]
    fn local_save_then_load_roundtrips() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut store = LocalSnapshotStore::<Vec<String>>::new(dir.path());
        let state = vec!["a".to_string(), "b".to_string()];

        store.save(&meta("p-1", 7, 1000), &state).expect("save should succeed");

        let loaded = store
            .load("p-1", SnapshotSelectionCriteria::LATEST)
            .expect("load should succeed")
            .expect("snapshot should exist");
        assert_eq!(loaded.snapshot, state);
        assert_eq!(loaded.metadata, meta("p-1", 7, 1000));
    }

    #[test]
    fn local_load_nonexistent_returns_none() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut store = LocalSnapshotStore::<u32>::new(dir.path());
        let loaded = store
            .load("nobody", SnapshotSelectionCriteria::LATEST)
            .expect("load should succeed");
        assert!(loaded.is_none());
    }

    #[test]
    fn local_corrupt_newest_falls_back_to_older() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut store = LocalSnapshotStore::<u32>::new(dir.path());
        store.save(&meta("p", 2, 20), &2).expect("save");
        store.save(&meta("p", 5, 50), &5).expect("save");
        std::fs::write(store.snapshot_path(&meta("p", 5, 50)), b"not json!!")
            .expect("write corrupt file");

        let loaded = store
            .load("p", SnapshotSelectionCriteria::LATEST)
            .expect("load should succeed (not Err)")
            .expect("older snapshot should be used");
        assert_eq!(loaded.snapshot, 2);
    }

    #[test]
    fn local_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut store = LocalSnapshotStore::<u32>::new(dir.path());
        let metadata = meta("p", 3, 30);
        store.save(&metadata, &10).expect("save should succeed");

        let final_path = store.snapshot_path(&metadata);
        assert!(final_path.exists(), "final snapshot file should exist");
        assert!(
            !final_path.with_extension("json.tmp").exists(),
            "temp file should not exist after successful save"
        );
    }

    #[test]
    fn local_delete_matching_removes_files() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut store = LocalSnapshotStore::<u32>::new(dir.path());
        store.save(&meta("p", 1, 10), &1).expect("save");
        store.save(&meta("p", 2, 20), &2).expect("save");

        store
            .delete_matching("p", SnapshotSelectionCriteria::LATEST.limit(1))
            .expect("delete");
        let loaded = store
            .load("p", SnapshotSelectionCriteria::LATEST)
            .expect("load")
            .expect("newer snapshot remains");
        assert_eq!(loaded.metadata.sequence_nr, 2);

        store.delete(&meta("p", 2, 0)).expect("delete");
        assert!(
            store
                .load("p", SnapshotSelectionCriteria::LATEST)
                .expect("load")
                .is_none()
        );
    }
}
