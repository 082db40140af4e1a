//! Snapshot model and the snapshot-store protocol.
//!
//! An entity asks the store for the newest snapshot matching a
//! [`SnapshotSelectionCriteria`] before replaying its journal, and may save
//! or delete snapshots during normal operation. The store itself runs as a
//! spawned task (see [`spawn_snapshot_store`]) that answers each
//! [`SnapshotRequest`] with a [`SnapshotResponse`] on the requester's
//! reply channel. Concrete stores live in [`crate::snapshot_store`].

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SnapshotError;
use crate::record::SequenceNr;

/// Identity of a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Identifier of the entity the snapshot belongs to.
    pub persistence_id: String,
    /// Sequence number of the last record folded into the snapshot.
    pub sequence_nr: SequenceNr,
    /// Milliseconds since the Unix epoch when the store saved the snapshot.
    /// `0` before the store has stamped it.
    #[serde(rename = "timestampMillis")]
    pub timestamp: u64,
}

impl SnapshotMetadata {
    /// Create metadata with an unset timestamp.
    pub fn new(persistence_id: impl Into<String>, sequence_nr: SequenceNr) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            sequence_nr,
            timestamp: 0,
        }
    }
}

/// Predicate used to pick the newest snapshot not exceeding both bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSelectionCriteria {
    /// Upper bound (inclusive) for the snapshot's sequence number.
    pub max_sequence_nr: SequenceNr,
    /// Upper bound (inclusive) for the snapshot's timestamp.
    pub max_timestamp: u64,
}

impl SnapshotSelectionCriteria {
    /// Selects the newest snapshot available.
    pub const LATEST: Self = Self {
        max_sequence_nr: u64::MAX,
        max_timestamp: u64::MAX,
    };

    /// Selects nothing: recovery replays the full journal.
    pub const NONE: Self = Self {
        max_sequence_nr: 0,
        max_timestamp: 0,
    };

    /// Whether the snapshot described by `metadata` satisfies both bounds.
    pub fn matches(&self, metadata: &SnapshotMetadata) -> bool {
        metadata.sequence_nr <= self.max_sequence_nr && metadata.timestamp <= self.max_timestamp
    }

    /// Tighten the sequence-number bound to `to_sequence_nr`.
    pub fn limit(self, to_sequence_nr: SequenceNr) -> Self {
        Self {
            max_sequence_nr: self.max_sequence_nr.min(to_sequence_nr),
            ..self
        }
    }
}

impl Default for SnapshotSelectionCriteria {
    fn default() -> Self {
        Self::LATEST
    }
}

/// A snapshot chosen by the store, with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedSnapshot<S> {
    /// Identity of the snapshot.
    pub metadata: SnapshotMetadata,
    /// The opaque snapshot payload.
    pub snapshot: S,
}

/// Offered to the entity's handler during recovery so it can restore its
/// in-memory state before the journal is replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotOffer<S> {
    /// Identity of the offered snapshot.
    pub metadata: SnapshotMetadata,
    /// The snapshot payload.
    pub snapshot: S,
}

/// Requests understood by a snapshot store.
#[derive(Debug, Clone)]
pub enum SnapshotRequest<S> {
    /// Load the newest snapshot matching `criteria`, capped at `to_sequence_nr`.
    LoadSnapshot {
        /// Entity whose snapshots are searched.
        persistence_id: String,
        /// Selection bounds.
        criteria: SnapshotSelectionCriteria,
        /// Recovery upper bound; echoed back in the result.
        to_sequence_nr: SequenceNr,
    },
    /// Save `snapshot`; the store stamps the timestamp.
    SaveSnapshot {
        /// Identity of the snapshot to save.
        metadata: SnapshotMetadata,
        /// The snapshot payload.
        snapshot: S,
    },
    /// Delete one snapshot. A zero timestamp matches any timestamp.
    DeleteSnapshot {
        /// Identity of the snapshot to delete.
        metadata: SnapshotMetadata,
    },
    /// Delete every snapshot of `persistence_id` matching `criteria`.
    DeleteSnapshots {
        /// Entity whose snapshots are deleted.
        persistence_id: String,
        /// Selection bounds.
        criteria: SnapshotSelectionCriteria,
    },
}

/// Replies produced by a snapshot store.
#[derive(Debug, Clone)]
pub enum SnapshotResponse<S> {
    /// Outcome of a load. Load failures are reported as "no snapshot".
    LoadSnapshotResult {
        /// The selected snapshot, if any.
        snapshot: Option<SelectedSnapshot<S>>,
        /// The recovery upper bound from the request.
        to_sequence_nr: SequenceNr,
    },
    /// The snapshot was saved.
    SaveSnapshotSuccess {
        /// Metadata with the timestamp the store assigned.
        metadata: SnapshotMetadata,
    },
    /// The snapshot could not be saved.
    SaveSnapshotFailure {
        /// Metadata of the snapshot that failed.
        metadata: SnapshotMetadata,
        /// Why the save failed.
        cause: SnapshotError,
    },
    /// A single snapshot was deleted.
    DeleteSnapshotSuccess {
        /// Identity of the deleted snapshot.
        metadata: SnapshotMetadata,
    },
    /// A single snapshot could not be deleted.
    DeleteSnapshotFailure {
        /// Identity of the snapshot.
        metadata: SnapshotMetadata,
        /// Why the delete failed.
        cause: SnapshotError,
    },
    /// Snapshots matching the criteria were deleted.
    DeleteSnapshotsSuccess {
        /// The criteria from the request.
        criteria: SnapshotSelectionCriteria,
    },
    /// Snapshots matching the criteria could not be deleted.
    DeleteSnapshotsFailure {
        /// The criteria from the request.
        criteria: SnapshotSelectionCriteria,
        /// Why the delete failed.
        cause: SnapshotError,
    },
}

/// Storage backend for snapshots.
///
/// Implementations are driven by [`process_snapshot_request`] and never see
/// protocol messages directly.
pub trait SnapshotStore<S>: Send + 'static {
    /// Return the newest snapshot of `persistence_id` that matches `criteria`.
    fn load(
        &mut self,
        persistence_id: &str,
        criteria: SnapshotSelectionCriteria,
    ) -> Result<Option<SelectedSnapshot<S>>, SnapshotError>;

    /// Store `snapshot` under `metadata`. The timestamp is already stamped.
    fn save(&mut self, metadata: &SnapshotMetadata, snapshot: &S) -> Result<(), SnapshotError>;

    /// Delete the snapshot identified by `metadata`. A zero timestamp
    /// matches any timestamp at that sequence number.
    fn delete(&mut self, metadata: &SnapshotMetadata) -> Result<(), SnapshotError>;

    /// Delete every snapshot of `persistence_id` matching `criteria`.
    fn delete_matching(
        &mut self,
        persistence_id: &str,
        criteria: SnapshotSelectionCriteria,
    ) -> Result<(), SnapshotError>;
}

/// Milliseconds since the Unix epoch, saturating at zero for clocks set
/// before 1970.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Answer one request against `store`.
///
/// Saves are stamped with the current wall-clock time. A failed load is
/// logged and reported as "no snapshot", so recovery falls back to a full
/// journal replay instead of stalling.
pub fn process_snapshot_request<S, T>(store: &mut T, request: SnapshotRequest<S>) -> SnapshotResponse<S>
where
    T: SnapshotStore<S> + ?Sized,
{
    match request {
        SnapshotRequest::LoadSnapshot {
            persistence_id,
            criteria,
            to_sequence_nr,
        } => {
            let snapshot = match store.load(&persistence_id, criteria.limit(to_sequence_nr)) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(
                        persistence_id = %persistence_id,
                        error = %e,
                        "snapshot load failed; recovering without snapshot"
                    );
                    None
                }
            };
            SnapshotResponse::LoadSnapshotResult {
                snapshot,
                to_sequence_nr,
            }
        }
        SnapshotRequest::SaveSnapshot {
            mut metadata,
            snapshot,
        } => {
            metadata.timestamp = now_millis();
            match store.save(&metadata, &snapshot) {
                Ok(()) => SnapshotResponse::SaveSnapshotSuccess { metadata },
                Err(cause) => SnapshotResponse::SaveSnapshotFailure { metadata, cause },
            }
        }
        SnapshotRequest::DeleteSnapshot { metadata } => match store.delete(&metadata) {
            Ok(()) => SnapshotResponse::DeleteSnapshotSuccess { metadata },
            Err(cause) => SnapshotResponse::DeleteSnapshotFailure { metadata, cause },
        },
        SnapshotRequest::DeleteSnapshots {
            persistence_id,
            criteria,
        } => match store.delete_matching(&persistence_id, criteria) {
            Ok(()) => SnapshotResponse::DeleteSnapshotsSuccess { criteria },
            Err(cause) => SnapshotResponse::DeleteSnapshotsFailure { criteria, cause },
        },
    }
}

/// A request paired with the channel its response goes to.
type SnapshotEnvelope<S> = (SnapshotRequest<S>, mpsc::UnboundedSender<SnapshotResponse<S>>);

/// Cloneable address of a spawned snapshot store task.
#[derive(Debug)]
pub struct SnapshotStoreRef<S> {
    sender: mpsc::UnboundedSender<SnapshotEnvelope<S>>,
}

impl<S> Clone for SnapshotStoreRef<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S: Send + 'static> SnapshotStoreRef<S> {
    /// Send `request`; the response arrives on `reply`.
    ///
    /// Returns `false` if the store task has stopped.
    pub fn tell(
        &self,
        request: SnapshotRequest<S>,
        reply: mpsc::UnboundedSender<SnapshotResponse<S>>,
    ) -> bool {
        self.sender.send((request, reply)).is_ok()
    }
}

/// Run `store` on a tokio task and return its address.
///
/// The task exits once every [`SnapshotStoreRef`] has been dropped.
pub fn spawn_snapshot_store<S, T>(mut store: T) -> SnapshotStoreRef<S>
where
    S: Send + 'static,
    T: SnapshotStore<S>,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<SnapshotEnvelope<S>>();
    tokio::spawn(async move {
        while let Some((request, reply)) = rx.recv().await {
            let response = process_snapshot_request(&mut store, request);
            // The requester may have stopped; nothing to do then.
            let _ = reply.send(response);
        }
    });
    SnapshotStoreRef { sender: tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot_store::InMemorySnapshotStore;

    fn meta(seq: u64, ts: u64) -> SnapshotMetadata {
        SnapshotMetadata {
            persistence_id: "p-1".into(),
            sequence_nr: seq,
            timestamp: ts,
        }
    }

    #[test]
    fn latest_matches_everything() {
        assert!(SnapshotSelectionCriteria::LATEST.matches(&meta(u64::MAX, u64::MAX)));
        assert!(SnapshotSelectionCriteria::LATEST.matches(&meta(0, 0)));
    }

    #[test]
    fn none_matches_nothing_persisted() {
        assert!(!SnapshotSelectionCriteria::NONE.matches(&meta(1, 1)));
    }

    #[test]
    fn matches_requires_both_bounds() {
        let criteria = SnapshotSelectionCriteria {
            max_sequence_nr: 10,
            max_timestamp: 100,
        };
        assert!(criteria.matches(&meta(10, 100)));
        assert!(!criteria.matches(&meta(11, 50)));
        assert!(!criteria.matches(&meta(5, 101)));
    }

    #[test]
    fn limit_only_tightens() {
        let limited = SnapshotSelectionCriteria::LATEST.limit(7);
        assert_eq!(limited.max_sequence_nr, 7);
        assert_eq!(limited.max_timestamp, u64::MAX);

        let unchanged = SnapshotSelectionCriteria {
            max_sequence_nr: 3,
            max_timestamp: 9,
        }
        .limit(7);
        assert_eq!(unchanged.max_sequence_nr, 3);
    }

    #[test]
    fn metadata_uses_wire_field_names() {
        let value = serde_json::to_value(meta(5, 42)).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"persistenceId": "p-1", "sequenceNr": 5, "timestampMillis": 42})
        );
    }

    #[test]
    fn save_stamps_timestamp() {
        let mut store = InMemorySnapshotStore::<u32>::default();
        let response = process_snapshot_request(
            &mut store,
            SnapshotRequest::SaveSnapshot {
                metadata: SnapshotMetadata::new("p-1", 3),
                snapshot: 30,
            },
        );
        match response {
            SnapshotResponse::SaveSnapshotSuccess { metadata } => {
                assert_eq!(metadata.sequence_nr, 3);
                assert!(metadata.timestamp > 0, "store must stamp the timestamp");
            }
            other => panic!("expected SaveSnapshotSuccess, got {other:?}"),
        }
    }

    #[test]
    fn load_is_capped_by_to_sequence_nr() {
        let mut store = InMemorySnapshotStore::<u32>::default();
        for seq in [2, 5, 9] {
            store
                .save(&meta(seq, seq), &(seq as u32 * 10))
                .expect("save should succeed");
        }

        let response = process_snapshot_request(
            &mut store,
            SnapshotRequest::LoadSnapshot {
                persistence_id: "p-1".into(),
                criteria: SnapshotSelectionCriteria::LATEST,
                to_sequence_nr: 6,
            },
        );
        match response {
            SnapshotResponse::LoadSnapshotResult {
                snapshot: Some(selected),
                to_sequence_nr,
            } => {
                assert_eq!(to_sequence_nr, 6);
                assert_eq!(selected.metadata.sequence_nr, 5);
                assert_eq!(selected.snapshot, 50);
            }
            other => panic!("expected a selected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawned_store_answers_on_reply_channel() {
        let store_ref = spawn_snapshot_store(InMemorySnapshotStore::<String>::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(store_ref.tell(
            SnapshotRequest::SaveSnapshot {
                metadata: SnapshotMetadata::new("p-9", 1),
                snapshot: "state".to_string(),
            },
            tx.clone(),
        ));
        assert!(matches!(
            rx.recv().await,
            Some(SnapshotResponse::SaveSnapshotSuccess { .. })
        ));

        store_ref.tell(
            SnapshotRequest::LoadSnapshot {
                persistence_id: "p-9".into(),
                criteria: SnapshotSelectionCriteria::LATEST,
                to_sequence_nr: u64::MAX,
            },
            tx,
        );
        match rx.recv().await {
            Some(SnapshotResponse::LoadSnapshotResult {
                snapshot: Some(selected),
                ..
            }) => assert_eq!(selected.snapshot, "state"),
            other => panic!("expected loaded snapshot, got {other:?}"),
        }
    }
}
