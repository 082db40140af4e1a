//! Crate-level error types for delivery, journal, snapshot, and entity faults.

use std::sync::Arc;

use crate::record::SequenceNr;

/// Error returned by [`Context::deliver`](crate::Context::deliver) when the
/// delivery ledger is full.
///
/// The ledger is left untouched. Callers must shed load, raise
/// [`DeliveryConfig::max_unconfirmed_messages`](crate::DeliveryConfig), or
/// drop the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The ledger already holds the configured maximum of unconfirmed entries.
    #[error("too many unconfirmed deliveries: limit of {max} reached")]
    MaxUnconfirmedExceeded {
        /// The configured limit that was hit.
        max: usize,
    },
}

/// Cause attached to a failed journal write, replay, or deletion.
///
/// `Clone` because one batch failure fans out into a per-record
/// [`PersistenceFailure`](crate::PersistenceFailure) for every record in
/// the batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JournalError {
    /// The backend rejected a batch write.
    #[error("journal write failed: {0}")]
    Write(String),

    /// The backend could not replay the requested range.
    #[error("journal replay failed: {0}")]
    Replay(String),

    /// The backend could not delete the requested range.
    #[error("journal delete failed: {0}")]
    Delete(String),

    /// An underlying storage-layer I/O error occurred.
    #[error("journal I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for JournalError {
    fn from(err: std::io::Error) -> Self {
        JournalError::Io(Arc::new(err))
    }
}

/// Error returned by a [`SnapshotStore`](crate::SnapshotStore).
#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapshotError {
    /// Disk I/O failure while reading or writing snapshot files.
    #[error("snapshot I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The snapshot could not be encoded.
    #[error("snapshot encoding failed: {0}")]
    Encode(String),

    /// The store refused the operation.
    #[error("snapshot store rejected request: {0}")]
    Rejected(String),
}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        SnapshotError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Encode(err.to_string())
    }
}

/// Fault surfaced by the eventsourced core to its supervisor.
///
/// Generic over `F`, the fault type of the entity's message handler.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError<F: std::error::Error + Send + Sync + 'static> {
    /// The handler failed while processing a live message.
    #[error(transparent)]
    Handler(F),

    /// The handler failed on a replayed record. Raised only once the
    /// replay stream has drained, when the offending record is redelivered.
    #[error("replay failed at sequence number {sequence_nr}: {fault}")]
    Replay {
        /// Sequence number of the record the handler rejected.
        sequence_nr: SequenceNr,
        /// The fault captured when the record was first replayed.
        #[source]
        fault: F,
    },
}

impl<F: std::error::Error + Send + Sync + 'static> ProcessorError<F> {
    /// Returns the underlying handler fault.
    pub fn fault(&self) -> &F {
        match self {
            ProcessorError::Handler(fault) | ProcessorError::Replay { fault, .. } => fault,
        }
    }
}

/// Error returned by [`ProcessorHandle`](crate::ProcessorHandle) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    /// The entity task has stopped, so nothing more can be sent to it.
    #[error("processor actor is no longer running")]
    ActorGone,
}
