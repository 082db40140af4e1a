//! Event-sourced entities on tokio: snapshot-plus-replay recovery, batched
//! journal writes, and at-least-once delivery.

mod actor;
pub use actor::{ProcessorBuilder, ProcessorHandle, ProcessorStatus, SupervisorStrategy};
mod batch;
pub use batch::WriteBatcher;
mod delivery;
mod error;
mod journal;
mod processor;
mod record;
mod recovery;
mod router;
mod snapshot;
mod snapshot_store;

pub use delivery::{
    DeliveryConfig, DeliveryId, DeliveryLedger, DeliverySnapshot, Outgoing, UnconfirmedDelivery,
    UnconfirmedWarning,
};
pub use error::{DeliveryError, HandleError, JournalError, ProcessorError, SnapshotError};
pub use journal::{
    InMemoryJournal, JournalBackend, JournalRef, JournalRequest, JournalResponse,
    process_journal_request, spawn_journal,
};
pub use processor::{
    Context, Effect, Envelope, Eventsourced, PersistenceConfig, Processor, Received, Restart,
};
pub use record::{ActorPath, PersistenceFailure, PersistentRecord, SequenceNr, WriteItem};
pub use recovery::Recover;
pub use router::Router;
pub use snapshot::{
    SelectedSnapshot, SnapshotMetadata, SnapshotOffer, SnapshotRequest, SnapshotResponse,
    SnapshotSelectionCriteria, SnapshotStore, SnapshotStoreRef, process_snapshot_request,
    spawn_snapshot_store,
};
pub use snapshot_store::{InMemorySnapshotStore, LocalSnapshotStore};
