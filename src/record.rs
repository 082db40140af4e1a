//! Persistent records and the items that travel through a journal write batch.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::JournalError;

/// Position of a record within one entity's log. Starts at 1; 0 means
/// "nothing persisted yet".
pub type SequenceNr = u64;

/// Logical address of an actor, used as the destination of deliveries and
/// as the optional sender of a record.
///
/// Serialized as a bare string so ledger snapshots stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorPath(String);

impl ActorPath {
    /// Create a path from any string-like value (e.g. `"/user/billing"`).
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Returns the path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for ActorPath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

/// One immutable unit of persisted entity state.
///
/// Identified by `(persistence_id, sequence_nr)`. Records are never
/// mutated in place: [`mark_deleted`](PersistentRecord::mark_deleted)
/// returns a new value.
///
/// Serialized as
/// `{persistenceId, sequenceNr, payload, manifest, isDeleted, writerToken}`.
/// The sender is process-local routing information and is not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentRecord<E> {
    /// Identifier of the entity that owns this record.
    pub persistence_id: String,
    /// Strictly increasing, never reused position in the entity's log.
    pub sequence_nr: SequenceNr,
    /// The application event.
    pub payload: E,
    /// Type hint for the payload, empty when unused.
    #[serde(default)]
    pub manifest: String,
    /// Whether the record was logically deleted.
    #[serde(default)]
    pub is_deleted: bool,
    /// The actor that submitted the payload, if known.
    #[serde(skip)]
    pub sender: Option<ActorPath>,
    /// Token of the entity incarnation that wrote the record.
    #[serde(default)]
    pub writer_token: String,
}

impl<E> PersistentRecord<E> {
    /// Create a record with no manifest, sender, or writer token.
    pub fn new(persistence_id: impl Into<String>, sequence_nr: SequenceNr, payload: E) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            sequence_nr,
            payload,
            manifest: String::new(),
            is_deleted: false,
            sender: None,
            writer_token: String::new(),
        }
    }

    /// Set the payload manifest.
    pub fn with_manifest(mut self, manifest: impl Into<String>) -> Self {
        self.manifest = manifest.into();
        self
    }

    /// Set the sender.
    pub fn with_sender(mut self, sender: Option<ActorPath>) -> Self {
        self.sender = sender;
        self
    }

    /// Set the writer token.
    pub fn with_writer_token(mut self, token: impl Into<String>) -> Self {
        self.writer_token = token.into();
        self
    }
}

impl<E: Clone> PersistentRecord<E> {
    /// Returns a copy of this record flagged as logically deleted.
    pub fn mark_deleted(&self) -> Self {
        Self {
            is_deleted: true,
            ..self.clone()
        }
    }
}

/// An entry of a journal write batch.
///
/// Persistent records are stored; loop items are not, but travel through
/// the journal anyway so their acknowledgement keeps its place relative to
/// the records written around it.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteItem<E, L> {
    /// A record destined for durable storage.
    Persistent(PersistentRecord<E>),
    /// A pass-through message that only needs its ordering preserved.
    Loop {
        /// The message handed back on `LoopMessageSuccess`.
        payload: L,
        /// The actor that submitted the message, if known.
        sender: Option<ActorPath>,
    },
}

impl<E, L> WriteItem<E, L> {
    /// Returns the record if this item is persistent.
    pub fn as_persistent(&self) -> Option<&PersistentRecord<E>> {
        match self {
            WriteItem::Persistent(record) => Some(record),
            WriteItem::Loop { .. } => None,
        }
    }
}

/// A record the journal failed to write, handed to the entity's handler.
///
/// Recoverable: the entity keeps running and decides whether to retry,
/// ignore, or escalate.
#[derive(Debug, Clone)]
pub struct PersistenceFailure<E> {
    /// The payload that was not persisted.
    pub payload: E,
    /// The sequence number the record was assigned.
    pub sequence_nr: SequenceNr,
    /// Why the write failed.
    pub cause: JournalError,
}
