//! The eventsourced core: one entity's recovery, write batching, and
//! delivery ledger behind a single message-driven entry point.
//!
//! [`Eventsourced`] owns all per-entity persistence state and is driven one
//! [`Envelope`] at a time through [`Eventsourced::handle`]. It never performs
//! I/O; requests for the journal, the snapshot store, and outbound sends
//! accumulate as [`Effect`]s that the owner drains with
//! [`Eventsourced::take_effects`] and routes (see [`ProcessorBuilder`](crate::ProcessorBuilder)).
//!
//! The entity's own logic implements [`Processor`] and sees everything as
//! [`Received`] values together with an explicit [`Context`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;
use uuid::Uuid;

use crate::batch::WriteBatcher;
use crate::delivery::{
    DeliveryConfig, DeliveryId, DeliveryLedger, DeliverySnapshot, Outgoing, UnconfirmedWarning,
};
use crate::error::{DeliveryError, JournalError, ProcessorError, SnapshotError};
use crate::journal::{JournalRequest, JournalResponse};
use crate::record::{ActorPath, PersistenceFailure, PersistentRecord, SequenceNr, WriteItem};
use crate::recovery::{Recover, RecoveryPhase, Stashed};
use crate::snapshot::{
    SnapshotMetadata, SnapshotOffer, SnapshotRequest, SnapshotResponse, SnapshotSelectionCriteria,
};

/// Source of incarnation ids, shared by every entity in the process.
static INSTANCE_IDS: AtomicU64 = AtomicU64::new(1);

/// An entity whose state is rebuilt from snapshots and journal replay.
///
/// # Associated Types
///
/// - `Event`: payload of persisted records.
/// - `Command`: transient messages, also used for loop (pass-through) items.
/// - `Snapshot`: payload saved to and offered from the snapshot store.
/// - `Delivery`: message type sent through the at-least-once ledger.
/// - `Fault`: error raised by [`receive`](Processor::receive).
///
/// # Contract
///
/// [`receive`](Processor::receive) is called for replayed records, newly
/// persisted records, and every other [`Received`] value. During replay it
/// must rebuild state deterministically; a fault during replay makes the
/// entity restart once the replay stream has drained.
pub trait Processor: Send + Sized + 'static {
    /// Payload of persisted records.
    type Event: Clone + Send + 'static;
    /// Transient messages and loop items.
    type Command: Send + 'static;
    /// Snapshot payload.
    type Snapshot: Send + 'static;
    /// Message type of at-least-once deliveries.
    type Delivery: Clone + Send + 'static;
    /// Handler fault.
    type Fault: std::error::Error + Send + Sync + 'static;

    /// Identifier of this entity's log. Must stay the same across restarts.
    fn persistence_id(&self) -> &str;

    /// Handle one message.
    fn receive(
        &mut self,
        ctx: &mut Context<'_, Self>,
        message: Received<Self>,
    ) -> Result<(), Self::Fault>;

    /// Manifest stamped on records carrying `event`. Empty by default.
    fn manifest(_event: &Self::Event) -> String {
        String::new()
    }
}

/// Everything a [`Processor`] can be handed.
pub enum Received<P: Processor> {
    /// A replayed or newly persisted record. While it is handled,
    /// [`Context::last_sequence_nr`] equals its sequence number.
    Persistent(PersistentRecord<P::Event>),
    /// A transient message, or a loop item that passed through the journal.
    Command(P::Command),
    /// A snapshot to restore from, offered before replay starts.
    SnapshotOffer(SnapshotOffer<P::Snapshot>),
    /// A record the journal failed to write. Recoverable.
    PersistenceFailure(PersistenceFailure<P::Event>),
    /// The journal could not finish replay. Recovery still completes.
    ReplayFailure(JournalError),
    /// A snapshot requested with [`Context::save_snapshot`] was saved.
    SnapshotSaved(SnapshotMetadata),
    /// A snapshot requested with [`Context::save_snapshot`] was not saved.
    SnapshotSaveFailed {
        /// Metadata of the snapshot.
        metadata: SnapshotMetadata,
        /// Why the save failed.
        cause: SnapshotError,
    },
    /// Deliveries that reached the warning attempt threshold.
    UnconfirmedWarning(UnconfirmedWarning<P::Delivery>),
}

/// Messages driving an [`Eventsourced`] core.
pub enum Envelope<P: Processor> {
    /// Start recovery. Ignored once recovery has begun.
    Recover(Recover),
    /// A transient message for the handler.
    Command(P::Command),
    /// A payload to persist; the handler sees it once written.
    Persist {
        /// The event to persist.
        payload: P::Event,
        /// Who submitted it, if known.
        sender: Option<ActorPath>,
    },
    /// A message routed through the journal to keep its place relative to
    /// concurrently persisted records.
    Loop {
        /// The message handed back to the handler.
        payload: P::Command,
        /// Who submitted it, if known.
        sender: Option<ActorPath>,
    },
    /// A reply from the journal.
    Journal(JournalResponse<P::Event, P::Command>),
    /// A reply from the snapshot store.
    Snapshot(SnapshotResponse<P::Snapshot>),
    /// Periodic redelivery marker.
    RedeliveryTick,
}

/// Requests produced by the core for its owner to route.
pub enum Effect<P: Processor> {
    /// Send to the journal.
    Journal(JournalRequest<P::Event, P::Command>),
    /// Send to the snapshot store.
    Snapshot(SnapshotRequest<P::Snapshot>),
    /// Send a ledger message to its destination.
    Send(Outgoing<P::Delivery>),
}

/// Tuning for recovery and journal batching.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Maximum number of items in one journal write.
    ///
    /// Default: 200.
    pub max_message_batch_size: usize,

    /// Whether messages arriving during replay wait until replay finishes.
    /// When `false` they are handled as they arrive, interleaved with
    /// replayed records.
    ///
    /// Default: `true`.
    pub await_replay: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_message_batch_size: 200,
            await_replay: true,
        }
    }
}

/// An item waiting for a journal batch. Sequence numbers are assigned when
/// the batch is handed to the journal.
pub(crate) enum PendingWrite<E, L> {
    Persistent { payload: E, sender: Option<ActorPath> },
    Loop { payload: L, sender: Option<ActorPath> },
}

/// What a restarted incarnation needs from the one that failed.
pub struct Restart<P: Processor> {
    /// Upper bound for the new incarnation's recovery.
    pub to_sequence_nr: SequenceNr,
    /// Messages to handle first, in order, once the new incarnation runs.
    pub requeue: Vec<Envelope<P>>,
}

/// Handle given to [`Processor::receive`] for the duration of one call.
pub struct Context<'a, P: Processor> {
    persistence_id: &'a str,
    last_sequence_nr: SequenceNr,
    recovery_running: bool,
    now: Instant,
    /// Writes submitted during this call; queued only if the call succeeds.
    writes: &'a mut Vec<PendingWrite<P::Event, P::Command>>,
    ledger: &'a mut DeliveryLedger<P::Delivery>,
    effects: &'a mut Vec<Effect<P>>,
}

impl<P: Processor> Context<'_, P> {
    /// Identifier of this entity's log.
    pub fn persistence_id(&self) -> &str {
        self.persistence_id
    }

    /// Sequence number of the record being handled, or of the last one
    /// handled or restored from a snapshot.
    pub fn last_sequence_nr(&self) -> SequenceNr {
        self.last_sequence_nr
    }

    /// Whether the entity is still recovering.
    pub fn recovery_running(&self) -> bool {
        self.recovery_running
    }

    /// Whether recovery has completed.
    pub fn recovery_finished(&self) -> bool {
        !self.recovery_running
    }

    /// Persist `event`. The handler receives it as
    /// [`Received::Persistent`] once the journal has written it.
    ///
    /// Events persisted in the same call are written in one batch. If the
    /// call returns an error they are discarded.
    pub fn persist(&mut self, event: P::Event) {
        self.writes.push(PendingWrite::Persistent {
            payload: event,
            sender: None,
        });
    }

    /// Persist several events, in order.
    pub fn persist_all(&mut self, events: impl IntoIterator<Item = P::Event>) {
        for event in events {
            self.persist(event);
        }
    }

    /// Route `command` through the journal; the handler receives it back
    /// as [`Received::Command`] after every record persisted before it.
    pub fn defer(&mut self, command: P::Command) {
        self.writes.push(PendingWrite::Loop {
            payload: command,
            sender: None,
        });
    }

    /// Send a message to `destination` with at-least-once semantics.
    ///
    /// `build` receives the allocated delivery id, which the destination
    /// must echo back so the entity can call
    /// [`confirm_delivery`](Context::confirm_delivery). During recovery the
    /// entry is recorded without sending and is resent by the first
    /// redelivery tick after recovery.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::MaxUnconfirmedExceeded`] when the ledger is full.
    pub fn deliver(
        &mut self,
        destination: ActorPath,
        build: impl FnOnce(DeliveryId) -> P::Delivery,
    ) -> Result<DeliveryId, DeliveryError> {
        let (delivery_id, outgoing) =
            self.ledger
                .deliver(destination, build, self.recovery_running, self.now)?;
        if let Some(outgoing) = outgoing {
            self.effects.push(Effect::Send(outgoing));
        }
        Ok(delivery_id)
    }

    /// Confirm delivery `delivery_id`. Returns `true` if it was unconfirmed.
    pub fn confirm_delivery(&mut self, delivery_id: DeliveryId) -> bool {
        self.ledger.confirm(delivery_id)
    }

    /// Number of deliveries awaiting confirmation.
    pub fn number_of_unconfirmed(&self) -> usize {
        self.ledger.number_of_unconfirmed()
    }

    /// Capture the delivery ledger, e.g. to embed in a snapshot.
    pub fn delivery_snapshot(&self) -> DeliverySnapshot<P::Delivery> {
        self.ledger.snapshot()
    }

    /// Restore the delivery ledger, e.g. from a
    /// [`Received::SnapshotOffer`]. Attempt counts restart at zero.
    pub fn set_delivery_snapshot(&mut self, snapshot: DeliverySnapshot<P::Delivery>) {
        self.ledger.restore(snapshot, self.now);
    }

    /// Save `snapshot` as of [`last_sequence_nr`](Context::last_sequence_nr).
    pub fn save_snapshot(&mut self, snapshot: P::Snapshot) {
        self.effects.push(Effect::Snapshot(SnapshotRequest::SaveSnapshot {
            metadata: SnapshotMetadata::new(self.persistence_id, self.last_sequence_nr),
            snapshot,
        }));
    }

    /// Delete one snapshot. A zero `timestamp` matches any timestamp.
    pub fn delete_snapshot(&mut self, sequence_nr: SequenceNr, timestamp: u64) {
        self.effects
            .push(Effect::Snapshot(SnapshotRequest::DeleteSnapshot {
                metadata: SnapshotMetadata {
                    persistence_id: self.persistence_id.to_owned(),
                    sequence_nr,
                    timestamp,
                },
            }));
    }

    /// Delete every snapshot matching `criteria`.
    pub fn delete_snapshots(&mut self, criteria: SnapshotSelectionCriteria) {
        self.effects
            .push(Effect::Snapshot(SnapshotRequest::DeleteSnapshots {
                persistence_id: self.persistence_id.to_owned(),
                criteria,
            }));
    }

    /// Delete journal records up to `to_sequence_nr`. Logical deletion
    /// flags records; permanent deletion removes them. Deleted records are
    /// not replayed.
    pub fn delete_messages(&mut self, to_sequence_nr: SequenceNr, permanent: bool) {
        self.effects
            .push(Effect::Journal(JournalRequest::DeleteMessagesTo {
                persistence_id: self.persistence_id.to_owned(),
                to_sequence_nr,
                permanent,
            }));
    }
}

/// Persistence state of one entity incarnation.
pub struct Eventsourced<P: Processor> {
    pub(crate) persistence_id: String,
    pub(crate) instance_id: u64,
    pub(crate) writer_token: String,
    pub(crate) config: PersistenceConfig,
    pub(crate) phase: RecoveryPhase<P::Event, P::Fault>,
    pub(crate) stash: VecDeque<Stashed<P>>,
    /// Last sequence number handed to the journal.
    pub(crate) sequence_nr: SequenceNr,
    /// Sequence number of the last record handled or restored.
    pub(crate) last_sequence_nr: SequenceNr,
    /// Set when the journal failed to finish replay.
    pub(crate) replay_incomplete: bool,
    pub(crate) writes: WriteBatcher<PendingWrite<P::Event, P::Command>>,
    pub(crate) ledger: DeliveryLedger<P::Delivery>,
    pub(crate) effects: Vec<Effect<P>>,
}

impl<P: Processor> Eventsourced<P> {
    /// Create the core for a new incarnation of `persistence_id`, waiting
    /// for [`Envelope::Recover`].
    pub fn new(
        persistence_id: impl Into<String>,
        config: PersistenceConfig,
        delivery: DeliveryConfig,
    ) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            instance_id: INSTANCE_IDS.fetch_add(1, Ordering::Relaxed),
            writer_token: Uuid::new_v4().to_string(),
            writes: WriteBatcher::new(config.max_message_batch_size),
            config,
            phase: RecoveryPhase::RecoveryPending,
            stash: VecDeque::new(),
            sequence_nr: 0,
            last_sequence_nr: 0,
            replay_incomplete: false,
            ledger: DeliveryLedger::new(delivery),
            effects: Vec::new(),
        }
    }

    /// Identifier of this entity's log.
    pub fn persistence_id(&self) -> &str {
        &self.persistence_id
    }

    /// Process-unique id of this incarnation.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Token stamped on every record this incarnation writes.
    pub fn writer_token(&self) -> &str {
        &self.writer_token
    }

    /// Sequence number of the last record handled or restored.
    pub fn last_sequence_nr(&self) -> SequenceNr {
        self.last_sequence_nr
    }

    /// Name of the current recovery phase, for diagnostics.
    pub fn phase_name(&self) -> &'static str {
        self.phase.name()
    }

    /// Whether recovery has completed.
    pub fn is_processing(&self) -> bool {
        self.phase.is_processing()
    }

    /// Number of messages deferred until recovery completes.
    pub fn stash_len(&self) -> usize {
        self.stash.len()
    }

    /// Whether a journal write is outstanding.
    pub fn is_batch_in_flight(&self) -> bool {
        self.writes.is_in_flight()
    }

    /// The delivery ledger.
    pub fn ledger(&self) -> &DeliveryLedger<P::Delivery> {
        &self.ledger
    }

    /// Drain the requests produced so far, in the order they were made.
    pub fn take_effects(&mut self) -> Vec<Effect<P>> {
        std::mem::take(&mut self.effects)
    }

    /// Handle one envelope at the current time.
    ///
    /// # Errors
    ///
    /// A fault the supervisor must act on: the handler failed on a live
    /// message, or a replay fault is being re-raised. The core must not be
    /// used afterwards except through [`into_restart`](Eventsourced::into_restart).
    pub fn handle(
        &mut self,
        processor: &mut P,
        envelope: Envelope<P>,
    ) -> Result<(), ProcessorError<P::Fault>> {
        self.handle_at(processor, envelope, Instant::now())
    }

    /// Handle one envelope as if the current time were `now`.
    pub fn handle_at(
        &mut self,
        processor: &mut P,
        envelope: Envelope<P>,
        now: Instant,
    ) -> Result<(), ProcessorError<P::Fault>> {
        let result = self.dispatch(processor, Stashed::Envelope(envelope), now);
        // Everything submitted during this turn goes out as one batch.
        if result.is_ok()
            && self.phase.is_processing()
            && let Some(batch) = self.writes.take_ready()
        {
            self.write_batch(batch);
        }
        result
    }

    /// Consume a failed incarnation, returning what its successor needs.
    ///
    /// Unwritten submissions come back first, followed by messages stashed
    /// during recovery. The successor recovers up to this incarnation's last
    /// sequence number, or without bound when replay did not complete.
    pub fn into_restart(mut self) -> Restart<P> {
        let replay_completed = matches!(
            self.phase,
            RecoveryPhase::PrepareRestart { .. } | RecoveryPhase::Processing
        ) && !self.replay_incomplete;
        let to_sequence_nr = if replay_completed && !self.writes.is_in_flight() {
            self.last_sequence_nr
        } else {
            SequenceNr::MAX
        };

        let mut requeue: Vec<Envelope<P>> = self
            .writes
            .clear()
            .into_iter()
            .map(|pending| match pending {
                PendingWrite::Persistent { payload, sender } => Envelope::Persist { payload, sender },
                PendingWrite::Loop { payload, sender } => Envelope::Loop { payload, sender },
            })
            .collect();
        // Store replies belong to this incarnation and die with it.
        requeue.extend(self.stash.drain(..).filter_map(|stashed| match stashed {
            Stashed::Envelope(
                envelope @ (Envelope::Command(_) | Envelope::Persist { .. } | Envelope::Loop { .. }),
            ) => Some(envelope),
            Stashed::Envelope(_) | Stashed::ReplayFailure(_) => None,
        }));

        Restart {
            to_sequence_nr,
            requeue,
        }
    }

    /// Route one message according to the current phase.
    pub(crate) fn dispatch(
        &mut self,
        processor: &mut P,
        message: Stashed<P>,
        now: Instant,
    ) -> Result<(), ProcessorError<P::Fault>> {
        let envelope = match message {
            Stashed::Envelope(Envelope::RedeliveryTick) => {
                if self.phase.is_processing() {
                    return self.redeliver_overdue(processor, now);
                }
                // The first tick after recovery does the scan.
                tracing::trace!(persistence_id = %self.persistence_id, "redelivery tick during recovery");
                return Ok(());
            }
            Stashed::Envelope(envelope) => envelope,
            Stashed::ReplayFailure(cause) => {
                return self
                    .receive(processor, Received::ReplayFailure(cause), now)
                    .map_err(ProcessorError::Handler);
            }
        };

        match self.phase {
            RecoveryPhase::RecoveryPending => {
                self.on_recovery_pending(envelope);
                Ok(())
            }
            RecoveryPhase::RecoveryStarted { replay_max } => {
                self.on_recovery_started(processor, envelope, replay_max, now)
            }
            RecoveryPhase::ReplayStarted { should_await } => {
                self.on_replay_started(processor, envelope, should_await, now)
            }
            RecoveryPhase::ReplayFailed { .. } => self.on_replay_failed(processor, envelope, now),
            RecoveryPhase::PrepareRestart { .. } => self.on_prepare_restart(envelope),
            RecoveryPhase::Processing => self.on_processing(processor, envelope, now),
        }
    }

    /// Steady-state behavior: batch writes, dispatch acknowledgements.
    pub(crate) fn on_processing(
        &mut self,
        processor: &mut P,
        envelope: Envelope<P>,
        now: Instant,
    ) -> Result<(), ProcessorError<P::Fault>> {
        match envelope {
            Envelope::Command(command) => self
                .receive(processor, Received::Command(command), now)
                .map_err(ProcessorError::Handler),
            Envelope::Persist { payload, sender } => {
                self.writes.push(PendingWrite::Persistent { payload, sender });
                Ok(())
            }
            Envelope::Loop { payload, sender } => {
                self.writes.push(PendingWrite::Loop { payload, sender });
                Ok(())
            }
            Envelope::Journal(response) => self.on_journal_response(processor, response, now),
            Envelope::Snapshot(response) => self.on_snapshot_response(processor, response, now),
            Envelope::RedeliveryTick => self.redeliver_overdue(processor, now),
            Envelope::Recover(_) => Ok(()),
        }
    }

    fn on_journal_response(
        &mut self,
        processor: &mut P,
        response: JournalResponse<P::Event, P::Command>,
        now: Instant,
    ) -> Result<(), ProcessorError<P::Fault>> {
        if let Some(instance_id) = write_instance_id(&response)
            && instance_id != self.instance_id
        {
            tracing::debug!(
                persistence_id = %self.persistence_id,
                instance_id,
                "dropping write reply addressed to a previous incarnation"
            );
            return Ok(());
        }

        match response {
            JournalResponse::WriteMessageSuccess { record, .. } => self
                .receive_persistent(processor, record, now)
                .map_err(ProcessorError::Handler),
            JournalResponse::WriteMessageFailure { record, cause, .. } => {
                tracing::warn!(
                    persistence_id = %self.persistence_id,
                    sequence_nr = record.sequence_nr,
                    error = %cause,
                    "record not persisted"
                );
                let failure = PersistenceFailure {
                    payload: record.payload,
                    sequence_nr: record.sequence_nr,
                    cause,
                };
                self.receive(processor, Received::PersistenceFailure(failure), now)
                    .map_err(ProcessorError::Handler)
            }
            JournalResponse::LoopMessageSuccess { payload, .. } => self
                .receive(processor, Received::Command(payload), now)
                .map_err(ProcessorError::Handler),
            JournalResponse::WriteMessagesSuccess { .. } => {
                self.on_batch_acknowledged();
                Ok(())
            }
            JournalResponse::WriteMessagesFailure { cause, .. } => {
                tracing::warn!(
                    persistence_id = %self.persistence_id,
                    error = %cause,
                    "journal batch failed"
                );
                self.on_batch_acknowledged();
                Ok(())
            }
            JournalResponse::ReplayedMessage(record) => {
                tracing::debug!(
                    persistence_id = %self.persistence_id,
                    sequence_nr = record.sequence_nr,
                    "ignoring replayed record after recovery"
                );
                Ok(())
            }
            JournalResponse::ReplayMessagesSuccess { .. }
            | JournalResponse::ReplayMessagesFailure(_) => Ok(()),
        }
    }

    fn on_snapshot_response(
        &mut self,
        processor: &mut P,
        response: SnapshotResponse<P::Snapshot>,
        now: Instant,
    ) -> Result<(), ProcessorError<P::Fault>> {
        let pid = &self.persistence_id;
        match response {
            SnapshotResponse::SaveSnapshotSuccess { metadata } => {
                tracing::debug!(persistence_id = %pid, sequence_nr = metadata.sequence_nr, "snapshot saved");
                self.receive(processor, Received::SnapshotSaved(metadata), now)
                    .map_err(ProcessorError::Handler)
            }
            SnapshotResponse::SaveSnapshotFailure { metadata, cause } => {
                tracing::warn!(persistence_id = %pid, error = %cause, "snapshot save failed");
                self.receive(
                    processor,
                    Received::SnapshotSaveFailed { metadata, cause },
                    now,
                )
                .map_err(ProcessorError::Handler)
            }
            SnapshotResponse::DeleteSnapshotSuccess { metadata } => {
                tracing::debug!(persistence_id = %pid, sequence_nr = metadata.sequence_nr, "snapshot deleted");
                Ok(())
            }
            SnapshotResponse::DeleteSnapshotFailure { metadata, cause } => {
                tracing::warn!(
                    persistence_id = %pid,
                    sequence_nr = metadata.sequence_nr,
                    error = %cause,
                    "snapshot delete failed"
                );
                Ok(())
            }
            SnapshotResponse::DeleteSnapshotsSuccess { criteria } => {
                tracing::debug!(persistence_id = %pid, max_sequence_nr = criteria.max_sequence_nr, "snapshots deleted");
                Ok(())
            }
            SnapshotResponse::DeleteSnapshotsFailure { cause, .. } => {
                tracing::warn!(persistence_id = %pid, error = %cause, "snapshots delete failed");
                Ok(())
            }
            SnapshotResponse::LoadSnapshotResult { .. } => {
                tracing::debug!(persistence_id = %pid, "ignoring snapshot load result after recovery");
                Ok(())
            }
        }
    }

    /// Whole-batch acknowledgement: keep one batch in flight while
    /// anything is pending.
    fn on_batch_acknowledged(&mut self) {
        if let Some(batch) = self.writes.acknowledge() {
            self.write_batch(batch);
        }
    }

    /// Assign sequence numbers and hand `batch` to the journal.
    fn write_batch(&mut self, batch: Vec<PendingWrite<P::Event, P::Command>>) {
        let mut items = Vec::with_capacity(batch.len());
        for pending in batch {
            items.push(match pending {
                PendingWrite::Persistent { payload, sender } => {
                    self.sequence_nr += 1;
                    let manifest = P::manifest(&payload);
                    WriteItem::Persistent(
                        PersistentRecord::new(&*self.persistence_id, self.sequence_nr, payload)
                            .with_manifest(manifest)
                            .with_sender(sender)
                            .with_writer_token(&*self.writer_token),
                    )
                }
                PendingWrite::Loop { payload, sender } => WriteItem::Loop { payload, sender },
            });
        }
        tracing::debug!(
            persistence_id = %self.persistence_id,
            size = items.len(),
            "writing journal batch"
        );
        self.effects
            .push(Effect::Journal(JournalRequest::WriteMessages {
                batch: items,
                instance_id: self.instance_id,
            }));
    }

    fn redeliver_overdue(
        &mut self,
        processor: &mut P,
        now: Instant,
    ) -> Result<(), ProcessorError<P::Fault>> {
        let (sends, warning) = self.ledger.redeliver_overdue(now);
        if !sends.is_empty() {
            tracing::debug!(
                persistence_id = %self.persistence_id,
                count = sends.len(),
                "redelivering unconfirmed messages"
            );
        }
        self.effects.extend(sends.into_iter().map(Effect::Send));

        if let Some(warning) = warning {
            tracing::warn!(
                persistence_id = %self.persistence_id,
                count = warning.unconfirmed.len(),
                "deliveries still unconfirmed after warning threshold"
            );
            self.receive(processor, Received::UnconfirmedWarning(warning), now)
                .map_err(ProcessorError::Handler)?;
        }
        Ok(())
    }

    /// Raise `last_sequence_nr` to `sequence_nr`; never lowers it.
    pub(crate) fn update_last_sequence_nr(&mut self, sequence_nr: SequenceNr) {
        if sequence_nr > self.last_sequence_nr {
            self.last_sequence_nr = sequence_nr;
        }
    }

    /// Hand `record` to the handler with it established as the current one.
    pub(crate) fn receive_persistent(
        &mut self,
        processor: &mut P,
        record: PersistentRecord<P::Event>,
        now: Instant,
    ) -> Result<(), P::Fault> {
        self.update_last_sequence_nr(record.sequence_nr);
        self.receive(processor, Received::Persistent(record), now)
    }

    /// Call the handler with a fresh [`Context`].
    pub(crate) fn receive(
        &mut self,
        processor: &mut P,
        message: Received<P>,
        now: Instant,
    ) -> Result<(), P::Fault> {
        let mut submitted = Vec::new();
        let mut ctx = Context {
            persistence_id: &self.persistence_id,
            last_sequence_nr: self.last_sequence_nr,
            recovery_running: !self.phase.is_processing(),
            now,
            writes: &mut submitted,
            ledger: &mut self.ledger,
            effects: &mut self.effects,
        };
        processor.receive(&mut ctx, message)?;
        // A failed call's writes are discarded with it.
        for pending in submitted {
            self.writes.push(pending);
        }
        Ok(())
    }
}

/// Incarnation id carried by write-path replies.
fn write_instance_id<E, L>(response: &JournalResponse<E, L>) -> Option<u64> {
    match response {
        JournalResponse::WriteMessageSuccess { instance_id, .. }
        | JournalResponse::WriteMessageFailure { instance_id, .. }
        | JournalResponse::LoopMessageSuccess { instance_id, .. }
        | JournalResponse::WriteMessagesSuccess { instance_id }
        | JournalResponse::WriteMessagesFailure { instance_id, .. } => Some(*instance_id),
        JournalResponse::ReplayedMessage(_)
        | JournalResponse::ReplayMessagesSuccess { .. }
        | JournalResponse::ReplayMessagesFailure(_) => None,
    }
}
