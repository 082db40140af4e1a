//! Recovery: snapshot load, journal replay, and the transition to normal
//! processing.
//!
//! An incarnation starts in [`RecoveryPhase::RecoveryPending`] and walks
//! forward one phase at a time. Messages that are not part of the recovery
//! protocol are stashed and released, in arrival order, once the entity
//! reaches [`RecoveryPhase::Processing`].
//!
//! A handler fault during replay does not stop the replay stream: the
//! remaining records only advance the sequence counter, and the fault is
//! re-raised when the offending record is redelivered after the stream
//! ends. The supervisor then restarts the entity.

use tokio::time::Instant;

use crate::error::{JournalError, ProcessorError};
use crate::journal::{JournalRequest, JournalResponse};
use crate::processor::{Effect, Envelope, Eventsourced, Processor, Received};
use crate::record::{PersistentRecord, SequenceNr};
use crate::snapshot::{SelectedSnapshot, SnapshotOffer, SnapshotRequest, SnapshotResponse, SnapshotSelectionCriteria};

/// Request to recover an entity's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recover {
    /// Which snapshot to start from.
    pub from_snapshot: SnapshotSelectionCriteria,
    /// Highest sequence number to recover (inclusive).
    pub to_sequence_nr: SequenceNr,
    /// Maximum number of records to replay.
    pub replay_max: u64,
}

impl Recover {
    /// Recover up to `to_sequence_nr`, from the latest snapshot.
    pub fn up_to(to_sequence_nr: SequenceNr) -> Self {
        Self {
            to_sequence_nr,
            ..Self::default()
        }
    }
}

impl Default for Recover {
    /// Latest snapshot, everything after it.
    fn default() -> Self {
        Self {
            from_snapshot: SnapshotSelectionCriteria::LATEST,
            to_sequence_nr: SequenceNr::MAX,
            replay_max: u64::MAX,
        }
    }
}

/// Where an incarnation is in its lifecycle.
#[derive(Debug)]
pub(crate) enum RecoveryPhase<E, F> {
    /// Waiting for [`Envelope::Recover`].
    RecoveryPending,
    /// Snapshot load requested.
    RecoveryStarted { replay_max: u64 },
    /// Replay requested; records are being applied.
    ReplayStarted { should_await: bool },
    /// The handler failed on `offending`; draining the replay stream.
    ReplayFailed {
        fault: F,
        offending: PersistentRecord<E>,
    },
    /// Replay drained; waiting for `offending` to come back round so the
    /// fault can be raised. `fault` is taken when it is.
    PrepareRestart {
        fault: Option<F>,
        offending: PersistentRecord<E>,
    },
    /// Recovered.
    Processing,
}

impl<E, F> RecoveryPhase<E, F> {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            RecoveryPhase::RecoveryPending => "recovery-pending",
            RecoveryPhase::RecoveryStarted { .. } => "recovery-started",
            RecoveryPhase::ReplayStarted { .. } => "replay-started",
            RecoveryPhase::ReplayFailed { .. } => "replay-failed",
            RecoveryPhase::PrepareRestart { .. } => "prepare-restart",
            RecoveryPhase::Processing => "processing",
        }
    }

    pub(crate) fn is_processing(&self) -> bool {
        matches!(self, RecoveryPhase::Processing)
    }
}

/// A message held back until recovery completes.
pub(crate) enum Stashed<P: Processor> {
    Envelope(Envelope<P>),
    /// Replay failure notification, delivered in arrival order.
    ReplayFailure(JournalError),
}

impl<P: Processor> Eventsourced<P> {
    pub(crate) fn on_recovery_pending(&mut self, envelope: Envelope<P>) {
        match envelope {
            Envelope::Recover(recover) => {
                tracing::debug!(
                    persistence_id = %self.persistence_id,
                    to_sequence_nr = recover.to_sequence_nr,
                    "recovery started"
                );
                self.effects
                    .push(Effect::Snapshot(SnapshotRequest::LoadSnapshot {
                        persistence_id: self.persistence_id.clone(),
                        criteria: recover.from_snapshot.limit(recover.to_sequence_nr),
                        to_sequence_nr: recover.to_sequence_nr,
                    }));
                self.phase = RecoveryPhase::RecoveryStarted {
                    replay_max: recover.replay_max,
                };
            }
            other => self.stash.push_back(Stashed::Envelope(other)),
        }
    }

    pub(crate) fn on_recovery_started(
        &mut self,
        processor: &mut P,
        envelope: Envelope<P>,
        replay_max: u64,
        now: Instant,
    ) -> Result<(), ProcessorError<P::Fault>> {
        match envelope {
            Envelope::Snapshot(SnapshotResponse::LoadSnapshotResult {
                snapshot,
                to_sequence_nr,
            }) => {
                if let Some(SelectedSnapshot { metadata, snapshot }) = snapshot {
                    tracing::debug!(
                        persistence_id = %self.persistence_id,
                        sequence_nr = metadata.sequence_nr,
                        "offering snapshot"
                    );
                    self.update_last_sequence_nr(metadata.sequence_nr);
                    self.receive(
                        processor,
                        Received::SnapshotOffer(SnapshotOffer { metadata, snapshot }),
                        now,
                    )
                    .map_err(ProcessorError::Handler)?;
                }

                self.effects
                    .push(Effect::Journal(JournalRequest::ReplayMessages {
                        from_sequence_nr: self.last_sequence_nr.saturating_add(1),
                        to_sequence_nr,
                        max: replay_max,
                        persistence_id: self.persistence_id.clone(),
                    }));
                self.phase = RecoveryPhase::ReplayStarted {
                    should_await: self.config.await_replay,
                };
                Ok(())
            }
            Envelope::Recover(_) => Ok(()),
            other => {
                self.stash.push_back(Stashed::Envelope(other));
                Ok(())
            }
        }
    }

    pub(crate) fn on_replay_started(
        &mut self,
        processor: &mut P,
        envelope: Envelope<P>,
        should_await: bool,
        now: Instant,
    ) -> Result<(), ProcessorError<P::Fault>> {
        match envelope {
            Envelope::Journal(JournalResponse::ReplayedMessage(record)) => {
                if let Err(fault) = self.receive_persistent(processor, record.clone(), now) {
                    tracing::warn!(
                        persistence_id = %self.persistence_id,
                        sequence_nr = record.sequence_nr,
                        error = %fault,
                        "handler failed during replay"
                    );
                    self.phase = RecoveryPhase::ReplayFailed {
                        fault,
                        offending: record,
                    };
                }
                Ok(())
            }
            Envelope::Journal(JournalResponse::ReplayMessagesSuccess {
                highest_sequence_nr,
            }) => {
                self.finish_replay(highest_sequence_nr);
                self.unstash_all(processor, now)
            }
            Envelope::Journal(JournalResponse::ReplayMessagesFailure(cause)) => {
                tracing::warn!(
                    persistence_id = %self.persistence_id,
                    error = %cause,
                    "journal replay failed; continuing with partial state"
                );
                self.replay_incomplete = true;
                self.finish_replay(self.last_sequence_nr);
                if should_await {
                    self.stash.push_back(Stashed::ReplayFailure(cause));
                } else {
                    self.dispatch(processor, Stashed::ReplayFailure(cause), now)?;
                }
                self.unstash_all(processor, now)
            }
            Envelope::Recover(_) => Ok(()),
            other if should_await => {
                self.stash.push_back(Stashed::Envelope(other));
                Ok(())
            }
            other => self.on_processing(processor, other, now),
        }
    }

    pub(crate) fn on_replay_failed(
        &mut self,
        processor: &mut P,
        envelope: Envelope<P>,
        now: Instant,
    ) -> Result<(), ProcessorError<P::Fault>> {
        match envelope {
            Envelope::Journal(JournalResponse::ReplayedMessage(record)) => {
                self.update_last_sequence_nr(record.sequence_nr);
                Ok(())
            }
            Envelope::Journal(JournalResponse::ReplayMessagesSuccess { .. }) => {
                self.prepare_restart(processor, now)
            }
            Envelope::Journal(JournalResponse::ReplayMessagesFailure(cause)) => {
                tracing::warn!(
                    persistence_id = %self.persistence_id,
                    error = %cause,
                    "journal replay failed after handler fault"
                );
                self.replay_incomplete = true;
                self.prepare_restart(processor, now)
            }
            Envelope::Recover(_) => Ok(()),
            other => {
                self.stash.push_back(Stashed::Envelope(other));
                Ok(())
            }
        }
    }

    pub(crate) fn on_prepare_restart(
        &mut self,
        envelope: Envelope<P>,
    ) -> Result<(), ProcessorError<P::Fault>> {
        let RecoveryPhase::PrepareRestart { fault, offending } = &mut self.phase else {
            return Ok(());
        };
        match envelope {
            Envelope::Journal(JournalResponse::ReplayedMessage(record))
                if record.sequence_nr == offending.sequence_nr =>
            {
                match fault.take() {
                    Some(fault) => Err(ProcessorError::Replay {
                        sequence_nr: record.sequence_nr,
                        fault,
                    }),
                    None => Ok(()),
                }
            }
            Envelope::Command(_) | Envelope::Persist { .. } | Envelope::Loop { .. } => {
                self.stash.push_back(Stashed::Envelope(envelope));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Replay drained after a fault: redeliver the offending record so the
    /// fault surfaces.
    fn prepare_restart(
        &mut self,
        processor: &mut P,
        now: Instant,
    ) -> Result<(), ProcessorError<P::Fault>> {
        let phase = std::mem::replace(&mut self.phase, RecoveryPhase::RecoveryPending);
        let RecoveryPhase::ReplayFailed { fault, offending } = phase else {
            self.phase = phase;
            return Ok(());
        };
        self.phase = RecoveryPhase::PrepareRestart {
            fault: Some(fault),
            offending: offending.clone(),
        };
        self.dispatch(
            processor,
            Stashed::Envelope(Envelope::Journal(JournalResponse::ReplayedMessage(offending))),
            now,
        )
    }

    /// Enter processing. New writes are numbered after `highest_sequence_nr`.
    fn finish_replay(&mut self, highest_sequence_nr: SequenceNr) {
        self.update_last_sequence_nr(highest_sequence_nr);
        self.sequence_nr = self.last_sequence_nr;
        self.phase = RecoveryPhase::Processing;
        tracing::info!(
            persistence_id = %self.persistence_id,
            last_sequence_nr = self.last_sequence_nr,
            stashed = self.stash.len(),
            "recovery completed"
        );
    }

    /// Release every stashed message in arrival order. On a fault the rest
    /// stay stashed.
    fn unstash_all(&mut self, processor: &mut P, now: Instant) -> Result<(), ProcessorError<P::Fault>> {
        while let Some(message) = self.stash.pop_front() {
            self.dispatch(processor, message, now)?;
        }
        Ok(())
    }
}
