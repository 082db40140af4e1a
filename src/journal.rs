//! Journal protocol and the in-memory journal backend.
//!
//! The journal is the single ordering authority for an entity's writes.
//! Requests arrive as [`JournalRequest`]s; every request is answered on the
//! requester's reply channel with a sequence of [`JournalResponse`]s:
//!
//! * `WriteMessages` yields one `WriteMessageSuccess`/`WriteMessageFailure`
//!   per record and one `LoopMessageSuccess` per loop item, in batch order,
//!   followed by a single `WriteMessagesSuccess`/`WriteMessagesFailure`.
//! * `ReplayMessages` yields zero or more `ReplayedMessage`s terminated by
//!   `ReplayMessagesSuccess` or `ReplayMessagesFailure`.
//! * `DeleteMessagesTo` is fire-and-forget.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::mpsc;

use crate::error::JournalError;
use crate::record::{ActorPath, PersistentRecord, SequenceNr, WriteItem};

/// Requests understood by the journal.
#[derive(Debug, Clone)]
pub enum JournalRequest<E, L> {
    /// Atomically write the persistent records of `batch`, passing loop
    /// items through in order.
    WriteMessages {
        /// Items in submission order.
        batch: Vec<WriteItem<E, L>>,
        /// Incarnation of the requesting entity, echoed in every reply.
        instance_id: u64,
    },
    /// Replay the non-deleted records of `persistence_id` in
    /// `from_sequence_nr..=to_sequence_nr`, at most `max` of them.
    ReplayMessages {
        /// First sequence number to replay.
        from_sequence_nr: SequenceNr,
        /// Last sequence number to replay.
        to_sequence_nr: SequenceNr,
        /// Maximum number of records to replay.
        max: u64,
        /// Entity whose records are replayed.
        persistence_id: String,
    },
    /// Delete every record of `persistence_id` up to `to_sequence_nr`.
    DeleteMessagesTo {
        /// Entity whose records are deleted.
        persistence_id: String,
        /// Last sequence number to delete.
        to_sequence_nr: SequenceNr,
        /// Remove records outright instead of flagging them deleted.
        permanent: bool,
    },
}

/// Replies produced by the journal.
#[derive(Debug, Clone)]
pub enum JournalResponse<E, L> {
    /// A record of the batch was written.
    WriteMessageSuccess {
        /// The written record.
        record: PersistentRecord<E>,
        /// Incarnation that requested the write.
        instance_id: u64,
    },
    /// A record of the batch was not written.
    WriteMessageFailure {
        /// The record that failed.
        record: PersistentRecord<E>,
        /// Why the write failed.
        cause: JournalError,
        /// Incarnation that requested the write.
        instance_id: u64,
    },
    /// A loop item passed through the journal.
    LoopMessageSuccess {
        /// The looped message.
        payload: L,
        /// Sender recorded with the loop item.
        sender: Option<ActorPath>,
        /// Incarnation that requested the write.
        instance_id: u64,
    },
    /// The whole batch was written.
    WriteMessagesSuccess {
        /// Incarnation that requested the write.
        instance_id: u64,
    },
    /// The whole batch failed.
    WriteMessagesFailure {
        /// Why the batch failed.
        cause: JournalError,
        /// Incarnation that requested the write.
        instance_id: u64,
    },
    /// One replayed record.
    ReplayedMessage(PersistentRecord<E>),
    /// Replay finished.
    ReplayMessagesSuccess {
        /// Highest sequence number ever stored for the entity, including
        /// records that have since been deleted.
        highest_sequence_nr: SequenceNr,
    },
    /// Replay could not be completed.
    ReplayMessagesFailure(JournalError),
}

/// Storage backend for journal records.
///
/// Implementations are driven by [`process_journal_request`]; they never
/// see loop items or protocol messages.
pub trait JournalBackend<E>: Send + 'static {
    /// Atomically store `records`: either all are stored or none are.
    fn write_messages(&mut self, records: &[PersistentRecord<E>]) -> Result<(), JournalError>;

    /// Call `on_record` for each non-deleted record of `persistence_id` in
    /// `from..=to`, in sequence order, stopping after `max` records.
    fn replay_messages(
        &mut self,
        persistence_id: &str,
        from: SequenceNr,
        to: SequenceNr,
        max: u64,
        on_record: &mut dyn FnMut(PersistentRecord<E>),
    ) -> Result<(), JournalError>;

    /// Highest sequence number ever stored for `persistence_id`, or 0.
    fn highest_sequence_nr(&mut self, persistence_id: &str) -> Result<SequenceNr, JournalError>;

    /// Delete records of `persistence_id` up to `to`, logically or permanently.
    fn delete_messages_to(
        &mut self,
        persistence_id: &str,
        to: SequenceNr,
        permanent: bool,
    ) -> Result<(), JournalError>;
}

/// Answer one request against `backend`, returning the replies in the
/// order they must be delivered.
pub fn process_journal_request<E, L, B>(
    backend: &mut B,
    request: JournalRequest<E, L>,
) -> Vec<JournalResponse<E, L>>
where
    E: Clone,
    B: JournalBackend<E> + ?Sized,
{
    match request {
        JournalRequest::WriteMessages { batch, instance_id } => {
            let records: Vec<PersistentRecord<E>> =
                batch.iter().filter_map(WriteItem::as_persistent).cloned().collect();
            let outcome = backend.write_messages(&records);

            let mut replies = Vec::with_capacity(batch.len() + 1);
            for item in batch {
                replies.push(match item {
                    WriteItem::Persistent(record) => match &outcome {
                        Ok(()) => JournalResponse::WriteMessageSuccess {
                            record,
                            instance_id,
                        },
                        Err(cause) => JournalResponse::WriteMessageFailure {
                            record,
                            cause: cause.clone(),
                            instance_id,
                        },
                    },
                    // Loop items are acknowledged whether or not the batch failed.
                    WriteItem::Loop { payload, sender } => JournalResponse::LoopMessageSuccess {
                        payload,
                        sender,
                        instance_id,
                    },
                });
            }
            replies.push(match outcome {
                Ok(()) => JournalResponse::WriteMessagesSuccess { instance_id },
                Err(cause) => {
                    tracing::warn!(error = %cause, "journal batch write failed");
                    JournalResponse::WriteMessagesFailure { cause, instance_id }
                }
            });
            replies
        }

        JournalRequest::ReplayMessages {
            from_sequence_nr,
            to_sequence_nr,
            max,
            persistence_id,
        } => {
            let mut replies = Vec::new();
            let replayed = backend.replay_messages(
                &persistence_id,
                from_sequence_nr,
                to_sequence_nr,
                max,
                &mut |record| replies.push(JournalResponse::ReplayedMessage(record)),
            );
            let terminal = replayed
                .and_then(|()| backend.highest_sequence_nr(&persistence_id))
                .map_or_else(JournalResponse::ReplayMessagesFailure, |highest_sequence_nr| {
                    JournalResponse::ReplayMessagesSuccess {
                        highest_sequence_nr,
                    }
                });
            replies.push(terminal);
            replies
        }

        JournalRequest::DeleteMessagesTo {
            persistence_id,
            to_sequence_nr,
            permanent,
        } => {
            if let Err(e) = backend.delete_messages_to(&persistence_id, to_sequence_nr, permanent) {
                tracing::warn!(
                    persistence_id = %persistence_id,
                    to_sequence_nr,
                    error = %e,
                    "journal delete failed"
                );
            }
            Vec::new()
        }
    }
}

/// Journal records kept in process memory.
///
/// Rejects any batch containing a record whose sequence number is not above
/// the highest one already stored for its entity.
#[derive(Debug)]
pub struct InMemoryJournal<E> {
    records: HashMap<String, BTreeMap<SequenceNr, PersistentRecord<E>>>,
    highest: HashMap<String, SequenceNr>,
}

impl<E> Default for InMemoryJournal<E> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            highest: HashMap::new(),
        }
    }
}

impl<E: Clone> InMemoryJournal<E> {
    /// All records currently stored for `persistence_id`, including ones
    /// flagged deleted, in sequence order.
    pub fn records(&self, persistence_id: &str) -> Vec<PersistentRecord<E>> {
        self.records
            .get(persistence_id)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl<E: Clone + Send + 'static> JournalBackend<E> for InMemoryJournal<E> {
    fn write_messages(&mut self, records: &[PersistentRecord<E>]) -> Result<(), JournalError> {
        // Validate the whole batch before touching storage.
        let mut next_highest: HashMap<&str, SequenceNr> = HashMap::new();
        for record in records {
            let pid = record.persistence_id.as_str();
            let highest = next_highest
                .get(pid)
                .copied()
                .unwrap_or_else(|| self.highest.get(pid).copied().unwrap_or(0));
            if record.sequence_nr <= highest {
                return Err(JournalError::Write(format!(
                    "sequence number {} of '{}' is not above {}",
                    record.sequence_nr, pid, highest
                )));
            }
            next_highest.insert(pid, record.sequence_nr);
        }

        for record in records {
            self.highest
                .insert(record.persistence_id.clone(), record.sequence_nr);
            self.records
                .entry(record.persistence_id.clone())
                .or_default()
                .insert(record.sequence_nr, record.clone());
        }
        Ok(())
    }

    fn replay_messages(
        &mut self,
        persistence_id: &str,
        from: SequenceNr,
        to: SequenceNr,
        max: u64,
        on_record: &mut dyn FnMut(PersistentRecord<E>),
    ) -> Result<(), JournalError> {
        if from > to {
            return Ok(());
        }
        let Some(log) = self.records.get(persistence_id) else {
            return Ok(());
        };
        let limit = usize::try_from(max).unwrap_or(usize::MAX);
        log.range(from..=to)
            .map(|(_, record)| record)
            .filter(|record| !record.is_deleted)
            .take(limit)
            .for_each(|record| on_record(record.clone()));
        Ok(())
    }

    fn highest_sequence_nr(&mut self, persistence_id: &str) -> Result<SequenceNr, JournalError> {
        Ok(self.highest.get(persistence_id).copied().unwrap_or(0))
    }

    fn delete_messages_to(
        &mut self,
        persistence_id: &str,
        to: SequenceNr,
        permanent: bool,
    ) -> Result<(), JournalError> {
        let Some(log) = self.records.get_mut(persistence_id) else {
            return Ok(());
        };
        if permanent {
            // `split_off` keeps everything above `to`.
            *log = log.split_off(&to.saturating_add(1));
        } else {
            for record in log.range_mut(..=to).map(|(_, r)| r) {
                *record = record.mark_deleted();
            }
        }
        Ok(())
    }
}

/// A request paired with the channel its replies go to.
type JournalEnvelope<E, L> = (JournalRequest<E, L>, mpsc::UnboundedSender<JournalResponse<E, L>>);

/// Cloneable address of a spawned journal task.
#[derive(Debug)]
pub struct JournalRef<E, L> {
    sender: mpsc::UnboundedSender<JournalEnvelope<E, L>>,
}

impl<E, L> Clone for JournalRef<E, L> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E: Send + 'static, L: Send + 'static> JournalRef<E, L> {
    /// Send `request`; replies arrive on `reply`.
    ///
    /// Returns `false` if the journal task has stopped.
    pub fn tell(
        &self,
        request: JournalRequest<E, L>,
        reply: mpsc::UnboundedSender<JournalResponse<E, L>>,
    ) -> bool {
        self.sender.send((request, reply)).is_ok()
    }
}

/// Run `backend` on a tokio task and return its address.
///
/// Requests are served one at a time in arrival order, so replies to one
/// requester never interleave across requests. The task exits once every
/// [`JournalRef`] has been dropped.
pub fn spawn_journal<E, L, B>(mut backend: B) -> JournalRef<E, L>
where
    E: Clone + Send + 'static,
    L: Send + 'static,
    B: JournalBackend<E>,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<JournalEnvelope<E, L>>();
    tokio::spawn(async move {
        while let Some((request, reply)) = rx.recv().await {
            for response in process_journal_request(&mut backend, request) {
                // The requester may have stopped; keep serving others.
                if reply.send(response).is_err() {
                    break;
                }
            }
        }
    });
    JournalRef { sender: tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Request = JournalRequest<String, &'static str>;
    type Response = JournalResponse<String, &'static str>;

    fn record(seq: SequenceNr) -> PersistentRecord<String> {
        PersistentRecord::new("p-1", seq, format!("e{seq}"))
    }

    fn write(batch: Vec<WriteItem<String, &'static str>>) -> Request {
        JournalRequest::WriteMessages {
            batch,
            instance_id: 7,
        }
    }

    fn delete_to(to_sequence_nr: SequenceNr, permanent: bool) -> Request {
        JournalRequest::DeleteMessagesTo {
            persistence_id: "p-1".into(),
            to_sequence_nr,
            permanent,
        }
    }

    fn replay(from: SequenceNr, to: SequenceNr, max: u64) -> Request {
        JournalRequest::ReplayMessages {
            from_sequence_nr: from,
            to_sequence_nr: to,
            max,
            persistence_id: "p-1".into(),
        }
    }

    fn replayed_seqs(replies: &[Response]) -> Vec<SequenceNr> {
        replies
            .iter()
            .filter_map(|r| match r {
                JournalResponse::ReplayedMessage(record) => Some(record.sequence_nr),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn write_acknowledges_items_in_order_then_batch() {
        let mut journal = InMemoryJournal::default();
        let replies = process_journal_request(
            &mut journal,
            write(vec![
                WriteItem::Persistent(record(1)),
                WriteItem::Loop {
                    payload: "ping",
                    sender: None,
                },
                WriteItem::Persistent(record(2)),
            ]),
        );

        assert_eq!(replies.len(), 4);
        assert!(matches!(
            &replies[0],
            JournalResponse::WriteMessageSuccess { record, instance_id: 7 } if record.sequence_nr == 1
        ));
        assert!(matches!(
            &replies[1],
            JournalResponse::LoopMessageSuccess { payload: "ping", .. }
        ));
        assert!(matches!(
            &replies[2],
            JournalResponse::WriteMessageSuccess { record, .. } if record.sequence_nr == 2
        ));
        assert!(matches!(
            &replies[3],
            JournalResponse::WriteMessagesSuccess { instance_id: 7 }
        ));
        assert_eq!(journal.records("p-1").len(), 2);
    }

    #[test]
    fn rejected_batch_fails_every_record_but_passes_loops() {
        let mut journal = InMemoryJournal::default();
        process_journal_request(&mut journal, write(vec![WriteItem::Persistent(record(1))]));

        // Sequence number 1 is already taken, so the whole batch is rejected.
        let replies = process_journal_request(
            &mut journal,
            write(vec![
                WriteItem::Persistent(record(2)),
                WriteItem::Loop {
                    payload: "pong",
                    sender: None,
                },
                WriteItem::Persistent(record(1)),
            ]),
        );

        assert!(matches!(&replies[0], JournalResponse::WriteMessageFailure { .. }));
        assert!(matches!(&replies[1], JournalResponse::LoopMessageSuccess { .. }));
        assert!(matches!(&replies[2], JournalResponse::WriteMessageFailure { .. }));
        assert!(matches!(&replies[3], JournalResponse::WriteMessagesFailure { .. }));
        assert_eq!(journal.records("p-1").len(), 1, "batch must be atomic");
    }

    #[test]
    fn replay_respects_range_and_max() {
        let mut journal = InMemoryJournal::default();
        let batch = (1..=6).map(|s| WriteItem::Persistent(record(s))).collect();
        process_journal_request(&mut journal, write(batch));

        let replies = process_journal_request(&mut journal, replay(2, 5, u64::MAX));
        assert_eq!(replayed_seqs(&replies), vec![2, 3, 4, 5]);
        assert!(matches!(
            replies.last(),
            Some(JournalResponse::ReplayMessagesSuccess {
                highest_sequence_nr: 6
            })
        ));

        let replies = process_journal_request(&mut journal, replay(1, u64::MAX, 2));
        assert_eq!(replayed_seqs(&replies), vec![1, 2]);
    }

    #[test]
    fn replay_of_unknown_entity_succeeds_empty() {
        let mut journal = InMemoryJournal::<String>::default();
        let replies = process_journal_request(&mut journal, replay(1, u64::MAX, u64::MAX));
        assert_eq!(replies.len(), 1);
        assert!(matches!(
            replies[0],
            JournalResponse::ReplayMessagesSuccess {
                highest_sequence_nr: 0
            }
        ));
    }

    #[test]
    fn logical_delete_hides_records_from_replay() {
        let mut journal = InMemoryJournal::default();
        let batch = (1..=4).map(|s| WriteItem::Persistent(record(s))).collect();
        process_journal_request(&mut journal, write(batch));

        let replies = process_journal_request(&mut journal, delete_to(2, false));
        assert!(replies.is_empty(), "delete is fire-and-forget");

        let stored = journal.records("p-1");
        assert!(stored[0].is_deleted && stored[1].is_deleted);
        assert!(!stored[2].is_deleted);

        let replies = process_journal_request(&mut journal, replay(1, u64::MAX, u64::MAX));
        assert_eq!(replayed_seqs(&replies), vec![3, 4]);
    }

    #[test]
    fn permanent_delete_keeps_highest_sequence_nr() {
        let mut journal = InMemoryJournal::default();
        let batch = (1..=3).map(|s| WriteItem::Persistent(record(s))).collect();
        process_journal_request(&mut journal, write(batch));
        process_journal_request(&mut journal, delete_to(3, true));
        assert!(journal.records("p-1").is_empty());

        let replies = process_journal_request(&mut journal, replay(1, u64::MAX, u64::MAX));
        assert!(matches!(
            replies.as_slice(),
            [JournalResponse::ReplayMessagesSuccess {
                highest_sequence_nr: 3
            }]
        ));
    }

    #[tokio::test]
    async fn spawned_journal_replies_in_order() {
        let journal = spawn_journal::<String, &'static str, _>(InMemoryJournal::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(journal.tell(
            write(vec![
                WriteItem::Persistent(record(1)),
                WriteItem::Persistent(record(2)),
            ]),
            tx.clone(),
        ));
        journal.tell(replay(1, u64::MAX, u64::MAX), tx);

        let mut kinds = Vec::new();
        for _ in 0..6 {
            let reply = rx.recv().await.expect("journal should reply");
            kinds.push(match reply {
                JournalResponse::WriteMessageSuccess { .. } => "write",
                JournalResponse::WriteMessagesSuccess { .. } => "batch",
                JournalResponse::ReplayedMessage(_) => "replayed",
                JournalResponse::ReplayMessagesSuccess { .. } => "replay-done",
                other => panic!("unexpected reply: {other:?}"),
            });
        }
        assert_eq!(
            kinds,
            vec!["write", "write", "batch", "replayed", "replayed", "replay-done"]
        );
    }
}
