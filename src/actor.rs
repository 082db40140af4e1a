//! Actor runtime hosting one eventsourced entity on a tokio task.
//!
//! The task owns the [`Processor`] and its [`Eventsourced`] core, handles
//! one message at a time from the inbox and from the journal and snapshot
//! store reply channels, and routes the core's effects. A separate timer
//! task feeds redelivery ticks into the inbox.
//!
//! When the handler faults, the supervisor either stops the actor or
//! restarts it: a fresh processor from the factory and a fresh core (new
//! incarnation id and writer token) recover from storage, and messages the
//! failed incarnation had not yet handled are handled first.
//!
//! Public API: [`ProcessorBuilder`] (configuration and spawn) and
//! [`ProcessorHandle`] (cloneable handle).

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::delivery::DeliveryConfig;
use crate::error::HandleError;
use crate::journal::{JournalRef, JournalResponse};
use crate::processor::{Effect, Envelope, Eventsourced, PersistenceConfig, Processor};
use crate::record::{ActorPath, SequenceNr};
use crate::recovery::Recover;
use crate::router::Router;
use crate::snapshot::{SnapshotResponse, SnapshotStoreRef};

/// What happens when the entity's handler faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStrategy {
    /// Restart with recovery, up to `max_restarts` times over the actor's
    /// lifetime, then stop.
    Restart {
        /// Restarts allowed before the actor stops.
        max_restarts: u32,
    },
    /// Stop on the first fault.
    Stop,
}

impl SupervisorStrategy {
    fn allows_restart(&self, restarts_so_far: u32) -> bool {
        match self {
            SupervisorStrategy::Restart { max_restarts } => restarts_so_far < *max_restarts,
            SupervisorStrategy::Stop => false,
        }
    }
}

impl Default for SupervisorStrategy {
    fn default() -> Self {
        SupervisorStrategy::Restart { max_restarts: 10 }
    }
}

/// Everything the actor loop needs besides its channels.
///
/// Internal to the crate -- callers configure it through
/// [`ProcessorBuilder`].
#[derive(Debug, Clone, Default)]
pub(crate) struct ActorConfig {
    pub persistence: PersistenceConfig,
    pub delivery: DeliveryConfig,
    pub supervisor: SupervisorStrategy,
    pub recover: Recover,
}

/// A read of the entity, answered once it is settled.
type Query<P> = Box<dyn FnOnce(&P, &Eventsourced<P>) + Send>;

/// Messages sent from [`ProcessorHandle`] (and the redelivery timer) to
/// the actor loop.
pub(crate) enum ActorMessage<P: Processor> {
    /// Drive the core.
    Envelope(Envelope<P>),
    /// Read the processor and its core.
    Query(Query<P>),
    /// Stop the actor loop.
    Shutdown,
}

/// Point-in-time view of a running entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorStatus {
    /// Identifier of the entity's log.
    pub persistence_id: String,
    /// Id of the current incarnation. Changes on every restart.
    pub instance_id: u64,
    /// Sequence number of the last record handled.
    pub last_sequence_nr: SequenceNr,
    /// Deliveries awaiting confirmation.
    pub number_of_unconfirmed: usize,
}

/// One incarnation: the processor, its core, and the reply channels its
/// requests use. Replies to a previous incarnation's channels are lost
/// with them.
struct Incarnation<P: Processor> {
    processor: P,
    core: Eventsourced<P>,
    journal_tx: mpsc::UnboundedSender<JournalResponse<P::Event, P::Command>>,
    journal_rx: mpsc::UnboundedReceiver<JournalResponse<P::Event, P::Command>>,
    snapshot_tx: mpsc::UnboundedSender<SnapshotResponse<P::Snapshot>>,
    snapshot_rx: mpsc::UnboundedReceiver<SnapshotResponse<P::Snapshot>>,
    timer: JoinHandle<()>,
}

impl<P: Processor> Incarnation<P> {
    /// Whether recovery is done and no journal write is outstanding.
    fn is_settled(&self) -> bool {
        self.core.is_processing() && !self.core.is_batch_in_flight()
    }
}

enum Next<P: Processor> {
    Envelope(Envelope<P>),
    Query(Query<P>),
    Stop,
}

/// The actor loop's long-lived state.
struct Runner<P: Processor, F> {
    factory: F,
    journal: JournalRef<P::Event, P::Command>,
    snapshots: SnapshotStoreRef<P::Snapshot>,
    router: Router<P::Delivery>,
    config: ActorConfig,
    inbox: mpsc::WeakUnboundedSender<ActorMessage<P>>,
}

impl<P, F> Runner<P, F>
where
    P: Processor,
    F: FnMut() -> P + Send + 'static,
{
    /// Create a new incarnation and queue its recovery ahead of `front`.
    fn incarnate(&mut self, recover: Recover, front: &mut VecDeque<Envelope<P>>) -> Incarnation<P> {
        let processor = (self.factory)();
        let core = Eventsourced::new(
            processor.persistence_id(),
            self.config.persistence.clone(),
            self.config.delivery.clone(),
        );
        let (journal_tx, journal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let timer = spawn_redelivery_timer(
            self.inbox.clone(),
            self.config.delivery.redelivery_tick_interval(),
        );
        front.push_front(Envelope::Recover(recover));

        tracing::debug!(
            persistence_id = %core.persistence_id(),
            instance_id = core.instance_id(),
            "processor incarnation started"
        );
        Incarnation {
            processor,
            core,
            journal_tx,
            journal_rx,
            snapshot_tx,
            snapshot_rx,
            timer,
        }
    }

    /// Runs the actor loop until shutdown, all handles drop, or the
    /// supervisor gives up.
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ActorMessage<P>>) {
        let mut front: VecDeque<Envelope<P>> = VecDeque::new();
        let mut queries: Vec<Query<P>> = Vec::new();
        let mut restarts = 0u32;
        let mut current = self.incarnate(self.config.recover, &mut front);

        loop {
            let next = match front.pop_front() {
                Some(envelope) => Next::Envelope(envelope),
                None => tokio::select! {
                    biased;
                    Some(response) = current.journal_rx.recv() => Next::Envelope(Envelope::Journal(response)),
                    Some(response) = current.snapshot_rx.recv() => Next::Envelope(Envelope::Snapshot(response)),
                    message = inbox.recv() => match message {
                        Some(ActorMessage::Envelope(envelope)) => Next::Envelope(envelope),
                        Some(ActorMessage::Query(query)) => Next::Query(query),
                        Some(ActorMessage::Shutdown) | None => Next::Stop,
                    },
                },
            };

            let envelope = match next {
                Next::Envelope(envelope) => envelope,
                Next::Query(query) => {
                    if current.is_settled() {
                        query(&current.processor, &current.core);
                    } else {
                        queries.push(query);
                    }
                    continue;
                }
                Next::Stop => break,
            };

            let result = {
                let _span = tracing::info_span!(
                    "processor",
                    persistence_id = %current.core.persistence_id(),
                    instance_id = current.core.instance_id(),
                )
                .entered();
                let result = current.core.handle(&mut current.processor, envelope);
                self.route(&mut current);
                result
            };

            match result {
                Ok(()) => {
                    if current.is_settled() {
                        for query in queries.drain(..) {
                            query(&current.processor, &current.core);
                        }
                    }
                }
                Err(err) => {
                    current.timer.abort();
                    tracing::error!(
                        persistence_id = %current.core.persistence_id(),
                        phase = current.core.phase_name(),
                        error = %err,
                        "processor failed"
                    );
                    if !self.config.supervisor.allows_restart(restarts) {
                        tracing::error!(
                            persistence_id = %current.core.persistence_id(),
                            restarts,
                            "processor stopped by supervisor"
                        );
                        return;
                    }
                    restarts += 1;

                    let restart = current.core.into_restart();
                    for envelope in restart.requeue.into_iter().rev() {
                        front.push_front(envelope);
                    }
                    let recover = Recover {
                        to_sequence_nr: restart.to_sequence_nr,
                        ..self.config.recover
                    };
                    current = self.incarnate(recover, &mut front);
                    tracing::warn!(
                        persistence_id = %current.core.persistence_id(),
                        restarts,
                        to_sequence_nr = restart.to_sequence_nr,
                        "processor restarted"
                    );
                }
            }
        }
        current.timer.abort();
    }

    /// Send the core's effects on their way.
    fn route(&self, current: &mut Incarnation<P>) {
        for effect in current.core.take_effects() {
            match effect {
                Effect::Journal(request) => {
                    if !self.journal.tell(request, current.journal_tx.clone()) {
                        tracing::error!("journal stopped, request dropped");
                    }
                }
                Effect::Snapshot(request) => {
                    if !self.snapshots.tell(request, current.snapshot_tx.clone()) {
                        tracing::error!("snapshot store stopped, request dropped");
                    }
                }
                Effect::Send(outgoing) => {
                    if !self.router.send(&outgoing.destination, outgoing.message) {
                        tracing::debug!(
                            destination = %outgoing.destination,
                            delivery_id = outgoing.delivery_id,
                            "destination unreachable, awaiting redelivery"
                        );
                    }
                }
            }
        }
    }
}

/// Feed a redelivery tick into `inbox` every `period` until the actor is
/// gone or the task is aborted.
fn spawn_redelivery_timer<P: Processor>(
    inbox: mpsc::WeakUnboundedSender<ActorMessage<P>>,
    period: Duration,
) -> JoinHandle<()> {
    // `interval` rejects a zero period.
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let Some(inbox) = inbox.upgrade() else {
                break;
            };
            if inbox
                .send(ActorMessage::Envelope(Envelope::RedeliveryTick))
                .is_err()
            {
                break;
            }
        }
    })
}

/// Async handle to a running entity.
///
/// Lightweight and cloneable. The actor stops once every handle has been
/// dropped, on [`shutdown`](ProcessorHandle::shutdown), or when its
/// supervisor gives up.
pub struct ProcessorHandle<P: Processor> {
    sender: mpsc::UnboundedSender<ActorMessage<P>>,
}

// Manual `Clone` because `P` need not be `Clone`.
impl<P: Processor> Clone for ProcessorHandle<P> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<P: Processor> std::fmt::Debug for ProcessorHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<P: Processor> ProcessorHandle<P> {
    fn send(&self, message: ActorMessage<P>) -> Result<(), HandleError> {
        self.sender.send(message).map_err(|_| HandleError::ActorGone)
    }

    /// Send a transient message to the handler.
    ///
    /// # Errors
    ///
    /// [`HandleError::ActorGone`] if the actor has stopped.
    pub fn tell(&self, command: P::Command) -> Result<(), HandleError> {
        self.send(ActorMessage::Envelope(Envelope::Command(command)))
    }

    /// Persist `event`; the handler receives it once written.
    ///
    /// # Errors
    ///
    /// [`HandleError::ActorGone`] if the actor has stopped.
    pub fn persist(&self, event: P::Event) -> Result<(), HandleError> {
        self.send(ActorMessage::Envelope(Envelope::Persist {
            payload: event,
            sender: None,
        }))
    }

    /// Persist `event`, recording `sender` on the resulting record.
    ///
    /// # Errors
    ///
    /// [`HandleError::ActorGone`] if the actor has stopped.
    pub fn persist_from(&self, event: P::Event, sender: ActorPath) -> Result<(), HandleError> {
        self.send(ActorMessage::Envelope(Envelope::Persist {
            payload: event,
            sender: Some(sender),
        }))
    }

    /// Route `command` through the journal so the handler sees it after
    /// every event persisted before it.
    ///
    /// # Errors
    ///
    /// [`HandleError::ActorGone`] if the actor has stopped.
    pub fn defer(&self, command: P::Command) -> Result<(), HandleError> {
        self.send(ActorMessage::Envelope(Envelope::Loop {
            payload: command,
            sender: None,
        }))
    }

    /// Run `f` against the entity once it is settled: recovered, with no
    /// journal write outstanding.
    ///
    /// # Errors
    ///
    /// [`HandleError::ActorGone`] if the actor stops before answering.
    pub async fn query<R, Q>(&self, f: Q) -> Result<R, HandleError>
    where
        R: Send + 'static,
        Q: FnOnce(&P, &Eventsourced<P>) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let query: Query<P> = Box::new(move |processor: &P, core: &Eventsourced<P>| {
            // The caller may have given up waiting.
            let _ = tx.send(f(processor, core));
        });
        self.send(ActorMessage::Query(query))?;
        rx.await.map_err(|_| HandleError::ActorGone)
    }

    /// Current persistence status, once settled.
    ///
    /// # Errors
    ///
    /// [`HandleError::ActorGone`] if the actor stops before answering.
    pub async fn status(&self) -> Result<ProcessorStatus, HandleError> {
        self.query(|_, core| ProcessorStatus {
            persistence_id: core.persistence_id().to_owned(),
            instance_id: core.instance_id(),
            last_sequence_nr: core.last_sequence_nr(),
            number_of_unconfirmed: core.ledger().number_of_unconfirmed(),
        })
        .await
    }

    /// Ask the actor to stop after the messages already queued.
    pub fn shutdown(&self) {
        // Already stopped is fine.
        let _ = self.send(ActorMessage::Shutdown);
    }

    /// Check whether the actor is still running.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Configures and spawns an entity actor.
///
/// ```no_run
/// use eventfold_persistence::{
///     InMemoryJournal, InMemorySnapshotStore, ProcessorBuilder, spawn_journal,
///     spawn_snapshot_store,
/// };
/// # use eventfold_persistence::{Context, Processor, Received};
/// # #[derive(Debug, thiserror::Error)] #[error("never")] struct Never;
/// # struct Counter(u64);
/// # impl Processor for Counter {
/// #     type Event = u64; type Command = (); type Snapshot = u64;
/// #     type Delivery = (); type Fault = Never;
/// #     fn persistence_id(&self) -> &str { "counter-1" }
/// #     fn receive(&mut self, _: &mut Context<'_, Self>, m: Received<Self>) -> Result<(), Never> {
/// #         if let Received::Persistent(r) = m { self.0 += r.payload; }
/// #         Ok(())
/// #     }
/// # }
///
/// # async fn demo() {
/// let journal = spawn_journal(InMemoryJournal::default());
/// let snapshots = spawn_snapshot_store(InMemorySnapshotStore::default());
/// let handle = ProcessorBuilder::new(journal, snapshots).spawn(|| Counter(0));
/// handle.persist(5).expect("actor running");
/// # }
/// ```
pub struct ProcessorBuilder<P: Processor> {
    journal: JournalRef<P::Event, P::Command>,
    snapshots: SnapshotStoreRef<P::Snapshot>,
    router: Router<P::Delivery>,
    config: ActorConfig,
}

impl<P: Processor> ProcessorBuilder<P> {
    /// Start a builder for an entity backed by `journal` and `snapshots`.
    pub fn new(
        journal: JournalRef<P::Event, P::Command>,
        snapshots: SnapshotStoreRef<P::Snapshot>,
    ) -> Self {
        Self {
            journal,
            snapshots,
            router: Router::new(),
            config: ActorConfig::default(),
        }
    }

    /// Route deliveries through `router`. Defaults to an empty router.
    pub fn router(mut self, router: Router<P::Delivery>) -> Self {
        self.router = router;
        self
    }

    /// Set batching and replay behavior.
    pub fn persistence_config(mut self, config: PersistenceConfig) -> Self {
        self.config.persistence = config;
        self
    }

    /// Set at-least-once delivery behavior.
    pub fn delivery_config(mut self, config: DeliveryConfig) -> Self {
        self.config.delivery = config;
        self
    }

    /// Set the fault-handling strategy. Defaults to ten restarts.
    pub fn supervisor(mut self, strategy: SupervisorStrategy) -> Self {
        self.config.supervisor = strategy;
        self
    }

    /// Set the initial recovery request. Defaults to the latest snapshot
    /// and the whole journal after it.
    pub fn recover(mut self, recover: Recover) -> Self {
        self.config.recover = recover;
        self
    }

    /// Spawn the actor. `factory` builds the processor for the first
    /// incarnation and again after every restart.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn<F>(self, factory: F) -> ProcessorHandle<P>
    where
        F: FnMut() -> P + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<ActorMessage<P>>();
        let runner = Runner {
            factory,
            journal: self.journal,
            snapshots: self.snapshots,
            router: self.router,
            config: self.config,
            inbox: tx.downgrade(),
        };
        tokio::spawn(runner.run(rx));
        ProcessorHandle { sender: tx }
    }
}
