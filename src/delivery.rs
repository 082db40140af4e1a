//! At-least-once delivery ledger.
//!
//! The ledger remembers every message sent through
//! [`DeliveryLedger::deliver`] until [`DeliveryLedger::confirm`] is called
//! with its delivery id. A periodic tick (half the redeliver interval)
//! resends entries that stayed unconfirmed for a full interval and reports
//! entries that crossed the warning threshold.
//!
//! The ledger is owned by one entity and mutated only from that entity's
//! turn. It performs no I/O: sends are returned as [`Outgoing`] values for
//! the caller to route.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::DeliveryError;
use crate::record::ActorPath;

/// Per-entity, monotonically increasing identifier of a delivery.
pub type DeliveryId = u64;

/// Tuning for the delivery ledger.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_persistence::DeliveryConfig;
///
/// let config = DeliveryConfig {
///     redeliver_interval: Duration::from_secs(2),
///     ..DeliveryConfig::default()
/// };
/// assert_eq!(config.redelivery_tick_interval(), Duration::from_secs(1));
/// assert_eq!(config.max_unconfirmed_messages, 100_000);
/// ```
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// How long an entry may stay unconfirmed before it is resent.
    ///
    /// Default: 5 seconds.
    pub redeliver_interval: Duration,

    /// Attempt count at which an entry is reported in an
    /// [`UnconfirmedWarning`].
    ///
    /// Default: 5.
    pub warn_after_number_of_unconfirmed_attempts: u32,

    /// Maximum number of unconfirmed entries before `deliver` fails.
    ///
    /// Default: 100 000.
    pub max_unconfirmed_messages: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            redeliver_interval: Duration::from_secs(5),
            warn_after_number_of_unconfirmed_attempts: 5,
            max_unconfirmed_messages: 100_000,
        }
    }
}

impl DeliveryConfig {
    /// Period of the redelivery tick: half the redeliver interval.
    pub fn redelivery_tick_interval(&self) -> Duration {
        self.redeliver_interval / 2
    }
}

/// A message the ledger wants sent to `destination`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing<M> {
    /// Where the message goes.
    pub destination: ActorPath,
    /// The ledger entry this send belongs to.
    pub delivery_id: DeliveryId,
    /// The message itself.
    pub message: M,
}

/// An entry that is still waiting for confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnconfirmedDelivery<M> {
    /// Ledger key of the entry.
    pub delivery_id: DeliveryId,
    /// Where the message is sent.
    pub destination: ActorPath,
    /// The message.
    pub message: M,
}

/// Entries that reached the warning attempt threshold on one tick.
///
/// Delivered to the entity's handler. Each entry appears in at most one
/// warning per threshold crossing.
#[derive(Debug, Clone, PartialEq)]
pub struct UnconfirmedWarning<M> {
    /// The entries that crossed the threshold.
    pub unconfirmed: Vec<UnconfirmedDelivery<M>>,
}

/// Serializable point-in-time capture of a ledger.
///
/// Serialized as `{deliveryIdCounter, entries: [{deliveryId, destination, message}]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverySnapshot<M> {
    /// The last delivery id handed out.
    #[serde(rename = "deliveryIdCounter")]
    pub current_delivery_id: DeliveryId,
    /// Entries still unconfirmed when the capture was taken.
    #[serde(rename = "entries")]
    pub unconfirmed: Vec<UnconfirmedDelivery<M>>,
}

/// One ledger entry.
#[derive(Debug, Clone)]
struct Delivery<M> {
    destination: ActorPath,
    message: M,
    last_sent_at: Instant,
    attempt: u32,
}

/// Table of unconfirmed outbound messages for one entity.
#[derive(Debug)]
pub struct DeliveryLedger<M> {
    config: DeliveryConfig,
    // Single writer: only the owning entity's turn touches the counter.
    delivery_sequence_nr: DeliveryId,
    unconfirmed: BTreeMap<DeliveryId, Delivery<M>>,
}

impl<M: Clone> DeliveryLedger<M> {
    /// Create an empty ledger.
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            delivery_sequence_nr: 0,
            unconfirmed: BTreeMap::new(),
        }
    }

    /// The ledger's configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Number of entries awaiting confirmation.
    pub fn number_of_unconfirmed(&self) -> usize {
        self.unconfirmed.len()
    }

    /// Send count of entry `delivery_id`, if present.
    pub fn attempts(&self, delivery_id: DeliveryId) -> Option<u32> {
        self.unconfirmed.get(&delivery_id).map(|d| d.attempt)
    }

    /// Register a new delivery to `destination`.
    ///
    /// The message is built from the freshly allocated delivery id. While
    /// the owner is recovering nothing is sent: the entry is recorded with
    /// zero attempts and a timestamp backdated by one redeliver interval,
    /// so the first tick after recovery resends it.
    ///
    /// # Returns
    ///
    /// The delivery id and, outside recovery, the send to perform now.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::MaxUnconfirmedExceeded`] when the ledger is full;
    /// the ledger is left unchanged and `build` is not called.
    pub fn deliver(
        &mut self,
        destination: ActorPath,
        build: impl FnOnce(DeliveryId) -> M,
        recovery_running: bool,
        now: Instant,
    ) -> Result<(DeliveryId, Option<Outgoing<M>>), DeliveryError> {
        let max = self.config.max_unconfirmed_messages;
        if self.unconfirmed.len() >= max {
            return Err(DeliveryError::MaxUnconfirmedExceeded { max });
        }

        self.delivery_sequence_nr += 1;
        let delivery_id = self.delivery_sequence_nr;
        let message = build(delivery_id);

        if recovery_running {
            let backdated = now
                .checked_sub(self.config.redeliver_interval)
                .unwrap_or(now);
            self.unconfirmed.insert(
                delivery_id,
                Delivery {
                    destination,
                    message,
                    last_sent_at: backdated,
                    attempt: 0,
                },
            );
            return Ok((delivery_id, None));
        }

        let outgoing = Outgoing {
            destination: destination.clone(),
            delivery_id,
            message: message.clone(),
        };
        self.unconfirmed.insert(
            delivery_id,
            Delivery {
                destination,
                message,
                last_sent_at: now,
                attempt: 1,
            },
        );
        Ok((delivery_id, Some(outgoing)))
    }

    /// Remove entry `delivery_id`.
    ///
    /// Returns `true` if it was present. Confirming twice is harmless.
    pub fn confirm(&mut self, delivery_id: DeliveryId) -> bool {
        self.unconfirmed.remove(&delivery_id).is_some()
    }

    /// Resend every entry last sent at least one redeliver interval before
    /// `now`.
    ///
    /// # Returns
    ///
    /// The sends to perform, in delivery-id order, and a warning bundling
    /// the resent entries whose attempt count equalled the warning
    /// threshold before this resend.
    pub fn redeliver_overdue(
        &mut self,
        now: Instant,
    ) -> (Vec<Outgoing<M>>, Option<UnconfirmedWarning<M>>) {
        let Some(deadline) = now.checked_sub(self.config.redeliver_interval) else {
            return (Vec::new(), None);
        };
        let threshold = self.config.warn_after_number_of_unconfirmed_attempts;

        let mut sends = Vec::new();
        let mut warnings = Vec::new();
        for (&delivery_id, delivery) in self.unconfirmed.iter_mut() {
            if delivery.last_sent_at > deadline {
                continue;
            }
            if delivery.attempt == threshold {
                warnings.push(UnconfirmedDelivery {
                    delivery_id,
                    destination: delivery.destination.clone(),
                    message: delivery.message.clone(),
                });
            }
            delivery.attempt += 1;
            delivery.last_sent_at = now;
            sends.push(Outgoing {
                destination: delivery.destination.clone(),
                delivery_id,
                message: delivery.message.clone(),
            });
        }

        let warning = (!warnings.is_empty()).then_some(UnconfirmedWarning {
            unconfirmed: warnings,
        });
        (sends, warning)
    }

    /// Capture the counter and every unconfirmed entry.
    pub fn snapshot(&self) -> DeliverySnapshot<M> {
        DeliverySnapshot {
            current_delivery_id: self.delivery_sequence_nr,
            unconfirmed: self
                .unconfirmed
                .iter()
                .map(|(&delivery_id, d)| UnconfirmedDelivery {
                    delivery_id,
                    destination: d.destination.clone(),
                    message: d.message.clone(),
                })
                .collect(),
        }
    }

    /// Replace the ledger's contents with `snapshot`.
    ///
    /// Every restored entry starts over at zero attempts, last sent `now`.
    pub fn restore(&mut self, snapshot: DeliverySnapshot<M>, now: Instant) {
        self.delivery_sequence_nr = snapshot.current_delivery_id;
        self.unconfirmed = snapshot
            .unconfirmed
            .into_iter()
            .map(|u| {
                (
                    u.delivery_id,
                    Delivery {
                        destination: u.destination,
                        message: u.message,
                        last_sent_at: now,
                        attempt: 0,
                    },
                )
            })
            .collect();
    }
}
