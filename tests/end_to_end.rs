//! Spawned entities driven through the public API: recovery from journal
//! and snapshot stores, at-least-once delivery across restarts, and
//! message deletion.

use std::time::Duration;

use eventfold_persistence::{
    ActorPath, Context, DeliveryConfig, DeliveryError, DeliveryId, DeliverySnapshot,
    InMemoryJournal, InMemorySnapshotStore, JournalRef, LocalSnapshotStore, Processor,
    ProcessorBuilder, ProcessorHandle, Received, Router, SnapshotStoreRef, spawn_journal,
    spawn_snapshot_store,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum DeskEvent {
    Placed(String),
    Shipped(DeliveryId),
}

#[derive(Debug, Clone, PartialEq)]
enum DeskCommand {
    Place(String),
    WarehouseAck(DeliveryId),
    TakeSnapshot,
    Forget(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ShipRequest {
    delivery_id: DeliveryId,
    order: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeskSnapshot {
    orders: Vec<String>,
    deliveries: DeliverySnapshot<ShipRequest>,
}

/// Takes orders and asks the warehouse to ship each one until it acks.
#[derive(Debug)]
struct Desk {
    warehouse: ActorPath,
    orders: Vec<String>,
    saved_at: Option<u64>,
}

impl Desk {
    fn new() -> Self {
        Self {
            warehouse: ActorPath::new("/user/warehouse"),
            orders: Vec::new(),
            saved_at: None,
        }
    }
}

impl Processor for Desk {
    type Event = DeskEvent;
    type Command = DeskCommand;
    type Snapshot = DeskSnapshot;
    type Delivery = ShipRequest;
    type Fault = DeliveryError;

    fn persistence_id(&self) -> &str {
        "desk-1"
    }

    fn receive(
        &mut self,
        ctx: &mut Context<'_, Self>,
        message: Received<Self>,
    ) -> Result<(), Self::Fault> {
        match message {
            Received::Persistent(record) => match record.payload {
                DeskEvent::Placed(order) => {
                    self.orders.push(order.clone());
                    ctx.deliver(self.warehouse.clone(), |delivery_id| ShipRequest {
                        delivery_id,
                        order,
                    })?;
                }
                DeskEvent::Shipped(delivery_id) => {
                    ctx.confirm_delivery(delivery_id);
                }
            },
            Received::Command(DeskCommand::Place(order)) => ctx.persist(DeskEvent::Placed(order)),
            Received::Command(DeskCommand::WarehouseAck(id)) => {
                ctx.persist(DeskEvent::Shipped(id));
            }
            Received::Command(DeskCommand::TakeSnapshot) => {
                let snapshot = DeskSnapshot {
                    orders: self.orders.clone(),
                    deliveries: ctx.delivery_snapshot(),
                };
                ctx.save_snapshot(snapshot);
            }
            Received::Command(DeskCommand::Forget(to)) => ctx.delete_messages(to, false),
            Received::SnapshotOffer(offer) => {
                self.orders = offer.snapshot.orders;
                ctx.set_delivery_snapshot(offer.snapshot.deliveries);
            }
            Received::SnapshotSaved(metadata) => self.saved_at = Some(metadata.sequence_nr),
            _ => {}
        }
        Ok(())
    }
}

type Journal = JournalRef<DeskEvent, DeskCommand>;
type Snapshots = SnapshotStoreRef<DeskSnapshot>;

fn desk(journal: &Journal, snapshots: &Snapshots, router: &Router<ShipRequest>) -> ProcessorHandle<Desk> {
    ProcessorBuilder::new(journal.clone(), snapshots.clone())
        .router(router.clone())
        .delivery_config(DeliveryConfig {
            redeliver_interval: Duration::from_secs(1),
            ..DeliveryConfig::default()
        })
        .spawn(Desk::new)
}

async fn orders(handle: &ProcessorHandle<Desk>) -> Vec<String> {
    handle
        .query(|desk, _| desk.orders.clone())
        .await
        .expect("query should succeed")
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_shipments_are_resent_after_respawn() {
    let journal: Journal = spawn_journal(InMemoryJournal::default());
    let snapshots: Snapshots = spawn_snapshot_store(InMemorySnapshotStore::default());
    let router = Router::new();
    let mut warehouse = router.register("/user/warehouse");

    let first = desk(&journal, &snapshots, &router);
    first
        .tell(DeskCommand::Place("o-1".into()))
        .expect("tell should succeed");
    first
        .tell(DeskCommand::Place("o-2".into()))
        .expect("tell should succeed");

    let a = warehouse.recv().await.expect("first request");
    let b = warehouse.recv().await.expect("second request");
    assert_eq!((a.delivery_id, a.order.as_str()), (1, "o-1"));
    assert_eq!((b.delivery_id, b.order.as_str()), (2, "o-2"));

    first
        .tell(DeskCommand::WarehouseAck(1))
        .expect("tell should succeed");
    let status = first.status().await.expect("status should succeed");
    assert_eq!(status.number_of_unconfirmed, 1);
    first.shutdown();

    // Replay rebuilds the ledger without sending; the first tick resends
    // what is still unconfirmed.
    let second = desk(&journal, &snapshots, &router);
    let resent = warehouse.recv().await.expect("resent request");
    assert_eq!(
        resent,
        ShipRequest {
            delivery_id: 2,
            order: "o-2".into()
        }
    );
    let status = second.status().await.expect("status should succeed");
    assert_eq!(status.last_sequence_nr, 3);
    assert_eq!(status.number_of_unconfirmed, 1);
}

#[tokio::test]
async fn local_snapshot_restores_orders_and_ledger() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let journal: Journal = spawn_journal(InMemoryJournal::default());
    let router = Router::new();

    {
        let snapshots: Snapshots = spawn_snapshot_store(LocalSnapshotStore::new(tmp.path()));
        let handle = desk(&journal, &snapshots, &router);
        for order in ["o-1", "o-2"] {
            handle
                .tell(DeskCommand::Place(order.into()))
                .expect("tell should succeed");
        }
        assert_eq!(orders(&handle).await.len(), 2);
        handle
            .tell(DeskCommand::TakeSnapshot)
            .expect("tell should succeed");

        let mut saved = None;
        for _ in 0..200 {
            saved = handle
                .query(|desk, _| desk.saved_at)
                .await
                .expect("query should succeed");
            if saved.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(saved, Some(2));
        handle.shutdown();
    }

    let store = LocalSnapshotStore::<DeskSnapshot>::new(tmp.path());
    let files = std::fs::read_dir(store.snapshot_dir("desk-1"))
        .expect("snapshot dir should exist")
        .count();
    assert_eq!(files, 1);

    let snapshots: Snapshots = spawn_snapshot_store(store);
    let handle = desk(&journal, &snapshots, &router);
    assert_eq!(orders(&handle).await, vec!["o-1", "o-2"]);
    let status = handle.status().await.expect("status should succeed");
    assert_eq!(status.last_sequence_nr, 2);
    assert_eq!(status.number_of_unconfirmed, 2);
}

#[tokio::test]
async fn deleted_messages_are_not_replayed_and_numbers_are_not_reused() {
    let journal: Journal = spawn_journal(InMemoryJournal::default());
    let snapshots: Snapshots = spawn_snapshot_store(InMemorySnapshotStore::default());
    let router = Router::new();

    {
        let handle = desk(&journal, &snapshots, &router);
        for order in ["o-1", "o-2", "o-3"] {
            handle
                .tell(DeskCommand::Place(order.into()))
                .expect("tell should succeed");
        }
        assert_eq!(orders(&handle).await.len(), 3);
        handle.tell(DeskCommand::Forget(2)).expect("tell should succeed");
        orders(&handle).await;
        handle.shutdown();
    }

    let handle = desk(&journal, &snapshots, &router);
    handle
        .tell(DeskCommand::Place("o-4".into()))
        .expect("tell should succeed");
    assert_eq!(orders(&handle).await, vec!["o-3", "o-4"]);
    let status = handle.status().await.expect("status should succeed");
    assert_eq!(status.last_sequence_nr, 4);
}
