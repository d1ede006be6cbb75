//! Two server instances sharing one broker

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use courier_api::dispatch::{DeliveryPath, DispatchOutcome, Dispatcher, Recipient, SendParams};
use courier_api::realtime::{connection, Bridge, BridgeSettings, Connection, ConnectionSettings, Hub, LoopbackBroker};
use courier_shared::{
    EntityId, Identity, NewNotification, Notification, NotificationCategory, NotificationId,
    NotificationPreferences, NotificationStore, Role, StoreError, UserId,
};
use futures::channel::mpsc;
use futures::StreamExt;
use time::{OffsetDateTime, UtcOffset};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MemoryStore {
    created: Mutex<Vec<Notification>>,
    pushed: Mutex<Vec<NotificationId>>,
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn create_notification(&self, new: &NewNotification) -> Result<Notification, StoreError> {
        let mut created = self.created.lock().unwrap();
        let notification = Notification {
            id: NotificationId(created.len() as i64 + 1),
            user_id: new.user_id,
            category: new.category,
            title: new.title.clone(),
            body: new.body.clone(),
            related_type: new.related.as_ref().map(|r| r.kind.clone()),
            related_id: new.related.as_ref().map(|r| r.id),
            extra: new.extra.clone(),
            is_read: false,
            read_at: None,
            is_pushed: false,
            pushed_at: None,
            expires_at: new.expires_at,
            created_at: OffsetDateTime::now_utc(),
        };
        created.push(notification.clone());
        Ok(notification)
    }

    async fn mark_notification_as_pushed(
        &self,
        id: NotificationId,
        _pushed_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.pushed.lock().unwrap().push(id);
        Ok(())
    }

    async fn get_preferences(
        &self,
        _user_id: UserId,
    ) -> Result<Option<NotificationPreferences>, StoreError> {
        Ok(None)
    }
}

struct Instance {
    hub: Hub,
    bridge: Bridge,
    dispatcher: Dispatcher,
}

fn instance(broker: &LoopbackBroker, store: &Arc<MemoryStore>, cancel: &CancellationToken) -> Instance {
    let hub = Hub::new();
    let bridge = Bridge::new(Arc::new(broker.clone()), hub.clone(), BridgeSettings::default());
    bridge.spawn(cancel.child_token());
    let dispatcher = Dispatcher::new(store.clone(), hub.clone(), Some(bridge.clone()), UtcOffset::UTC);
    Instance {
        hub,
        bridge,
        dispatcher,
    }
}

async fn eventually(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn rider_recipient() -> Recipient {
    Recipient {
        user_id: UserId(501),
        role: Role::Rider,
        entity_id: EntityId(50),
    }
}

fn pickup_event() -> SendParams {
    SendParams::new(
        rider_recipient(),
        NotificationCategory::Delivery,
        "Pickup ready",
        "Order 88 is waiting at the counter",
    )
    .related("order", 88)
}

/// Attach a fake client to `hub`; returns the frames it receives
fn attach_client(
    hub: &Hub,
    identity: Identity,
) -> (
    mpsc::UnboundedReceiver<Message>,
    mpsc::UnboundedSender<Result<Message, std::io::Error>>,
) {
    let (server_tx, server_rx) = mpsc::unbounded::<Message>();
    let (client_tx, client_rx) = mpsc::unbounded::<Result<Message, std::io::Error>>();
    let settings = ConnectionSettings::default();
    let conn = Connection::new(identity, &settings);
    hub.spawn(connection::serve(hub.clone(), conn, server_tx, client_rx, settings));
    (server_rx, client_tx)
}

async fn next_text(frames: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), frames.next())
            .await
            .expect("no frame within timeout")
            .expect("transport closed");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_recipient_on_other_instance_receives_through_bridge() {
    let broker = LoopbackBroker::new();
    let store = Arc::new(MemoryStore::default());
    let cancel = CancellationToken::new();
    let a = instance(&broker, &store, &cancel);
    let b = instance(&broker, &store, &cancel);
    eventually(|| a.bridge.is_connected() && b.bridge.is_connected(), "bridges").await;

    let (mut frames, _client) = attach_client(&b.hub, Identity::new(Role::Rider, 50, 501));
    assert_eq!(next_text(&mut frames).await["type"], "connected");
    assert!(!a.hub.is_online(Role::Rider, EntityId(50)));

    let outcome = a.dispatcher.send(pickup_event()).await.unwrap();

    assert_eq!(
        outcome,
        DispatchOutcome::Pushed {
            notification_id: NotificationId(1),
            via: DeliveryPath::Bridge
        }
    );
    assert_eq!(*store.pushed.lock().unwrap(), vec![NotificationId(1)]);

    let delivered = next_text(&mut frames).await;
    assert_eq!(delivered["type"], "notification");
    assert_eq!(delivered["data"]["id"], 1);
    assert_eq!(delivered["data"]["category"], "delivery");
    assert_eq!(delivered["data"]["related_type"], "order");

    cancel.cancel();
}

#[tokio::test]
async fn test_local_delivery_does_not_publish_duplicate() {
    let broker = LoopbackBroker::new();
    let store = Arc::new(MemoryStore::default());
    let cancel = CancellationToken::new();
    let a = instance(&broker, &store, &cancel);
    let b = instance(&broker, &store, &cancel);
    eventually(|| a.bridge.is_connected() && b.bridge.is_connected(), "bridges").await;

    let (mut frames, _client) = attach_client(&a.hub, Identity::new(Role::Rider, 50, 501));
    next_text(&mut frames).await;

    let outcome = a.dispatcher.send(pickup_event()).await.unwrap();
    assert!(matches!(
        outcome,
        DispatchOutcome::Pushed {
            via: DeliveryPath::Local,
            ..
        }
    ));

    assert_eq!(next_text(&mut frames).await["type"], "notification");
    // Nothing else follows the single delivery
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(frames.try_next().is_err());

    cancel.cancel();
}

#[tokio::test]
async fn test_broker_down_still_delivers_locally() {
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    let store = Arc::new(MemoryStore::default());
    let cancel = CancellationToken::new();
    let a = instance(&broker, &store, &cancel);

    let (mut frames, _client) = attach_client(&a.hub, Identity::new(Role::Rider, 50, 501));
    next_text(&mut frames).await;
    assert!(!a.bridge.is_connected());

    let outcome = a.dispatcher.send(pickup_event()).await.unwrap();

    assert!(outcome.is_pushed());
    assert_eq!(next_text(&mut frames).await["type"], "notification");

    cancel.cancel();
}

#[tokio::test]
async fn test_offline_everywhere_keeps_record_unpushed() {
    let broker = LoopbackBroker::new();
    let store = Arc::new(MemoryStore::default());
    let cancel = CancellationToken::new();
    let a = instance(&broker, &store, &cancel);
    broker.set_online(false);

    let outcome = a.dispatcher.send(pickup_event()).await.unwrap();

    assert!(!outcome.is_pushed());
    assert_eq!(store.created.lock().unwrap().len(), 1);
    assert!(store.pushed.lock().unwrap().is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn test_platform_alert_reaches_operators_on_both_instances() {
    let broker = LoopbackBroker::new();
    let store = Arc::new(MemoryStore::default());
    let cancel = CancellationToken::new();
    let a = instance(&broker, &store, &cancel);
    let b = instance(&broker, &store, &cancel);
    eventually(|| a.bridge.is_connected() && b.bridge.is_connected(), "bridges").await;

    let (mut local_ops, _c1) = attach_client(&a.hub, Identity::new(Role::Platform, 1, 1));
    let (mut remote_ops, _c2) = attach_client(&b.hub, Identity::new(Role::Platform, 2, 2));
    next_text(&mut local_ops).await;
    next_text(&mut remote_ops).await;

    let outcome = a
        .dispatcher
        .alert_platform("Payment gateway degraded", "Retrying card captures", serde_json::json!({}))
        .await;
    assert_eq!(outcome.local_operators, 1);
    assert!(outcome.bridged);

    assert_eq!(next_text(&mut local_ops).await["type"], "alert");
    let remote = next_text(&mut remote_ops).await;
    assert_eq!(remote["type"], "alert");
    assert_eq!(remote["data"]["title"], "Payment gateway degraded");
    assert!(store.created.lock().unwrap().is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn test_hub_shutdown_closes_client_transports() {
    let hub = Hub::new();
    let (mut frames, _client) = attach_client(&hub, Identity::new(Role::Merchant, 3, 30));
    next_text(&mut frames).await;

    hub.send_to(
        Role::Merchant,
        EntityId(3),
        courier_api::realtime::Envelope::new("order_update", serde_json::json!({"id": 9})),
    );
    hub.shutdown(Duration::from_secs(1)).await;

    let remaining: Vec<Message> = frames.collect().await;
    assert!(remaining
        .iter()
        .any(|m| matches!(m, Message::Text(text) if text.contains("order_update"))));
    assert_eq!(hub.connection_count(), 0);
}
