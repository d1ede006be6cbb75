//! Notification dispatch policy
//!
//! Decides, per domain event, whether a notification is created and whether
//! it is pushed:
//!
//! 1. Load the recipient's preferences (missing preferences mean defaults)
//! 2. Drop the event if its category is muted, unless the caller bypasses preferences
//! 3. Persist the notification record; from here on the event is durable
//! 4. Leave it unpushed inside the recipient's quiet hours
//! 5. Push through the local hub, falling back to the bridge, and mark it pushed
//!
//! Recipient connectivity never turns into an error for the caller. Only a
//! failure to persist the record does.

use std::sync::Arc;

use courier_shared::{
    EntityId, NewNotification, NotificationCategory, NotificationId, NotificationPreferences,
    NotificationStore, RelatedEntity, Role, StoreError, UserId,
};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

use crate::realtime::{Bridge, Envelope, Hub};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to persist notification: {0}")]
    Store(#[from] StoreError),
}

/// Who receives the notification and where their connections are registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: UserId,
    pub role: Role,
    pub entity_id: EntityId,
}

/// One domain event to notify about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendParams {
    pub recipient: Recipient,
    pub category: NotificationCategory,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub related: Option<RelatedEntity>,
    #[serde(default)]
    pub extra: serde_json::Value,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    /// Deliver even if the recipient muted the category (payment success, delivery completion)
    #[serde(default)]
    pub bypass_preferences: bool,
}

impl SendParams {
    pub fn new(
        recipient: Recipient,
        category: NotificationCategory,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient,
            category,
            title: title.into(),
            body: body.into(),
            related: None,
            extra: serde_json::Value::Null,
            expires_at: None,
            bypass_preferences: false,
        }
    }

    pub fn related(mut self, kind: impl Into<String>, id: i64) -> Self {
        self.related = Some(RelatedEntity {
            kind: kind.into(),
            id,
        });
        self
    }

    pub fn extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }

    pub fn bypass_preferences(mut self) -> Self {
        self.bypass_preferences = true;
        self
    }

    fn new_notification(&self) -> NewNotification {
        NewNotification {
            user_id: self.recipient.user_id,
            category: self.category,
            title: self.title.clone(),
            body: self.body.clone(),
            related: self.related.clone(),
            extra: self.extra.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// Path that carried a pushed notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPath {
    Local,
    Bridge,
}

/// Why a persisted notification was not pushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnpushedReason {
    QuietHours,
    RecipientOffline,
    EncodingFailed,
}

/// Result of a dispatch call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Category muted by the recipient; nothing was persisted
    Suppressed,
    /// Persisted but left unpushed
    Stored {
        notification_id: NotificationId,
        reason: UnpushedReason,
    },
    /// Persisted and handed to at least one connection or to the bridge
    Pushed {
        notification_id: NotificationId,
        via: DeliveryPath,
    },
}

impl DispatchOutcome {
    pub fn notification_id(&self) -> Option<NotificationId> {
        match self {
            Self::Suppressed => None,
            Self::Stored {
                notification_id, ..
            }
            | Self::Pushed {
                notification_id, ..
            } => Some(*notification_id),
        }
    }

    pub fn is_pushed(&self) -> bool {
        matches!(self, Self::Pushed { .. })
    }
}

/// Where a platform alert went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlertOutcome {
    /// Operators reached on this instance
    pub local_operators: usize,
    /// Whether the alert was published for other instances
    pub bridged: bool,
}

/// Applies the dispatch policy; cheap to clone
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn NotificationStore>,
    hub: Hub,
    bridge: Option<Bridge>,
    quiet_hours_offset: UtcOffset,
}

impl Dispatcher {
    /// `quiet_hours_offset` is the platform's local offset; quiet hours are wall-clock times in it
    pub fn new(
        store: Arc<dyn NotificationStore>,
        hub: Hub,
        bridge: Option<Bridge>,
        quiet_hours_offset: UtcOffset,
    ) -> Self {
        Self {
            store,
            hub,
            bridge,
            quiet_hours_offset,
        }
    }

    /// Dispatch one event now
    pub async fn send(&self, params: SendParams) -> Result<DispatchOutcome, DispatchError> {
        self.send_at(params, OffsetDateTime::now_utc()).await
    }

    /// Dispatch one event, evaluating quiet hours at `now`
    pub async fn send_at(
        &self,
        params: SendParams,
        now: OffsetDateTime,
    ) -> Result<DispatchOutcome, DispatchError> {
        let recipient = params.recipient;
        let preferences = self.load_preferences(recipient.user_id).await;

        if !params.bypass_preferences && !preferences.allows(params.category) {
            tracing::info!(
                user_id = %recipient.user_id,
                category = %params.category.as_str(),
                "Notification suppressed by preferences"
            );
            return Ok(DispatchOutcome::Suppressed);
        }

        let notification = self
            .store
            .create_notification(&params.new_notification())
            .await?;
        let notification_id = notification.id;

        let local_time = now.to_offset(self.quiet_hours_offset).time();
        if preferences
            .quiet_hours
            .is_some_and(|window| window.contains(local_time))
        {
            tracing::info!(
                notification_id = %notification_id,
                user_id = %recipient.user_id,
                local_time = %local_time,
                "Recipient in quiet hours, notification left unpushed"
            );
            return Ok(DispatchOutcome::Stored {
                notification_id,
                reason: UnpushedReason::QuietHours,
            });
        }

        let envelope = match Envelope::notification(&notification) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(
                    notification_id = %notification_id,
                    error = ?e,
                    "Failed to encode notification envelope"
                );
                return Ok(DispatchOutcome::Stored {
                    notification_id,
                    reason: UnpushedReason::EncodingFailed,
                });
            }
        };

        let Some(via) = self
            .deliver(recipient.role, recipient.entity_id, envelope)
            .await
        else {
            tracing::info!(
                notification_id = %notification_id,
                role = %recipient.role,
                entity_id = %recipient.entity_id,
                "Recipient offline, notification left unpushed"
            );
            return Ok(DispatchOutcome::Stored {
                notification_id,
                reason: UnpushedReason::RecipientOffline,
            });
        };

        // The push already happened; a failed mark only leaves the flag stale
        if let Err(e) = self
            .store
            .mark_notification_as_pushed(notification_id, OffsetDateTime::now_utc())
            .await
        {
            tracing::warn!(
                notification_id = %notification_id,
                error = ?e,
                "Failed to mark notification as pushed"
            );
        }

        tracing::info!(
            notification_id = %notification_id,
            role = %recipient.role,
            entity_id = %recipient.entity_id,
            via = ?via,
            "Notification pushed"
        );

        Ok(DispatchOutcome::Pushed {
            notification_id,
            via,
        })
    }

    /// Broadcast an operational alert to every platform operator in the fleet.
    ///
    /// Alerts are not notification records and are never persisted.
    pub async fn alert_platform(
        &self,
        title: &str,
        body: &str,
        extra: serde_json::Value,
    ) -> AlertOutcome {
        let envelope = Envelope::alert(title, body, extra);
        let local_operators = self.hub.broadcast(Role::Platform, envelope.clone());

        let bridged = match &self.bridge {
            Some(bridge) => bridge.publish_broadcast(Role::Platform, &envelope).await,
            None => false,
        };

        tracing::info!(local_operators, bridged, title, "Platform alert dispatched");
        AlertOutcome {
            local_operators,
            bridged,
        }
    }

    async fn load_preferences(&self, user_id: UserId) -> NotificationPreferences {
        match self.store.get_preferences(user_id).await {
            Ok(Some(preferences)) => preferences,
            Ok(None) => NotificationPreferences::defaults_for(user_id),
            Err(e) if e.is_not_found() => NotificationPreferences::defaults_for(user_id),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = ?e,
                    "Failed to load preferences, using defaults"
                );
                NotificationPreferences::defaults_for(user_id)
            }
        }
    }

    /// Local hub first, bridge only when no local connection took it
    async fn deliver(&self, role: Role, entity_id: EntityId, envelope: Envelope) -> Option<DeliveryPath> {
        let envelope = Arc::new(envelope);
        if self.hub.send_shared(role, entity_id, Arc::clone(&envelope)) {
            return Some(DeliveryPath::Local);
        }

        match &self.bridge {
            Some(bridge) if bridge.publish(role, entity_id, &envelope).await => {
                Some(DeliveryPath::Bridge)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_shared::{Identity, Notification, QuietHours};
    use std::sync::Mutex;
    use time::macros::{datetime, time};

    use crate::realtime::{Connection, ConnectionSettings};

    /// In-memory store recording every call
    #[derive(Default)]
    struct RecordingStore {
        preferences: Option<NotificationPreferences>,
        fail_preferences: bool,
        fail_create: bool,
        created: Mutex<Vec<Notification>>,
        pushed: Mutex<Vec<NotificationId>>,
    }

    #[async_trait]
    impl NotificationStore for RecordingStore {
        async fn create_notification(&self, new: &NewNotification) -> Result<Notification, StoreError> {
            if self.fail_create {
                return Err(StoreError::Unavailable("database down".to_string()));
            }
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
            if self.fail_preferences {
                return Err(StoreError::Unavailable("preferences table locked".to_string()));
            }
            Ok(self.preferences.clone())
        }
    }

    const NOON: OffsetDateTime = datetime!(2025-03-01 12:00 UTC);

    fn merchant() -> Recipient {
        Recipient {
            user_id: UserId(70),
            role: Role::Merchant,
            entity_id: EntityId(7),
        }
    }

    fn order_event() -> SendParams {
        SendParams::new(merchant(), NotificationCategory::Order, "New order", "Order #1001 received")
            .related("order", 1001)
    }

    fn dispatcher(store: &Arc<RecordingStore>, hub: &Hub) -> Dispatcher {
        Dispatcher::new(store.clone(), hub.clone(), None, UtcOffset::UTC)
    }

    fn connect_merchant(hub: &Hub) -> Arc<Connection> {
        let conn = Connection::new(Identity::new(Role::Merchant, 7, 70), &ConnectionSettings::default());
        hub.register(&conn);
        conn
    }

    fn preferences(order_enabled: bool) -> NotificationPreferences {
        NotificationPreferences {
            order_enabled,
            ..NotificationPreferences::defaults_for(UserId(70))
        }
    }

    #[tokio::test]
    async fn test_online_recipient_pushed_and_marked_once() {
        let store = Arc::new(RecordingStore::default());
        let hub = Hub::new();
        let conn = connect_merchant(&hub);

        let outcome = dispatcher(&store, &hub).send_at(order_event(), NOON).await.unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Pushed {
                notification_id: NotificationId(1),
                via: DeliveryPath::Local
            }
        );
        assert_eq!(*store.pushed.lock().unwrap(), vec![NotificationId(1)]);

        let envelope = conn.outbound().try_pop().unwrap();
        assert_eq!(envelope.kind(), "notification");
        assert_eq!(envelope.data()["related_id"], 1001);
    }

    #[tokio::test]
    async fn test_muted_category_never_persisted() {
        let store = Arc::new(RecordingStore {
            preferences: Some(preferences(false)),
            ..Default::default()
        });
        let hub = Hub::new();
        let conn = connect_merchant(&hub);

        let outcome = dispatcher(&store, &hub).send_at(order_event(), NOON).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Suppressed);
        assert!(store.created.lock().unwrap().is_empty());
        assert!(conn.outbound().is_empty());
    }

    #[tokio::test]
    async fn test_bypass_overrides_muted_category() {
        let store = Arc::new(RecordingStore {
            preferences: Some(preferences(false)),
            ..Default::default()
        });
        let hub = Hub::new();
        connect_merchant(&hub);

        let outcome = dispatcher(&store, &hub)
            .send_at(order_event().bypass_preferences(), NOON)
            .await
            .unwrap();

        assert!(outcome.is_pushed());
        assert_eq!(store.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_quiet_hours_store_without_push() {
        let store = Arc::new(RecordingStore {
            preferences: Some(NotificationPreferences {
                quiet_hours: Some(QuietHours::new(time!(22:00), time!(08:00))),
                ..preferences(true)
            }),
            ..Default::default()
        });
        let hub = Hub::new();
        let conn = connect_merchant(&hub);
        let dispatcher = dispatcher(&store, &hub);

        let late = dispatcher
            .send_at(order_event(), datetime!(2025-03-01 23:30 UTC))
            .await
            .unwrap();
        assert_eq!(
            late,
            DispatchOutcome::Stored {
                notification_id: NotificationId(1),
                reason: UnpushedReason::QuietHours
            }
        );
        assert!(conn.outbound().is_empty());
        assert!(store.pushed.lock().unwrap().is_empty());

        let morning = dispatcher
            .send_at(order_event(), datetime!(2025-03-02 09:00 UTC))
            .await
            .unwrap();
        assert!(morning.is_pushed());
    }

    #[tokio::test]
    async fn test_quiet_hours_evaluated_in_platform_offset() {
        let store = Arc::new(RecordingStore {
            preferences: Some(NotificationPreferences {
                quiet_hours: Some(QuietHours::new(time!(01:00), time!(06:00))),
                ..preferences(true)
            }),
            ..Default::default()
        });
        let hub = Hub::new();
        connect_merchant(&hub);

        // 19:00 UTC is 03:00 at UTC+8
        let dispatcher = Dispatcher::new(
            store.clone(),
            hub.clone(),
            None,
            UtcOffset::from_hms(8, 0, 0).unwrap(),
        );
        let outcome = dispatcher
            .send_at(order_event(), datetime!(2025-03-01 19:00 UTC))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            DispatchOutcome::Stored {
                reason: UnpushedReason::QuietHours,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_offline_recipient_without_bridge_stays_unpushed() {
        let store = Arc::new(RecordingStore::default());
        let hub = Hub::new();

        let outcome = dispatcher(&store, &hub).send_at(order_event(), NOON).await.unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Stored {
                notification_id: NotificationId(1),
                reason: UnpushedReason::RecipientOffline
            }
        );
        assert_eq!(store.created.lock().unwrap().len(), 1);
        assert!(store.pushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preference_failure_falls_back_to_defaults() {
        let store = Arc::new(RecordingStore {
            fail_preferences: true,
            ..Default::default()
        });
        let hub = Hub::new();
        connect_merchant(&hub);

        let outcome = dispatcher(&store, &hub).send_at(order_event(), NOON).await.unwrap();
        assert!(outcome.is_pushed());
    }

    #[tokio::test]
    async fn test_persistence_failure_is_surfaced_and_nothing_pushed() {
        let store = Arc::new(RecordingStore {
            fail_create: true,
            ..Default::default()
        });
        let hub = Hub::new();
        let conn = connect_merchant(&hub);

        let result = dispatcher(&store, &hub).send_at(order_event(), NOON).await;

        assert!(matches!(result, Err(DispatchError::Store(_))));
        assert!(conn.outbound().is_empty());
    }

    #[tokio::test]
    async fn test_alert_reaches_local_operators_only_without_bridge() {
        let store = Arc::new(RecordingStore::default());
        let hub = Hub::new();
        let ops = Connection::new(Identity::new(Role::Platform, 1, 1), &ConnectionSettings::default());
        hub.register(&ops);
        let merchant = connect_merchant(&hub);

        let outcome = dispatcher(&store, &hub)
            .alert_platform("Kitchen outage", "Merchant 7 offline", serde_json::json!({"merchant_id": 7}))
            .await;

        assert_eq!(
            outcome,
            AlertOutcome {
                local_operators: 1,
                bridged: false
            }
        );
        assert_eq!(ops.outbound().try_pop().unwrap().kind(), "alert");
        assert!(merchant.outbound().is_empty());
        assert!(store.created.lock().unwrap().is_empty());
    }

    #[test]
    fn test_params_deserialize_with_defaults() {
        let params: SendParams = serde_json::from_value(serde_json::json!({
            "recipient": {"user_id": 5, "role": "rider", "entity_id": 9},
            "category": "delivery",
            "title": "Pickup ready",
            "body": "Order 12 is ready for pickup"
        }))
        .unwrap();

        assert_eq!(params.recipient.role, Role::Rider);
        assert!(!params.bypass_preferences);
        assert!(params.related.is_none());
        assert!(params.expires_at.is_none());
    }
}
