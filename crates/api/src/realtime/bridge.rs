//! Cross-process pub/sub bridge
//!
//! Several server instances run behind a load balancer, and a recipient may be
//! connected to any of them. The bridge publishes envelopes to a shared broker
//! and every instance re-delivers what it receives to its own [`Hub`].
//!
//! Delivery is best-effort and at-most-once: nothing is retried or persisted
//! here, the notification record in the database is the durable copy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_shared::{EntityId, Role};
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::envelope::Envelope;
use super::hub::Hub;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// One message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: String,
}

/// Topic-based publish/subscribe transport shared by all instances
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BridgeError>;

    /// Subscribe to `topics`; the stream ends when the subscription is lost
    async fn subscribe(
        &self,
        topics: &[String],
    ) -> Result<BoxStream<'static, BrokerMessage>, BridgeError>;
}

// =============================================================================
// Redis
// =============================================================================

/// Redis PUBLISH/SUBSCRIBE broker
pub struct RedisBroker {
    client: redis::Client,
    publisher: Mutex<Option<ConnectionManager>>,
}

impl RedisBroker {
    /// Parse the URL; no connection is made until first use
    pub fn open(redis_url: &str) -> Result<Self, BridgeError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            publisher: Mutex::new(None),
        })
    }

    async fn publisher(&self) -> Result<ConnectionManager, BridgeError> {
        let mut publisher = self.publisher.lock().await;
        if let Some(conn) = publisher.as_ref() {
            return Ok(conn.clone());
        }

        // The manager reconnects by itself after this
        let conn = ConnectionManager::new(self.client.clone()).await?;
        *publisher = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BridgeError> {
        let mut conn = self.publisher().await?;
        let receivers: i64 = conn.publish(topic, payload).await?;
        tracing::trace!(topic, receivers, "Published bridge frame");
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[String],
    ) -> Result<BoxStream<'static, BrokerMessage>, BridgeError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for topic in topics {
            pubsub.subscribe(topic).await?;
        }

        let messages = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BrokerMessage {
                    topic: msg.get_channel_name().to_string(),
                    payload,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "Non-text payload on bridge channel");
                    None
                }
            }
        });

        Ok(messages.boxed())
    }
}

// =============================================================================
// Loopback
// =============================================================================

/// In-process broker for single-instance deployments and tests.
///
/// Every clone shares the same channel, so two bridges built on clones of one
/// loopback broker behave like two instances on one Redis.
#[derive(Clone)]
pub struct LoopbackBroker {
    tx: broadcast::Sender<BrokerMessage>,
    online: Arc<AtomicBool>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the broker going away or coming back.
    ///
    /// Going offline fails publishes and new subscriptions; existing
    /// subscriptions keep their stream.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    fn check_online(&self) -> Result<(), BridgeError> {
        if self.online.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BridgeError::Unavailable("loopback broker offline".to_string()))
        }
    }
}

#[async_trait]
impl Broker for LoopbackBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BridgeError> {
        self.check_online()?;
        // No subscribers is not an error for pub/sub
        let _ = self.tx.send(BrokerMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[String],
    ) -> Result<BoxStream<'static, BrokerMessage>, BridgeError> {
        self.check_online()?;
        let topics = topics.to_vec();
        let rx = self.tx.subscribe();

        let messages = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Loopback subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |message| futures::future::ready(topics.contains(&message.topic)));

        Ok(messages.boxed())
    }
}

// =============================================================================
// Bridge
// =============================================================================

/// Frame carried over the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BridgeFrame {
    /// Publishing instance; an instance skips its own frames
    origin: Uuid,
    role: Role,
    /// `None` addresses every online entity of `role`
    entity_id: Option<EntityId>,
    envelope: Envelope,
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Topics are `<prefix><role>`
    pub channel_prefix: String,
    pub publish_timeout: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            channel_prefix: String::new(),
            publish_timeout: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

struct BridgeInner {
    broker: Arc<dyn Broker>,
    hub: Hub,
    instance_id: Uuid,
    settings: BridgeSettings,
    connected: AtomicBool,
}

/// Publishes envelopes for remote instances and re-delivers theirs locally
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn new(broker: Arc<dyn Broker>, hub: Hub, settings: BridgeSettings) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                broker,
                hub,
                instance_id: Uuid::new_v4(),
                settings,
                connected: AtomicBool::new(false),
            }),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    /// Whether the subscription to the broker is currently established
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn topic(&self, role: Role) -> String {
        format!("{}{}", self.inner.settings.channel_prefix, role.as_str())
    }

    /// Publish `envelope` for `(role, entity_id)` to every instance.
    ///
    /// Returns true once the broker accepted the frame. Returns false, after
    /// logging, when the bridge is disconnected, the publish fails, or it does
    /// not complete within the publish timeout.
    pub async fn publish(&self, role: Role, entity_id: EntityId, envelope: &Envelope) -> bool {
        self.publish_frame(role, Some(entity_id), envelope).await
    }

    /// Publish `envelope` for every online entity of `role` on every instance
    pub async fn publish_broadcast(&self, role: Role, envelope: &Envelope) -> bool {
        self.publish_frame(role, None, envelope).await
    }

    async fn publish_frame(&self, role: Role, entity_id: Option<EntityId>, envelope: &Envelope) -> bool {
        if !self.is_connected() {
            tracing::warn!(
                role = %role,
                entity_id = ?entity_id,
                "Bridge disconnected, skipping cross-instance publish"
            );
            return false;
        }

        let frame = BridgeFrame {
            origin: self.inner.instance_id,
            role,
            entity_id,
            envelope: envelope.clone(),
        };
        let payload = match serde_json::to_string(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = ?e, "Failed to serialize bridge frame");
                return false;
            }
        };

        let topic = self.topic(role);
        match tokio::time::timeout(
            self.inner.settings.publish_timeout,
            self.inner.broker.publish(&topic, payload),
        )
        .await
        {
            Ok(Ok(())) => {
                tracing::debug!(topic = %topic, entity_id = ?entity_id, "Envelope published to bridge");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(topic = %topic, error = %e, "Bridge publish failed");
                false
            }
            Err(_) => {
                tracing::warn!(
                    topic = %topic,
                    timeout = ?self.inner.settings.publish_timeout,
                    "Bridge publish timed out"
                );
                false
            }
        }
    }

    /// Hand a received payload to the local hub; true if a local connection took it
    fn deliver(&self, payload: &str) -> bool {
        let frame: BridgeFrame = match serde_json::from_str(payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed bridge frame");
                return false;
            }
        };

        if frame.origin == self.inner.instance_id {
            return false;
        }

        match frame.entity_id {
            Some(entity_id) => self.inner.hub.send_to(frame.role, entity_id, frame.envelope),
            None => self.inner.hub.broadcast(frame.role, frame.envelope) > 0,
        }
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        // 200ms, 400ms, 800ms, ... capped, with jitter
        ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(self.inner.settings.reconnect_max_delay)
            .map(jitter)
    }

    /// Run the subscriber until `cancel` fires, reconnecting with backoff
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move { bridge.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        let topics: Vec<String> = Role::ALL.iter().map(|role| self.topic(*role)).collect();
        let mut backoff = self.backoff();

        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                subscribed = self.inner.broker.subscribe(&topics) => subscribed,
            };

            match subscribed {
                Ok(mut messages) => {
                    self.inner.connected.store(true, Ordering::Release);
                    backoff = self.backoff();
                    tracing::info!(
                        instance_id = %self.inner.instance_id,
                        topics = ?topics,
                        "Bridge subscribed"
                    );

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                self.inner.connected.store(false, Ordering::Release);
                                return;
                            }
                            next = messages.next() => match next {
                                Some(message) => {
                                    self.deliver(&message.payload);
                                }
                                None => break,
                            },
                        }
                    }

                    self.inner.connected.store(false, Ordering::Release);
                    tracing::warn!("Bridge subscription lost, reconnecting");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Bridge subscribe failed");
                }
            }

            let delay = backoff
                .next()
                .unwrap_or(self.inner.settings.reconnect_max_delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.inner.connected.store(false, Ordering::Release);
        tracing::info!("Bridge stopped");
    }
}
