//! Realtime connection lifecycle
//!
//! A [`Connection`] is one physical duplex channel to one client process.
//! Once registered it is driven by two cooperating tasks:
//!
//! - the **inbound pump** reads frames (clients only send control frames) and
//!   refreshes the liveness timestamp
//! - the **outbound pump** drains the bounded [`OutboundQueue`] into the
//!   transport and sends keepalive pings
//!
//! Whichever pump stops first unregisters the connection and cancels the
//! other; [`serve`] returns only after both have exited, so the transport
//! halves are always released last.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::ws::Message;
use courier_shared::Identity;
use futures::{Sink, SinkExt, Stream, StreamExt};
use time::OffsetDateTime;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::envelope::Envelope;
use super::hub::Hub;
use super::queue::{EnqueueOutcome, OutboundQueue, OverflowPolicy};

/// Tunables applied to every connection
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub outbound_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Interval between keepalive pings
    pub ping_interval: Duration,
    /// Close the connection when nothing was read for this long
    pub idle_timeout: Duration,
    /// Upper bound for flushing queued messages once closing starts
    pub drain_grace: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            overflow_policy: OverflowPolicy::DropOldest,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            drain_grace: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of a connection; `Closed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Upgraded, identity attached, not registered yet
    Connecting = 0,
    /// Registered and pumping
    Active = 1,
    /// Unregistered, flushing what is left
    Draining = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Represents an active realtime connection
#[derive(Debug)]
pub struct Connection {
    session_id: Uuid,
    identity: Identity,
    outbound: OutboundQueue,
    state: AtomicU8,
    last_seen: Mutex<Instant>,
    shutdown: CancellationToken,
    connected_at: OffsetDateTime,
}

impl Connection {
    /// Create a connection for an already authorized identity
    pub fn new(identity: Identity, settings: &ConnectionSettings) -> Arc<Self> {
        Arc::new(Self {
            session_id: Uuid::new_v4(),
            identity,
            outbound: OutboundQueue::new(settings.outbound_capacity, settings.overflow_policy),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            last_seen: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
            connected_at: OffsetDateTime::now_utc(),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connected_at(&self) -> OffsetDateTime {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Messages waiting to be written
    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Queue a message for the outbound pump without waiting
    pub fn enqueue(&self, envelope: Arc<Envelope>) -> EnqueueOutcome {
        let outcome = self.outbound.push(envelope);
        match outcome {
            EnqueueOutcome::Queued | EnqueueOutcome::Closed => {}
            EnqueueOutcome::DroppedOldest | EnqueueOutcome::DroppedNewest => {
                tracing::warn!(
                    session_id = %self.session_id,
                    role = %self.identity.role,
                    entity_id = %self.identity.entity_id,
                    outcome = ?outcome,
                    capacity = self.outbound.capacity(),
                    total_dropped = self.outbound.dropped(),
                    "Outbound queue full, message dropped"
                );
            }
            EnqueueOutcome::Overflowed => {
                tracing::warn!(
                    session_id = %self.session_id,
                    role = %self.identity.role,
                    entity_id = %self.identity.entity_id,
                    capacity = self.outbound.capacity(),
                    policy = ?self.outbound.policy(),
                    "Outbound queue overflowed, disconnecting slow client"
                );
                self.close();
            }
        }
        outcome
    }

    /// Record inbound activity
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last inbound frame
    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Begin closing: stop accepting messages and signal both pumps
    pub fn close(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Active as u8,
            ConnectionState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.state.compare_exchange(
            ConnectionState::Connecting as u8,
            ConnectionState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.outbound.close();
        self.shutdown.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Move `Connecting -> Active`; false if the connection already started closing
    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
            || self.state() == ConnectionState::Active
    }

    fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

/// Why a pump stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The other pump, the hub, or an overflow asked us to stop
    Cancelled,
    /// Client sent a close frame or the stream ended
    ClientClosed,
    /// Outbound queue closed and empty
    QueueClosed,
    /// Nothing read from the client within the idle timeout
    IdleTimeout,
    /// Read or write on the transport failed
    Transport(String),
}

impl fmt::Display for PumpExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::ClientClosed => f.write_str("client closed"),
            Self::QueueClosed => f.write_str("queue closed"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// Unregisters and cancels on every exit path of a pump, panics included
struct PumpGuard {
    conn: Arc<Connection>,
    hub: Hub,
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.conn.close();
        self.hub.unregister(&self.conn);
    }
}

/// Drive a connection until either side goes away.
///
/// Registers `conn` with `hub`, runs both pumps, and returns once both have
/// exited and the connection is unregistered.
pub async fn serve<W, R, E>(
    hub: Hub,
    conn: Arc<Connection>,
    sink: W,
    stream: R,
    settings: ConnectionSettings,
) where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: fmt::Display + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let session_id = conn.session_id();

    // The acknowledgement is queued before registration so it is always the first frame
    conn.enqueue(Arc::new(Envelope::connected(session_id, conn.identity())));
    hub.register(&conn);

    let writer = tokio::spawn(write_pump(
        PumpGuard {
            conn: Arc::clone(&conn),
            hub: hub.clone(),
        },
        sink,
        settings,
    ));
    let reader = tokio::spawn(read_pump(
        PumpGuard {
            conn: Arc::clone(&conn),
            hub: hub.clone(),
        },
        stream,
    ));

    let (written, read) = tokio::join!(writer, reader);

    for (pump, result) in [("outbound", written), ("inbound", read)] {
        match result {
            Ok(exit) => tracing::debug!(session_id = %session_id, pump, exit = %exit, "Pump stopped"),
            Err(e) if e.is_panic() => {
                tracing::error!(session_id = %session_id, pump, "Pump panicked")
            }
            Err(e) => tracing::warn!(session_id = %session_id, pump, error = %e, "Pump aborted"),
        }
    }

    hub.unregister(&conn);
    conn.mark_closed();

    tracing::info!(
        session_id = %session_id,
        role = %conn.identity().role,
        entity_id = %conn.identity().entity_id,
        dropped = conn.outbound().dropped(),
        "Realtime connection closed"
    );
}

async fn write_pump<W>(guard: PumpGuard, mut sink: W, settings: ConnectionSettings) -> PumpExit
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display + Send,
{
    let conn = &guard.conn;
    let mut keepalive = tokio::time::interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            biased;

            _ = conn.shutdown.cancelled() => {
                break flush(conn, &mut sink, settings.drain_grace).await;
            }

            next = conn.outbound.pop() => match next {
                Some(envelope) => {
                    if let Err(exit) = write_envelope(conn, &mut sink, &envelope).await {
                        break exit;
                    }
                }
                None => break PumpExit::QueueClosed,
            },

            _ = keepalive.tick() => {
                if conn.idle_for() > settings.idle_timeout {
                    tracing::info!(
                        session_id = %conn.session_id,
                        idle = ?conn.idle_for(),
                        "Closing idle realtime connection"
                    );
                    break PumpExit::IdleTimeout;
                }
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    break PumpExit::Transport(e.to_string());
                }
            }
        }
    };

    // Closing a websocket sink writes a Close frame; flush and drop it instead
    if let Ok(Err(e)) = tokio::time::timeout(settings.drain_grace, sink.flush()).await {
        tracing::debug!(session_id = %conn.session_id, error = %e, "Final flush failed");
    }
    drop(sink);
    exit
}

/// Best-effort flush of what is still queued, bounded by `grace`
async fn flush<W>(conn: &Connection, sink: &mut W, grace: Duration) -> PumpExit
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display + Send,
{
    let drained = tokio::time::timeout(grace, async {
        while let Some(envelope) = conn.outbound.try_pop() {
            write_envelope(conn, sink, &envelope).await?;
        }
        Ok::<(), PumpExit>(())
    })
    .await;

    match drained {
        Ok(Ok(())) => PumpExit::Cancelled,
        Ok(Err(exit)) => exit,
        Err(_) => {
            tracing::warn!(
                session_id = %conn.session_id,
                remaining = conn.outbound.len(),
                "Drain grace period elapsed, discarding queued messages"
            );
            PumpExit::Cancelled
        }
    }
}

async fn write_envelope<W>(conn: &Connection, sink: &mut W, envelope: &Envelope) -> Result<(), PumpExit>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display + Send,
{
    let frame = match envelope.to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            // Only this message is lost
            tracing::error!(
                session_id = %conn.session_id,
                envelope_type = envelope.kind(),
                error = ?e,
                "Failed to serialize envelope"
            );
            return Ok(());
        }
    };

    sink.send(Message::Text(frame))
        .await
        .map_err(|e| PumpExit::Transport(e.to_string()))
}

async fn read_pump<R, E>(guard: PumpGuard, mut stream: R) -> PumpExit
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display + Send,
{
    let conn = &guard.conn;

    loop {
        tokio::select! {
            _ = conn.shutdown.cancelled() => break PumpExit::Cancelled,

            frame = stream.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break PumpExit::ClientClosed,
                Some(Ok(Message::Text(_))) | Some(Ok(Message::Binary(_))) => {
                    // Clients are push-only consumers
                    conn.touch();
                    tracing::debug!(session_id = %conn.session_id, "Ignoring inbound application message");
                }
                Some(Ok(_)) => conn.touch(),
                Some(Err(e)) => break PumpExit::Transport(e.to_string()),
            },
        }
    }
}
