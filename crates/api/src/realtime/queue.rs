//! Bounded per-connection outbound queue
//!
//! Producers (hub sends, bridge deliveries) never wait on a slow client. When
//! the queue is full the configured [`OverflowPolicy`] decides what is lost:
//! the oldest queued message by default, so a lagging client keeps receiving
//! the most recent state instead of growing memory without bound.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::envelope::Envelope;

/// What to do with a message that arrives while the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued message and enqueue the new one
    #[default]
    DropOldest,
    /// Keep the queue as is and discard the new message
    DropNewest,
    /// Close the queue; the connection is torn down as a slow consumer
    Disconnect,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drop_oldest" => Ok(Self::DropOldest),
            "drop_newest" => Ok(Self::DropNewest),
            "disconnect" => Ok(Self::Disconnect),
            _ => Err(format!(
                "expected drop_oldest, drop_newest or disconnect, got {}",
                s
            )),
        }
    }
}

/// Result of offering a message to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Message queued with room to spare
    Queued,
    /// Message queued after evicting the oldest one
    DroppedOldest,
    /// Queue full, the new message was discarded
    DroppedNewest,
    /// Queue full under [`OverflowPolicy::Disconnect`]; the queue is now closed
    Overflowed,
    /// Queue already closed, nothing queued
    Closed,
}

impl EnqueueOutcome {
    /// Whether the offered message is now waiting to be written
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued | Self::DroppedOldest)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Arc<Envelope>>,
    closed: bool,
    dropped: u64,
}

/// Single-consumer FIFO of envelopes waiting for the outbound pump
#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a message without waiting
    pub fn push(&self, envelope: Arc<Envelope>) -> EnqueueOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return EnqueueOutcome::Closed;
            }

            if state.items.len() < self.capacity {
                state.items.push_back(envelope);
                EnqueueOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                        state.items.push_back(envelope);
                        state.dropped += 1;
                        EnqueueOutcome::DroppedOldest
                    }
                    OverflowPolicy::DropNewest => {
                        state.dropped += 1;
                        EnqueueOutcome::DroppedNewest
                    }
                    OverflowPolicy::Disconnect => {
                        state.dropped += 1;
                        state.closed = true;
                        EnqueueOutcome::Overflowed
                    }
                }
            }
        };

        // A stored permit wakes the consumer even if it is not parked yet
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next message; `None` once the queue is closed and drained
    pub async fn pop(&self) -> Option<Arc<Envelope>> {
        loop {
            {
                let mut state = self.lock();
                if let Some(envelope) = state.items.pop_front() {
                    return Some(envelope);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Take the next message if one is ready
    pub fn try_pop(&self) -> Option<Arc<Envelope>> {
        self.lock().items.pop_front()
    }

    /// Stop accepting messages; already queued ones can still be drained
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages lost to overflow over the queue's lifetime
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}
