//! Bounded outbound queue with drop-oldest overflow.
//!
//! Application sends land here from any context and never block. The
//! session drains the queue into the single writer while connected; while
//! disconnected the queue simply holds the most recent messages.

use adm_wire::Envelope;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Outbound envelopes waiting for the writer
#[derive(Debug)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` envelopes
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an envelope, returning the oldest one if it had to be dropped
    pub fn push(&self, envelope: Envelope) -> Option<Envelope> {
        let dropped = {
            let mut items = self.lock();
            let dropped = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(envelope);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Take the oldest envelope if any
    pub fn pop(&self) -> Option<Envelope> {
        self.lock().pop_front()
    }

    /// Wait for the next envelope
    pub async fn recv(&self) -> Envelope {
        loop {
            if let Some(envelope) = self.pop() {
                return envelope;
            }
            self.notify.notified().await;
        }
    }

    /// Envelopes currently waiting
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of waiting envelopes
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
