//! Outgoing command queue
//!
//! Commands pushed by the application wait here until the outgoing channel
//! takes them as one batch. The batch stays "in flight" until the server
//! acknowledges it, so a failed flush re-sends exactly the same commands.

use crate::models::OutgoingMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Default)]
struct QueueInner {
    pending: VecDeque<OutgoingMessage>,
    in_flight: Option<Vec<OutgoingMessage>>,
}

/// FIFO shared between producers and the outgoing channel
#[derive(Debug, Default)]
pub struct OutgoingQueue {
    inner: Mutex<QueueInner>,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: OutgoingMessage) {
        self.inner.lock().pending.push_back(message);
    }

    /// The unacknowledged batch if any, otherwise everything pending.
    ///
    /// Returns `None` when there is nothing to send. Messages pushed after
    /// this call belong to the next batch.
    pub fn take_batch(&self) -> Option<Vec<OutgoingMessage>> {
        let mut inner = self.inner.lock();
        if let Some(batch) = &inner.in_flight {
            return Some(batch.clone());
        }
        if inner.pending.is_empty() {
            return None;
        }
        let batch: Vec<_> = inner.pending.drain(..).collect();
        inner.in_flight = Some(batch.clone());
        Some(batch)
    }

    /// Drop the in-flight batch after a successful flush; returns its size
    pub fn acknowledge(&self) -> usize {
        self.inner
            .lock()
            .in_flight
            .take()
            .map(|batch| batch.len())
            .unwrap_or(0)
    }

    /// Messages not yet taken
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending.is_empty() && inner.in_flight.is_none()
    }
}
