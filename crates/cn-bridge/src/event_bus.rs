use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::protocol::{BusMessage, StateChange};

/// Fan-out bus for [`StateChange`] notifications, built on flume channels.
///
/// Every subscriber gets its own unbounded receiver and sees each message
/// published after it subscribed. Publishing never blocks and needs no
/// acknowledgement; receivers that were dropped are pruned on the next
/// publish.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<BusMessage>>>>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<BusMessage> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    pub fn publish(&self, change: StateChange) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        let msg = BusMessage {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            at: Utc::now(),
            change,
        };
        senders.retain(|tx| tx.send(msg.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
