use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative stop for the daemon loops.
///
/// Each loop subscribes and `select!`s on the receiver next to its own work.
/// `trigger()` flips the flag and wakes every subscriber once; loops that
/// hold a [`ShutdownGuard`] report back when they have stopped so the daemon
/// can bound how long it waits.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    stopped_tx: Arc<watch::Sender<usize>>,
    stopped_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (stopped_tx, stopped_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            stopped_tx: Arc::new(stopped_tx),
            stopped_rx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Idempotent; only the first call broadcasts.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown triggered");
            let _ = self.trigger.send(());
        }
    }

    /// Resolves once shutdown has been triggered, even if that happened
    /// before the call.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }

    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            signal: self.clone(),
        }
    }

    /// Wait until `expected` guards have been dropped or `timeout` passes.
    /// Returns how many loops reported stopped.
    pub async fn wait_for_loops(&mut self, expected: usize, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let stopped = *self.stopped_rx.borrow();
            if stopped >= expected {
                return stopped;
            }
            match tokio::time::timeout_at(deadline, self.stopped_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return *self.stopped_rx.borrow(),
                Err(_) => {
                    let stopped = *self.stopped_rx.borrow();
                    warn!(stopped, expected, "timed out waiting for loops to stop");
                    return stopped;
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by a loop for its lifetime; dropping it counts the loop as stopped.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.stopped_tx.send_modify(|n| *n += 1);
    }
}
