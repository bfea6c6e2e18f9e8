//! Explicit stop signals for long-running loops.
//!
//! Every polling loop (applier, sequencer, role driver) takes a [`StopSignal`]
//! so it can be stopped deterministically from the outside. The signal is a
//! one-way latch: once stopped, always stopped.

use tokio::sync::watch;

/// Creates a connected stop handle and signal.
pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

/// Trips the latch.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// A new signal observing this handle.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observes the latch. Cheap to clone.
///
/// Dropping every [`StopHandle`] counts as a stop.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the latch is tripped.
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_wakes_waiter() {
        let (handle, mut signal) = stop_signal();
        assert!(!signal.is_stopped());

        let waiter = tokio::spawn(async move {
            signal.stopped().await;
        });
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_stop() {
        let (handle, mut signal) = stop_signal();
        drop(handle);
        assert!(signal.is_stopped());
        signal.stopped().await;
    }
}
