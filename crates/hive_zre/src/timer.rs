//! Liveness timers: one-shot tokio tasks that post back into the reactor.
//!
//! Timers never touch peer state themselves. When one elapses it sends a
//! [`TimerFired`] into the node's reactor, which hands it to the peer
//! registry. Each arm carries the peer's current epoch; a firing whose epoch
//! no longer matches was superseded and is ignored.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::identity::NodeId;

/// Which liveness deadline elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Evasive,
    Expired,
}

/// Posted into the reactor when a liveness timer elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub peer: NodeId,
    pub kind: TimerKind,
    pub epoch: u64,
}

/// Cancels the underlying task when dropped.
#[derive(Debug)]
pub struct TimerHandle(JoinHandle<()>);

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Schedules timers whose firings land on a single reactor channel.
#[derive(Debug, Clone)]
pub struct TimerQueue {
    tx: mpsc::UnboundedSender<TimerFired>,
}

impl TimerQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Arm a one-shot timer. Must be called from within a tokio runtime.
    pub fn schedule(&self, after: Duration, fired: TimerFired) -> TimerHandle {
        let tx = self.tx.clone();
        TimerHandle(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // Reactor gone means the node stopped; nothing to do.
            let _ = tx.send(fired);
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fired(kind: TimerKind) -> TimerFired {
        TimerFired {
            peer: NodeId::from_bytes([1; 16]),
            kind,
            epoch: 3,
        }
    }

    #[tokio::test]
    async fn test_timer_fires() {
        let (queue, mut rx) = TimerQueue::new();
        let _handle = queue.schedule(Duration::from_millis(10), fired(TimerKind::Evasive));

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, fired(TimerKind::Evasive));
    }

    #[tokio::test]
    async fn test_dropped_handle_cancels() {
        let (queue, mut rx) = TimerQueue::new();
        let handle = queue.schedule(Duration::from_millis(20), fired(TimerKind::Expired));
        drop(handle);

        let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(got.is_err(), "cancelled timer must not fire");
    }
}
