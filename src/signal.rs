//! Payload-free change notification.
//!
//! Writers publish after a successful store write; the redirect index
//! subscribes and reloads. Delivery is fire-and-forget: publishing with
//! no subscribers succeeds, and a receiver that lagged behind treats the
//! gap as a single signal.

use redirects_core::Result;
use tokio::sync::broadcast;

/// Capacity of the broadcast buffer. Signals carry no payload, so a small
/// buffer only bounds how many unread signals a slow reader can lag.
const SIGNAL_CAPACITY: usize = 16;

/// Publishes "the redirect set changed".
pub trait Publisher: Send + Sync {
    fn publish(&self) -> Result<()>;
}

/// In-process topic built on `tokio::sync::broadcast`.
#[derive(Clone)]
pub struct UpdateSignal {
    sender: broadcast::Sender<()>,
}

impl UpdateSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }
}

impl Default for UpdateSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for UpdateSignal {
    fn publish(&self) -> Result<()> {
        match self.sender.send(()) {
            Ok(receivers) => tracing::debug!(receivers, "published redirects update"),
            Err(_) => tracing::debug!("published redirects update with no subscribers"),
        }
        Ok(())
    }
}

/// Outcome of waiting on a subscription.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Signal,
    Closed,
}

/// Waits for the next signal; lag counts as one signal.
pub async fn recv_signal(receiver: &mut broadcast::Receiver<()>) -> Received {
    match receiver.recv().await {
        Ok(()) => Received::Signal,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::debug!(skipped, "update receiver lagged, coalescing");
            Received::Signal
        }
        Err(broadcast::error::RecvError::Closed) => Received::Closed,
    }
}

/// Consumes every pending signal without waiting; returns how many were
/// drained.
pub fn drain_pending(receiver: &mut broadcast::Receiver<()>) -> usize {
    let mut drained = 0;
    loop {
        match receiver.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => drained += 1,
            Err(_) => return drained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        assert!(UpdateSignal::new().publish().is_ok());
    }

    #[tokio::test]
    async fn test_burst_is_drained() {
        let signal = UpdateSignal::new();
        let mut rx = signal.subscribe();
        for _ in 0..5 {
            signal.publish().unwrap();
        }

        assert_eq!(recv_signal(&mut rx).await, Received::Signal);
        assert_eq!(drain_pending(&mut rx), 4);
        assert_eq!(drain_pending(&mut rx), 0);
    }

    #[tokio::test]
    async fn test_lag_counts_as_signal() {
        let signal = UpdateSignal::new();
        let mut rx = signal.subscribe();
        for _ in 0..(SIGNAL_CAPACITY * 2) {
            signal.publish().unwrap();
        }
        assert_eq!(recv_signal(&mut rx).await, Received::Signal);
    }

    #[tokio::test]
    async fn test_closed_topic() {
        let signal = UpdateSignal::new();
        let mut rx = signal.subscribe();
        drop(signal);
        assert_eq!(recv_signal(&mut rx).await, Received::Closed);
    }
}
