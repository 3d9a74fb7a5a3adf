//! Notification collaborator
//!
//! Publishing is fire-and-forget: at most once, no delivery confirmation.

use crate::error::NotifyError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

/// Notification backend contract
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), NotifyError>;
}

/// A published message as seen by subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub topic: String,
    pub payload: Bytes,
}

/// In-process fan-out over a tokio broadcast channel
///
/// Slow subscribers lag and lose messages rather than holding up publishers.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), NotifyError> {
        let notification = Notification {
            topic: topic.to_string(),
            payload,
        };
        // No subscribers is not a failure
        let _ = self.tx.send(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();

        notifier
            .publish("device-fix-updates", Bytes::from_static(b"fix"))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic, "device-fix-updates");
        assert_eq!(&received.payload[..], b"fix");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let notifier = BroadcastNotifier::new(8);
        assert!(notifier.publish("t", Bytes::new()).await.is_ok());
    }
}
