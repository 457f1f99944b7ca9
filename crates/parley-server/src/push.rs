//! Best-effort push notifications.
//!
//! Delivery never blocks or fails the request that triggered it: the relay
//! spawns the notifier future and only logs the outcome.

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use parley_shared::types::Identity;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push provider rejected the notification: {0}")]
    Rejected(String),

    #[error("push transport failed: {0}")]
    Transport(String),
}

/// One notification addressed to a registered device.
#[derive(Debug, Clone, PartialEq)]
pub struct PushNotification {
    pub device_token: String,
    pub recipient: Identity,
    pub title: String,
    pub body: String,
}

pub trait PushNotifier: Send + Sync {
    fn notify(&self, notification: PushNotification) -> BoxFuture<'static, Result<(), PushError>>;
}

pub type SharedNotifier = Arc<dyn PushNotifier>;

/// Notifier for deployments without a push provider: records the event in
/// the log and reports success.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl PushNotifier for LogNotifier {
    fn notify(&self, notification: PushNotification) -> BoxFuture<'static, Result<(), PushError>> {
        Box::pin(async move {
            tracing::info!(
                recipient = %notification.recipient,
                title = %notification.title,
                "Push notification (log only)"
            );
            Ok(())
        })
    }
}

/// Fire and forget. Errors are logged at warn.
pub fn dispatch(notifier: &SharedNotifier, notification: PushNotification) {
    let recipient = notification.recipient.clone();
    let delivery = notifier.notify(notification);
    tokio::spawn(async move {
        if let Err(e) = delivery.await {
            tracing::warn!(recipient = %recipient, error = %e, "Push delivery failed");
        }
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::mpsc;

    /// Forwards every notification to a channel so tests can await it.
    pub struct ChannelNotifier {
        pub tx: mpsc::UnboundedSender<PushNotification>,
    }

    impl PushNotifier for ChannelNotifier {
        fn notify(
            &self,
            notification: PushNotification,
        ) -> BoxFuture<'static, Result<(), PushError>> {
            let tx = self.tx.clone();
            Box::pin(async move {
                tx.send(notification)
                    .map_err(|e| PushError::Transport(e.to_string()))
            })
        }
    }

    /// Always fails.
    pub struct FailingNotifier;

    impl PushNotifier for FailingNotifier {
        fn notify(&self, _: PushNotification) -> BoxFuture<'static, Result<(), PushError>> {
            Box::pin(async { Err(PushError::Rejected("invalid token".into())) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn sample() -> PushNotification {
        PushNotification {
            device_token: "device-1".into(),
            recipient: Identity::from_email("alice@example.com"),
            title: "Support".into(),
            body: "New message from support".into(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_delivers_in_background() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier: SharedNotifier = Arc::new(ChannelNotifier { tx });

        dispatch(&notifier, sample());

        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, sample());
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failures() {
        let notifier: SharedNotifier = Arc::new(FailingNotifier);
        dispatch(&notifier, sample());
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_log_notifier_succeeds() {
        assert!(LogNotifier.notify(sample()).await.is_ok());
    }
}
