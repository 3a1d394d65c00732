use tokio::sync::broadcast;

use crate::error::WebhookError;

/// Broadcast hub for server-side errors with a sliding discard policy.
///
/// Publishing never blocks: a subscriber that falls more than the hub
/// capacity behind loses the oldest errors, not the producer's time.
#[derive(Clone)]
pub(crate) struct ErrorHub {
    tx: broadcast::Sender<WebhookError>,
}

impl ErrorHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn publish(&self, error: WebhookError) {
        tracing::warn!(%error, "server error");
        let _ = self.tx.send(error);
    }

    pub(crate) fn subscribe(&self) -> ErrorFeed {
        ErrorFeed {
            rx: self.tx.subscribe(),
        }
    }
}

/// Live feed of server-side errors.
///
/// Returned by [`crate::WebhookServer::get_errors`]. Dropping the feed
/// releases the subscription.
pub struct ErrorFeed {
    rx: broadcast::Receiver<WebhookError>,
}

impl ErrorFeed {
    /// Next error, waiting if none is pending. Returns `None` once the
    /// server is gone. Errors skipped by the sliding policy are simply
    /// absent from the feed.
    pub async fn recv(&mut self) -> Option<WebhookError> {
        loop {
            match self.rx.recv().await {
                Ok(error) => return Some(error),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<WebhookError> {
        loop {
            match self.rx.try_recv() {
                Ok(error) => return Some(error),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WebhookId;

    #[tokio::test]
    async fn slow_subscribers_lose_oldest_errors() {
        let hub = ErrorHub::new(2);
        let mut feed = hub.subscribe();

        for id in 0..5 {
            hub.publish(WebhookError::MissingWebhook(WebhookId(id)));
        }

        // Capacity 2: only the newest two survive.
        assert_eq!(
            feed.recv().await,
            Some(WebhookError::MissingWebhook(WebhookId(3)))
        );
        assert_eq!(
            feed.recv().await,
            Some(WebhookError::MissingWebhook(WebhookId(4)))
        );
        assert_eq!(feed.try_recv(), None);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let hub = ErrorHub::new(4);
        hub.publish(WebhookError::MissingWebhook(WebhookId(1)));
    }
}
