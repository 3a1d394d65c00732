use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::RepoError;
use crate::types::{Webhook, WebhookEvent, WebhookEventKey, WebhookEventStatus, WebhookId, WebhookStatus};

/// Buffer of a status-filtered event subscription.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Persistence surface for webhooks.
#[async_trait]
pub trait WebhookRepo: Send + Sync {
    async fn get_webhook_by_id(&self, id: WebhookId) -> Result<Option<Webhook>, RepoError>;

    async fn set_webhook_status(&self, id: WebhookId, status: WebhookStatus)
        -> Result<(), RepoError>;
}

/// Persistence surface for webhook events.
#[async_trait]
pub trait WebhookEventRepo: Send + Sync {
    /// Subscribe to events entering any of the given statuses. Events
    /// already in a matching status are replayed first, in arrival
    /// order. The subscription closes when the returned dequeue drops.
    async fn get_events_by_statuses(
        &self,
        statuses: &[WebhookEventStatus],
    ) -> Result<EventSubscription, RepoError>;

    /// Snapshot of the events currently in the given status, in arrival
    /// order.
    async fn list_events_by_status(
        &self,
        status: WebhookEventStatus,
    ) -> Result<Vec<WebhookEvent>, RepoError>;

    async fn set_event_status(
        &self,
        key: WebhookEventKey,
        status: WebhookEventStatus,
    ) -> Result<(), RepoError>;

    async fn set_event_status_many(
        &self,
        keys: &[WebhookEventKey],
        status: WebhookEventStatus,
    ) -> Result<(), RepoError>;

    /// Finalize every `Delivering` event of the webhook as `Failed`.
    /// Used when a webhook is quarantined.
    async fn set_all_as_failed_by_webhook_id(&self, id: WebhookId) -> Result<(), RepoError>;
}

/// Live dequeue of events matching a status subscription.
pub struct EventSubscription {
    rx: mpsc::Receiver<WebhookEvent>,
}

impl EventSubscription {
    /// Next matching event; `None` once the repository is gone.
    pub async fn next(&mut self) -> Option<WebhookEvent> {
        self.rx.recv().await
    }
}

/// In-memory webhook repository for tests and embedded use.
#[derive(Default)]
pub struct InMemoryWebhookRepo {
    webhooks: Mutex<HashMap<WebhookId, Webhook>>,
}

impl InMemoryWebhookRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_webhook(&self, webhook: Webhook) {
        self.webhooks.lock().await.insert(webhook.id, webhook);
    }
}

#[async_trait]
impl WebhookRepo for InMemoryWebhookRepo {
    async fn get_webhook_by_id(&self, id: WebhookId) -> Result<Option<Webhook>, RepoError> {
        Ok(self.webhooks.lock().await.get(&id).cloned())
    }

    async fn set_webhook_status(
        &self,
        id: WebhookId,
        status: WebhookStatus,
    ) -> Result<(), RepoError> {
        let mut webhooks = self.webhooks.lock().await;
        match webhooks.get_mut(&id) {
            Some(webhook) => {
                webhook.status = status;
                Ok(())
            }
            None => Err(RepoError::new(format!("unknown webhook {id}"))),
        }
    }
}

struct Subscriber {
    statuses: Vec<WebhookEventStatus>,
    tx: mpsc::Sender<WebhookEvent>,
}

#[derive(Default)]
struct EventStore {
    events: HashMap<WebhookEventKey, WebhookEvent>,
    arrival: Vec<WebhookEventKey>,
    subscribers: Vec<Subscriber>,
}

/// In-memory event repository for tests and embedded use.
///
/// Status transitions are validated: an event never regresses.
#[derive(Default)]
pub struct InMemoryWebhookEventRepo {
    store: Mutex<EventStore>,
}

impl InMemoryWebhookEventRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new event and wake matching subscriptions.
    pub async fn create_event(&self, event: WebhookEvent) -> Result<(), RepoError> {
        let targets = {
            let mut store = self.store.lock().await;
            if store.events.contains_key(&event.key) {
                return Err(RepoError::new(format!(
                    "duplicate event {}/{}",
                    event.key.webhook_id, event.key.event_id
                )));
            }
            store.arrival.push(event.key);
            store.events.insert(event.key, event.clone());
            matching_senders(&mut store, event.status)
        };

        for tx in targets {
            let _ = tx.send(event.clone()).await;
        }
        Ok(())
    }

    /// Current status of an event, if it exists.
    pub async fn event_status(&self, key: WebhookEventKey) -> Option<WebhookEventStatus> {
        self.store.lock().await.events.get(&key).map(|e| e.status)
    }

    async fn transition(
        &self,
        key: WebhookEventKey,
        status: WebhookEventStatus,
    ) -> Result<(), RepoError> {
        let (event, targets) = {
            let mut store = self.store.lock().await;
            let Some(event) = store.events.get_mut(&key) else {
                return Err(RepoError::new(format!(
                    "unknown event {}/{}",
                    key.webhook_id, key.event_id
                )));
            };
            if !event.status.may_advance_to(status) {
                return Err(RepoError::new(format!(
                    "illegal status transition {:?} -> {:?} for event {}/{}",
                    event.status, status, key.webhook_id, key.event_id
                )));
            }
            event.status = status;
            let event = event.clone();
            let targets = matching_senders(&mut store, status);
            (event, targets)
        };

        for tx in targets {
            let _ = tx.send(event.clone()).await;
        }
        Ok(())
    }
}

fn matching_senders(
    store: &mut EventStore,
    status: WebhookEventStatus,
) -> Vec<mpsc::Sender<WebhookEvent>> {
    store.subscribers.retain(|s| !s.tx.is_closed());
    store
        .subscribers
        .iter()
        .filter(|s| s.statuses.contains(&status))
        .map(|s| s.tx.clone())
        .collect()
}

#[async_trait]
impl WebhookEventRepo for InMemoryWebhookEventRepo {
    async fn get_events_by_statuses(
        &self,
        statuses: &[WebhookEventStatus],
    ) -> Result<EventSubscription, RepoError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let backlog = {
            let mut store = self.store.lock().await;
            let backlog: Vec<WebhookEvent> = store
                .arrival
                .iter()
                .filter_map(|key| store.events.get(key))
                .filter(|e| statuses.contains(&e.status))
                .cloned()
                .collect();
            store.subscribers.push(Subscriber {
                statuses: statuses.to_vec(),
                tx: tx.clone(),
            });
            backlog
        };

        for event in backlog {
            let _ = tx.send(event).await;
        }
        Ok(EventSubscription { rx })
    }

    async fn list_events_by_status(
        &self,
        status: WebhookEventStatus,
    ) -> Result<Vec<WebhookEvent>, RepoError> {
        let store = self.store.lock().await;
        Ok(store
            .arrival
            .iter()
            .filter_map(|key| store.events.get(key))
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    async fn set_event_status(
        &self,
        key: WebhookEventKey,
        status: WebhookEventStatus,
    ) -> Result<(), RepoError> {
        self.transition(key, status).await
    }

    async fn set_event_status_many(
        &self,
        keys: &[WebhookEventKey],
        status: WebhookEventStatus,
    ) -> Result<(), RepoError> {
        for key in keys {
            self.transition(*key, status).await?;
        }
        Ok(())
    }

    async fn set_all_as_failed_by_webhook_id(&self, id: WebhookId) -> Result<(), RepoError> {
        let mut store = self.store.lock().await;
        for event in store.events.values_mut() {
            if event.key.webhook_id == id && event.status == WebhookEventStatus::Delivering {
                event.status = WebhookEventStatus::Failed;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WebhookEventId;

    fn key(event_id: u64) -> WebhookEventKey {
        WebhookEventKey::new(WebhookId(1), WebhookEventId(event_id))
    }

    #[tokio::test]
    async fn subscription_replays_backlog_then_streams() {
        let repo = InMemoryWebhookEventRepo::new();
        repo.create_event(WebhookEvent::new(key(1), "a")).await.unwrap();

        let mut sub = repo
            .get_events_by_statuses(&[WebhookEventStatus::New])
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().key, key(1));

        repo.create_event(WebhookEvent::new(key(2), "b")).await.unwrap();
        assert_eq!(sub.next().await.unwrap().key, key(2));
    }

    #[tokio::test]
    async fn statuses_never_regress() {
        let repo = InMemoryWebhookEventRepo::new();
        repo.create_event(WebhookEvent::new(key(1), "a")).await.unwrap();

        repo.set_event_status(key(1), WebhookEventStatus::Delivering)
            .await
            .unwrap();
        repo.set_event_status(key(1), WebhookEventStatus::Delivered)
            .await
            .unwrap();

        let err = repo
            .set_event_status(key(1), WebhookEventStatus::Failed)
            .await
            .unwrap_err();
        assert!(err.message.contains("illegal status transition"));
        assert_eq!(
            repo.event_status(key(1)).await,
            Some(WebhookEventStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn quarantine_fails_only_delivering_events() {
        let repo = InMemoryWebhookEventRepo::new();
        repo.create_event(WebhookEvent::new(key(1), "a")).await.unwrap();
        repo.create_event(WebhookEvent::new(key(2), "b")).await.unwrap();
        repo.set_event_status(key(1), WebhookEventStatus::Delivering)
            .await
            .unwrap();

        repo.set_all_as_failed_by_webhook_id(WebhookId(1)).await.unwrap();

        assert_eq!(repo.event_status(key(1)).await, Some(WebhookEventStatus::Failed));
        assert_eq!(repo.event_status(key(2)).await, Some(WebhookEventStatus::New));
    }

    #[tokio::test]
    async fn webhook_status_roundtrip() {
        let repo = InMemoryWebhookRepo::new();
        repo.upsert_webhook(Webhook::new(WebhookId(1), "http://example.test"))
            .await;

        repo.set_webhook_status(WebhookId(1), WebhookStatus::Disabled)
            .await
            .unwrap();
        let webhook = repo.get_webhook_by_id(WebhookId(1)).await.unwrap().unwrap();
        assert_eq!(webhook.status, WebhookStatus::Disabled);

        assert!(repo
            .set_webhook_status(WebhookId(9), WebhookStatus::Enabled)
            .await
            .is_err());
    }
}
