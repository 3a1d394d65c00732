use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;

use crate::types::{Retry, WebhookDispatch, WebhookId};

/// Capacity of the state-change broadcast channel. Readers that lag
/// re-check the shutdown flag, so dropped notifications are harmless.
const CHANGE_CAPACITY: usize = 64;

/// In-memory state of one webhook, distinct from its persisted status.
///
/// `Retrying` carries the live retry pipeline: the queue feeding the
/// webhook's retry loop and the map of dispatches currently tracked by
/// it. The webhook stays in `Retrying` exactly as long as the map is
/// non-empty or the queue still holds work.
#[derive(Debug)]
pub enum WebhookState {
    Enabled,
    Disabled,
    Retrying {
        since: Instant,
        queue: mpsc::Sender<WebhookDispatch>,
        /// Dispatches handed to the queue but not yet moved into
        /// `retries` by the feeder. While this is non-zero the pipeline
        /// still has work even if the map reads empty.
        queued: usize,
        retries: HashMap<WebhookDispatch, Retry>,
    },
    Unavailable,
}

/// Read-only view of a webhook's in-memory state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookStateSnapshot {
    Enabled,
    Disabled,
    Retrying {
        since: Instant,
        pending_retries: usize,
    },
    Unavailable,
}

/// Change notification published by the state cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    /// The shutdown flag flipped. It never flips back.
    Shutdown,

    /// A webhook's in-memory state was replaced.
    WebhookStateChanged(WebhookId),
}

/// Outcome of routing a failed dispatch into the retry pipeline.
pub(crate) enum RetryEnqueue {
    /// The webhook just entered `Retrying`; the dispatch is already on
    /// the new queue and the receiver must be handed to a retry loop.
    Started(mpsc::Receiver<WebhookDispatch>),

    /// The webhook was already retrying; send the dispatch on the
    /// returned queue outside the state lock.
    Queued {
        queue: mpsc::Sender<WebhookDispatch>,
        dispatch: WebhookDispatch,
    },

    /// The webhook is disabled or quarantined; the dispatch is dropped.
    Rejected,
}

struct StateInner {
    is_shutdown: bool,
    webhooks: HashMap<WebhookId, WebhookState>,
}

/// The shared state cell: a single lock-guarded struct paired with a
/// broadcast channel of changes.
///
/// Snapshot reads and mutations go through the lock; shutdown
/// observation goes through the channel. All mutators are total.
pub struct ServerState {
    inner: Mutex<StateInner>,
    changes: broadcast::Sender<StateChange>,
}

impl ServerState {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Mutex::new(StateInner {
                is_shutdown: false,
                webhooks: HashMap::new(),
            }),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub async fn is_shutdown(&self) -> bool {
        self.inner.lock().await.is_shutdown
    }

    /// Flip the shutdown flag and publish the change. Monotonic: once
    /// set, no new dispatches begin.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.is_shutdown {
            return;
        }
        inner.is_shutdown = true;
        drop(inner);
        let _ = self.changes.send(StateChange::Shutdown);
    }

    /// Replace a webhook's in-memory state.
    pub async fn update_webhook_state(&self, id: WebhookId, state: WebhookState) {
        let mut inner = self.inner.lock().await;
        inner.webhooks.insert(id, state);
        drop(inner);
        let _ = self.changes.send(StateChange::WebhookStateChanged(id));
    }

    /// Record a retry in the webhook's tracking map. No-op unless the
    /// webhook is currently `Retrying`.
    pub async fn set_retry(&self, id: WebhookId, retry: Retry) {
        let mut inner = self.inner.lock().await;
        if let Some(WebhookState::Retrying { retries, .. }) = inner.webhooks.get_mut(&id) {
            retries.insert(retry.dispatch.clone(), retry);
        }
    }

    /// Move a dispatch from the queued count into the webhook's tracking
    /// map. Used by the retry feeder; both updates happen in one
    /// linearized step so the pipeline never looks idle while a dispatch
    /// sits between queue and map.
    pub async fn register_retry(&self, id: WebhookId, retry: Retry) {
        let mut inner = self.inner.lock().await;
        if let Some(WebhookState::Retrying {
            retries, queued, ..
        }) = inner.webhooks.get_mut(&id)
        {
            *queued = queued.saturating_sub(1);
            retries.insert(retry.dispatch.clone(), retry);
        }
    }

    /// Drop a dispatch from the webhook's tracking map. No-op unless the
    /// webhook is currently `Retrying`.
    pub async fn remove_retry(&self, id: WebhookId, dispatch: &WebhookDispatch) {
        let mut inner = self.inner.lock().await;
        if let Some(WebhookState::Retrying { retries, .. }) = inner.webhooks.get_mut(&id) {
            retries.remove(dispatch);
        }
    }

    /// Close an idle retry pipeline: when the webhook is `Retrying`
    /// with an empty tracking map and nothing waiting in or behind the
    /// dispatch queue, replace the state with `Enabled` and report true.
    /// The check and the transition share one critical section, so a
    /// concurrent enqueue either lands before it (and keeps the
    /// pipeline open) or observes `Enabled` and starts a fresh one.
    pub(crate) async fn try_finish_retrying(&self, id: WebhookId) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.webhooks.get(&id) {
            Some(WebhookState::Retrying {
                retries, queued, ..
            }) if retries.is_empty() && *queued == 0 => {}
            _ => return false,
        }
        inner.webhooks.insert(id, WebhookState::Enabled);
        drop(inner);
        let _ = self.changes.send(StateChange::WebhookStateChanged(id));
        true
    }

    pub async fn snapshot(&self, id: WebhookId) -> Option<WebhookStateSnapshot> {
        let inner = self.inner.lock().await;
        inner.webhooks.get(&id).map(|state| match state {
            WebhookState::Enabled => WebhookStateSnapshot::Enabled,
            WebhookState::Disabled => WebhookStateSnapshot::Disabled,
            WebhookState::Retrying { since, retries, .. } => WebhookStateSnapshot::Retrying {
                since: *since,
                pending_retries: retries.len(),
            },
            WebhookState::Unavailable => WebhookStateSnapshot::Unavailable,
        })
    }

    /// Route a failed at-least-once dispatch into the webhook's retry
    /// pipeline, creating the pipeline on the `Enabled -> Retrying`
    /// transition. Linearized under the state lock.
    pub(crate) async fn enqueue_for_retry(
        &self,
        id: WebhookId,
        dispatch: WebhookDispatch,
        capacity: usize,
    ) -> RetryEnqueue {
        let mut inner = self.inner.lock().await;
        match inner.webhooks.get_mut(&id) {
            Some(WebhookState::Retrying { queue, queued, .. }) => {
                // Counted before the send so the pipeline cannot close
                // while the dispatch is on its way to the queue.
                *queued += 1;
                return RetryEnqueue::Queued {
                    queue: queue.clone(),
                    dispatch,
                };
            }
            Some(WebhookState::Disabled) | Some(WebhookState::Unavailable) => {
                return RetryEnqueue::Rejected;
            }
            Some(WebhookState::Enabled) | None => {}
        }

        let (tx, rx) = mpsc::channel(capacity.max(1));
        tx.try_send(dispatch)
            .expect("fresh retry queue has capacity");
        inner.webhooks.insert(
            id,
            WebhookState::Retrying {
                since: Instant::now(),
                queue: tx,
                queued: 1,
                retries: HashMap::new(),
            },
        );
        drop(inner);
        let _ = self.changes.send(StateChange::WebhookStateChanged(id));
        RetryEnqueue::Started(rx)
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once the shutdown flag is set. Lag on the change channel is
/// tolerated by re-checking the flag.
pub(crate) async fn await_shutdown(state: &ServerState) {
    let mut rx = state.subscribe();
    loop {
        if state.is_shutdown().await {
            return;
        }
        match rx.recv().await {
            Ok(StateChange::Shutdown) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Retry, Webhook, WebhookEvent, WebhookEventId, WebhookEventKey};
    use std::sync::Arc;
    use std::time::Duration;

    fn dispatch(id: u64) -> WebhookDispatch {
        let webhook = Arc::new(Webhook::new(WebhookId(id), "http://example.test"));
        let event = WebhookEvent::new(
            WebhookEventKey::new(WebhookId(id), WebhookEventId(1)),
            "{}",
        );
        WebhookDispatch::single(webhook, event)
    }

    #[tokio::test]
    async fn set_retry_is_noop_outside_retrying() {
        let state = ServerState::new();
        let id = WebhookId(1);
        let d = dispatch(1);

        state
            .set_retry(id, Retry::first(d.clone(), Duration::from_millis(10), 2.0))
            .await;
        assert_eq!(state.snapshot(id).await, None);

        state.update_webhook_state(id, WebhookState::Enabled).await;
        state
            .set_retry(id, Retry::first(d, Duration::from_millis(10), 2.0))
            .await;
        assert_eq!(state.snapshot(id).await, Some(WebhookStateSnapshot::Enabled));
    }

    #[tokio::test]
    async fn enqueue_starts_pipeline_once() {
        let state = ServerState::new();
        let id = WebhookId(7);

        let first = state.enqueue_for_retry(id, dispatch(7), 4).await;
        assert!(matches!(first, RetryEnqueue::Started(_)));

        let second = state.enqueue_for_retry(id, dispatch(7), 4).await;
        assert!(matches!(second, RetryEnqueue::Queued { .. }));

        state.update_webhook_state(id, WebhookState::Unavailable).await;
        let third = state.enqueue_for_retry(id, dispatch(7), 4).await;
        assert!(matches!(third, RetryEnqueue::Rejected));
    }

    #[tokio::test]
    async fn pipeline_closes_only_when_queue_and_map_are_drained() {
        let state = ServerState::new();
        let id = WebhookId(1);
        let d1 = dispatch(1);
        let d2 = dispatch(1);

        let started = state.enqueue_for_retry(id, d1.clone(), 4).await;
        assert!(matches!(started, RetryEnqueue::Started(_)));
        // d1 sits in the dispatch queue, not yet registered.
        assert!(!state.try_finish_retrying(id).await);

        let queued = state.enqueue_for_retry(id, d2.clone(), 4).await;
        assert!(matches!(queued, RetryEnqueue::Queued { .. }));

        state
            .register_retry(id, Retry::first(d1.clone(), Duration::from_millis(10), 2.0))
            .await;
        state.remove_retry(id, &d1).await;
        // d2 is still between queue and map; the pipeline must stay open.
        assert!(!state.try_finish_retrying(id).await);

        state
            .register_retry(id, Retry::first(d2.clone(), Duration::from_millis(10), 2.0))
            .await;
        state.remove_retry(id, &d2).await;
        assert!(state.try_finish_retrying(id).await);
        assert_eq!(state.snapshot(id).await, Some(WebhookStateSnapshot::Enabled));
    }

    #[tokio::test]
    async fn shutdown_wakes_observers() {
        let state = Arc::new(ServerState::new());
        let observer = {
            let state = state.clone();
            tokio::spawn(async move { await_shutdown(&state).await })
        };

        state.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), observer)
            .await
            .expect("observer should wake")
            .expect("observer should not panic");
        assert!(state.is_shutdown().await);
    }
}
