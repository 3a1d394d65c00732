use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::config::BatchingConfig;
use crate::dispatcher::Dispatcher;
use crate::latch::CountdownLatch;
use crate::state::{await_shutdown, ServerState};
use crate::types::{Webhook, WebhookDispatch, WebhookEvent, WebhookId};

/// An event queued for batching together with its resolved webhook.
pub(crate) type BatchItem = (Arc<Webhook>, WebhookEvent);

/// Events group by webhook and content type: one POST carries exactly
/// one content type, so differing types for the same webhook form
/// separate batches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    webhook_id: WebhookId,
    content_type: Option<String>,
}

impl BatchKey {
    fn for_item(webhook: &Webhook, event: &WebhookEvent) -> Self {
        Self {
            webhook_id: webhook.id,
            content_type: event.content_type().map(str::to_string),
        }
    }
}

struct PendingBatch {
    webhook: Arc<Webhook>,
    events: Vec<WebhookEvent>,
    deadline: Instant,
}

/// Single fiber draining the batching queue.
///
/// Each group flushes when it reaches `max_size` events or
/// `max_wait_time` after its first event, whichever comes first. On
/// shutdown, partial groups are flushed once before the stage exits.
pub(crate) async fn batching_loop(
    config: BatchingConfig,
    mut rx: mpsc::Receiver<BatchItem>,
    dispatcher: Arc<Dispatcher>,
    state: Arc<ServerState>,
    shutdown_latch: Arc<CountdownLatch>,
) {
    let mut pending: HashMap<BatchKey, PendingBatch> = HashMap::new();

    let shutdown = await_shutdown(&state);
    tokio::pin!(shutdown);

    loop {
        let next_deadline = pending.values().map(|b| b.deadline).min();

        tokio::select! {
            _ = &mut shutdown => {
                flush_all(&mut pending, &dispatcher).await;
                break;
            }
            item = rx.recv() => {
                let Some((webhook, event)) = item else {
                    flush_all(&mut pending, &dispatcher).await;
                    break;
                };

                let key = BatchKey::for_item(&webhook, &event);
                let batch = pending.entry(key.clone()).or_insert_with(|| PendingBatch {
                    webhook,
                    events: Vec::with_capacity(config.max_size),
                    deadline: Instant::now() + config.max_wait_time,
                });
                batch.events.push(event);

                if batch.events.len() >= config.max_size {
                    let batch = pending.remove(&key).expect("batch just inserted");
                    flush(batch, &dispatcher).await;
                }
            }
            _ = wait_for(next_deadline) => {
                let now = Instant::now();
                let due: Vec<BatchKey> = pending
                    .iter()
                    .filter(|(_, b)| b.deadline <= now)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in due {
                    let batch = pending.remove(&key).expect("due batch is present");
                    flush(batch, &dispatcher).await;
                }
            }
        }
    }

    shutdown_latch.count_down();
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn flush(batch: PendingBatch, dispatcher: &Dispatcher) {
    debug!(
        webhook = %batch.webhook.id,
        size = batch.events.len(),
        "flushing batch"
    );
    dispatcher
        .deliver(WebhookDispatch::new(batch.webhook, batch.events))
        .await;
}

async fn flush_all(pending: &mut HashMap<BatchKey, PendingBatch>, dispatcher: &Dispatcher) {
    for (_, batch) in pending.drain() {
        flush(batch, dispatcher).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{WebhookEventId, WebhookEventKey};

    fn item(webhook_id: u64, event_id: u64, content_type: Option<&str>) -> BatchItem {
        let webhook = Arc::new(Webhook::new(WebhookId(webhook_id), "http://example.test"));
        let mut event = WebhookEvent::new(
            WebhookEventKey::new(WebhookId(webhook_id), WebhookEventId(event_id)),
            "{}",
        );
        if let Some(ct) = content_type {
            event = event.with_header("Content-Type", ct);
        }
        (webhook, event)
    }

    #[test]
    fn batch_key_splits_on_content_type() {
        let (w, a) = item(1, 1, Some("application/json"));
        let (_, b) = item(1, 2, Some("application/JSON"));
        let (_, c) = item(1, 3, Some("text/plain"));
        let (_, d) = item(1, 4, None);

        let ka = BatchKey::for_item(&w, &a);
        let kb = BatchKey::for_item(&w, &b);
        let kc = BatchKey::for_item(&w, &c);
        let kd = BatchKey::for_item(&w, &d);

        // Header names are matched case-insensitively; values are taken
        // verbatim.
        assert_ne!(ka, kb);
        assert_ne!(ka, kc);
        assert_ne!(ka, kd);
    }

    #[test]
    fn batch_key_splits_on_webhook() {
        let (w1, a) = item(1, 1, Some("application/json"));
        let (w2, b) = item(2, 1, Some("application/json"));
        assert_ne!(BatchKey::for_item(&w1, &a), BatchKey::for_item(&w2, &b));
    }
}
