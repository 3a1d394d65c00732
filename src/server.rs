use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::batch::{batching_loop, BatchItem};
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::WebhookError;
use crate::hub::{ErrorFeed, ErrorHub};
use crate::latch::CountdownLatch;
use crate::retry::{retry_change_loop, RetryContext, ToRetrying};
use crate::state::{await_shutdown, ServerState, WebhookStateSnapshot};
use crate::storage::{WebhookEventRepo, WebhookRepo};
use crate::types::{
    Webhook, WebhookBatching, WebhookDispatch, WebhookEvent, WebhookEventStatus, WebhookSemantics,
};

/// Capacity of the queue carrying `ToRetrying` notifications from the
/// dispatcher to the retry subsystem.
const RETRY_CHANGE_CAPACITY: usize = 64;

/// The reliable-dispatch engine.
///
/// Consumes `New` events from the event repository, groups them into
/// dispatches, delivers per-webhook semantics, and drives the retry
/// state machine. Construct with [`WebhookServer::new`], then call
/// [`start`](Self::start); once it returns, producers may push events.
pub struct WebhookServer {
    config: ServerConfig,
    state: Arc<ServerState>,
    hub: ErrorHub,
    webhook_repo: Arc<dyn WebhookRepo>,
    event_repo: Arc<dyn WebhookEventRepo>,
    dispatcher: Arc<Dispatcher>,
    retry_changes: Option<mpsc::Receiver<ToRetrying>>,
    shutdown_latch: Arc<CountdownLatch>,
    handles: Vec<JoinHandle<()>>,
}

impl WebhookServer {
    pub fn new(
        config: ServerConfig,
        webhook_repo: Arc<dyn WebhookRepo>,
        event_repo: Arc<dyn WebhookEventRepo>,
        http: Arc<dyn crate::http::WebhookHttpClient>,
    ) -> Self {
        let state = Arc::new(ServerState::new());
        let hub = ErrorHub::new(config.error_sliding_capacity);
        let (change_tx, change_rx) = mpsc::channel(RETRY_CHANGE_CAPACITY);

        let dispatcher = Arc::new(Dispatcher::new(
            state.clone(),
            webhook_repo.clone(),
            event_repo.clone(),
            http,
            hub.clone(),
            change_tx,
            config.retry.clone(),
        ));

        let shutdown_count = 1 + u32::from(config.batching.is_some());

        Self {
            config,
            state,
            hub,
            webhook_repo,
            event_repo,
            dispatcher,
            retry_changes: Some(change_rx),
            shutdown_latch: Arc::new(CountdownLatch::new(shutdown_count)),
            handles: Vec::new(),
        }
    }

    /// Start the engine's stages. Returns once the new-event
    /// subscription is live, so callers may then safely push events.
    pub async fn start(&mut self) {
        let Some(retry_changes) = self.retry_changes.take() else {
            return;
        };

        self.recover_delivering_events().await;

        let batch_tx = self.config.batching.as_ref().map(|batching| {
            let (tx, rx) = mpsc::channel::<BatchItem>(batching.capacity.max(1));
            self.handles.push(tokio::spawn(batching_loop(
                batching.clone(),
                rx,
                self.dispatcher.clone(),
                self.state.clone(),
                self.shutdown_latch.clone(),
            )));
            tx
        });

        let retry_ctx = Arc::new(RetryContext {
            state: self.state.clone(),
            dispatcher: self.dispatcher.clone(),
            webhook_repo: self.webhook_repo.clone(),
            event_repo: self.event_repo.clone(),
            hub: self.hub.clone(),
            config: self.config.retry.clone(),
        });
        self.handles
            .push(tokio::spawn(retry_change_loop(retry_ctx, retry_changes)));

        let startup_latch = Arc::new(CountdownLatch::new(1));
        self.handles.push(tokio::spawn(subscription_loop(
            self.webhook_repo.clone(),
            self.event_repo.clone(),
            self.dispatcher.clone(),
            self.state.clone(),
            self.hub.clone(),
            batch_tx,
            startup_latch.clone(),
            self.shutdown_latch.clone(),
        )));

        startup_latch.wait().await;
        info!("webhook server started");
    }

    /// Stop the engine: flips the shutdown flag, then waits for the
    /// long-running stages to drain and exit. In-flight HTTP attempts
    /// run to completion; queue items past the signal are not
    /// guaranteed delivery.
    pub async fn shutdown(&mut self) {
        info!("webhook server shutting down");
        self.state.shutdown().await;
        if self.retry_changes.is_none() {
            // Started: the stages are running and will release the latch.
            self.shutdown_latch.wait().await;
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }

    /// Live feed of server-side errors. Consumers unaware of the feed
    /// see silent degradation.
    pub fn get_errors(&self) -> ErrorFeed {
        self.hub.subscribe()
    }

    /// Read-only view of a webhook's in-memory state.
    pub async fn webhook_state(&self, id: crate::types::WebhookId) -> Option<WebhookStateSnapshot> {
        self.state.snapshot(id).await
    }

    /// Reconstruct work lost to a restart: events stuck in `Delivering`
    /// are re-dispatched when their webhook still wants them
    /// (at-least-once, available), and finalized `Failed` otherwise —
    /// an at-most-once event may already have had its one attempt.
    async fn recover_delivering_events(&self) {
        let delivering = match self
            .event_repo
            .list_events_by_status(WebhookEventStatus::Delivering)
            .await
        {
            Ok(events) => events,
            Err(err) => {
                self.hub.publish(WebhookError::Repository(err));
                return;
            }
        };
        if delivering.is_empty() {
            return;
        }

        info!(count = delivering.len(), "recovering delivering events");
        for event in delivering {
            let webhook_id = event.key.webhook_id;
            let webhook = match self.webhook_repo.get_webhook_by_id(webhook_id).await {
                Ok(Some(webhook)) => webhook,
                Ok(None) => {
                    self.hub.publish(WebhookError::MissingWebhook(webhook_id));
                    continue;
                }
                Err(err) => {
                    self.hub.publish(WebhookError::Repository(err));
                    continue;
                }
            };

            let wants_redelivery = webhook.mode.semantics == WebhookSemantics::AtLeastOnce
                && webhook.status.is_available();
            if wants_redelivery {
                self.dispatcher
                    .deliver(WebhookDispatch::single(Arc::new(webhook), event))
                    .await;
            } else if let Err(err) = self
                .event_repo
                .set_event_status(event.key, WebhookEventStatus::Failed)
                .await
            {
                self.hub.publish(WebhookError::Repository(err));
            }
        }
    }
}

/// Ingestion stage: consumes `New` events and hands them to batching or
/// the dispatcher. Each event is handled to completion before the next
/// shutdown check, so a status write is never torn.
async fn subscription_loop(
    webhook_repo: Arc<dyn WebhookRepo>,
    event_repo: Arc<dyn WebhookEventRepo>,
    dispatcher: Arc<Dispatcher>,
    state: Arc<ServerState>,
    hub: ErrorHub,
    batch_tx: Option<mpsc::Sender<BatchItem>>,
    startup_latch: Arc<CountdownLatch>,
    shutdown_latch: Arc<CountdownLatch>,
) {
    let subscription = event_repo
        .get_events_by_statuses(&[WebhookEventStatus::New])
        .await;
    let mut subscription = match subscription {
        Ok(subscription) => {
            startup_latch.count_down();
            debug!("new-event subscription live");
            subscription
        }
        Err(err) => {
            hub.publish(WebhookError::Repository(err));
            startup_latch.count_down();
            shutdown_latch.count_down();
            return;
        }
    };

    let shutdown = await_shutdown(&state);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = subscription.next() => {
                let Some(event) = event else { break };
                handle_new_event(
                    &webhook_repo,
                    &event_repo,
                    &dispatcher,
                    &hub,
                    &batch_tx,
                    event,
                )
                .await;
            }
        }
    }

    shutdown_latch.count_down();
}

async fn handle_new_event(
    webhook_repo: &Arc<dyn WebhookRepo>,
    event_repo: &Arc<dyn WebhookEventRepo>,
    dispatcher: &Arc<Dispatcher>,
    hub: &ErrorHub,
    batch_tx: &Option<mpsc::Sender<BatchItem>>,
    mut event: WebhookEvent,
) {
    let webhook_id = event.key.webhook_id;
    let webhook: Webhook = match webhook_repo.get_webhook_by_id(webhook_id).await {
        Ok(Some(webhook)) => webhook,
        Ok(None) => {
            hub.publish(WebhookError::MissingWebhook(webhook_id));
            return;
        }
        Err(err) => {
            hub.publish(WebhookError::Repository(err));
            return;
        }
    };

    if !webhook.status.is_available() {
        debug!(webhook = %webhook_id, "dropping event for unavailable webhook");
        return;
    }

    if let Err(err) = event_repo
        .set_event_status(event.key, WebhookEventStatus::Delivering)
        .await
    {
        hub.publish(WebhookError::Repository(err));
        return;
    }
    event.status = WebhookEventStatus::Delivering;

    let webhook = Arc::new(webhook);
    match (webhook.mode.batching, batch_tx) {
        (WebhookBatching::Batched, Some(tx)) => {
            // Closed only past shutdown; the event is then recovered
            // from its Delivering status on the next start.
            let _ = tx.send((webhook, event)).await;
        }
        _ => {
            dispatcher
                .deliver(WebhookDispatch::single(webhook, event))
                .await;
        }
    }
}
