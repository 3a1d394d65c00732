use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::dispatcher::{AttemptOutcome, Dispatcher};
use crate::error::WebhookError;
use crate::hub::ErrorHub;
use crate::state::{await_shutdown, ServerState, WebhookState};
use crate::storage::{WebhookEventRepo, WebhookRepo};
use crate::types::{now_secs, Retry, WebhookDispatch, WebhookId, WebhookStatus};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Published by the dispatcher when a webhook enters `Retrying`. Carries
/// the receiving end of the webhook's fresh dispatch queue; exactly one
/// retry loop consumes it.
pub(crate) struct ToRetrying {
    pub(crate) webhook_id: WebhookId,
    pub(crate) dispatches: mpsc::Receiver<WebhookDispatch>,
}

/// Shared collaborators of the retry subsystem.
pub(crate) struct RetryContext {
    pub(crate) state: Arc<ServerState>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) webhook_repo: Arc<dyn WebhookRepo>,
    pub(crate) event_repo: Arc<dyn WebhookEventRepo>,
    pub(crate) hub: ErrorHub,
    pub(crate) config: RetryConfig,
}

/// Consumes `ToRetrying` notifications and forks one supervised retry
/// loop per webhook. Exits on shutdown; loops already in flight run out
/// their own timeout.
pub(crate) async fn retry_change_loop(
    ctx: Arc<RetryContext>,
    mut changes: mpsc::Receiver<ToRetrying>,
) {
    let shutdown = await_shutdown(&ctx.state);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            change = changes.recv() => {
                let Some(change) = change else { break };
                tokio::spawn(run_retry_loop(ctx.clone(), change));
            }
        }
    }
}

/// Drive one webhook's retries to completion or quarantine.
///
/// The loop is a feeder/worker pair around a capacity-1 retry queue:
/// the queue admits one in-flight retry per webhook, serializing
/// attempts. The whole pair runs under the configured retry budget.
async fn run_retry_loop(ctx: Arc<RetryContext>, change: ToRetrying) {
    let webhook_id = change.webhook_id;
    info!(webhook = %webhook_id, "retry loop started");

    let (retry_tx, retry_rx) = mpsc::channel(1);
    let timers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

    let feeder = tokio::spawn(retry_feeder(
        ctx.clone(),
        webhook_id,
        change.dispatches,
        retry_tx.clone(),
    ));

    let drained = timeout(
        ctx.config.timeout,
        retry_worker(ctx.clone(), webhook_id, retry_rx, retry_tx, timers.clone()),
    )
    .await;

    feeder.abort();
    for timer in timers.lock().await.drain(..) {
        timer.abort();
    }

    match drained {
        Ok(()) => {
            // The worker already swapped the in-memory state to
            // `Enabled` when it closed the pipeline; overwriting it
            // here could clobber a pipeline started since.
            info!(webhook = %webhook_id, "retries drained, webhook re-enabled");
            metric_inc("webhook.retry.recovered");
            if let Err(err) = ctx
                .webhook_repo
                .set_webhook_status(webhook_id, WebhookStatus::Enabled)
                .await
            {
                ctx.hub.publish(WebhookError::Repository(err));
            }
        }
        Err(_) => {
            warn!(webhook = %webhook_id, "retry budget exhausted, quarantining webhook");
            metric_inc("webhook.retry.quarantined");
            if let Err(err) = ctx
                .webhook_repo
                .set_webhook_status(
                    webhook_id,
                    WebhookStatus::Unavailable {
                        since_secs: now_secs(),
                    },
                )
                .await
            {
                ctx.hub.publish(WebhookError::Repository(err));
            }
            if let Err(err) = ctx.event_repo.set_all_as_failed_by_webhook_id(webhook_id).await {
                ctx.hub.publish(WebhookError::Repository(err));
            }
            ctx.state
                .update_webhook_state(webhook_id, WebhookState::Unavailable)
                .await;
        }
    }
}

/// Streams the webhook's dispatch queue into initial retries. A retry is
/// registered in the state cell before it is offered, so the tracking
/// map never under-counts in-flight work.
async fn retry_feeder(
    ctx: Arc<RetryContext>,
    webhook_id: WebhookId,
    mut dispatches: mpsc::Receiver<WebhookDispatch>,
    retry_tx: mpsc::Sender<Retry>,
) {
    while let Some(dispatch) = dispatches.recv().await {
        let retry = Retry::first(
            dispatch,
            ctx.config.exponential_base,
            ctx.config.exponential_factor,
        );
        ctx.state.register_retry(webhook_id, retry.clone()).await;
        if retry_tx.send(retry).await.is_err() {
            break;
        }
    }
}

/// Serial worker over the capacity-1 retry queue. Runs until the
/// webhook's tracking map empties and the dispatch queue is drained.
async fn retry_worker(
    ctx: Arc<RetryContext>,
    webhook_id: WebhookId,
    mut retry_rx: mpsc::Receiver<Retry>,
    retry_tx: mpsc::Sender<Retry>,
    timers: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    while let Some(retry) = retry_rx.recv().await {
        match ctx.dispatcher.attempt(&retry.dispatch).await {
            AttemptOutcome::Success => {
                if ctx.state.try_finish_retrying(webhook_id).await {
                    break;
                }
            }
            AttemptOutcome::Failure => {
                let next = retry.next();
                ctx.state.set_retry(webhook_id, next.clone()).await;
                metric_inc("webhook.retry.scheduled");

                if let Some(delay) = next.backoff {
                    debug!(
                        webhook = %webhook_id,
                        attempt = next.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retry scheduled"
                    );
                }
                // Re-offer from a supervised timer task; offering from
                // the worker itself could block the queue's only
                // consumer.
                let delay = next.backoff.unwrap_or_default();
                let tx = retry_tx.clone();
                let handle = tokio::spawn(async move {
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    let _ = tx.send(next).await;
                });
                timers.lock().await.push(handle);
            }
        }
    }
}
