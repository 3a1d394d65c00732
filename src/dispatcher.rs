use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::RetryConfig;
use crate::error::WebhookError;
use crate::http::{build_request, WebhookHttpClient};
use crate::hub::ErrorHub;
use crate::retry::ToRetrying;
use crate::state::{RetryEnqueue, ServerState};
use crate::storage::{WebhookEventRepo, WebhookRepo};
use crate::types::{now_secs, WebhookDispatch, WebhookEventStatus, WebhookSemantics, WebhookStatus};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Result of one wire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    Success,
    Failure,
}

/// Performs HTTP POST attempts and applies their outcome to event
/// statuses and retry bookkeeping.
///
/// The dispatcher never fails its caller: repository and transport
/// errors go to the error hub and the corresponding stage keeps going.
pub(crate) struct Dispatcher {
    state: Arc<ServerState>,
    webhook_repo: Arc<dyn WebhookRepo>,
    event_repo: Arc<dyn WebhookEventRepo>,
    http: Arc<dyn WebhookHttpClient>,
    hub: ErrorHub,
    retry_changes: mpsc::Sender<ToRetrying>,
    retry: RetryConfig,
}

impl Dispatcher {
    pub(crate) fn new(
        state: Arc<ServerState>,
        webhook_repo: Arc<dyn WebhookRepo>,
        event_repo: Arc<dyn WebhookEventRepo>,
        http: Arc<dyn WebhookHttpClient>,
        hub: ErrorHub,
        retry_changes: mpsc::Sender<ToRetrying>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            state,
            webhook_repo,
            event_repo,
            http,
            hub,
            retry_changes,
            retry,
        }
    }

    /// Deliver a dispatch: one POST attempt, then outcome handling
    /// according to the webhook's semantics.
    pub(crate) async fn deliver(&self, dispatch: WebhookDispatch) {
        match self.attempt(&dispatch).await {
            AttemptOutcome::Success => {}
            AttemptOutcome::Failure => match dispatch.semantics() {
                WebhookSemantics::AtMostOnce => self.finalize_failed(&dispatch).await,
                WebhookSemantics::AtLeastOnce => self.enqueue_retry(dispatch).await,
            },
        }
    }

    /// One POST attempt. On success, events advance to `Delivered` and
    /// the dispatch leaves the webhook's retry tracking. Failure
    /// handling is the caller's: `deliver` routes by semantics, the
    /// retry worker schedules the next attempt.
    pub(crate) async fn attempt(&self, dispatch: &WebhookDispatch) -> AttemptOutcome {
        let request = build_request(dispatch);
        let outcome = match self.http.post(request).await {
            Ok(response) if response.is_success() => AttemptOutcome::Success,
            Ok(response) => {
                debug!(
                    webhook = %dispatch.webhook_id(),
                    status = response.status_code,
                    size = dispatch.size(),
                    "delivery attempt rejected"
                );
                AttemptOutcome::Failure
            }
            Err(err) => {
                self.hub.publish(WebhookError::HttpClient(err));
                AttemptOutcome::Failure
            }
        };

        if outcome == AttemptOutcome::Success {
            metric_inc("webhook.delivery.delivered");
            self.finalize_delivered(dispatch).await;
            self.state
                .remove_retry(dispatch.webhook_id(), dispatch)
                .await;
        } else {
            metric_inc("webhook.delivery.failed_attempt");
        }
        outcome
    }

    async fn finalize_delivered(&self, dispatch: &WebhookDispatch) {
        let result = if dispatch.size() == 1 {
            self.event_repo
                .set_event_status(dispatch.events[0].key, WebhookEventStatus::Delivered)
                .await
        } else {
            self.event_repo
                .set_event_status_many(&dispatch.event_keys(), WebhookEventStatus::Delivered)
                .await
        };
        if let Err(err) = result {
            self.hub.publish(WebhookError::Repository(err));
        }
    }

    async fn finalize_failed(&self, dispatch: &WebhookDispatch) {
        let result = if dispatch.size() == 1 {
            self.event_repo
                .set_event_status(dispatch.events[0].key, WebhookEventStatus::Failed)
                .await
        } else {
            self.event_repo
                .set_event_status_many(&dispatch.event_keys(), WebhookEventStatus::Failed)
                .await
        };
        if let Err(err) = result {
            self.hub.publish(WebhookError::Repository(err));
        }
    }

    /// Route a failed at-least-once dispatch into its webhook's retry
    /// pipeline, starting the pipeline on first failure.
    async fn enqueue_retry(&self, dispatch: WebhookDispatch) {
        let webhook_id = dispatch.webhook_id();
        match self
            .state
            .enqueue_for_retry(webhook_id, dispatch, self.retry.capacity)
            .await
        {
            RetryEnqueue::Started(dispatches) => {
                info!(webhook = %webhook_id, "webhook entered retrying");
                metric_inc("webhook.retry.started");
                if let Err(err) = self
                    .webhook_repo
                    .set_webhook_status(
                        webhook_id,
                        WebhookStatus::Retrying {
                            since_secs: now_secs(),
                        },
                    )
                    .await
                {
                    self.hub.publish(WebhookError::Repository(err));
                }
                if self
                    .retry_changes
                    .send(ToRetrying {
                        webhook_id,
                        dispatches,
                    })
                    .await
                    .is_err()
                {
                    // Retry subsystem is gone; only happens past shutdown.
                    debug!(webhook = %webhook_id, "retry change queue closed");
                }
            }
            RetryEnqueue::Queued { queue, dispatch } => {
                metric_inc("webhook.retry.queued");
                if queue.send(dispatch).await.is_err() {
                    self.hub
                        .publish(WebhookError::InvalidWebhookState { webhook_id });
                }
            }
            RetryEnqueue::Rejected => {
                self.hub
                    .publish(WebhookError::InvalidWebhookState { webhook_id });
            }
        }
    }
}
