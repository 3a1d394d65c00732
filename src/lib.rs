//! A single-process reliable-dispatch engine for webhook delivery.
//!
//! This crate consumes a stream of webhook events from a repository,
//! groups them into HTTP dispatches per destination, delivers them under
//! per-webhook semantics, and drives a retry state machine with
//! exponential backoff that can ultimately quarantine a persistently
//! failing destination.
//!
//! ## Guarantees
//! - Event statuses only ever advance
//! - At-most-once: one POST attempt per event, then finalization
//! - At-least-once: retries until success or the webhook's retry budget
//!   runs out, then quarantine
//! - Per-webhook retry attempts are serialized
//! - Errors never block producers (sliding error hub)
//! - Shutdown drains in-flight work without tearing status writes
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering beyond arrival order within a batch
//! - Distributed coordination across server instances
//! - Persistence of in-memory retry queues across restarts (recovery is
//!   reconstructed from event status)
//!
//! The HTTP client and the repositories are collaborators behind traits;
//! in-memory implementations are provided for tests and embedded use.

mod batch;
mod config;
mod dispatcher;
mod error;
mod http;
mod hub;
mod latch;
mod retry;
mod server;
mod signing;
mod state;
mod storage;
mod types;

pub use config::{BatchingConfig, RetryConfig, ServerConfig};
pub use error::{HttpClientError, RepoError, WebhookError};
pub use http::{
    build_request, ReqwestWebhookClient, WebhookHttpClient, WebhookHttpRequest,
    WebhookHttpResponse,
};
pub use hub::ErrorFeed;
pub use server::WebhookServer;
pub use signing::{
    compute_signature, is_timestamp_fresh, verify_request, verify_signature, VerificationError,
    SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
pub use state::WebhookStateSnapshot;
pub use storage::{
    EventSubscription, InMemoryWebhookEventRepo, InMemoryWebhookRepo, WebhookEventRepo,
    WebhookRepo,
};
pub use types::{
    Retry, Webhook, WebhookBatching, WebhookDeliveryMode, WebhookDispatch, WebhookEvent,
    WebhookEventId, WebhookEventKey, WebhookEventStatus, WebhookId, WebhookSemantics,
    WebhookStatus,
};
