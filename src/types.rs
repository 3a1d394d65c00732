use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Unique identifier for a webhook.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of webhook ids with other numeric identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookId(pub u64);

impl std::fmt::Display for WebhookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookEventId(pub u64);

impl std::fmt::Display for WebhookEventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique key of an event: the (webhook, event) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WebhookEventKey {
    pub webhook_id: WebhookId,
    pub event_id: WebhookEventId,
}

impl WebhookEventKey {
    pub fn new(webhook_id: WebhookId, event_id: WebhookEventId) -> Self {
        Self {
            webhook_id,
            event_id,
        }
    }
}

/// Delivery lifecycle status of an event.
///
/// Transitions only ever advance: `New -> Delivering`,
/// `Delivering -> Delivered`, `Delivering -> Failed`.
/// An event found in `Delivering` after a restart is the recovery target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEventStatus {
    New,
    Delivering,
    Delivered,
    Failed,
}

impl WebhookEventStatus {
    /// Whether a transition from `self` to `next` is permitted.
    pub fn may_advance_to(self, next: WebhookEventStatus) -> bool {
        use WebhookEventStatus::*;
        matches!(
            (self, next),
            (New, Delivering) | (Delivering, Delivered) | (Delivering, Failed)
        )
    }
}

/// A single webhook event: payload bytes plus the HTTP headers it was
/// recorded with.
///
/// The engine treats the payload as opaque bytes. Header order is
/// preserved; names are matched case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub key: WebhookEventKey,
    pub status: WebhookEventStatus,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl WebhookEvent {
    pub fn new(key: WebhookEventKey, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            status: WebhookEventStatus::New,
            payload: payload.into(),
            headers: Vec::new(),
        }
    }

    /// Append a header pair.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup. Returns the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The event's content type, if it carries one.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// Persisted status of a webhook.
///
/// Only the server moves a webhook `Enabled -> Retrying -> (Enabled |
/// Unavailable)`. `Disabled` webhooks are ignored by ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookStatus {
    Enabled,
    Disabled,
    Retrying { since_secs: u64 },
    Unavailable { since_secs: u64 },
}

impl WebhookStatus {
    /// Whether events for this webhook should be dispatched at all.
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            WebhookStatus::Enabled | WebhookStatus::Retrying { .. }
        )
    }
}

/// Whether events are posted one per request or grouped into batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookBatching {
    Single,
    Batched,
}

/// Delivery guarantee for a webhook.
///
/// `AtMostOnce` finalizes an event after its single attempt;
/// `AtLeastOnce` keeps retrying until the webhook's retry budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookSemantics {
    AtMostOnce,
    AtLeastOnce,
}

/// How a webhook wants its events delivered: grouping x guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDeliveryMode {
    pub batching: WebhookBatching,
    pub semantics: WebhookSemantics,
}

impl WebhookDeliveryMode {
    pub fn new(batching: WebhookBatching, semantics: WebhookSemantics) -> Self {
        Self {
            batching,
            semantics,
        }
    }

    pub fn single_at_most_once() -> Self {
        Self::new(WebhookBatching::Single, WebhookSemantics::AtMostOnce)
    }

    pub fn single_at_least_once() -> Self {
        Self::new(WebhookBatching::Single, WebhookSemantics::AtLeastOnce)
    }

    pub fn batched_at_most_once() -> Self {
        Self::new(WebhookBatching::Batched, WebhookSemantics::AtMostOnce)
    }

    pub fn batched_at_least_once() -> Self {
        Self::new(WebhookBatching::Batched, WebhookSemantics::AtLeastOnce)
    }
}

/// Destination for webhook delivery.
///
/// A `Webhook` is pure configuration plus its persisted status; all
/// retry bookkeeping lives in the server's in-memory state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub url: String,
    pub label: String,
    pub status: WebhookStatus,
    pub mode: WebhookDeliveryMode,

    /// Optional secret for HMAC signing of outgoing requests.
    pub secret: Option<Vec<u8>>,
}

impl Webhook {
    pub fn new(id: WebhookId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            label: String::new(),
            status: WebhookStatus::Enabled,
            mode: WebhookDeliveryMode::single_at_most_once(),
            secret: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_mode(mut self, mode: WebhookDeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_status(mut self, status: WebhookStatus) -> Self {
        self.status = status;
        self
    }

    /// Set a secret for HMAC signing.
    pub fn with_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

/// One HTTP POST worth of work: a webhook plus a non-empty ordered chunk
/// of its events.
///
/// Equality and hashing go by the identity of the event chunk, not its
/// contents: the retry bookkeeping keys a map by dispatch, and two
/// dispatches built from distinct chunks must never collide even when
/// they carry equal events.
#[derive(Debug, Clone)]
pub struct WebhookDispatch {
    pub webhook: Arc<Webhook>,
    pub events: Arc<Vec<WebhookEvent>>,
}

impl WebhookDispatch {
    pub fn new(webhook: Arc<Webhook>, events: Vec<WebhookEvent>) -> Self {
        debug_assert!(!events.is_empty(), "dispatch must carry events");
        Self {
            webhook,
            events: Arc::new(events),
        }
    }

    pub fn single(webhook: Arc<Webhook>, event: WebhookEvent) -> Self {
        Self::new(webhook, vec![event])
    }

    pub fn size(&self) -> usize {
        self.events.len()
    }

    pub fn webhook_id(&self) -> WebhookId {
        self.webhook.id
    }

    pub fn semantics(&self) -> WebhookSemantics {
        self.webhook.mode.semantics
    }

    pub fn event_keys(&self) -> Vec<WebhookEventKey> {
        self.events.iter().map(|e| e.key).collect()
    }
}

impl PartialEq for WebhookDispatch {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.events, &other.events)
    }
}

impl Eq for WebhookDispatch {}

impl Hash for WebhookDispatch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.events).hash(state);
    }
}

/// Retry bookkeeping for one dispatch.
///
/// The first wire attempt carries no backoff; each `next` derives the
/// following attempt with `backoff = base * factor^attempt` and bumps the
/// attempt counter.
#[derive(Debug, Clone)]
pub struct Retry {
    pub dispatch: WebhookDispatch,
    pub backoff: Option<Duration>,
    pub base: Duration,
    pub factor: f64,
    pub attempt: u32,
}

impl Retry {
    pub fn first(dispatch: WebhookDispatch, base: Duration, factor: f64) -> Self {
        Self {
            dispatch,
            backoff: None,
            base,
            factor,
            attempt: 0,
        }
    }

    pub fn next(&self) -> Self {
        Self {
            dispatch: self.dispatch.clone(),
            backoff: Some(self.base.mul_f64(self.factor.powi(self.attempt as i32))),
            base: self.base,
            factor: self.factor,
            attempt: self.attempt + 1,
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: u64) -> WebhookEvent {
        WebhookEvent::new(
            WebhookEventKey::new(WebhookId(1), WebhookEventId(id)),
            format!("{{\"p\":{id}}}"),
        )
    }

    #[test]
    fn backoff_grows_exponentially() {
        let dispatch = WebhookDispatch::single(Arc::new(Webhook::new(WebhookId(1), "u")), event(1));
        let retry = Retry::first(dispatch, Duration::from_millis(100), 2.0);
        assert_eq!(retry.backoff, None);
        assert_eq!(retry.attempt, 0);

        let second = retry.next();
        assert_eq!(second.backoff, Some(Duration::from_millis(100)));
        assert_eq!(second.attempt, 1);

        let third = second.next();
        assert_eq!(third.backoff, Some(Duration::from_millis(200)));

        let fourth = third.next();
        assert_eq!(fourth.backoff, Some(Duration::from_millis(400)));
    }

    #[test]
    fn dispatch_equality_is_chunk_identity() {
        let webhook = Arc::new(Webhook::new(WebhookId(1), "u"));
        let a = WebhookDispatch::single(webhook.clone(), event(1));
        let b = WebhookDispatch::single(webhook, event(1));

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let e = event(1).with_header("Content-Type", "application/json");
        assert_eq!(e.header("content-type"), Some("application/json"));
        assert_eq!(e.content_type(), Some("application/json"));
        assert_eq!(e.header("x-missing"), None);
    }

    #[test]
    fn status_advancement_rules() {
        use WebhookEventStatus::*;
        assert!(New.may_advance_to(Delivering));
        assert!(Delivering.may_advance_to(Delivered));
        assert!(Delivering.may_advance_to(Failed));
        assert!(!Delivered.may_advance_to(Delivering));
        assert!(!Failed.may_advance_to(New));
        assert!(!New.may_advance_to(Delivered));
    }

    #[test]
    fn retrying_webhooks_stay_available() {
        assert!(WebhookStatus::Enabled.is_available());
        assert!(WebhookStatus::Retrying { since_secs: 0 }.is_available());
        assert!(!WebhookStatus::Disabled.is_available());
        assert!(!WebhookStatus::Unavailable { since_secs: 0 }.is_available());
    }
}
