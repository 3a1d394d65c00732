use std::fmt;

use crate::types::{WebhookEventKey, WebhookId};

/// Upstream persistence failure reported by a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoError {
    pub message: String,
}

impl RepoError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "repository error: {}", self.message)
    }
}

impl std::error::Error for RepoError {}

/// Transport-level failure of an HTTP delivery attempt.
///
/// A non-2xx response is *not* an error; it is a delivery failure
/// handled by the webhook's semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpClientError {
    pub message: String,
}

impl HttpClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for HttpClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http client error: {}", self.message)
    }
}

impl std::error::Error for HttpClientError {}

/// Server-side errors surfaced on the error hub.
///
/// Errors inside long-running stages never tear down the server; they
/// are forwarded here and the stage keeps going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    /// An event referenced a webhook that does not exist.
    MissingWebhook(WebhookId),

    /// A repository lookup came back empty for a known event key.
    MissingEvent(WebhookEventKey),

    /// A repository call failed.
    Repository(RepoError),

    /// An HTTP delivery attempt failed at the transport level.
    HttpClient(HttpClientError),

    /// A dispatch raced a webhook into `Disabled` or `Unavailable` and
    /// was dropped.
    InvalidWebhookState { webhook_id: WebhookId },
}

impl fmt::Display for WebhookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebhookError::MissingWebhook(id) =>
                write!(f, "webhook not found: {id}"),
            WebhookError::MissingEvent(key) =>
                write!(f, "event not found: {}/{}", key.webhook_id, key.event_id),
            WebhookError::Repository(err) =>
                write!(f, "{err}"),
            WebhookError::HttpClient(err) =>
                write!(f, "{err}"),
            WebhookError::InvalidWebhookState { webhook_id } =>
                write!(f, "dispatch dropped: webhook {webhook_id} is not available"),
        }
    }
}

impl std::error::Error for WebhookError {}

impl From<RepoError> for WebhookError {
    fn from(err: RepoError) -> Self {
        WebhookError::Repository(err)
    }
}

impl From<HttpClientError> for WebhookError {
    fn from(err: HttpClientError) -> Self {
        WebhookError::HttpClient(err)
    }
}
