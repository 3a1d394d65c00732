use async_trait::async_trait;

use crate::error::HttpClientError;
use crate::signing;
use crate::types::{now_secs, WebhookDispatch};

/// Outgoing POST built from a dispatch.
#[derive(Debug, Clone)]
pub struct WebhookHttpRequest {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// Response to a delivery attempt. Delivery succeeds iff the status
/// code is 200; any other code is a delivery failure, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookHttpResponse {
    pub status_code: u16,
}

impl WebhookHttpResponse {
    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

/// Transport used for delivery attempts. Implementations only surface
/// transport-level failures; HTTP status handling is the engine's job.
#[async_trait]
pub trait WebhookHttpClient: Send + Sync {
    async fn post(&self, request: WebhookHttpRequest) -> Result<WebhookHttpResponse, HttpClientError>;
}

/// Build the wire request for a dispatch.
///
/// The body is the newline-join of the chunk's payloads, which is
/// deterministic for a given chunk. Headers are taken from the last
/// event in the chunk; batches share a content type by construction.
/// Webhooks carrying a secret get signature and timestamp headers.
pub fn build_request(dispatch: &WebhookDispatch) -> WebhookHttpRequest {
    let body = dispatch
        .events
        .iter()
        .map(|e| e.payload.as_slice())
        .collect::<Vec<_>>()
        .join(&b"\n"[..]);

    let last = dispatch.events.last().expect("dispatch is non-empty");
    let mut headers = last.headers.clone();

    if let Some(secret) = dispatch.webhook.secret.as_deref() {
        let timestamp = now_secs();
        headers.push((
            signing::SIGNATURE_HEADER.to_string(),
            signing::compute_signature(secret, timestamp, &body),
        ));
        headers.push((signing::TIMESTAMP_HEADER.to_string(), timestamp.to_string()));
    }

    WebhookHttpRequest {
        url: dispatch.webhook.url.clone(),
        body,
        headers,
    }
}

/// HTTP client backed by `reqwest`.
#[derive(Default, Clone)]
pub struct ReqwestWebhookClient {
    client: reqwest::Client,
}

impl ReqwestWebhookClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookHttpClient for ReqwestWebhookClient {
    async fn post(&self, request: WebhookHttpRequest) -> Result<WebhookHttpResponse, HttpClientError> {
        let mut builder = self.client.post(&request.url).body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| HttpClientError::new(err.to_string()))?;

        Ok(WebhookHttpResponse {
            status_code: response.status().as_u16(),
        })
    }
}
