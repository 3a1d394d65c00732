use std::time::Duration;

/// Tuning for the optional batching stage.
///
/// Presence of this config on the server enables batching for webhooks
/// whose delivery mode asks for it.
#[derive(Debug, Clone)]
pub struct BatchingConfig {
    /// Capacity of the queue between ingestion and the batching stage.
    pub capacity: usize,

    /// Flush a group once it holds this many events.
    pub max_size: usize,

    /// Flush a group this long after its first event arrived.
    pub max_wait_time: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            max_size: 16,
            max_wait_time: Duration::from_millis(500),
        }
    }
}

/// Tuning for the per-webhook retry pipeline.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Capacity of each webhook's dispatch queue while it is retrying.
    pub capacity: usize,

    /// First backoff duration; later backoffs grow exponentially.
    pub exponential_base: Duration,

    /// Growth factor applied per attempt.
    pub exponential_factor: f64,

    /// Total retry budget per webhook. A webhook that cannot drain its
    /// retries within this window is quarantined as unavailable.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            exponential_base: Duration::from_millis(100),
            exponential_factor: 2.0,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of the error hub; the oldest errors are dropped when a
    /// subscriber falls this far behind.
    pub error_sliding_capacity: usize,

    /// Enables the batching stage when present.
    pub batching: Option<BatchingConfig>,

    pub retry: RetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            error_sliding_capacity: 128,
            batching: None,
            retry: RetryConfig::default(),
        }
    }
}
