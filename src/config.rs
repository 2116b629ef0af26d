use std::time::Duration;

/// Gateway configuration. Built by the embedding application from its own
/// settings source; every limit here is tunable.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the remote execution service
    pub api_url: String,

    /// Optional API key, sent as `x-api-key`
    pub api_key: Option<String>,

    /// Maximum number of concurrent in-flight remote executions
    pub max_concurrent: usize,

    /// Per-requester quota
    pub quota: QuotaConfig,

    /// How long `admit` may wait for a free execution slot before
    /// reporting `Busy`
    pub admission_timeout: Duration,

    /// TCP connect timeout per network attempt
    pub connect_timeout: Duration,

    /// Read timeout per network attempt
    pub attempt_timeout: Duration,

    /// Soft deadline for the whole remote compile + run
    pub soft_deadline: Duration,

    /// Retry attempts after the first, for transient upstream failures
    pub max_retries: u32,

    /// Base delay for exponential retry backoff
    pub retry_base_delay: Duration,

    /// Output rendering limits
    pub format: FormatConfig,
}

/// Token-bucket quota parameters for a single requester.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Bucket capacity, also the initial token count
    pub capacity: u32,
    /// One token regenerates per interval
    pub refill_interval: Duration,
    /// How long an admission may wait for a token before `QuotaExceeded`.
    /// Zero disables queueing, an empty bucket rejects immediately.
    pub max_wait: Duration,
    /// Maximum number of admissions allowed to wait for tokens at once
    pub queue_depth: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_interval: Duration::from_secs(20),
            max_wait: Duration::ZERO,
            queue_depth: 4,
        }
    }
}

/// Message rendering limits.
#[derive(Debug, Clone)]
pub struct FormatConfig {
    /// Hard cap on a single chat message, in bytes
    pub message_limit: usize,
    /// Upper bound on segments per result; total output is truncated to
    /// `message_limit * max_segments` before splitting
    pub max_segments: usize,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            message_limit: 2000,
            max_segments: 4,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: None,
            max_concurrent: 8,
            quota: QuotaConfig::default(),
            admission_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(10),
            soft_deadline: Duration::from_secs(30),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(250),
            format: FormatConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ..Self::default()
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    pub fn with_soft_deadline(mut self, deadline: Duration) -> Self {
        self.soft_deadline = deadline;
        self
    }

    pub fn with_format(mut self, format: FormatConfig) -> Self {
        self.format = format;
        self
    }
}
