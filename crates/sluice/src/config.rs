use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// HTTP client options shared by manifest and segment requests.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for an entire request; zero disables it.
    pub timeout: Duration,

    /// Connection timeout (time to establish the initial connection).
    pub connect_timeout: Duration,

    /// Whether to follow redirects.
    pub follow_redirects: bool,

    /// User agent string.
    pub user_agent: String,

    /// Custom HTTP headers applied to every request.
    pub headers: HeaderMap,

    /// Maximum idle connections kept per host. Segment waves hit the same
    /// CDN host repeatedly, so keep this at or above the wave size share.
    pub pool_max_idle_per_host: usize,

    /// Duration idle connections are kept alive before closing.
    pub pool_idle_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(0),
            connect_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::default_headers(),
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpConfig {
    pub fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("*/*"),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        headers
    }
}

/// Segment batch fetcher options.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Concurrency bound per wave.
    pub wave_size: usize,

    /// Fixed pause between waves, for load shedding.
    pub inter_wave_pause: Duration,

    /// Per-attempt timeout for a single segment request.
    pub segment_timeout: Duration,

    /// Retries per segment before recording it as failed.
    pub max_segment_retries: u32,

    /// Base for exponential retry backoff.
    pub retry_delay_base: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            wave_size: 24,
            inter_wave_pause: Duration::from_millis(150),
            segment_timeout: Duration::from_secs(30),
            max_segment_retries: 3,
            retry_delay_base: Duration::from_millis(500),
        }
    }
}

/// Merge collaborator options.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Bounded wait for the merge service response.
    pub response_timeout: Duration,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Registry retention options.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long terminal tasks remain queryable before eviction.
    pub linger: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            linger: Duration::from_secs(60),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Maximum simultaneously active download tasks.
    pub limits: LimitsConfig,
    pub http: HttpConfig,
    pub fetcher: FetcherConfig,
    pub merge: MergeConfig,
    pub registry: RegistryConfig,
}

/// Task admission limits.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Maximum simultaneously Active tasks; excess registrations queue FIFO.
    pub max_concurrent: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_concurrent: 3 }
    }
}
