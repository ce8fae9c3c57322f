use reqwest::StatusCode;

/// Error taxonomy for a download task.
///
/// `Cancelled` is a distinct terminal outcome, not a failure. Segment-level
/// fetch errors are non-fatal and accumulate; everything else aborts the task.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("manifest fetch failed for {url}: {reason}")]
    ManifestFetch { url: String, reason: String },

    #[error("manifest parse failed: {reason}")]
    ManifestParse { reason: String },

    #[error("segment fetch error: {reason}")]
    SegmentFetch { reason: String, retryable: bool },

    #[error("merge failed: {reason}")]
    Merge { reason: String },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("blob store error: {reason}")]
    Store { reason: String },

    #[error("sink error: {reason}")]
    Sink { reason: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn manifest_fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ManifestFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn manifest_parse(reason: impl Into<String>) -> Self {
        Self::ManifestParse {
            reason: reason.into(),
        }
    }

    pub fn segment_fetch(reason: impl Into<String>, retryable: bool) -> Self {
        Self::SegmentFetch {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn merge(reason: impl Into<String>) -> Self {
        Self::Merge {
            reason: reason.into(),
        }
    }

    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }

    pub fn sink(reason: impl Into<String>) -> Self {
        Self::Sink {
            reason: reason.into(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::ManifestParse { .. }
            | Self::Configuration { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::SegmentFetch { retryable, .. } => *retryable,
            _ => true,
        }
    }

    /// The short category string surfaced to users on a terminal transition.
    pub fn terminal_status_text(&self) -> String {
        match self {
            Self::Cancelled => "Cancelled".to_string(),
            other => format!("Failed: {other}"),
        }
    }
}

pub type Result<T, E = DownloadError> = std::result::Result<T, E>;
