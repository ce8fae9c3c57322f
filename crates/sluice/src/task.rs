//! Download task model: ids, lifecycle states, metadata, progress.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Stable, unique task identifier. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Mints a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Task lifecycle state. Transitions are monotonic:
/// `Queued -> Active -> {Completed | Failed | Cancelled}`, never reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Origin quality of a source URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    Raw,
    Transcoded,
}

/// Preference order between alternative source URLs for the same title.
/// Undocumented upstream policy preserved as-is: raw preferred, transcoded
/// fallback.
pub const SOURCE_KIND_PREFERENCE: [SourceKind; 2] = [SourceKind::Raw, SourceKind::Transcoded];

/// One candidate source URL for a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub url: String,
    pub kind: SourceKind,
}

/// Caller-supplied description of what to download.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub url: String,
    pub title: Option<String>,
    /// Stored and forwarded verbatim; never interpreted by the engine.
    pub password: Option<String>,
    /// Alternative source URLs, consulted in [`SOURCE_KIND_PREFERENCE`] order.
    pub sources: Vec<SourceCandidate>,
}

impl TaskMetadata {
    /// The URL the task should actually fetch, honoring the source-kind
    /// preference order; falls back to the primary url.
    pub fn preferred_source(&self) -> &str {
        for kind in SOURCE_KIND_PREFERENCE {
            if let Some(candidate) = self.sources.iter().find(|s| s.kind == kind) {
                return &candidate.url;
            }
        }
        &self.url
    }

    /// Merges fields from a re-registration; present fields win, absent ones
    /// keep their current value.
    pub fn merge_from(&mut self, other: TaskMetadata) {
        if !other.url.is_empty() {
            self.url = other.url;
        }
        if other.title.is_some() {
            self.title = other.title;
        }
        if other.password.is_some() {
            self.password = other.password;
        }
        if !other.sources.is_empty() {
            self.sources = other.sources;
        }
    }
}

/// Observable progress of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub downloaded: u64,
    pub total: u64,
    pub percentage: f64,
    pub speed: Option<String>,
    pub status_text: String,
    pub awaiting_user_interaction: bool,
}

/// Partial progress update. Numeric fields merge as running maxima so
/// progress never regresses; text fields replace verbatim when present.
#[derive(Debug, Clone, Default)]
pub struct ProgressDelta {
    pub downloaded: Option<u64>,
    pub total: Option<u64>,
    pub percentage: Option<f64>,
    pub speed: Option<String>,
    pub status_text: Option<String>,
    pub awaiting_user_interaction: Option<bool>,
}

impl ProgressDelta {
    pub fn status(text: impl Into<String>) -> Self {
        Self {
            status_text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn percentage(value: f64) -> Self {
        Self {
            percentage: Some(value),
            ..Default::default()
        }
    }
}

/// One end-to-end download-and-merge request tracked by the registry.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub id: TaskId,
    pub status: TaskStatus,
    pub metadata: TaskMetadata,
    pub progress: TaskProgress,
    /// Attached when the task becomes Active.
    pub cancellation: Option<CancellationToken>,
    /// Outstanding merge request for the current attempt, if any.
    pub merge_request_id: Option<String>,
    /// Downstream subsystem identifiers correlated back to this task.
    pub external_ids: HashSet<String>,
    /// Client-issued placeholder ids reconciled to this task.
    pub aliases: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    pub fn new(id: TaskId, metadata: TaskMetadata) -> Self {
        Self {
            id,
            status: TaskStatus::Queued,
            metadata,
            progress: TaskProgress {
                status_text: "Queued".to_string(),
                ..Default::default()
            },
            cancellation: None,
            merge_request_id: None,
            external_ids: HashSet::new(),
            aliases: HashSet::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Output filename for this task: the title when given, otherwise the
    /// final path component of the source URL, stripped of query noise.
    pub fn display_name(&self) -> String {
        if let Some(title) = &self.metadata.title
            && !title.is_empty()
        {
            return title.clone();
        }
        let url = self.metadata.preferred_source();
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let stem = path.rsplit('/').next().unwrap_or(path);
        if stem.is_empty() {
            "download".to_string()
        } else {
            stem.to_string()
        }
    }
}
