//! Task registry: the single owner of all mutable cross-task state.
//!
//! Every operation is one synchronous critical section behind a single lock,
//! so compound moves (dequeue-and-activate, terminal commits) are atomic with
//! respect to each other. Operating on an unknown id is a defensive no-op —
//! it returns `false`/`None` and never raises.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RegistryConfig;
use crate::task::{DownloadTask, ProgressDelta, TaskId, TaskMetadata, TaskProgress, TaskStatus};

/// Registration request for [`TaskRegistry::register_download`].
#[derive(Debug, Clone, Default)]
pub struct NewDownload {
    /// Caller-chosen id; a fresh one is minted when absent.
    pub id: Option<TaskId>,
    pub metadata: TaskMetadata,
}

/// Read-only projection of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub status: TaskStatus,
    pub title: Option<String>,
    pub url: String,
    pub progress: TaskProgress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskView {
    fn of(task: &DownloadTask) -> Self {
        Self {
            id: task.id.clone(),
            status: task.status,
            title: task.metadata.title.clone(),
            url: task.metadata.url.clone(),
            progress: task.progress.clone(),
            created_at: task.created_at,
            started_at: task.started_at,
            finished_at: task.finished_at,
        }
    }
}

/// Point-in-time view over the whole registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub queued: Vec<TaskView>,
    pub active: Vec<TaskView>,
    pub recent_terminal: Vec<TaskView>,
}

#[derive(Default)]
struct RegistryInner {
    tasks: HashMap<TaskId, DownloadTask>,
    /// Exactly the Queued task ids, in registration order.
    queue: VecDeque<TaskId>,
    external_ids: HashMap<String, TaskId>,
    aliases: HashMap<String, TaskId>,
}

pub struct TaskRegistry {
    inner: RwLock<RegistryInner>,
    config: RegistryConfig,
}

impl TaskRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            config,
        }
    }

    /// Registers a download, minting an id when none is given.
    /// Re-registering an existing id merges metadata without duplicating the
    /// task or its queue entry.
    pub fn register_download(&self, new: NewDownload) -> TaskId {
        let mut inner = self.inner.write();
        let id = new.id.unwrap_or_default();
        if let Some(existing) = inner.tasks.get_mut(&id) {
            existing.metadata.merge_from(new.metadata);
            debug!(task_id = %id, "re-registration merged into existing task");
            return id;
        }
        let task = DownloadTask::new(id.clone(), new.metadata);
        inner.queue.push_back(id.clone());
        inner.tasks.insert(id.clone(), task);
        debug!(task_id = %id, "task registered");
        id
    }

    /// Transitions a Queued task to Active, attaching its cancellation
    /// handle. Returns false for unknown ids or tasks not currently Queued.
    pub fn mark_active(&self, id: &TaskId, cancellation: CancellationToken) -> bool {
        let mut inner = self.inner.write();
        Self::mark_active_locked(&mut inner, id, cancellation)
    }

    fn mark_active_locked(
        inner: &mut RegistryInner,
        id: &TaskId,
        cancellation: CancellationToken,
    ) -> bool {
        let Some(task) = inner.tasks.get_mut(id) else {
            warn!(task_id = %id, "mark_active on unknown task ignored");
            return false;
        };
        if task.status != TaskStatus::Queued {
            return false;
        }
        task.status = TaskStatus::Active;
        task.cancellation = Some(cancellation);
        task.started_at = Some(Utc::now());
        task.progress.status_text = "Starting".to_string();
        inner.queue.retain(|queued| queued != id);
        true
    }

    /// Atomic admission step: when the active count is below the bound,
    /// dequeues the oldest Queued task and activates it in the same critical
    /// section.
    pub fn activate_next(
        &self,
        max_concurrent: usize,
        cancellation: CancellationToken,
    ) -> Option<TaskId> {
        let mut inner = self.inner.write();
        let active = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Active)
            .count();
        if active >= max_concurrent {
            return None;
        }
        let id = inner.queue.front()?.clone();
        Self::mark_active_locked(&mut inner, &id, cancellation).then_some(id)
    }

    /// Merges a progress delta. Numeric fields never regress; text fields
    /// replace verbatim when present. Returns the merged progress, or None
    /// for unknown or already-terminal tasks.
    pub fn update_progress(&self, id: &TaskId, delta: ProgressDelta) -> Option<TaskProgress> {
        let mut inner = self.inner.write();
        let task = inner.tasks.get_mut(id)?;
        if task.status.is_terminal() {
            return None;
        }
        let progress = &mut task.progress;
        if let Some(downloaded) = delta.downloaded {
            progress.downloaded = progress.downloaded.max(downloaded);
        }
        if let Some(total) = delta.total {
            progress.total = progress.total.max(total);
        }
        if let Some(percentage) = delta.percentage {
            progress.percentage = progress.percentage.max(percentage.clamp(0.0, 100.0));
        }
        if let Some(speed) = delta.speed {
            progress.speed = Some(speed);
        }
        if let Some(status_text) = delta.status_text {
            progress.status_text = status_text;
        }
        if let Some(awaiting) = delta.awaiting_user_interaction {
            progress.awaiting_user_interaction = awaiting;
        }
        Some(progress.clone())
    }

    pub fn mark_completed(&self, id: &TaskId) -> bool {
        self.terminal_transition(id, TaskStatus::Completed, |progress| {
            progress.percentage = 100.0;
            progress.status_text = "Completed".to_string();
        })
    }

    pub fn mark_failed(&self, id: &TaskId, cause: &str) -> bool {
        let status_text = format!("Failed: {cause}");
        self.terminal_transition(id, TaskStatus::Failed, |progress| {
            progress.status_text = status_text;
        })
    }

    pub fn mark_cancelled(&self, id: &TaskId) -> bool {
        self.terminal_transition(id, TaskStatus::Cancelled, |progress| {
            progress.status_text = "Cancelled".to_string();
        })
    }

    /// Commits a terminal transition exactly once. A second terminal call on
    /// the same task is a no-op returning false, which is what guards the
    /// completion/cancellation race.
    fn terminal_transition(
        &self,
        id: &TaskId,
        status: TaskStatus,
        apply: impl FnOnce(&mut TaskProgress),
    ) -> bool {
        let mut inner = self.inner.write();
        let Some(task) = inner.tasks.get_mut(id) else {
            warn!(task_id = %id, ?status, "terminal transition on unknown task ignored");
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        task.status = status;
        task.finished_at = Some(Utc::now());
        task.progress.awaiting_user_interaction = false;
        task.merge_request_id = None;
        apply(&mut task.progress);
        inner.queue.retain(|queued| queued != id);
        debug!(task_id = %id, ?status, "task reached terminal state");
        true
    }

    /// Evicts the task and every external-id/alias mapping referencing it.
    pub fn remove(&self, id: &TaskId) {
        let mut inner = self.inner.write();
        inner.tasks.remove(id);
        inner.queue.retain(|queued| queued != id);
        inner.external_ids.retain(|_, mapped| mapped != id);
        inner.aliases.retain(|_, mapped| mapped != id);
    }

    /// Removes terminal tasks whose linger window has elapsed.
    pub fn evict_expired(&self) -> Vec<TaskId> {
        let linger = chrono::Duration::from_std(self.config.linger)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let now = Utc::now();
        let mut inner = self.inner.write();
        let expired: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status.is_terminal()
                    && t.finished_at.is_some_and(|finished| now - finished >= linger)
            })
            .map(|t| t.id.clone())
            .collect();
        for id in &expired {
            inner.tasks.remove(id);
            inner.queue.retain(|queued| queued != id);
            inner.external_ids.retain(|_, mapped| mapped != id);
            inner.aliases.retain(|_, mapped| mapped != id);
            debug!(task_id = %id, "terminal task evicted after linger window");
        }
        expired
    }

    /// Correlates a downstream subsystem's identifier with this task.
    pub fn attach_external_id(&self, id: &TaskId, external_id: impl Into<String>) -> bool {
        let mut inner = self.inner.write();
        if !inner.tasks.contains_key(id) {
            return false;
        }
        let external_id = external_id.into();
        inner.external_ids.insert(external_id.clone(), id.clone());
        if let Some(task) = inner.tasks.get_mut(id) {
            task.external_ids.insert(external_id);
        }
        true
    }

    pub fn id_for_external_id(&self, external_id: &str) -> Option<TaskId> {
        self.inner.read().external_ids.get(external_id).cloned()
    }

    /// Reconciles a client-issued placeholder id with the authoritative id.
    pub fn attach_alias(&self, id: &TaskId, alias: impl Into<String>) -> bool {
        let mut inner = self.inner.write();
        if !inner.tasks.contains_key(id) {
            return false;
        }
        let alias = alias.into();
        inner.aliases.insert(alias.clone(), id.clone());
        if let Some(task) = inner.tasks.get_mut(id) {
            task.aliases.insert(alias);
        }
        true
    }

    pub fn id_for_alias(&self, alias: &str) -> Option<TaskId> {
        self.inner.read().aliases.get(alias).cloned()
    }

    /// Resolves any caller-facing reference: task id, external id, or alias.
    pub fn resolve(&self, reference: &str) -> Option<TaskId> {
        let inner = self.inner.read();
        let as_id = TaskId::from(reference);
        if inner.tasks.contains_key(&as_id) {
            return Some(as_id);
        }
        inner
            .external_ids
            .get(reference)
            .or_else(|| inner.aliases.get(reference))
            .cloned()
    }

    pub fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.inner.read().tasks.get(id).map(|t| t.status)
    }

    pub fn metadata_of(&self, id: &TaskId) -> Option<TaskMetadata> {
        self.inner.read().tasks.get(id).map(|t| t.metadata.clone())
    }

    pub fn view_of(&self, id: &TaskId) -> Option<TaskView> {
        self.inner.read().tasks.get(id).map(TaskView::of)
    }

    pub fn display_name_of(&self, id: &TaskId) -> Option<String> {
        self.inner.read().tasks.get(id).map(|t| t.display_name())
    }

    pub fn cancellation_token(&self, id: &TaskId) -> Option<CancellationToken> {
        self.inner.read().tasks.get(id).and_then(|t| t.cancellation.clone())
    }

    pub fn set_merge_request(&self, id: &TaskId, request_id: Option<String>) {
        if let Some(task) = self.inner.write().tasks.get_mut(id) {
            task.merge_request_id = request_id;
        }
    }

    pub fn merge_request_id(&self, id: &TaskId) -> Option<String> {
        self.inner.read().tasks.get(id).and_then(|t| t.merge_request_id.clone())
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .read()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Active)
            .count()
    }

    /// Queued task ids in registration order.
    pub fn queued_entries(&self) -> Vec<TaskId> {
        self.inner.read().queue.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read();
        let queued = inner
            .queue
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .map(TaskView::of)
            .collect();
        let mut active: Vec<TaskView> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Active)
            .map(TaskView::of)
            .collect();
        active.sort_by_key(|v| v.started_at);
        let mut recent_terminal: Vec<TaskView> = inner
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(TaskView::of)
            .collect();
        recent_terminal.sort_by_key(|v| v.finished_at);
        RegistrySnapshot {
            queued,
            active,
            recent_terminal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TaskRegistry {
        TaskRegistry::new(RegistryConfig::default())
    }

    fn enqueue(reg: &TaskRegistry, url: &str) -> TaskId {
        reg.register_download(NewDownload {
            id: None,
            metadata: TaskMetadata {
                url: url.to_string(),
                ..Default::default()
            },
        })
    }

    #[test]
    fn test_register_appends_to_queue_in_order() {
        let reg = registry();
        let a = enqueue(&reg, "https://a");
        let b = enqueue(&reg, "https://b");
        assert_eq!(reg.queued_entries(), vec![a, b]);
    }

    #[test]
    fn test_reregistration_merges_without_duplicating() {
        let reg = registry();
        let id = enqueue(&reg, "https://a");
        let merged = reg.register_download(NewDownload {
            id: Some(id.clone()),
            metadata: TaskMetadata {
                title: Some("Title".to_string()),
                ..Default::default()
            },
        });
        assert_eq!(merged, id);
        assert_eq!(reg.queued_entries().len(), 1);
        let view = reg.view_of(&id).unwrap();
        assert_eq!(view.title.as_deref(), Some("Title"));
        assert_eq!(view.url, "https://a");
    }

    #[test]
    fn test_active_count_never_exceeds_bound() {
        let reg = registry();
        for i in 0..5 {
            enqueue(&reg, &format!("https://t{i}"));
        }
        let mut activated = Vec::new();
        while let Some(id) = reg.activate_next(3, CancellationToken::new()) {
            activated.push(id);
            assert!(reg.active_count() <= 3);
        }
        assert_eq!(activated.len(), 3);
        assert_eq!(reg.queued_entries().len(), 2);
    }

    #[test]
    fn test_promotion_follows_registration_order() {
        let reg = registry();
        let ids: Vec<TaskId> = (0..5).map(|i| enqueue(&reg, &format!("https://t{i}"))).collect();
        let mut order = Vec::new();
        while let Some(id) = reg.activate_next(3, CancellationToken::new()) {
            order.push(id);
        }
        assert_eq!(order, ids[..3].to_vec());

        assert!(reg.mark_completed(&ids[0]));
        let promoted = reg.activate_next(3, CancellationToken::new()).unwrap();
        assert_eq!(promoted, ids[3]);
    }

    #[test]
    fn test_mark_active_unknown_is_noop() {
        let reg = registry();
        assert!(!reg.mark_active(&TaskId::from("nope"), CancellationToken::new()));
    }

    #[test]
    fn test_terminal_transitions_idempotent() {
        let reg = registry();
        let id = enqueue(&reg, "https://a");
        reg.mark_active(&id, CancellationToken::new());
        assert!(reg.mark_completed(&id));
        assert!(!reg.mark_completed(&id));
        assert!(!reg.mark_cancelled(&id));
        assert!(!reg.mark_failed(&id, "late"));
        assert_eq!(reg.status_of(&id), Some(TaskStatus::Completed));
        assert_eq!(reg.view_of(&id).unwrap().progress.status_text, "Completed");
    }

    #[test]
    fn test_cancel_races_commit_once() {
        let reg = registry();
        let id = enqueue(&reg, "https://a");
        reg.mark_active(&id, CancellationToken::new());
        assert!(reg.mark_cancelled(&id));
        assert!(!reg.mark_completed(&id));
        assert_eq!(reg.status_of(&id), Some(TaskStatus::Cancelled));
        assert_eq!(reg.view_of(&id).unwrap().progress.status_text, "Cancelled");
    }

    #[test]
    fn test_progress_never_regresses() {
        let reg = registry();
        let id = enqueue(&reg, "https://a");
        reg.update_progress(
            &id,
            ProgressDelta {
                downloaded: Some(500),
                total: Some(1000),
                percentage: Some(50.0),
                ..Default::default()
            },
        );
        let merged = reg
            .update_progress(
                &id,
                ProgressDelta {
                    downloaded: Some(300),
                    percentage: Some(20.0),
                    speed: Some("1.2 MB/s".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(merged.downloaded, 500);
        assert_eq!(merged.percentage, 50.0);
        assert_eq!(merged.speed.as_deref(), Some("1.2 MB/s"));
    }

    #[test]
    fn test_alias_and_external_id_resolution() {
        let reg = registry();
        let id = enqueue(&reg, "https://a");
        assert!(reg.attach_alias(&id, "placeholder-7"));
        assert!(reg.attach_external_id(&id, "sink-42"));
        assert_eq!(reg.resolve("placeholder-7"), Some(id.clone()));
        assert_eq!(reg.resolve("sink-42"), Some(id.clone()));
        assert_eq!(reg.resolve(id.as_str()), Some(id.clone()));
        assert_eq!(reg.resolve("unknown"), None);

        reg.remove(&id);
        assert_eq!(reg.resolve("placeholder-7"), None);
        assert_eq!(reg.id_for_external_id("sink-42"), None);
    }

    #[test]
    fn test_snapshot_partitions() {
        let reg = registry();
        let a = enqueue(&reg, "https://a");
        let b = enqueue(&reg, "https://b");
        let _c = enqueue(&reg, "https://c");
        reg.mark_active(&a, CancellationToken::new());
        reg.mark_active(&b, CancellationToken::new());
        reg.mark_failed(&b, "boom");

        let snapshot = reg.snapshot();
        assert_eq!(snapshot.queued.len(), 1);
        assert_eq!(snapshot.active.len(), 1);
        assert_eq!(snapshot.recent_terminal.len(), 1);
        assert_eq!(
            snapshot.recent_terminal[0].progress.status_text,
            "Failed: boom"
        );
    }

    #[test]
    fn test_evict_expired_only_after_linger() {
        let reg = TaskRegistry::new(RegistryConfig {
            linger: std::time::Duration::from_secs(0),
        });
        let id = enqueue(&reg, "https://a");
        assert!(reg.evict_expired().is_empty());
        reg.mark_active(&id, CancellationToken::new());
        reg.mark_completed(&id);
        let evicted = reg.evict_expired();
        assert_eq!(evicted, vec![id.clone()]);
        assert!(reg.view_of(&id).is_none());
    }
}
