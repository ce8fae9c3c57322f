//! External collaborator interfaces.
//!
//! Everything outside the download core is reached through a typed trait:
//! the merge engine, the temporary blob store, the final download sink, and
//! the progress notification channel. Messages that expect a reply return a
//! `Result`; fire-and-forget messages return nothing.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;

use crate::error::{DownloadError, Result};
use crate::fetch::StoredSegment;
use crate::task::TaskId;

/// Merge request handed to the merge collaborator: the ordered, tagged
/// segment set plus duration/codec hints.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    /// Per-attempt request id; cancellation messages are keyed by it.
    pub request_id: String,
    pub task_id: TaskId,
    pub output_name: String,
    /// Ordered segment refs, init segments ahead of their media segments.
    pub segments: Vec<StoredSegment>,
    pub duration_hint: Option<f64>,
    pub video_codecs: Option<String>,
    pub audio_codecs: Option<String>,
}

/// Successful merge response.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Blob-store key of the merged output.
    pub output_key: String,
}

/// The container muxing/transcoding collaborator.
#[async_trait]
pub trait MergeService: Send + Sync {
    /// Merges the segment set; awaits the collaborator's reply.
    async fn merge(&self, request: MergeRequest) -> Result<MergeOutcome>;

    /// Requests cancellation of an outstanding merge. Fire-and-forget: a
    /// request id that is unknown or already finished is ignored.
    async fn cancel(&self, request_id: &str);
}

/// Temporary key/bytes storage for fetched segments and merge output.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Deletes every key under a prefix, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// In-memory [`BlobStore`].
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    entries: DashMap<String, Bytes>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.entries.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        let removed = doomed.len();
        for key in doomed {
            self.entries.remove(&key);
        }
        Ok(removed)
    }
}

/// Receipt from the download sink.
#[derive(Debug, Clone)]
pub struct SinkReceipt {
    /// Sink-assigned identifier, correlated back to the task via
    /// `attach_external_id`.
    pub external_id: String,
}

/// Final delivery target for the merged output stream.
#[async_trait]
pub trait DownloadSink: Send + Sync {
    async fn deliver(&self, filename: &str, data: Bytes) -> Result<SinkReceipt>;
}

/// One progress notification. Fire-and-forget.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub filename: String,
    pub downloaded: u64,
    pub total: u64,
    pub percentage: f64,
    pub status: String,
    pub awaiting_user_interaction: bool,
}

/// Progress notification channel.
pub trait ProgressNotifier: Send + Sync {
    fn notify(&self, event: ProgressEvent);
}

/// Notifier that drops every event.
pub struct NullNotifier;

impl ProgressNotifier for NullNotifier {
    fn notify(&self, _event: ProgressEvent) {}
}

/// Merge service that concatenates segment payloads in order. Stands in when
/// no real muxing collaborator is wired up; produces valid output only for
/// self-contained formats such as MPEG-TS.
pub struct ConcatMergeService {
    store: Arc<dyn BlobStore>,
}

impl ConcatMergeService {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MergeService for ConcatMergeService {
    async fn merge(&self, request: MergeRequest) -> Result<MergeOutcome> {
        let mut merged = Vec::new();
        for segment in &request.segments {
            let data = self.store.get(&segment.key).await?.ok_or_else(|| {
                DownloadError::merge(format!("segment payload missing: {}", segment.key))
            })?;
            merged.extend_from_slice(&data);
        }
        if merged.is_empty() {
            return Err(DownloadError::merge("no segment payloads to merge"));
        }
        let output_key = format!("merged/{}/{}", request.task_id, request.request_id);
        self.store.put(&output_key, Bytes::from(merged)).await?;
        Ok(MergeOutcome { output_key })
    }

    async fn cancel(&self, _request_id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_prefix_delete() {
        let store = MemoryBlobStore::new();
        store.put("segments/a/00000", Bytes::from_static(b"x")).await.unwrap();
        store.put("segments/a/00001", Bytes::from_static(b"y")).await.unwrap();
        store.put("segments/b/00000", Bytes::from_static(b"z")).await.unwrap();

        let removed = store.delete_prefix("segments/a/").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("segments/b/00000").await.unwrap().is_some());
        assert!(store.get("segments/a/00000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concat_merge_preserves_order() {
        use crate::fetch::TrackKind;
        use adaptive::MimeKind;

        let store = Arc::new(MemoryBlobStore::new());
        store.put("k0", Bytes::from_static(b"AA")).await.unwrap();
        store.put("k1", Bytes::from_static(b"BB")).await.unwrap();

        let segment = |index: usize, key: &str| StoredSegment {
            key: key.to_string(),
            index,
            kind: TrackKind::Video,
            is_init: false,
            mime: MimeKind::MpegTs,
            sequence_number: index as u64,
            discontinuity_sequence: 0,
            duration: 2.0,
            size: 2,
        };

        let merge = ConcatMergeService::new(store.clone());
        let outcome = merge
            .merge(MergeRequest {
                request_id: "req-1".to_string(),
                task_id: TaskId::from("t"),
                output_name: "out.ts".to_string(),
                segments: vec![segment(0, "k0"), segment(1, "k1")],
                duration_hint: None,
                video_codecs: None,
                audio_codecs: None,
            })
            .await
            .unwrap();
        let merged = store.get(&outcome.output_key).await.unwrap().unwrap();
        assert_eq!(&merged[..], b"AABB");
    }
}
