//! Segment batch fetcher: downloads an ordered segment list in bounded
//! concurrent waves, writing each payload to the blob store.
//!
//! A wave completes only once every member resolves; a single segment's
//! failure is recorded and its index is simply absent from the output. The
//! cancellation token is checked before each wave and raced against the wave
//! itself, so cancellation mid-wave abandons the remaining in-flight fetches.

use std::sync::Arc;
use std::time::Duration;

use adaptive::{ByteRange, MimeKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::collab::BlobStore;
use crate::config::FetcherConfig;
use crate::error::{DownloadError, Result};
use crate::task::TaskId;

/// Which elementary track a segment belongs to in a separate-track plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackKind {
    Video,
    Audio,
}

/// One segment to fetch. `index` is the global position within the plan and
/// determines output order.
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    pub index: usize,
    pub url: Url,
    pub kind: TrackKind,
    pub is_init: bool,
    pub mime: MimeKind,
    pub sequence_number: u64,
    pub discontinuity_sequence: u64,
    pub duration: f64,
    pub byte_range: Option<ByteRange>,
}

/// A fetched segment, stored under `key` in the blob store.
#[derive(Debug, Clone, Serialize)]
pub struct StoredSegment {
    pub key: String,
    pub index: usize,
    pub kind: TrackKind,
    pub is_init: bool,
    pub mime: MimeKind,
    pub sequence_number: u64,
    pub discontinuity_sequence: u64,
    pub duration: f64,
    pub size: u64,
}

/// Blob-store key for one fetched segment.
pub fn segment_key(task_id: &TaskId, index: usize) -> String {
    format!("segments/{task_id}/{index:05}")
}

/// Key prefix covering every segment stored for a task; deleting it is the
/// task's cleanup obligation.
pub fn segment_prefix(task_id: &TaskId) -> String {
    format!("segments/{task_id}/")
}

/// An ordered batch of segments to fetch for one task, with the progress
/// sub-range the batch occupies.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub task_id: TaskId,
    pub segments: Vec<SegmentRequest>,
    pub progress_lo: f64,
    pub progress_hi: f64,
    pub password: Option<String>,
}

/// Progress emitted after each completed wave.
#[derive(Debug, Clone, Copy)]
pub struct WaveProgress {
    pub percentage: f64,
    pub processed: usize,
    pub total: usize,
    pub failed: usize,
    pub downloaded_bytes: u64,
}

/// Network transport for manifests and segments. The engine's seam for
/// tests: the HTTP implementation lives here, mocks live with the tests.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Fetches a manifest-candidate URL. `body` is None when the response is
    /// clearly a media payload rather than manifest text.
    async fn fetch_manifest(
        &self,
        url: &Url,
        password: Option<&str>,
    ) -> Result<ManifestResponse>;

    /// Fetches one segment's raw bytes.
    async fn fetch_segment(
        &self,
        request: &SegmentRequest,
        password: Option<&str>,
    ) -> Result<Bytes>;
}

/// Response to a manifest probe.
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    pub body: Option<String>,
    pub content_type: Option<String>,
    /// URL after redirects; relative segment URIs resolve against this.
    pub final_url: Url,
}

/// reqwest-backed [`RemoteFetcher`] with per-segment retry and backoff.
pub struct HttpFetcher {
    client: Client,
    config: FetcherConfig,
}

impl HttpFetcher {
    pub fn new(client: Client, config: FetcherConfig) -> Self {
        Self { client, config }
    }

    fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        password: Option<&str>,
    ) -> reqwest::RequestBuilder {
        match password {
            Some(password) => builder.bearer_auth(password),
            None => builder,
        }
    }

    /// Retries on network errors and server errors; client errors (4xx) are
    /// final immediately.
    async fn fetch_with_retries(
        &self,
        request: &SegmentRequest,
        password: Option<&str>,
    ) -> Result<Bytes> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let mut builder = self
                .client
                .get(request.url.clone())
                .timeout(self.config.segment_timeout);
            builder = self.authorize(builder, password);
            if let Some(range) = &request.byte_range {
                let offset = range.offset.unwrap_or(0);
                builder = builder.header(
                    reqwest::header::RANGE,
                    format!("bytes={}-{}", offset, offset + range.length.saturating_sub(1)),
                );
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .bytes()
                            .await
                            .map_err(DownloadError::from);
                    }
                    if status.is_client_error() {
                        return Err(DownloadError::segment_fetch(
                            format!("client error {status} for segment {}", request.url),
                            false,
                        ));
                    }
                    if attempts > self.config.max_segment_retries {
                        return Err(DownloadError::segment_fetch(
                            format!(
                                "max retries ({}) exceeded for segment {}, last status {status}",
                                self.config.max_segment_retries, request.url
                            ),
                            true,
                        ));
                    }
                }
                Err(e) => {
                    if !e.is_connect() && !e.is_timeout() && !e.is_request() {
                        return Err(DownloadError::from(e));
                    }
                    if attempts > self.config.max_segment_retries {
                        return Err(DownloadError::segment_fetch(
                            format!(
                                "max retries ({}) exceeded for segment {}: {e}",
                                self.config.max_segment_retries, request.url
                            ),
                            true,
                        ));
                    }
                }
            }

            let delay = self.config.retry_delay_base * 2_u32.pow(attempts.saturating_sub(1));
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch_manifest(
        &self,
        url: &Url,
        password: Option<&str>,
    ) -> Result<ManifestResponse> {
        let builder = self.authorize(self.client.get(url.clone()), password);
        let response = builder.send().await.map_err(|e| {
            DownloadError::manifest_fetch(url.as_str(), e.to_string())
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::manifest_fetch(
                url.as_str(),
                format!("HTTP {status}"),
            ));
        }
        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        // A media payload is not manifest text; let the caller treat the URL
        // as a direct file instead of buffering the whole body here.
        let is_media = content_type.as_deref().is_some_and(|ct| {
            ct.starts_with("video/")
                || ct.starts_with("audio/")
                || ct.starts_with("application/octet-stream")
        });
        if is_media {
            return Ok(ManifestResponse {
                body: None,
                content_type,
                final_url,
            });
        }

        let body = response.text().await.map_err(|e| {
            DownloadError::manifest_fetch(url.as_str(), e.to_string())
        })?;
        Ok(ManifestResponse {
            body: Some(body),
            content_type,
            final_url,
        })
    }

    async fn fetch_segment(
        &self,
        request: &SegmentRequest,
        password: Option<&str>,
    ) -> Result<Bytes> {
        self.fetch_with_retries(request, password).await
    }
}

/// Separate-track fMP4 plans need an init per track; when none was declared,
/// the first segment of each track serves as the init.
pub fn apply_init_fallback(segments: &mut [SegmentRequest]) {
    for kind in [TrackKind::Video, TrackKind::Audio] {
        if segments.iter().any(|s| s.kind == kind && s.is_init) {
            continue;
        }
        if let Some(first) = segments.iter_mut().find(|s| s.kind == kind)
            && first.mime == MimeKind::Fmp4
        {
            first.is_init = true;
        }
    }
}

/// Executes [`FetchPlan`]s in waves of `wave_size` concurrent fetches.
pub struct SegmentBatchFetcher {
    remote: Arc<dyn RemoteFetcher>,
    store: Arc<dyn BlobStore>,
    config: FetcherConfig,
}

impl SegmentBatchFetcher {
    pub fn new(
        remote: Arc<dyn RemoteFetcher>,
        store: Arc<dyn BlobStore>,
        config: FetcherConfig,
    ) -> Self {
        Self {
            remote,
            store,
            config,
        }
    }

    /// Runs the plan to completion or cancellation.
    ///
    /// Output preserves the plan's input order regardless of which concurrent
    /// fetch resolves first; failed segments are absent. The caller owns
    /// cleanup of stored keys on every exit path.
    pub async fn run<F>(
        &self,
        plan: &FetchPlan,
        token: &CancellationToken,
        mut on_progress: F,
    ) -> Result<Vec<StoredSegment>>
    where
        F: FnMut(WaveProgress),
    {
        let total = plan.segments.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let wave_size = self.config.wave_size.max(1);
        let mut stored: Vec<Option<StoredSegment>> = vec![None; total];
        let mut processed = 0usize;
        let mut failed = 0usize;
        let mut downloaded_bytes = 0u64;
        let wave_count = total.div_ceil(wave_size);

        for (wave_index, wave) in plan.segments.chunks(wave_size).enumerate() {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let fetches = wave.iter().map(|request| {
                let remote = Arc::clone(&self.remote);
                let store = Arc::clone(&self.store);
                let key = segment_key(&plan.task_id, request.index);
                let password = plan.password.clone();
                async move {
                    let bytes = remote.fetch_segment(request, password.as_deref()).await?;
                    let size = bytes.len() as u64;
                    store.put(&key, bytes).await?;
                    Ok::<StoredSegment, DownloadError>(StoredSegment {
                        key,
                        index: request.index,
                        kind: request.kind,
                        is_init: request.is_init,
                        mime: request.mime,
                        sequence_number: request.sequence_number,
                        discontinuity_sequence: request.discontinuity_sequence,
                        duration: request.duration,
                        size,
                    })
                }
            });

            // Racing the whole wave against the token abandons in-flight
            // fetches on cancellation.
            let results = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                results = join_all(fetches) => results,
            };

            for (request, result) in wave.iter().zip(results) {
                processed += 1;
                match result {
                    Ok(segment) => {
                        downloaded_bytes += segment.size;
                        trace!(
                            task_id = %plan.task_id,
                            index = segment.index,
                            size = segment.size,
                            "segment stored"
                        );
                        if let Some(slot) = stored.get_mut(segment.index) {
                            *slot = Some(segment);
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        warn!(
                            task_id = %plan.task_id,
                            index = request.index,
                            url = %request.url,
                            error = %e,
                            "segment fetch failed; continuing without it"
                        );
                    }
                }
            }

            let span = plan.progress_hi - plan.progress_lo;
            on_progress(WaveProgress {
                percentage: plan.progress_lo + (processed as f64 / total as f64) * span,
                processed,
                total,
                failed,
                downloaded_bytes,
            });

            if wave_index + 1 < wave_count && self.config.inter_wave_pause > Duration::ZERO {
                tokio::time::sleep(self.config.inter_wave_pause).await;
            }
        }

        debug!(
            task_id = %plan.task_id,
            total,
            failed,
            downloaded_bytes,
            "segment batch complete"
        );
        Ok(stored.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::MemoryBlobStore;
    use crate::config::FetcherConfig;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock transport: payloads derived from the index, an optional failure
    /// set, and per-index delays to scramble completion order.
    struct MockRemote {
        fail: Vec<usize>,
        delays_ms: HashMap<usize, u64>,
        calls: AtomicUsize,
    }

    impl MockRemote {
        fn new() -> Self {
            Self {
                fail: Vec::new(),
                delays_ms: HashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteFetcher for MockRemote {
        async fn fetch_manifest(
            &self,
            url: &Url,
            _password: Option<&str>,
        ) -> Result<ManifestResponse> {
            Ok(ManifestResponse {
                body: Some(String::new()),
                content_type: None,
                final_url: url.clone(),
            })
        }

        async fn fetch_segment(
            &self,
            request: &SegmentRequest,
            _password: Option<&str>,
        ) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delays_ms.get(&request.index) {
                tokio::time::sleep(Duration::from_millis(*delay)).await;
            }
            if self.fail.contains(&request.index) {
                return Err(DownloadError::segment_fetch("injected failure", false));
            }
            Ok(Bytes::from(format!("payload-{}", request.index)))
        }
    }

    fn request(index: usize) -> SegmentRequest {
        SegmentRequest {
            index,
            url: Url::parse(&format!("https://cdn.example.com/seg{index}.ts")).unwrap(),
            kind: TrackKind::Video,
            is_init: false,
            mime: MimeKind::MpegTs,
            sequence_number: index as u64,
            discontinuity_sequence: 0,
            duration: 4.0,
            byte_range: None,
        }
    }

    fn plan(task: &str, count: usize) -> FetchPlan {
        FetchPlan {
            task_id: TaskId::from(task),
            segments: (0..count).map(request).collect(),
            progress_lo: 0.0,
            progress_hi: 100.0,
            password: None,
        }
    }

    fn fetcher(remote: MockRemote) -> (SegmentBatchFetcher, Arc<MemoryBlobStore>) {
        let store = Arc::new(MemoryBlobStore::new());
        let config = FetcherConfig {
            wave_size: 4,
            inter_wave_pause: Duration::from_millis(1),
            ..Default::default()
        };
        (
            SegmentBatchFetcher::new(Arc::new(remote), store.clone(), config),
            store,
        )
    }

    #[tokio::test]
    async fn test_output_preserves_input_order() {
        let mut remote = MockRemote::new();
        // Earlier indices resolve last within their wave.
        remote.delays_ms = HashMap::from([(0, 30), (1, 20), (2, 10), (3, 1)]);
        let (fetcher, _store) = fetcher(remote);
        let plan = plan("order", 10);
        let token = CancellationToken::new();
        let stored = fetcher.run(&plan, &token, |_| {}).await.unwrap();
        let indices: Vec<usize> = stored.iter().map(|s| s.index).collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_single_failure_is_dropped_not_fatal() {
        let mut remote = MockRemote::new();
        remote.fail = vec![2];
        let (fetcher, store) = fetcher(remote);
        let plan = plan("partial", 4);
        let token = CancellationToken::new();
        let mut last = None;
        let stored = fetcher
            .run(&plan, &token, |progress| last = Some(progress))
            .await
            .unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|s| s.index != 2));
        assert_eq!(store.len(), 3);
        let last = last.unwrap();
        assert_eq!(last.failed, 1);
        assert_eq!(last.processed, 4);
    }

    #[tokio::test]
    async fn test_cancellation_before_wave() {
        let remote = MockRemote::new();
        let (fetcher, store) = fetcher(remote);
        let plan = plan("cancelled", 4);
        let token = CancellationToken::new();
        token.cancel();
        let result = fetcher.run(&plan, &token, |_| {}).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_mid_run_stops_following_waves() {
        let mut remote = MockRemote::new();
        remote.delays_ms = (0..12).map(|i| (i, 5)).collect();
        let (fetcher, _store) = fetcher(remote);
        let plan = plan("midway", 12);
        let token = CancellationToken::new();
        let cancel_after_first_wave = token.clone();
        let result = fetcher
            .run(&plan, &token, move |progress| {
                if progress.processed >= 4 {
                    cancel_after_first_wave.cancel();
                }
            })
            .await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }

    #[tokio::test]
    async fn test_progress_scaled_into_subrange() {
        let remote = MockRemote::new();
        let (fetcher, _store) = fetcher(remote);
        let plan = FetchPlan {
            progress_lo: 10.0,
            progress_hi: 90.0,
            ..plan("scaled", 8)
        };
        let token = CancellationToken::new();
        let mut seen = Vec::new();
        fetcher
            .run(&plan, &token, |progress| seen.push(progress.percentage))
            .await
            .unwrap();
        assert_eq!(seen.len(), 2);
        assert!((seen[0] - 50.0).abs() < 1e-9);
        assert!((seen[1] - 90.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_plan() {
        let remote = MockRemote::new();
        let (fetcher, _store) = fetcher(remote);
        let plan = plan("empty", 0);
        let token = CancellationToken::new();
        let stored = fetcher.run(&plan, &token, |_| {}).await.unwrap();
        assert!(stored.is_empty());
    }

    #[test]
    fn test_init_fallback_per_track() {
        let mut segments: Vec<SegmentRequest> = (0..4)
            .map(|i| SegmentRequest {
                kind: if i < 2 { TrackKind::Video } else { TrackKind::Audio },
                mime: MimeKind::Fmp4,
                ..request(i)
            })
            .collect();
        apply_init_fallback(&mut segments);
        assert!(segments[0].is_init);
        assert!(!segments[1].is_init);
        assert!(segments[2].is_init);
        assert!(!segments[3].is_init);

        // Explicit init suppresses the fallback.
        let mut explicit: Vec<SegmentRequest> = (0..3)
            .map(|i| SegmentRequest {
                mime: MimeKind::Fmp4,
                is_init: i == 1,
                ..request(i)
            })
            .collect();
        apply_init_fallback(&mut explicit);
        assert!(!explicit[0].is_init);
        assert!(explicit[1].is_init);

        // Transport streams need no init.
        let mut ts: Vec<SegmentRequest> = (0..2).map(request).collect();
        apply_init_fallback(&mut ts);
        assert!(ts.iter().all(|s| !s.is_init));
    }
}
