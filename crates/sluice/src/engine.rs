//! Download orchestrator.
//!
//! Sequences the per-task flow — manifest fetch, parse, variant/track
//! selection, segment batch fetch, merge handoff, sink delivery — and owns
//! FIFO admission against the concurrency bound. All cross-task state lives
//! in the [`TaskRegistry`]; tasks never mutate it directly.

use std::sync::Arc;
use std::time::Instant;

use adaptive::{
    ManifestDescriptor, MimeKind, parse_dash, parse_hls, select_best_representation,
    select_best_variant, select_preferred_audio_track,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::collab::{
    BlobStore, DownloadSink, MergeRequest, MergeService, ProgressEvent, ProgressNotifier,
};
use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};
use crate::fetch::{
    FetchPlan, HttpFetcher, ManifestResponse, RemoteFetcher, SegmentBatchFetcher, SegmentRequest,
    TrackKind, apply_init_fallback, segment_prefix,
};
use crate::http::create_client;
use crate::registry::{NewDownload, RegistrySnapshot, TaskRegistry};
use crate::task::{ProgressDelta, SourceCandidate, TaskId, TaskMetadata, TaskStatus};

/// Progress milestones: manifest work occupies the head of the bar, segment
/// fetching the middle, merge and delivery the tail.
const PROGRESS_MANIFEST: f64 = 5.0;
const PROGRESS_FETCH_DONE: f64 = 90.0;

/// Request accepted by [`DownloadEngine::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    pub url: String,
    pub title: Option<String>,
    pub password: Option<String>,
    /// Alternative source URLs; consulted in source-kind preference order.
    pub sources: Vec<SourceCandidate>,
    /// Client-issued placeholder id, reconciled to the real id immediately.
    pub alias: Option<String>,
}

/// Stream type detected from the manifest probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamType {
    HlsMaster,
    HlsMedia,
    Dash,
    Direct,
}

/// A fetch plan plus the hints the merge collaborator wants alongside it.
struct PlannedDownload {
    plan: FetchPlan,
    duration_hint: Option<f64>,
    video_codecs: Option<String>,
    audio_codecs: Option<String>,
}

/// External collaborator bundle for constructing the engine.
pub struct Collaborators {
    pub store: Arc<dyn BlobStore>,
    pub merge: Arc<dyn MergeService>,
    pub sink: Arc<dyn DownloadSink>,
    pub notifier: Arc<dyn ProgressNotifier>,
}

pub struct DownloadEngine {
    config: EngineConfig,
    registry: Arc<TaskRegistry>,
    remote: Arc<dyn RemoteFetcher>,
    store: Arc<dyn BlobStore>,
    merge: Arc<dyn MergeService>,
    sink: Arc<dyn DownloadSink>,
    notifier: Arc<dyn ProgressNotifier>,
}

impl DownloadEngine {
    /// Builds an engine backed by a real HTTP client.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        let client = create_client(&config.http)?;
        let remote = Arc::new(HttpFetcher::new(client, config.fetcher.clone()));
        Ok(Self::with_remote(config, remote, collaborators))
    }

    /// Injection point for a custom transport.
    pub fn with_remote(
        config: EngineConfig,
        remote: Arc<dyn RemoteFetcher>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(TaskRegistry::new(config.registry.clone())),
            config,
            remote,
            store: collaborators.store,
            merge: collaborators.merge,
            sink: collaborators.sink,
            notifier: collaborators.notifier,
        })
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Registers a download and runs the admission pump. Excess registrations
    /// wait in FIFO queue order.
    pub fn enqueue(self: &Arc<Self>, request: EnqueueRequest) -> TaskId {
        let metadata = TaskMetadata {
            url: request.url,
            title: request.title,
            password: request.password,
            sources: request.sources,
        };
        let id = self.registry.register_download(NewDownload {
            id: None,
            metadata,
        });
        if let Some(alias) = request.alias {
            self.registry.attach_alias(&id, alias);
        }
        info!(task_id = %id, "download enqueued");
        self.notify(&id);
        self.pump();
        id
    }

    /// Cancels by task id, external id, or alias. Queued tasks cancel in
    /// place; Active tasks are signalled and commit their own terminal state
    /// after cleanup. Unknown references and terminal tasks are no-ops.
    pub async fn cancel(&self, reference: &str) -> bool {
        let Some(id) = self.registry.resolve(reference) else {
            debug!(reference, "cancel for unknown reference ignored");
            return false;
        };
        match self.registry.status_of(&id) {
            Some(TaskStatus::Queued) => {
                if self.registry.mark_cancelled(&id) {
                    let _ = self.store.delete_prefix(&segment_prefix(&id)).await;
                    self.notify(&id);
                    self.schedule_eviction();
                }
                true
            }
            Some(TaskStatus::Active) => {
                info!(task_id = %id, "cancellation requested");
                if let Some(request_id) = self.registry.merge_request_id(&id) {
                    self.merge.cancel(&request_id).await;
                }
                if let Some(token) = self.registry.cancellation_token(&id) {
                    token.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Cancels every Queued and Active task.
    pub async fn cancel_all(&self) -> usize {
        let snapshot = self.registry.snapshot();
        let mut cancelled = 0;
        for view in snapshot.queued.iter().chain(snapshot.active.iter()) {
            if self.cancel(view.id.as_str()).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// Admission pump: promotes Queued tasks in registration order while the
    /// active count is below the bound. Dequeue-and-activate is a single
    /// registry critical section.
    fn pump(self: &Arc<Self>) {
        loop {
            let token = CancellationToken::new();
            let Some(id) = self
                .registry
                .activate_next(self.config.limits.max_concurrent, token.clone())
            else {
                break;
            };
            info!(task_id = %id, "task activated");
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.run_task(id, token).await;
            });
        }
    }

    async fn run_task(self: Arc<Self>, id: TaskId, token: CancellationToken) {
        self.notify(&id);
        let outcome = self.execute(&id, &token).await;

        // Cleanup runs unconditionally: success, failure, or cancellation.
        match self.store.delete_prefix(&segment_prefix(&id)).await {
            Ok(removed) if removed > 0 => {
                debug!(task_id = %id, removed, "temporary segments cleaned up");
            }
            Ok(_) => {}
            Err(e) => warn!(task_id = %id, error = %e, "temporary segment cleanup failed"),
        }

        // Exactly one terminal transition commits; the registry guard turns
        // the completion/cancellation race into a single winner.
        let transitioned = match &outcome {
            Ok(()) => self.registry.mark_completed(&id),
            Err(e) if e.is_cancelled() => self.registry.mark_cancelled(&id),
            Err(e) => {
                error!(task_id = %id, error = %e, "task failed");
                self.registry.mark_failed(&id, &e.to_string())
            }
        };
        if transitioned {
            self.notify(&id);
            self.schedule_eviction();
        }
        self.pump();
    }

    async fn execute(&self, id: &TaskId, token: &CancellationToken) -> Result<()> {
        let metadata = self.registry.metadata_of(id).ok_or_else(|| {
            DownloadError::Configuration {
                reason: "task vanished before start".to_string(),
            }
        })?;
        let source = metadata.preferred_source().to_string();
        let url = Url::parse(&source)
            .map_err(|e| DownloadError::invalid_url(&source, e.to_string()))?;
        let password = metadata.password.clone();

        self.push_progress(id, ProgressDelta::status("Fetching manifest"));
        ensure_live(token)?;
        let probe = self.remote.fetch_manifest(&url, password.as_deref()).await?;
        ensure_live(token)?;

        let stream_type = detect_stream_type(&probe);
        debug!(task_id = %id, ?stream_type, url = %probe.final_url, "stream type detected");
        self.push_progress(id, ProgressDelta::percentage(PROGRESS_MANIFEST));

        let planned = match stream_type {
            StreamType::HlsMaster => {
                self.plan_hls_master(id, token, &probe, password.clone()).await?
            }
            StreamType::HlsMedia => self.plan_hls_media(id, &probe, password.clone()),
            StreamType::Dash => self.plan_dash(id, &probe, password.clone())?,
            StreamType::Direct => self.plan_direct(id, &probe, password.clone()),
        };
        if planned.plan.segments.is_empty() {
            return Err(DownloadError::manifest_parse("no segments to fetch"));
        }

        self.push_progress(id, ProgressDelta::status("Downloading segments"));
        let fetcher = SegmentBatchFetcher::new(
            Arc::clone(&self.remote),
            Arc::clone(&self.store),
            self.config.fetcher.clone(),
        );
        let started = Instant::now();
        let stored = fetcher
            .run(&planned.plan, token, |wave| {
                let elapsed = started.elapsed().as_secs_f64();
                let speed = (elapsed > 0.0)
                    .then(|| format_speed(wave.downloaded_bytes as f64 / elapsed));
                self.push_progress(
                    id,
                    ProgressDelta {
                        downloaded: Some(wave.downloaded_bytes),
                        percentage: Some(wave.percentage),
                        speed,
                        ..Default::default()
                    },
                );
            })
            .await?;
        ensure_live(token)?;

        // Per-segment failures are tolerated; the task only escalates when
        // nothing usable survived.
        let media_count = stored.iter().filter(|s| !s.is_init).count();
        if media_count == 0 {
            return Err(DownloadError::segment_fetch(
                "no segments survived the fetch",
                false,
            ));
        }

        let container = stored
            .iter()
            .find(|s| !s.is_init)
            .map(|s| s.mime)
            .unwrap_or_default();
        let display_name = self
            .registry
            .display_name_of(id)
            .unwrap_or_else(|| "download".to_string());
        let output_name = output_filename(&display_name, container);

        self.push_progress(
            id,
            ProgressDelta {
                percentage: Some(PROGRESS_FETCH_DONE),
                status_text: Some("Merging".to_string()),
                ..Default::default()
            },
        );

        let request_id = Uuid::new_v4().to_string();
        self.registry.set_merge_request(id, Some(request_id.clone()));
        let request = MergeRequest {
            request_id: request_id.clone(),
            task_id: id.clone(),
            output_name: output_name.clone(),
            segments: stored,
            duration_hint: planned.duration_hint,
            video_codecs: planned.video_codecs,
            audio_codecs: planned.audio_codecs,
        };
        // Bounded wait for the merge reply, raced against cancellation.
        let merge_result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.merge.cancel(&request_id).await;
                Err(DownloadError::Cancelled)
            }
            timed = tokio::time::timeout(
                self.config.merge.response_timeout,
                self.merge.merge(request),
            ) => match timed {
                Ok(result) => result,
                Err(_) => {
                    self.merge.cancel(&request_id).await;
                    Err(DownloadError::timeout("merge service response"))
                }
            }
        };
        self.registry.set_merge_request(id, None);
        let outcome = merge_result?;
        ensure_live(token)?;

        let merged = self.store.get(&outcome.output_key).await?.ok_or_else(|| {
            DownloadError::merge(format!("merged output missing: {}", outcome.output_key))
        })?;
        let _ = self.store.delete(&outcome.output_key).await;

        self.push_progress(
            id,
            ProgressDelta {
                status_text: Some("Saving".to_string()),
                awaiting_user_interaction: Some(true),
                ..Default::default()
            },
        );
        let receipt = self.sink.deliver(&output_name, merged).await?;
        self.registry.attach_external_id(id, receipt.external_id);
        self.push_progress(
            id,
            ProgressDelta {
                awaiting_user_interaction: Some(false),
                ..Default::default()
            },
        );
        Ok(())
    }

    /// Master playlist flow: pick the best variant, fetch its media playlist,
    /// and ride the preferred audio rendition alongside when one exists.
    async fn plan_hls_master(
        &self,
        id: &TaskId,
        token: &CancellationToken,
        probe: &ManifestResponse,
        password: Option<String>,
    ) -> Result<PlannedDownload> {
        let master = parse_hls(probe.body.as_deref().unwrap_or_default());
        let variant = select_best_variant(&master.variants)
            .cloned()
            .ok_or_else(|| DownloadError::manifest_parse("master playlist has no variants"))?;
        debug!(
            task_id = %id,
            bandwidth = variant.bandwidth,
            uri = %variant.uri,
            "variant selected"
        );

        let variant_url = join_url(&probe.final_url, &variant.uri)?;
        ensure_live(token)?;
        let media_probe = self
            .remote
            .fetch_manifest(&variant_url, password.as_deref())
            .await?;
        let media = parse_hls(media_probe.body.as_deref().unwrap_or_default());
        if media.segments.is_empty() {
            return Err(DownloadError::manifest_parse(
                "selected variant playlist has no segments",
            ));
        }

        let audio_track =
            select_preferred_audio_track(&master.audio_tracks, variant.audio_group_id.as_deref());
        let mut audio: Option<(ManifestDescriptor, Url)> = None;
        if let Some(track) = audio_track
            && let Some(uri) = &track.uri
        {
            let audio_url = join_url(&probe.final_url, uri)?;
            ensure_live(token)?;
            let audio_probe = self
                .remote
                .fetch_manifest(&audio_url, password.as_deref())
                .await?;
            let parsed = parse_hls(audio_probe.body.as_deref().unwrap_or_default());
            if parsed.segments.is_empty() {
                warn!(task_id = %id, url = %audio_url, "audio playlist empty; continuing without separate audio");
            } else {
                audio = Some((parsed, audio_probe.final_url));
            }
        }

        let mut segments = Vec::new();
        push_descriptor_segments(&mut segments, &media, &media_probe.final_url, TrackKind::Video);
        if let Some((audio_manifest, audio_base)) = &audio {
            push_descriptor_segments(&mut segments, audio_manifest, audio_base, TrackKind::Audio);
        }
        apply_init_fallback(&mut segments);

        Ok(PlannedDownload {
            plan: FetchPlan {
                task_id: id.clone(),
                segments,
                progress_lo: PROGRESS_MANIFEST,
                progress_hi: PROGRESS_FETCH_DONE,
                password,
            },
            duration_hint: (media.total_duration > 0.0).then_some(media.total_duration),
            video_codecs: variant.codecs,
            audio_codecs: audio_track.and_then(|t| t.codecs.clone()),
        })
    }

    /// Media-only playlist: a single-track plan straight from the segments.
    fn plan_hls_media(
        &self,
        id: &TaskId,
        probe: &ManifestResponse,
        password: Option<String>,
    ) -> PlannedDownload {
        let media = parse_hls(probe.body.as_deref().unwrap_or_default());
        let kind = match media.mime_type {
            MimeKind::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        let mut segments = Vec::new();
        push_descriptor_segments(&mut segments, &media, &probe.final_url, kind);
        PlannedDownload {
            plan: FetchPlan {
                task_id: id.clone(),
                segments,
                progress_lo: PROGRESS_MANIFEST,
                progress_hi: PROGRESS_FETCH_DONE,
                password,
            },
            duration_hint: (media.total_duration > 0.0).then_some(media.total_duration),
            video_codecs: None,
            audio_codecs: None,
        }
    }

    /// DASH: best video and audio representations as a separate-track plan.
    fn plan_dash(
        &self,
        id: &TaskId,
        probe: &ManifestResponse,
        password: Option<String>,
    ) -> Result<PlannedDownload> {
        let manifest = parse_dash(probe.body.as_deref().unwrap_or_default());
        let video = select_best_representation(&manifest.video);
        let audio = select_best_representation(&manifest.audio);
        if video.is_none() && audio.is_none() {
            return Err(DownloadError::manifest_parse(
                "MPD has no usable representations",
            ));
        }

        let mut segments = Vec::new();
        let mut duration_hint = None;
        if let Some(rep) = video {
            debug!(task_id = %id, rep_id = %rep.id, bandwidth = rep.bandwidth, "video representation selected");
            push_dash_segments(&mut segments, rep, &probe.final_url, TrackKind::Video);
            duration_hint = (rep.total_duration() > 0.0).then(|| rep.total_duration());
        }
        if let Some(rep) = audio {
            push_dash_segments(&mut segments, rep, &probe.final_url, TrackKind::Audio);
            if duration_hint.is_none() {
                duration_hint = (rep.total_duration() > 0.0).then(|| rep.total_duration());
            }
        }
        apply_init_fallback(&mut segments);

        Ok(PlannedDownload {
            plan: FetchPlan {
                task_id: id.clone(),
                segments,
                progress_lo: PROGRESS_MANIFEST,
                progress_hi: PROGRESS_FETCH_DONE,
                password,
            },
            duration_hint,
            video_codecs: video.and_then(|r| r.codecs.clone()),
            audio_codecs: audio.and_then(|r| r.codecs.clone()),
        })
    }

    /// Direct file: the URL itself is the only segment.
    fn plan_direct(
        &self,
        id: &TaskId,
        probe: &ManifestResponse,
        password: Option<String>,
    ) -> PlannedDownload {
        let mime = MimeKind::from_uri(probe.final_url.path());
        let kind = match mime {
            MimeKind::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        PlannedDownload {
            plan: FetchPlan {
                task_id: id.clone(),
                segments: vec![SegmentRequest {
                    index: 0,
                    url: probe.final_url.clone(),
                    kind,
                    is_init: false,
                    mime,
                    sequence_number: 0,
                    discontinuity_sequence: 0,
                    duration: 0.0,
                    byte_range: None,
                }],
                progress_lo: PROGRESS_MANIFEST,
                progress_hi: PROGRESS_FETCH_DONE,
                password,
            },
            duration_hint: None,
            video_codecs: None,
            audio_codecs: None,
        }
    }

    /// Merges a progress delta and forwards the fresh view to the notifier.
    fn push_progress(&self, id: &TaskId, delta: ProgressDelta) {
        if self.registry.update_progress(id, delta).is_some() {
            self.notify(id);
        }
    }

    fn notify(&self, id: &TaskId) {
        let Some(view) = self.registry.view_of(id) else {
            return;
        };
        let filename = self
            .registry
            .display_name_of(id)
            .unwrap_or_default();
        self.notifier.notify(ProgressEvent {
            task_id: id.clone(),
            filename,
            downloaded: view.progress.downloaded,
            total: view.progress.total,
            percentage: view.progress.percentage,
            status: view.progress.status_text.clone(),
            awaiting_user_interaction: view.progress.awaiting_user_interaction,
        });
    }

    /// Evicts terminal tasks once their linger window elapses.
    fn schedule_eviction(&self) {
        let registry = Arc::clone(&self.registry);
        let linger = self.config.registry.linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            for id in registry.evict_expired() {
                debug!(task_id = %id, "terminal task evicted");
            }
        });
    }
}

fn ensure_live(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(DownloadError::Cancelled)
    } else {
        Ok(())
    }
}

fn detect_stream_type(probe: &ManifestResponse) -> StreamType {
    let Some(body) = probe.body.as_deref() else {
        return StreamType::Direct;
    };
    let head = body.trim_start();
    if head.starts_with("#EXTM3U") {
        if body.contains("#EXT-X-STREAM-INF") {
            StreamType::HlsMaster
        } else {
            StreamType::HlsMedia
        }
    } else if body.contains("<MPD")
        || probe
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("dash+xml"))
    {
        StreamType::Dash
    } else {
        // Content sniff failed; fall back to the URL extension for servers
        // that mislabel manifest responses.
        let path = probe.final_url.path().to_ascii_lowercase();
        if path.ends_with(".mpd") {
            StreamType::Dash
        } else if path.ends_with(".m3u8") || path.ends_with(".m3u") {
            StreamType::HlsMedia
        } else {
            StreamType::Direct
        }
    }
}

fn join_url(base: &Url, uri: &str) -> Result<Url> {
    base.join(uri)
        .map_err(|e| DownloadError::invalid_url(uri, e.to_string()))
}

/// Appends a manifest's segments to a plan as one track; a segment whose URI
/// cannot be resolved is dropped, mirroring the parser's tolerance.
fn push_descriptor_segments(
    out: &mut Vec<SegmentRequest>,
    manifest: &ManifestDescriptor,
    base: &Url,
    kind: TrackKind,
) {
    for descriptor in &manifest.segments {
        match base.join(&descriptor.uri) {
            Ok(url) => out.push(SegmentRequest {
                index: out.len(),
                url,
                kind,
                is_init: descriptor.is_init,
                mime: descriptor.mime_type,
                sequence_number: descriptor.sequence_number,
                discontinuity_sequence: descriptor.discontinuity_sequence,
                duration: descriptor.duration,
                byte_range: descriptor.byte_range,
            }),
            Err(e) => {
                warn!(uri = %descriptor.uri, error = %e, "dropping segment with unresolvable URI");
            }
        }
    }
}

fn push_dash_segments(
    out: &mut Vec<SegmentRequest>,
    representation: &adaptive::DashRepresentation,
    base: &Url,
    kind: TrackKind,
) {
    for descriptor in &representation.segments {
        match base.join(&descriptor.uri) {
            Ok(url) => out.push(SegmentRequest {
                index: out.len(),
                url,
                kind,
                is_init: descriptor.is_init,
                mime: descriptor.mime_type,
                sequence_number: descriptor.sequence_number,
                discontinuity_sequence: descriptor.discontinuity_sequence,
                duration: descriptor.duration,
                byte_range: descriptor.byte_range,
            }),
            Err(e) => {
                warn!(uri = %descriptor.uri, error = %e, "dropping segment with unresolvable URI");
            }
        }
    }
}

/// Output filename: the task's display name with a container extension.
fn output_filename(display_name: &str, container: MimeKind) -> String {
    let stem = display_name
        .trim_end_matches(".m3u8")
        .trim_end_matches(".mpd");
    let ext = match container {
        MimeKind::Fmp4 => "mp4",
        MimeKind::Webm => "webm",
        MimeKind::Audio => "m4a",
        MimeKind::MpegTs => "ts",
    };
    if stem.to_ascii_lowercase().ends_with(&format!(".{ext}")) {
        stem.to_string()
    } else {
        format!("{stem}.{ext}")
    }
}

fn format_speed(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_sec;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
