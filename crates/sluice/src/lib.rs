//! Sluice: an adaptive media download engine.
//!
//! Parses HLS/DASH manifests, selects the best variant and audio track,
//! fetches segments in bounded concurrent waves, and coordinates many such
//! downloads through a central task registry. Muxing, final delivery, and
//! progress display are external collaborators reached through traits.

pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod http;
pub mod registry;
pub mod task;

pub use collab::{
    BlobStore, ConcatMergeService, DownloadSink, MemoryBlobStore, MergeOutcome, MergeRequest,
    MergeService, NullNotifier, ProgressEvent, ProgressNotifier, SinkReceipt,
};
pub use config::{
    EngineConfig, FetcherConfig, HttpConfig, LimitsConfig, MergeConfig, RegistryConfig,
};
pub use engine::{Collaborators, DownloadEngine, EnqueueRequest};
pub use error::{DownloadError, Result};
pub use fetch::{
    FetchPlan, HttpFetcher, ManifestResponse, RemoteFetcher, SegmentBatchFetcher, SegmentRequest,
    StoredSegment, TrackKind, WaveProgress,
};
pub use registry::{NewDownload, RegistrySnapshot, TaskRegistry, TaskView};
pub use task::{
    DownloadTask, ProgressDelta, SOURCE_KIND_PREFERENCE, SourceCandidate, SourceKind, TaskId,
    TaskMetadata, TaskProgress, TaskStatus,
};
