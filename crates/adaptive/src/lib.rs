//! Adaptive streaming manifest parsing and track selection.
//!
//! Pure, I/O-free building blocks: a single-pass HLS playlist tokenizer,
//! a tolerant tag-scanning DASH manifest reader, and the deterministic
//! variant/track selection rules shared by both.

mod dash;
mod hls;
mod select;
mod types;

pub use dash::{DashManifest, DashRepresentation, parse_dash};
pub use hls::parse_hls;
pub use select::{
    select_best_representation, select_best_variant, select_preferred_audio_track,
};
pub use types::{
    AudioTrackDescriptor, ByteRange, ManifestDescriptor, MimeKind, Resolution, SegmentDescriptor,
    VariantDescriptor,
};
