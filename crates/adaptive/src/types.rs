use serde::{Deserialize, Serialize};

/// Video resolution information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[inline]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel count used as the tie-breaker between equal-bandwidth variants.
    #[inline]
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Parses the `WIDTHxHEIGHT` form used by HLS `RESOLUTION` attributes.
    pub fn parse(value: &str) -> Option<Self> {
        let (w, h) = value.split_once(['x', 'X'])?;
        Some(Self {
            width: w.trim().parse().ok()?,
            height: h.trim().parse().ok()?,
        })
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Container format inferred from a media URI extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MimeKind {
    /// Fragmented MP4 (`.m4s`, `.mp4`).
    Fmp4,
    /// WebM (`.webm`).
    Webm,
    /// Audio-only elementary stream (`.aac`, `.mp3`).
    Audio,
    /// MPEG transport stream (`.ts`, `.m2ts`); also the fallback.
    #[default]
    MpegTs,
}

impl MimeKind {
    pub fn from_uri(uri: &str) -> Self {
        let path = uri.split(['?', '#']).next().unwrap_or(uri);
        let ext = match path.rsplit_once('.') {
            Some((_, ext)) if !ext.contains('/') => ext.to_ascii_lowercase(),
            _ => return MimeKind::MpegTs,
        };
        match ext.as_str() {
            "m4s" | "mp4" => MimeKind::Fmp4,
            "webm" => MimeKind::Webm,
            "aac" | "mp3" => MimeKind::Audio,
            _ => MimeKind::MpegTs,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MimeKind::Fmp4 => "video/mp4",
            MimeKind::Webm => "video/webm",
            MimeKind::Audio => "audio/mp4",
            MimeKind::MpegTs => "video/mp2t",
        }
    }
}

/// HLS `BYTERANGE` value: a sub-range of the segment resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub length: u64,
    pub offset: Option<u64>,
}

impl ByteRange {
    /// Parses the `<n>[@<o>]` form.
    pub fn parse(value: &str) -> Option<Self> {
        match value.split_once('@') {
            Some((len, off)) => Some(Self {
                length: len.trim().parse().ok()?,
                offset: Some(off.trim().parse().ok()?),
            }),
            None => Some(Self {
                length: value.trim().parse().ok()?,
                offset: None,
            }),
        }
    }
}

/// One alternate bitrate/resolution encoding listed in a master playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantDescriptor {
    pub uri: String,
    pub bandwidth: u64,
    pub resolution: Option<Resolution>,
    pub codecs: Option<String>,
    pub audio_group_id: Option<String>,
}

/// An alternate audio rendition declared by `EXT-X-MEDIA:TYPE=AUDIO`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrackDescriptor {
    /// Absent when the audio is muxed into the variant stream itself.
    pub uri: Option<String>,
    pub group_id: String,
    pub name: Option<String>,
    pub is_default: bool,
    pub is_autoselect: bool,
    pub codecs: Option<String>,
}

/// One fetchable chunk of a media stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub uri: String,
    pub duration: f64,
    pub sequence_number: u64,
    pub discontinuity_sequence: u64,
    pub is_init: bool,
    pub mime_type: MimeKind,
    pub byte_range: Option<ByteRange>,
    pub title: Option<String>,
}

/// Structured view of a parsed manifest, master or media.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestDescriptor {
    pub is_master: bool,
    pub variants: Vec<VariantDescriptor>,
    pub audio_tracks: Vec<AudioTrackDescriptor>,
    pub segments: Vec<SegmentDescriptor>,
    pub target_duration: f64,
    pub media_sequence: u64,
    pub discontinuity_sequence: u64,
    pub total_duration: f64,
    pub init_segment_uri: Option<String>,
    pub mime_type: MimeKind,
    /// `EXT-X-ENDLIST` was present: the playlist is complete (VOD).
    pub end_list: bool,
}

impl ManifestDescriptor {
    /// Media segments only, excluding init entries.
    pub fn media_segments(&self) -> impl Iterator<Item = &SegmentDescriptor> {
        self.segments.iter().filter(|s| !s.is_init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_kind_from_uri() {
        assert_eq!(MimeKind::from_uri("seg_001.m4s"), MimeKind::Fmp4);
        assert_eq!(MimeKind::from_uri("video.mp4?token=abc"), MimeKind::Fmp4);
        assert_eq!(MimeKind::from_uri("chunk.webm"), MimeKind::Webm);
        assert_eq!(MimeKind::from_uri("audio.aac"), MimeKind::Audio);
        assert_eq!(MimeKind::from_uri("track.mp3"), MimeKind::Audio);
        assert_eq!(MimeKind::from_uri("seg0.ts"), MimeKind::MpegTs);
        assert_eq!(MimeKind::from_uri("seg0.m2ts"), MimeKind::MpegTs);
        assert_eq!(MimeKind::from_uri("no-extension"), MimeKind::MpegTs);
        assert_eq!(MimeKind::from_uri("a.dir/file"), MimeKind::MpegTs);
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!(Resolution::parse("1920x1080"), Some(Resolution::new(1920, 1080)));
        assert_eq!(Resolution::parse("640X360"), Some(Resolution::new(640, 360)));
        assert_eq!(Resolution::parse("bogus"), None);
    }

    #[test]
    fn test_byte_range_parse() {
        assert_eq!(
            ByteRange::parse("1234@5678"),
            Some(ByteRange { length: 1234, offset: Some(5678) })
        );
        assert_eq!(ByteRange::parse("1234"), Some(ByteRange { length: 1234, offset: None }));
        assert_eq!(ByteRange::parse("x@y"), None);
    }
}
