//! HLS playlist tokenizer.
//!
//! A single forward scan over the playlist text. Tag handlers mutate a small
//! amount of carried state (pending `EXTINF`, pending `BYTERANGE`, pending
//! `STREAM-INF`, the current `MAP`, a running discontinuity counter) which the
//! next URI line consumes. Unknown tags are ignored; an `EXTINF` with no
//! following URI line drops that entry instead of failing the parse.

use tracing::trace;

use crate::types::{
    AudioTrackDescriptor, ByteRange, ManifestDescriptor, MimeKind, Resolution, SegmentDescriptor,
    VariantDescriptor,
};

/// Pending `EXTINF` state waiting for its URI line.
struct PendingInf {
    duration: f64,
    title: Option<String>,
}

/// Parses an HLS playlist (master or media) into a [`ManifestDescriptor`].
///
/// Sequence numbers default to `media_sequence + positional index`; the
/// base is applied after the scan so a late `EXT-X-MEDIA-SEQUENCE` tag still
/// takes effect.
pub fn parse_hls(text: &str) -> ManifestDescriptor {
    let mut descriptor = ManifestDescriptor::default();

    let mut pending_inf: Option<PendingInf> = None;
    let mut pending_byte_range: Option<ByteRange> = None;
    let mut pending_variant: Option<VariantDescriptor> = None;
    let mut discontinuity: u64 = 0;
    // Positional index of the next media segment; rebased onto media_sequence
    // once the scan completes.
    let mut media_index: u64 = 0;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(tag) = line.strip_prefix('#') {
            if !tag.starts_with("EXT") {
                // Plain comment.
                continue;
            }
            let (name, value) = match tag.split_once(':') {
                Some((name, value)) => (name, value),
                None => (tag, ""),
            };
            match name {
                "EXT-X-TARGETDURATION" => {
                    descriptor.target_duration = value.trim().parse().unwrap_or(0.0);
                }
                "EXT-X-MEDIA-SEQUENCE" => {
                    descriptor.media_sequence = value.trim().parse().unwrap_or(0);
                }
                "EXT-X-DISCONTINUITY-SEQUENCE" => {
                    descriptor.discontinuity_sequence = value.trim().parse().unwrap_or(0);
                }
                "EXT-X-DISCONTINUITY" => {
                    discontinuity += 1;
                }
                "EXT-X-ENDLIST" => {
                    descriptor.end_list = true;
                }
                "EXT-X-MAP" => {
                    let attrs = split_attributes(value);
                    if let Some(uri) = attr_value(&attrs, "URI") {
                        let byte_range =
                            attr_value(&attrs, "BYTERANGE").and_then(|v| ByteRange::parse(&v));
                        if descriptor.init_segment_uri.is_none() {
                            descriptor.init_segment_uri = Some(uri.clone());
                        }
                        descriptor.segments.push(SegmentDescriptor {
                            mime_type: MimeKind::from_uri(&uri),
                            uri: uri.clone(),
                            duration: 0.0,
                            // Rides with the media segments it initializes.
                            sequence_number: media_index,
                            discontinuity_sequence: discontinuity,
                            is_init: true,
                            byte_range,
                            title: None,
                        });
                    }
                }
                "EXT-X-BYTERANGE" => {
                    pending_byte_range = ByteRange::parse(value);
                }
                "EXT-X-MEDIA" => {
                    let attrs = split_attributes(value);
                    let is_audio = attr_value(&attrs, "TYPE")
                        .is_some_and(|t| t.eq_ignore_ascii_case("AUDIO"));
                    if is_audio {
                        descriptor.audio_tracks.push(AudioTrackDescriptor {
                            uri: attr_value(&attrs, "URI"),
                            group_id: attr_value(&attrs, "GROUP-ID").unwrap_or_default(),
                            name: attr_value(&attrs, "NAME"),
                            is_default: attr_flag(&attrs, "DEFAULT"),
                            is_autoselect: attr_flag(&attrs, "AUTOSELECT"),
                            codecs: attr_value(&attrs, "CODECS"),
                        });
                    }
                }
                "EXT-X-STREAM-INF" => {
                    let attrs = split_attributes(value);
                    pending_variant = Some(VariantDescriptor {
                        uri: String::new(),
                        bandwidth: attr_value(&attrs, "BANDWIDTH")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0),
                        resolution: attr_value(&attrs, "RESOLUTION")
                            .and_then(|v| Resolution::parse(&v)),
                        codecs: attr_value(&attrs, "CODECS"),
                        audio_group_id: attr_value(&attrs, "AUDIO"),
                    });
                }
                "EXTINF" => {
                    let (duration, title) = match value.split_once(',') {
                        Some((d, t)) => {
                            let title = t.trim();
                            (
                                d.trim().parse().unwrap_or(0.0),
                                (!title.is_empty()).then(|| title.to_string()),
                            )
                        }
                        None => (value.trim().parse().unwrap_or(0.0), None),
                    };
                    pending_inf = Some(PendingInf { duration, title });
                }
                other => {
                    trace!(tag = other, "ignoring unrecognized playlist tag");
                }
            }
            continue;
        }

        // URI line: consumed by whichever tag is waiting for it.
        if let Some(mut variant) = pending_variant.take() {
            variant.uri = line.to_string();
            descriptor.variants.push(variant);
        } else if let Some(inf) = pending_inf.take() {
            descriptor.segments.push(SegmentDescriptor {
                uri: line.to_string(),
                duration: inf.duration,
                sequence_number: media_index,
                discontinuity_sequence: discontinuity,
                is_init: false,
                mime_type: MimeKind::from_uri(line),
                byte_range: pending_byte_range.take(),
                title: inf.title,
            });
            descriptor.total_duration += inf.duration;
            media_index += 1;
        }
        // A bare URI with no pending tag is meaningless; skip it.
    }

    // An EXTINF at end-of-file with no URI is dropped by pending_inf simply
    // going out of scope.
    descriptor.is_master = !descriptor.variants.is_empty();
    for segment in &mut descriptor.segments {
        segment.sequence_number += descriptor.media_sequence;
        segment.discontinuity_sequence += descriptor.discontinuity_sequence;
    }
    if let Some(first) = descriptor.segments.iter().find(|s| !s.is_init) {
        descriptor.mime_type = first.mime_type;
    }
    descriptor
}

/// Splits an HLS attribute list (`KEY=value,KEY="quoted,value",...`) into
/// pairs, honoring quotes. Quoted values are returned without their quotes.
fn split_attributes(value: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut key = String::new();
    let mut val = String::new();
    let mut in_value = false;
    let mut in_quotes = false;

    for c in value.chars() {
        match c {
            '=' if !in_value => in_value = true,
            '"' if in_value => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                if !key.is_empty() {
                    attrs.push((key.trim().to_string(), val.trim().to_string()));
                }
                key.clear();
                val.clear();
                in_value = false;
            }
            _ => {
                if in_value {
                    val.push(c);
                } else {
                    key.push(c);
                }
            }
        }
    }
    if !key.is_empty() {
        attrs.push((key.trim().to_string(), val.trim().to_string()));
    }
    attrs
}

fn attr_value(attrs: &[(String, String)], name: &str) -> Option<String> {
    attrs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
        .filter(|v| !v.is_empty())
}

fn attr_flag(attrs: &[(String, String)], name: &str) -> bool {
    attr_value(attrs, name).is_some_and(|v| v.eq_ignore_ascii_case("YES"))
}
