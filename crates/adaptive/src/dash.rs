//! DASH manifest reader.
//!
//! Tag-scanning, not a DOM parse: source content is not guaranteed to be
//! well-formed XML, so blocks are located by open/close tag scans and
//! attributes are pulled out with a quote-aware scanner. Unterminated blocks
//! extend to end of input rather than failing.

use crate::types::{MimeKind, Resolution, SegmentDescriptor};

/// One DASH `Representation` with its fully expanded segment list
/// (init entry first when one is declared).
#[derive(Debug, Clone, PartialEq)]
pub struct DashRepresentation {
    pub id: String,
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub resolution: Option<Resolution>,
    pub mime_type: MimeKind,
    pub segments: Vec<SegmentDescriptor>,
}

impl DashRepresentation {
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }
}

/// Audio and video representations extracted from an MPD, each list sorted
/// by descending bandwidth.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashManifest {
    pub video: Vec<DashRepresentation>,
    pub audio: Vec<DashRepresentation>,
}

impl DashManifest {
    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackClass {
    Video,
    Audio,
}

/// Parses an MPD document into audio/video representation lists.
pub fn parse_dash(xml: &str) -> DashManifest {
    let mut manifest = DashManifest::default();

    for set in scan_blocks(xml, "AdaptationSet") {
        let set_template = scan_blocks(set.body, "SegmentTemplate").into_iter().next();
        let mut representations: Vec<DashRepresentation> = scan_blocks(set.body, "Representation")
            .iter()
            .filter_map(|rep| parse_representation(rep, &set, set_template.as_ref()))
            .collect();
        representations.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));

        match classify(&set) {
            Some(TrackClass::Video) => manifest.video.extend(representations),
            Some(TrackClass::Audio) => manifest.audio.extend(representations),
            None => {}
        }
    }

    manifest
}

fn classify(set: &TagBlock<'_>) -> Option<TrackClass> {
    let by_value = |value: &str| {
        if value.starts_with("video") {
            Some(TrackClass::Video)
        } else if value.starts_with("audio") {
            Some(TrackClass::Audio)
        } else {
            None
        }
    };
    if let Some(content_type) = tag_attr(set.attrs, "contentType")
        && let Some(class) = by_value(&content_type)
    {
        return Some(class);
    }
    if let Some(mime) = tag_attr(set.attrs, "mimeType")
        && let Some(class) = by_value(&mime)
    {
        return Some(class);
    }
    // Fall back to the first representation's own mimeType.
    scan_blocks(set.body, "Representation")
        .iter()
        .find_map(|rep| tag_attr(rep.attrs, "mimeType").and_then(|m| by_value(&m)))
}

fn parse_representation(
    rep: &TagBlock<'_>,
    set: &TagBlock<'_>,
    set_template: Option<&TagBlock<'_>>,
) -> Option<DashRepresentation> {
    let id = tag_attr(rep.attrs, "id").unwrap_or_default();
    let bandwidth = tag_attr(rep.attrs, "bandwidth")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let codecs = tag_attr(rep.attrs, "codecs").or_else(|| tag_attr(set.attrs, "codecs"));
    let resolution = dimensions(rep.attrs).or_else(|| dimensions(set.attrs));

    // Representation-level template overrides the adaptation-level one.
    let rep_template = scan_blocks(rep.body, "SegmentTemplate").into_iter().next();
    let segments = match rep_template.as_ref().or(set_template) {
        Some(template) => expand_template(template, &id),
        None => expand_segment_list(rep),
    };
    if segments.is_empty() {
        return None;
    }

    let mime_type = segments
        .iter()
        .find(|s| !s.is_init)
        .map(|s| s.mime_type)
        .unwrap_or_default();

    Some(DashRepresentation {
        id,
        bandwidth,
        codecs,
        resolution,
        mime_type,
        segments,
    })
}

fn dimensions(attrs: &str) -> Option<Resolution> {
    let width = tag_attr(attrs, "width")?.parse().ok()?;
    let height = tag_attr(attrs, "height")?.parse().ok()?;
    Some(Resolution::new(width, height))
}

/// Expands `SegmentTemplate` addressing against its `SegmentTimeline`.
///
/// `$Number$` starts at `startNumber` (default 1); each `<S t d r>` entry
/// contributes `r + 1` segments of `d / timescale` seconds.
fn expand_template(template: &TagBlock<'_>, rep_id: &str) -> Vec<SegmentDescriptor> {
    let Some(media) = tag_attr(template.attrs, "media") else {
        return Vec::new();
    };
    let start_number: u64 = tag_attr(template.attrs, "startNumber")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let timescale: f64 = tag_attr(template.attrs, "timescale")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1.0);

    let mut segments = Vec::new();
    if let Some(init) = tag_attr(template.attrs, "initialization") {
        let uri = substitute(&init, rep_id, start_number, 0);
        segments.push(init_descriptor(uri, start_number));
    }

    let timelines = scan_blocks(template.body, "SegmentTimeline");
    let Some(timeline) = timelines.first() else {
        return segments;
    };

    let mut number = start_number;
    let mut time: u64 = 0;
    for entry in scan_blocks(timeline.body, "S") {
        let duration: u64 = tag_attr(entry.attrs, "d")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if let Some(t) = tag_attr(entry.attrs, "t").and_then(|v| v.parse().ok()) {
            time = t;
        }
        // Negative repeat means "until the end of the period"; only explicit
        // counts are expandable here.
        let repeat: u64 = tag_attr(entry.attrs, "r")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|r| r.max(0) as u64)
            .unwrap_or(0);
        for _ in 0..=repeat {
            let uri = substitute(&media, rep_id, number, time);
            segments.push(SegmentDescriptor {
                mime_type: MimeKind::from_uri(&uri),
                uri,
                duration: if timescale > 0.0 { duration as f64 / timescale } else { 0.0 },
                sequence_number: number,
                discontinuity_sequence: 0,
                is_init: false,
                byte_range: None,
                title: None,
            });
            number += 1;
            time += duration;
        }
    }
    segments
}

/// Explicit `SegmentURL` addressing, with an optional `Initialization` source.
fn expand_segment_list(rep: &TagBlock<'_>) -> Vec<SegmentDescriptor> {
    let lists = scan_blocks(rep.body, "SegmentList");
    let (scope, list_attrs) = match lists.first() {
        Some(list) => (list.body, list.attrs),
        None => (rep.body, ""),
    };

    let timescale: f64 = tag_attr(list_attrs, "timescale")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1.0);
    let duration: f64 = tag_attr(list_attrs, "duration")
        .and_then(|v| v.parse::<u64>().ok())
        .map(|d| if timescale > 0.0 { d as f64 / timescale } else { 0.0 })
        .unwrap_or(0.0);

    let mut segments = Vec::new();
    if let Some(init) = scan_blocks(scope, "Initialization")
        .iter()
        .chain(scan_blocks(rep.body, "Initialization").iter())
        .find_map(|block| tag_attr(block.attrs, "sourceURL"))
    {
        segments.push(init_descriptor(init, 0));
    }

    for (index, url) in scan_blocks(scope, "SegmentURL").iter().enumerate() {
        let Some(uri) = tag_attr(url.attrs, "media") else {
            continue;
        };
        segments.push(SegmentDescriptor {
            mime_type: MimeKind::from_uri(&uri),
            uri,
            duration,
            sequence_number: index as u64,
            discontinuity_sequence: 0,
            is_init: false,
            byte_range: None,
            title: None,
        });
    }
    segments
}

fn init_descriptor(uri: String, sequence_number: u64) -> SegmentDescriptor {
    SegmentDescriptor {
        mime_type: MimeKind::from_uri(&uri),
        uri,
        duration: 0.0,
        sequence_number,
        discontinuity_sequence: 0,
        is_init: true,
        byte_range: None,
        title: None,
    }
}

fn substitute(pattern: &str, rep_id: &str, number: u64, time: u64) -> String {
    pattern
        .replace("$RepresentationID$", rep_id)
        .replace("$Number$", &number.to_string())
        .replace("$Time$", &time.to_string())
}

/// A scanned tag occurrence: the raw attribute text of the opening tag and
/// the body up to the matching close tag (empty for self-closing tags).
struct TagBlock<'a> {
    attrs: &'a str,
    body: &'a str,
}

/// Finds every `<tag ...>...</tag>` or `<tag .../>` occurrence. Unterminated
/// blocks run to end of input.
fn scan_blocks<'a>(source: &'a str, tag: &str) -> Vec<TagBlock<'a>> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut blocks = Vec::new();
    let mut cursor = 0;

    while let Some(found) = source[cursor..].find(&open) {
        let after = cursor + found + open.len();
        // Reject prefix matches such as `<S` inside `<SegmentURL`.
        match source[after..].chars().next() {
            Some(c) if c.is_whitespace() || c == '>' || c == '/' => {}
            _ => {
                cursor = after;
                continue;
            }
        }
        let Some(open_end) = source[after..].find('>').map(|i| after + i) else {
            break;
        };
        let attrs = &source[after..open_end];
        if attrs.trim_end().ends_with('/') {
            blocks.push(TagBlock {
                attrs: attrs.trim_end().trim_end_matches('/'),
                body: "",
            });
            cursor = open_end + 1;
            continue;
        }
        let body_start = open_end + 1;
        match source[body_start..].find(&close) {
            Some(rel) => {
                blocks.push(TagBlock {
                    attrs,
                    body: &source[body_start..body_start + rel],
                });
                cursor = body_start + rel + close.len();
            }
            None => {
                blocks.push(TagBlock {
                    attrs,
                    body: &source[body_start..],
                });
                cursor = source.len();
            }
        }
    }
    blocks
}

/// Pulls a quoted attribute value out of raw opening-tag text.
fn tag_attr(attrs: &str, name: &str) -> Option<String> {
    for (pos, _) in attrs.match_indices(name) {
        // Name boundary on the left.
        if pos > 0 {
            let before = attrs[..pos].chars().next_back();
            if before.is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ':') {
                continue;
            }
        }
        let rest = attrs[pos + name.len()..].trim_start();
        let Some(rest) = rest.strip_prefix('=') else {
            continue;
        };
        let rest = rest.trim_start();
        let quote = match rest.chars().next() {
            Some(c @ ('"' | '\'')) => c,
            _ => continue,
        };
        let value = &rest[quote.len_utf8()..];
        if let Some(end) = value.find(quote) {
            return Some(value[..end].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE_MPD: &str = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/seg_$Number$.m4s" startNumber="5">
        <SegmentTimeline>
          <S t="0" d="2000" r="2"/>
          <S d="1500"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v1" bandwidth="800000" width="640" height="360" codecs="avc1.4d401e"/>
      <Representation id="v2" bandwidth="1500000" width="1280" height="720" codecs="avc1.64001f"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4">
      <SegmentTemplate timescale="1000" initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/seg_$Time$.m4s">
        <SegmentTimeline>
          <S t="100" d="2000" r="1"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="a1" bandwidth="128000" codecs="mp4a.40.2"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn test_template_timeline_expansion() {
        let manifest = parse_dash(TEMPLATE_MPD);
        assert_eq!(manifest.video.len(), 2);
        // Sorted by descending bandwidth.
        assert_eq!(manifest.video[0].id, "v2");
        assert_eq!(manifest.video[0].bandwidth, 1_500_000);
        assert_eq!(manifest.video[1].id, "v1");

        let v2 = &manifest.video[0];
        assert!(v2.segments[0].is_init);
        assert_eq!(v2.segments[0].uri, "v2/init.mp4");
        // r="2" yields three segments plus the single trailing entry.
        let media: Vec<_> = v2.segments.iter().filter(|s| !s.is_init).collect();
        assert_eq!(media.len(), 4);
        assert_eq!(media[0].uri, "v2/seg_5.m4s");
        assert_eq!(media[0].sequence_number, 5);
        assert_eq!(media[3].uri, "v2/seg_8.m4s");
        assert!((media[0].duration - 2.0).abs() < 1e-9);
        assert!((media[3].duration - 1.5).abs() < 1e-9);
        assert_eq!(v2.mime_type, MimeKind::Fmp4);
        assert_eq!(v2.resolution, Some(Resolution::new(1280, 720)));
    }

    #[test]
    fn test_time_substitution() {
        let manifest = parse_dash(TEMPLATE_MPD);
        let a1 = &manifest.audio[0];
        let media: Vec<_> = a1.segments.iter().filter(|s| !s.is_init).collect();
        assert_eq!(media.len(), 2);
        assert_eq!(media[0].uri, "a1/seg_100.m4s");
        assert_eq!(media[1].uri, "a1/seg_2100.m4s");
    }

    #[test]
    fn test_segment_url_list() {
        let xml = r#"<MPD><Period>
          <AdaptationSet mimeType="video/webm">
            <Representation id="r0" bandwidth="500000">
              <SegmentList timescale="1000" duration="4000">
                <Initialization sourceURL="init.webm"/>
                <SegmentURL media="chunk1.webm"/>
                <SegmentURL media="chunk2.webm"/>
              </SegmentList>
            </Representation>
          </AdaptationSet>
        </Period></MPD>"#;
        let manifest = parse_dash(xml);
        assert_eq!(manifest.video.len(), 1);
        let rep = &manifest.video[0];
        assert!(rep.segments[0].is_init);
        assert_eq!(rep.segments[0].uri, "init.webm");
        let media: Vec<_> = rep.segments.iter().filter(|s| !s.is_init).collect();
        assert_eq!(media.len(), 2);
        assert!((media[0].duration - 4.0).abs() < 1e-9);
        assert_eq!(rep.mime_type, MimeKind::Webm);
        assert!((rep.total_duration() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_classification_fallback_to_representation_mime() {
        let xml = r#"<AdaptationSet>
          <Representation id="a" bandwidth="96000" mimeType="audio/mp4">
            <SegmentList><SegmentURL media="a1.m4s"/></SegmentList>
          </Representation>
        </AdaptationSet>"#;
        let manifest = parse_dash(xml);
        assert_eq!(manifest.audio.len(), 1);
        assert!(manifest.video.is_empty());
    }

    #[test]
    fn test_unterminated_block_is_tolerated() {
        let xml = r#"<AdaptationSet contentType="video">
          <Representation id="v" bandwidth="1000">
            <SegmentList><SegmentURL media="only.ts"/></SegmentList>
        "#;
        let manifest = parse_dash(xml);
        assert_eq!(manifest.video.len(), 1);
        assert_eq!(manifest.video[0].segments.len(), 1);
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_dash("").is_empty());
        assert!(parse_dash("not xml at all").is_empty());
    }

    #[test]
    fn test_tag_attr_boundaries() {
        assert_eq!(tag_attr(r#" startNumber="7" "#, "startNumber").as_deref(), Some("7"));
        // `d` must not match inside `id` or `duration`.
        assert_eq!(tag_attr(r#" id="x" d="9" duration="4""#, "d").as_deref(), Some("9"));
        assert_eq!(tag_attr(r#" media='single-quoted'"#, "media").as_deref(), Some("single-quoted"));
        assert_eq!(tag_attr(r#" media=unquoted"#, "media"), None);
    }
}
