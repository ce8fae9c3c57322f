//! Variant and track selection.
//!
//! Selection is a stable left fold: a candidate replaces the current best
//! only when strictly better, so equal candidates keep the earliest-seen
//! entry and the result is deterministic for any input order.

use crate::dash::DashRepresentation;
use crate::types::{AudioTrackDescriptor, Resolution, VariantDescriptor};

fn pixels(resolution: Option<Resolution>) -> u64 {
    resolution.map(|r| r.pixels()).unwrap_or(0)
}

/// Picks the variant with the highest bandwidth; ties break on resolution
/// pixel count, and full ties keep the first-seen candidate.
pub fn select_best_variant(variants: &[VariantDescriptor]) -> Option<&VariantDescriptor> {
    let mut best: Option<&VariantDescriptor> = None;
    for candidate in variants {
        match best {
            None => best = Some(candidate),
            Some(current) => {
                let better = candidate.bandwidth > current.bandwidth
                    || (candidate.bandwidth == current.bandwidth
                        && pixels(candidate.resolution) > pixels(current.resolution));
                if better {
                    best = Some(candidate);
                }
            }
        }
    }
    best
}

/// Same fold over DASH representations.
pub fn select_best_representation(
    representations: &[DashRepresentation],
) -> Option<&DashRepresentation> {
    let mut best: Option<&DashRepresentation> = None;
    for candidate in representations {
        match best {
            None => best = Some(candidate),
            Some(current) => {
                let better = candidate.bandwidth > current.bandwidth
                    || (candidate.bandwidth == current.bandwidth
                        && pixels(candidate.resolution) > pixels(current.resolution));
                if better {
                    best = Some(candidate);
                }
            }
        }
    }
    best
}

/// Picks the audio rendition for a variant.
///
/// When the variant declares an audio group, only tracks of that group are
/// considered, unless the group matches nothing (a dangling group id should
/// not silence the download). Preference: DEFAULT, then AUTOSELECT, then the
/// first track encountered.
pub fn select_preferred_audio_track<'a>(
    tracks: &'a [AudioTrackDescriptor],
    group_id: Option<&str>,
) -> Option<&'a AudioTrackDescriptor> {
    let scoped: Vec<&AudioTrackDescriptor> = match group_id {
        Some(group) => {
            let matching: Vec<_> = tracks.iter().filter(|t| t.group_id == group).collect();
            if matching.is_empty() {
                tracks.iter().collect()
            } else {
                matching
            }
        }
        None => tracks.iter().collect(),
    };

    scoped
        .iter()
        .find(|t| t.is_default)
        .or_else(|| scoped.iter().find(|t| t.is_autoselect))
        .or_else(|| scoped.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(uri: &str, bandwidth: u64, resolution: Option<(u32, u32)>) -> VariantDescriptor {
        VariantDescriptor {
            uri: uri.to_string(),
            bandwidth,
            resolution: resolution.map(|(w, h)| Resolution::new(w, h)),
            codecs: None,
            audio_group_id: None,
        }
    }

    fn track(group: &str, default: bool, autoselect: bool) -> AudioTrackDescriptor {
        AudioTrackDescriptor {
            uri: Some(format!("{group}.m3u8")),
            group_id: group.to_string(),
            name: None,
            is_default: default,
            is_autoselect: autoselect,
            codecs: None,
        }
    }

    #[test]
    fn test_highest_bandwidth_wins() {
        let variants = vec![
            variant("a", 800_000, None),
            variant("b", 1_500_000, None),
            variant("c", 1_200_000, None),
        ];
        assert_eq!(select_best_variant(&variants).unwrap().uri, "b");
    }

    #[test]
    fn test_bandwidth_tie_breaks_on_pixels() {
        let variants = vec![
            variant("small", 1_000_000, Some((640, 360))),
            variant("large", 1_000_000, Some((1280, 720))),
        ];
        assert_eq!(select_best_variant(&variants).unwrap().uri, "large");
    }

    #[test]
    fn test_full_tie_keeps_first_seen() {
        let variants = vec![
            variant("first", 1_000_000, Some((1280, 720))),
            variant("second", 1_000_000, Some((1280, 720))),
        ];
        assert_eq!(select_best_variant(&variants).unwrap().uri, "first");
    }

    #[test]
    fn test_missing_resolution_counts_as_zero_pixels() {
        let variants = vec![
            variant("bare", 1_000_000, None),
            variant("sized", 1_000_000, Some((320, 180))),
        ];
        assert_eq!(select_best_variant(&variants).unwrap().uri, "sized");
    }

    #[test]
    fn test_empty_variants() {
        assert!(select_best_variant(&[]).is_none());
    }

    #[test]
    fn test_audio_prefers_default_within_group() {
        let tracks = vec![
            track("aud", false, true),
            track("aud", true, false),
            track("other", true, true),
        ];
        let chosen = select_preferred_audio_track(&tracks, Some("aud")).unwrap();
        assert!(chosen.is_default);
        assert_eq!(chosen.group_id, "aud");
    }

    #[test]
    fn test_audio_autoselect_over_first() {
        let tracks = vec![track("aud", false, false), track("aud", false, true)];
        let chosen = select_preferred_audio_track(&tracks, Some("aud")).unwrap();
        assert!(chosen.is_autoselect);
    }

    #[test]
    fn test_audio_falls_back_to_first() {
        let tracks = vec![track("aud", false, false), track("aud", false, false)];
        let chosen = select_preferred_audio_track(&tracks, None).unwrap();
        assert!(std::ptr::eq(chosen, &tracks[0]));
    }

    #[test]
    fn test_audio_dangling_group_considers_all() {
        let tracks = vec![track("aud", true, false)];
        let chosen = select_preferred_audio_track(&tracks, Some("missing")).unwrap();
        assert_eq!(chosen.group_id, "aud");
    }

    #[test]
    fn test_audio_empty() {
        assert!(select_preferred_audio_track(&[], Some("aud")).is_none());
    }
}
