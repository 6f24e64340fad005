//! HLS master playlist assembly.

use std::fmt::Write;

use crate::pipeline::ladder::SEGMENT_DURATION_SECS;

pub const MASTER_MANIFEST_NAME: &str = "master.m3u8";
pub const RENDITION_MANIFEST_NAME: &str = "index.m3u8";

/// A finished rendition, as the master playlist advertises it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionResult {
    pub name: String,
    pub relative_manifest_path: String,
    pub bitrate_bps: u64,
    pub resolution: String,
    pub codecs: String,
}

/// Builds the master playlist text. Output depends only on the set of results:
/// variants are ordered by ascending bandwidth, ties broken by name.
pub fn build(results: &[RenditionResult]) -> String {
    let mut sorted: Vec<&RenditionResult> = results.iter().collect();
    sorted.sort_by(|a, b| {
        a.bitrate_bps
            .cmp(&b.bitrate_bps)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.relative_manifest_path.cmp(&b.relative_manifest_path))
    });

    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", SEGMENT_DURATION_SECS);

    for variant in sorted {
        let _ = writeln!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={},CODECS=\"{}\"",
            variant.bitrate_bps, variant.resolution, variant.codecs
        );
        let _ = writeln!(out, "{}", variant.relative_manifest_path);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, bitrate_bps: u64, resolution: &str) -> RenditionResult {
        RenditionResult {
            name: name.to_string(),
            relative_manifest_path: format!("{}/{}", name, RENDITION_MANIFEST_NAME),
            bitrate_bps,
            resolution: resolution.to_string(),
            codecs: "avc1.42c01e,mp4a.40.2".to_string(),
        }
    }

    #[test]
    fn test_exact_output() {
        let manifest = build(&[
            result("720p", 2_500_000, "1280x720"),
            result("360p", 800_000, "640x360"),
        ]);

        assert_eq!(
            manifest,
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-TARGETDURATION:10\n\
             #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,CODECS=\"avc1.42c01e,mp4a.40.2\"\n\
             360p/index.m3u8\n\
             #EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720,CODECS=\"avc1.42c01e,mp4a.40.2\"\n\
             720p/index.m3u8\n"
        );
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let a = result("360p", 800_000, "640x360");
        let b = result("720p", 2_500_000, "1280x720");
        let c = result("1080p", 5_000_000, "1920x1080");

        let first = build(&[c.clone(), a.clone(), b.clone()]);
        let second = build(&[b.clone(), c.clone(), a.clone()]);
        let third = build(&[a, b, c]);
        assert_eq!(first, second);
        assert_eq!(second, third);

        let paths: Vec<&str> = first.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(paths, vec!["360p/index.m3u8", "720p/index.m3u8", "1080p/index.m3u8"]);
    }

    #[test]
    fn test_equal_bitrates_are_ordered_by_name() {
        let one = build(&[result("b", 1_000, "2x2"), result("a", 1_000, "1x1")]);
        let two = build(&[result("a", 1_000, "1x1"), result("b", 1_000, "2x2")]);
        assert_eq!(one, two);
        assert!(one.find("a/index.m3u8").unwrap() < one.find("b/index.m3u8").unwrap());
    }

    #[test]
    fn test_empty_results_yield_header_only() {
        assert_eq!(build(&[]), "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n");
    }
}
