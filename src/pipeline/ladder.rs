//! The bitrate ladder: which renditions every job produces.

use serde::Serialize;
use thiserror::Error;

/// H.264 video + AAC audio.
pub const DEFAULT_CODECS: &str = "avc1.42c01e,mp4a.40.2";

/// Seconds of media per HLS segment.
pub const SEGMENT_DURATION_SECS: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LadderError {
    #[error("the ladder must contain at least one rendition")]
    Empty,

    #[error("malformed rendition entry '{0}' (expected name:WIDTHxHEIGHT:bitrate)")]
    Malformed(String),

    #[error("invalid resolution '{0}'")]
    Resolution(String),

    #[error("invalid bitrate '{0}'")]
    Bitrate(String),

    #[error("duplicate rendition name '{0}'")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenditionSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u64,
}

impl RenditionSpec {
    pub fn new(name: &str, width: u32, height: u32, bitrate_bps: u64) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            bitrate_bps,
        }
    }

    /// `WIDTHxHEIGHT`, the form both ffmpeg and the manifest expect.
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    fn parse(entry: &str) -> Result<Self, LadderError> {
        let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
        let [name, size, bitrate] = parts.as_slice() else {
            return Err(LadderError::Malformed(entry.to_string()));
        };
        if name.is_empty() || name.contains('/') {
            return Err(LadderError::Malformed(entry.to_string()));
        }

        let (w, h) = size
            .split_once(['x', 'X'])
            .ok_or_else(|| LadderError::Resolution(size.to_string()))?;
        let width = w.parse::<u32>().ok().filter(|v| *v > 0);
        let height = h.parse::<u32>().ok().filter(|v| *v > 0);
        let (Some(width), Some(height)) = (width, height) else {
            return Err(LadderError::Resolution(size.to_string()));
        };

        Ok(Self::new(name, width, height, parse_bitrate(bitrate)?))
    }
}

/// Parses `800k`, `2.5M` or a plain bits-per-second integer.
pub fn parse_bitrate(raw: &str) -> Result<u64, LadderError> {
    let err = || LadderError::Bitrate(raw.to_string());
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last() {
        Some('k' | 'K') => (&raw[..raw.len() - 1], 1_000.0),
        Some('m' | 'M') => (&raw[..raw.len() - 1], 1_000_000.0),
        _ => (raw, 1.0),
    };
    let value = digits.parse::<f64>().map_err(|_| err())?;
    if !value.is_finite() || value <= 0.0 {
        return Err(err());
    }
    Ok((value * multiplier).round() as u64)
}

/// Ordered, non-empty and immutable once built. Shared read-only by every worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ladder {
    renditions: Vec<RenditionSpec>,
    codecs: String,
}

impl Ladder {
    pub fn new(renditions: Vec<RenditionSpec>, codecs: &str) -> Result<Self, LadderError> {
        if renditions.is_empty() {
            return Err(LadderError::Empty);
        }
        for (i, r) in renditions.iter().enumerate() {
            if renditions[..i].iter().any(|other| other.name == r.name) {
                return Err(LadderError::Duplicate(r.name.clone()));
            }
        }
        Ok(Self {
            renditions,
            codecs: codecs.to_string(),
        })
    }

    /// 360p / 720p / 1080p.
    pub fn standard(codecs: &str) -> Self {
        Self {
            renditions: vec![
                RenditionSpec::new("360p", 640, 360, 800_000),
                RenditionSpec::new("720p", 1280, 720, 2_500_000),
                RenditionSpec::new("1080p", 1920, 1080, 5_000_000),
            ],
            codecs: codecs.to_string(),
        }
    }

    /// Parses `name:WxH:bitrate` entries separated by commas.
    pub fn parse(raw: &str, codecs: &str) -> Result<Self, LadderError> {
        let renditions = raw
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(RenditionSpec::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(renditions, codecs)
    }

    pub fn renditions(&self) -> &[RenditionSpec] {
        &self.renditions
    }

    pub fn len(&self) -> usize {
        self.renditions.len()
    }

    pub fn codecs(&self) -> &str {
        &self.codecs
    }
}
