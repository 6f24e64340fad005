use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use regex_lite::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::encoder::{EncodeError, Encoder, OutputSpec};

const STDERR_TAIL_LINES: usize = 8;

/// Encodes with the ffmpeg CLI: libx264 + AAC into an HLS VOD playlist.
pub struct FfmpegEncoder {
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
    out_time: Regex,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_path: PathBuf, ffprobe_path: PathBuf) -> Self {
        Self {
            ffmpeg_path,
            ffprobe_path,
            out_time: Regex::new(r"^out_time_(?:ms|us)=(\d+)$").expect("static regex"),
        }
    }

    fn build_args(input: &Path, spec: &OutputSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostats".into(),
            "-y".into(),
            "-i".into(),
            input.to_string_lossy().into_owned(),
            "-vf".into(),
            format!("scale={}:{}", spec.width, spec.height),
            "-c:v".into(),
            "libx264".into(),
        ];
        if let Some(profile) = h264_profile(&spec.codecs) {
            args.extend(["-profile:v".into(), profile.into()]);
        }
        args.extend([
            "-b:v".into(),
            spec.bitrate_bps.to_string(),
            "-c:a".into(),
            "aac".into(),
            "-hls_time".into(),
            spec.segment_duration_secs.to_string(),
        ]);
        if spec.keep_all_segments {
            args.extend(["-hls_list_size".into(), "0".into()]);
        }
        args.extend([
            "-f".into(),
            "hls".into(),
            "-progress".into(),
            "pipe:2".into(),
            spec.manifest_path().to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Media position in seconds from an `-progress` line, if it carries one.
    fn parse_out_time(&self, line: &str) -> Option<f64> {
        let caps = self.out_time.captures(line.trim())?;
        let micros = caps.get(1)?.as_str().parse::<f64>().ok()?;
        Some(micros / 1_000_000.0)
    }

    /// Reads ffmpeg's stderr to the end, forwarding progress and keeping the
    /// last few diagnostic lines. Lines are decoded lossily: container
    /// metadata is printed raw and is often not UTF-8.
    async fn drain_stderr<R: AsyncBufRead + Unpin>(
        &self,
        mut reader: R,
        duration: Option<f64>,
        progress: &mpsc::Sender<f64>,
    ) -> std::io::Result<VecDeque<String>> {
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(position) = self.parse_out_time(line) {
                if let Some(total) = duration {
                    let _ = progress.try_send((position / total * 100.0).clamp(0.0, 100.0));
                }
                continue;
            }
            if line.trim() == "progress=end" {
                let _ = progress.try_send(100.0);
                continue;
            }
            if line.contains('=') && !line.contains(' ') {
                // other -progress key=value pairs
                continue;
            }
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }
        Ok(tail)
    }

    async fn probe_duration(&self, input: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(input)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|d| *d > 0.0)
    }
}

/// x264 profile matching the `avc1.PPCCLL` tag, so the stream is what the playlist claims.
fn h264_profile(codecs: &str) -> Option<&'static str> {
    let avc = codecs.split(',').map(str::trim).find(|c| c.starts_with("avc1."))?;
    match avc.get(5..7)?.to_ascii_lowercase().as_str() {
        "42" => Some("baseline"),
        "4d" => Some("main"),
        "64" => Some("high"),
        _ => None,
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn transcode(
        &self,
        input: &Path,
        spec: &OutputSpec,
        progress: mpsc::Sender<f64>,
    ) -> Result<(), EncodeError> {
        let duration = self.probe_duration(input).await;
        if duration.is_none() {
            warn!("Could not probe duration of {}, progress will stay at 0", input.display());
        }

        let args = Self::build_args(input, spec);
        debug!("ffmpeg {}", args.join(" "));

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EncodeError::NotFound {
                        path: self.ffmpeg_path.clone(),
                    }
                } else {
                    EncodeError::Io(e)
                }
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EncodeError::failed("ffmpeg stderr was not captured"))?;
        let tail = self.drain_stderr(BufReader::new(stderr), duration, &progress).await?;

        let status = child.wait().await?;
        if !status.success() {
            let detail = tail.back().cloned().unwrap_or_default();
            return Err(EncodeError::failed(format!(
                "ffmpeg exited with {}: {}",
                status, detail
            )));
        }
        Ok(())
    }
}
