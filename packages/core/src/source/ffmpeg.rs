//! FFmpeg-backed media decoding
//!
//! Writes the retrieved bytes to a scratch file, probes intrinsic metadata
//! with ffprobe, then streams raw RGBA frames from an ffmpeg child process.

use super::{FramePull, FrameStream, MediaDecoder, SourceMedia, VideoFrame};
use crate::{BackdropError, BackdropResult};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

fn ffmpeg_path() -> PathBuf {
    ffmpeg_sidecar::paths::ffmpeg_path()
}

fn ffprobe_path() -> PathBuf {
    let name = if cfg!(windows) { "ffprobe.exe" } else { "ffprobe" };
    ffmpeg_path().with_file_name(name)
}

/// Ensure ffmpeg is available, downloading it if needed.
pub fn ensure_ffmpeg() -> BackdropResult<()> {
    if ffmpeg_sidecar::command::ffmpeg_is_installed() {
        tracing::debug!("FFmpeg is already installed");
        return Ok(());
    }

    tracing::info!("FFmpeg not found, downloading...");
    ffmpeg_sidecar::download::auto_download()
        .map_err(|e| BackdropError::SourceDecode(format!("failed to download FFmpeg: {}", e)))?;

    tracing::info!("FFmpeg downloaded successfully");
    Ok(())
}

/// Probed stream metadata.
#[derive(Debug, Clone, Copy)]
struct ProbedMeta {
    width: u32,
    height: u32,
    fps: f64,
    duration: Duration,
}

async fn probe(path: &PathBuf) -> BackdropResult<ProbedMeta> {
    let output = Command::new(ffprobe_path())
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| BackdropError::SourceDecode(format!("failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        return Err(BackdropError::SourceDecode(
            "ffprobe could not read the media metadata".to_string(),
        ));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let mut width = None;
    let mut height = None;
    let mut fps = None;
    let mut duration = None;

    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "width" => width = value.trim().parse::<u32>().ok(),
            "height" => height = value.trim().parse::<u32>().ok(),
            "r_frame_rate" => fps = parse_rate(value.trim()),
            "duration" => duration = value.trim().parse::<f64>().ok(),
            _ => {}
        }
    }

    match (width, height, fps, duration) {
        (Some(width), Some(height), Some(fps), Some(secs)) if width > 0 && height > 0 => {
            Ok(ProbedMeta {
                width,
                height,
                fps,
                duration: Duration::from_secs_f64(secs.max(0.0)),
            })
        }
        _ => Err(BackdropError::SourceDecode(
            "media metadata never resolved (missing dimensions, rate, or duration)".to_string(),
        )),
    }
}

/// Parse an ffprobe rational rate like `30/1` or `30000/1001`.
fn parse_rate(value: &str) -> Option<f64> {
    if let Some((num, den)) = value.split_once('/') {
        let num = num.parse::<f64>().ok()?;
        let den = den.parse::<f64>().ok()?;
        if den == 0.0 {
            return None;
        }
        Some(num / den)
    } else {
        value.parse::<f64>().ok()
    }
}

/// Decoder backed by an ffmpeg child process per opened asset.
pub struct FfmpegDecoder {
    scratch_dir: PathBuf,
}

impl FfmpegDecoder {
    pub fn new() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_dir(scratch_dir: PathBuf) -> Self {
        Self { scratch_dir }
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MediaDecoder for FfmpegDecoder {
    async fn open(&self, bytes: Vec<u8>) -> BackdropResult<SourceMedia> {
        let path = self
            .scratch_dir
            .join(format!("backdrop-src-{}.bin", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await?;

        let meta = match probe(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        };

        let mut child = Command::new(ffmpeg_path())
            .args(["-v", "error", "-i"])
            .arg(&path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackdropError::SourceDecode(format!("failed to start FFmpeg decoder: {}", e))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            BackdropError::SourceDecode("failed to attach to FFmpeg stdout".to_string())
        })?;

        tracing::debug!(
            "Decoder started: {}x{} @ {:.2} fps, {:.2}s",
            meta.width,
            meta.height,
            meta.fps,
            meta.duration.as_secs_f64()
        );

        Ok(SourceMedia {
            width: meta.width,
            height: meta.height,
            duration: meta.duration,
            frames: Box::new(FfmpegFrameStream {
                child,
                stdout,
                width: meta.width,
                height: meta.height,
                frame_interval: Duration::from_secs_f64(1.0 / meta.fps.max(1.0)),
                frame_index: 0,
                scratch_path: path,
                done: false,
            }),
        })
    }
}

struct FfmpegFrameStream {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    frame_interval: Duration,
    frame_index: u64,
    scratch_path: PathBuf,
    done: bool,
}

#[async_trait::async_trait]
impl FrameStream for FfmpegFrameStream {
    async fn next_frame(&mut self) -> BackdropResult<FramePull> {
        if self.done {
            return Ok(FramePull::EndOfStream);
        }

        let frame_size = (self.width * self.height * 4) as usize;
        let mut data = vec![0u8; frame_size];

        match self.stdout.read_exact(&mut data).await {
            Ok(_) => {
                let timestamp = self.frame_interval * self.frame_index as u32;
                self.frame_index += 1;
                Ok(FramePull::Frame(VideoFrame {
                    data,
                    width: self.width,
                    height: self.height,
                    timestamp,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.done = true;
                let _ = self.child.wait().await;
                tracing::debug!("Decoder reached end of stream after {} frames", self.frame_index);
                Ok(FramePull::EndOfStream)
            }
            Err(e) => Err(BackdropError::SourceDecode(format!(
                "decode read failed: {}",
                e
            ))),
        }
    }
}

impl Drop for FfmpegFrameStream {
    fn drop(&mut self) {
        // kill_on_drop covers the child; the scratch file we clean ourselves.
        let _ = std::fs::remove_file(&self.scratch_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_parsing() {
        assert_eq!(parse_rate("30/1"), Some(30.0));
        assert_eq!(parse_rate("30000/1001").map(|f| (f * 100.0).round()), Some(2997.0));
        assert_eq!(parse_rate("25"), Some(25.0));
        assert_eq!(parse_rate("30/0"), None);
        assert_eq!(parse_rate("abc"), None);
    }
}
