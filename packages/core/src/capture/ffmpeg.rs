//! FFmpeg-backed capture sink and encoder support probe
//!
//! The sink feeds raw RGBA surface pixels to an ffmpeg child over stdin
//! and streams the negotiated container back from stdout; a reader task
//! forwards the encoded bytes as ordered chunks.

use super::{CaptureSettings, CaptureSink, CaptureSinkFactory, EncodedChunk, EncoderSupport, EncodingFormat};
use crate::compositor::Canvas;
use crate::{BackdropError, BackdropResult};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

fn ffmpeg_path() -> PathBuf {
    ffmpeg_sidecar::paths::ffmpeg_path()
}

/// Encoder name needed for a negotiation candidate.
fn required_encoder(format: &EncodingFormat) -> &'static str {
    match format.mime_type {
        "video/webm; codecs=vp9" => "libvpx-vp9",
        "video/webm; codecs=vp8" | "video/webm" => "libvpx",
        _ => "libx264",
    }
}

/// Probes the installed ffmpeg's encoder list once and answers support
/// queries from it.
pub struct FfmpegEncoderSupport {
    encoder_list: String,
}

impl FfmpegEncoderSupport {
    pub fn detect() -> BackdropResult<Self> {
        let output = std::process::Command::new(ffmpeg_path())
            .args(["-hide_banner", "-encoders"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| BackdropError::CaptureStart(format!("failed to probe encoders: {}", e)))?;

        if !output.status.success() {
            return Err(BackdropError::CaptureStart(
                "encoder probe exited with failure".to_string(),
            ));
        }

        Ok(Self {
            encoder_list: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

impl EncoderSupport for FfmpegEncoderSupport {
    fn is_supported(&self, format: &EncodingFormat) -> bool {
        let name = required_encoder(format);
        self.encoder_list
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(name))
    }
}

/// Factory for ffmpeg capture sinks.
pub struct FfmpegSinkFactory;

impl CaptureSinkFactory for FfmpegSinkFactory {
    fn create(&self) -> Box<dyn CaptureSink> {
        Box::new(FfmpegCaptureSink::new())
    }
}

/// Capture sink writing rawvideo frames to ffmpeg and chunking its encoded
/// stdout stream.
pub struct FfmpegCaptureSink {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    chunk_rx: Option<mpsc::UnboundedReceiver<EncodedChunk>>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl FfmpegCaptureSink {
    pub fn new() -> Self {
        Self {
            child: None,
            stdin: None,
            chunk_rx: None,
            reader: None,
        }
    }
}

impl Default for FfmpegCaptureSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CaptureSink for FfmpegCaptureSink {
    async fn start(&mut self, settings: &CaptureSettings) -> BackdropResult<()> {
        let encoder = required_encoder(&settings.format);

        let mut cmd = Command::new(ffmpeg_path());
        cmd.args([
            "-v",
            "error",
            "-f",
            "rawvideo",
            "-pixel_format",
            "rgba",
            "-video_size",
            &format!("{}x{}", settings.width, settings.height),
            "-framerate",
            &settings.frame_rate.to_string(),
            "-i",
            "pipe:0",
            "-c:v",
            encoder,
        ]);

        // vpx keeps the alpha plane; mp4 gets the universally playable
        // pixel format instead.
        if settings.format.container == "webm" {
            cmd.args(["-pix_fmt", "yuva420p", "-auto-alt-ref", "0"]);
        } else {
            cmd.args(["-pix_fmt", "yuv420p"]);
            // mp4 over a pipe must be fragmented.
            cmd.args(["-movflags", "frag_keyframe+empty_moov"]);
        }

        cmd.args(["-f", settings.format.container, "pipe:1"]);

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackdropError::CaptureStart(format!("failed to start FFmpeg: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackdropError::CaptureStart("failed to open FFmpeg stdin".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackdropError::CaptureStart("failed to open FFmpeg stdout".into()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(EncodedChunk(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tracing::debug!(
            "Capture encoder started: {} ({} {}x{})",
            encoder,
            settings.format.container,
            settings.width,
            settings.height
        );

        self.child = Some(child);
        self.stdin = Some(stdin);
        self.chunk_rx = Some(rx);
        self.reader = Some(reader);
        Ok(())
    }

    async fn write_frame(&mut self, canvas: &Canvas) -> BackdropResult<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| BackdropError::CaptureStart("capture not started".into()))?;

        stdin
            .write_all(canvas.pixels())
            .await
            .map_err(|e| BackdropError::Composite(format!("failed to write frame: {}", e)))?;
        Ok(())
    }

    fn poll_chunks(&mut self) -> Vec<EncodedChunk> {
        let mut out = Vec::new();
        if let Some(rx) = self.chunk_rx.as_mut() {
            while let Ok(chunk) = rx.try_recv() {
                out.push(chunk);
            }
        }
        out
    }

    async fn finish(&mut self) -> BackdropResult<Vec<EncodedChunk>> {
        // Closing stdin signals end of input.
        drop(self.stdin.take());

        if let Some(mut child) = self.child.take() {
            let status = child
                .wait()
                .await
                .map_err(|e| BackdropError::Composite(format!("FFmpeg wait failed: {}", e)))?;
            if !status.success() {
                return Err(BackdropError::Composite(format!(
                    "FFmpeg exited with status {}",
                    status
                )));
            }
        }

        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }

        let mut remaining = Vec::new();
        if let Some(mut rx) = self.chunk_rx.take() {
            rx.close();
            while let Ok(chunk) = rx.try_recv() {
                remaining.push(chunk);
            }
        }
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_mapping_follows_negotiation_order() {
        let names: Vec<_> = crate::capture::NEGOTIATION_ORDER
            .iter()
            .map(required_encoder)
            .collect();
        assert_eq!(names, ["libvpx-vp9", "libvpx", "libvpx", "libx264"]);
    }

    #[test]
    fn support_probe_parses_encoder_lines() {
        let support = FfmpegEncoderSupport {
            encoder_list: " V....D libvpx-vp9           libvpx VP9 encoder\n \
                           V....D libx264              H.264 encoder\n"
                .to_string(),
        };
        assert!(support.is_supported(&crate::capture::NEGOTIATION_ORDER[0]));
        assert!(!support.is_supported(&crate::capture::NEGOTIATION_ORDER[1]));
        assert!(support.is_supported(&crate::capture::NEGOTIATION_ORDER[3]));
    }
}
