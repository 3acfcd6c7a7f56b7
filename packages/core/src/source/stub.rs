//! Stub media source for tests and development
//!
//! Generates deterministic gradient frames without any decoder, so the
//! pipeline can run end to end with no ffmpeg installed.

use super::{FramePull, FrameStream, MediaLoader, SourceMedia, SourceRef, VideoFrame};
use crate::{BackdropError, BackdropResult};
use std::time::Duration;

/// Configuration for synthetic source media.
#[derive(Debug, Clone)]
pub struct StubSourceConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub duration: Duration,
    /// `NotReady` pulls reported before the first frame, simulating a
    /// decoder that has not produced its first frame yet.
    pub warmup_ticks: u32,
    /// Foreground alpha written into every generated pixel.
    pub alpha: u8,
}

impl Default for StubSourceConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 36,
            frame_rate: 30,
            duration: Duration::from_secs(2),
            warmup_ticks: 0,
            alpha: 255,
        }
    }
}

impl StubSourceConfig {
    pub fn total_frames(&self) -> u64 {
        (self.duration.as_secs_f64() * self.frame_rate as f64).round() as u64
    }

    /// Build fresh source media from this configuration.
    pub fn into_media(self) -> SourceMedia {
        SourceMedia {
            width: self.width,
            height: self.height,
            duration: self.duration,
            frames: Box::new(StubFrameStream {
                remaining_warmup: self.warmup_ticks,
                config: self,
                next_index: 0,
            }),
        }
    }
}

struct StubFrameStream {
    config: StubSourceConfig,
    next_index: u64,
    remaining_warmup: u32,
}

impl StubFrameStream {
    fn generate_frame(&self, index: u64) -> VideoFrame {
        let (width, height) = (self.config.width, self.config.height);
        let mut data = vec![0u8; (width * height * 4) as usize];

        for y in 0..height {
            for x in 0..width {
                let idx = ((y * width + x) * 4) as usize;
                data[idx] = ((x as f32 / width as f32) * 255.0) as u8;
                data[idx + 1] = ((y as f32 / height as f32) * 255.0) as u8;
                data[idx + 2] = (index % 256) as u8;
                data[idx + 3] = self.config.alpha;
            }
        }

        VideoFrame {
            data,
            width,
            height,
            timestamp: Duration::from_secs_f64(index as f64 / self.config.frame_rate as f64),
        }
    }
}

#[async_trait::async_trait]
impl FrameStream for StubFrameStream {
    async fn next_frame(&mut self) -> BackdropResult<FramePull> {
        // Each pull is a suspension point, like a real decoder read.
        tokio::task::yield_now().await;

        if self.remaining_warmup > 0 {
            self.remaining_warmup -= 1;
            return Ok(FramePull::NotReady);
        }

        if self.next_index >= self.config.total_frames() {
            return Ok(FramePull::EndOfStream);
        }

        let frame = self.generate_frame(self.next_index);
        self.next_index += 1;
        Ok(FramePull::Frame(frame))
    }
}

/// Loader returning synthetic media regardless of the reference.
pub struct StubLoader {
    config: StubSourceConfig,
}

impl StubLoader {
    pub fn new(config: StubSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl MediaLoader for StubLoader {
    async fn load(&self, _source: &SourceRef) -> BackdropResult<SourceMedia> {
        Ok(self.config.clone().into_media())
    }
}

/// Loader that always fails, for exercising the failure paths.
pub struct FailingLoader {
    message: String,
}

impl FailingLoader {
    pub fn http_status(status: u16, reason: &str) -> Self {
        Self {
            message: format!("HTTP {} {}", status, reason),
        }
    }
}

#[async_trait::async_trait]
impl MediaLoader for FailingLoader {
    async fn load(&self, _source: &SourceRef) -> BackdropResult<SourceMedia> {
        Err(BackdropError::SourceFetch(self.message.clone()))
    }
}
