//! Stub capture sink and support probe for tests
//!
//! Deterministic replacements for the ffmpeg-backed implementations so the
//! whole pipeline can run in tests without any encoder installed.

use super::{CaptureSettings, CaptureSink, CaptureSinkFactory, EncodedChunk, EncoderSupport, EncodingFormat};
use crate::compositor::Canvas;
use crate::{BackdropError, BackdropResult};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Support probe answering from a fixed mime list.
pub struct FixedSupport {
    supported: Vec<&'static str>,
}

impl FixedSupport {
    pub fn all() -> Self {
        Self {
            supported: super::NEGOTIATION_ORDER.iter().map(|f| f.mime_type).collect(),
        }
    }

    pub fn none() -> Self {
        Self { supported: vec![] }
    }

    pub fn only(mimes: &[&'static str]) -> Self {
        Self {
            supported: mimes.to_vec(),
        }
    }
}

impl EncoderSupport for FixedSupport {
    fn is_supported(&self, format: &EncodingFormat) -> bool {
        self.supported.contains(&format.mime_type)
    }
}

/// Shared observation point for sinks created by one [`StubSinkFactory`].
#[derive(Debug, Default)]
pub struct SinkStats {
    pub starts: AtomicU32,
    pub frames: AtomicU64,
    pub finishes: AtomicU32,
}

/// Factory producing deterministic in-memory sinks.
pub struct StubSinkFactory {
    stats: Arc<SinkStats>,
    fail_start: bool,
}

impl StubSinkFactory {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(SinkStats::default()),
            fail_start: false,
        }
    }

    /// Every created sink fails at start, simulating an unsupported stream.
    pub fn failing_start() -> Self {
        Self {
            stats: Arc::new(SinkStats::default()),
            fail_start: true,
        }
    }

    pub fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for StubSinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSinkFactory for StubSinkFactory {
    fn create(&self) -> Box<dyn CaptureSink> {
        Box::new(StubCaptureSink {
            stats: Arc::clone(&self.stats),
            fail_start: self.fail_start,
            started: false,
            frame_index: 0,
            pending: Vec::new(),
        })
    }
}

/// Sink emitting one small deterministic chunk per recorded frame and a
/// trailer chunk on finish.
pub struct StubCaptureSink {
    stats: Arc<SinkStats>,
    fail_start: bool,
    started: bool,
    frame_index: u64,
    pending: Vec<EncodedChunk>,
}

#[async_trait::async_trait]
impl CaptureSink for StubCaptureSink {
    async fn start(&mut self, settings: &CaptureSettings) -> BackdropResult<()> {
        if self.fail_start {
            return Err(BackdropError::CaptureStart(format!(
                "stream type {} rejected",
                settings.format.mime_type
            )));
        }
        self.started = true;
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_frame(&mut self, canvas: &Canvas) -> BackdropResult<()> {
        if !self.started {
            return Err(BackdropError::CaptureStart("sink not started".into()));
        }

        // Chunk payload: frame index plus the surface's first pixel, enough
        // to assert ordering and content in tests.
        let mut data = self.frame_index.to_be_bytes().to_vec();
        data.extend_from_slice(&canvas.pixels()[0..4]);
        self.pending.push(EncodedChunk(data));

        self.frame_index += 1;
        self.stats.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn poll_chunks(&mut self) -> Vec<EncodedChunk> {
        std::mem::take(&mut self.pending)
    }

    async fn finish(&mut self) -> BackdropResult<Vec<EncodedChunk>> {
        self.started = false;
        self.stats.finishes.fetch_add(1, Ordering::SeqCst);
        let mut remaining = std::mem::take(&mut self.pending);
        remaining.push(EncodedChunk(b"EOS".to_vec()));
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureFinalizer, CAPTURE_FRAME_RATE};

    #[tokio::test]
    async fn stub_sink_records_and_finalizes() {
        let factory = StubSinkFactory::new();
        let stats = factory.stats();

        let mut finalizer = CaptureFinalizer::start(&FixedSupport::all(), &factory, 4, 4)
            .await
            .unwrap();
        assert_eq!(finalizer.format().media_type, "video/webm");

        let canvas = Canvas::new(4, 4);
        finalizer.record_frame(&canvas).await.unwrap();
        finalizer.record_frame(&canvas).await.unwrap();

        let artifact = finalizer.finalize().await.unwrap();
        assert!(artifact.data.ends_with(b"EOS"));
        assert_eq!(stats.frames.load(Ordering::SeqCst), 2);
        assert_eq!(stats.finishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fast_media_coalesces_onto_the_capture_grid() {
        let factory = StubSinkFactory::new();
        let mut finalizer = CaptureFinalizer::start(&FixedSupport::all(), &factory, 4, 4)
            .await
            .unwrap();

        // One second of 60 fps media: only every other frame lands on a
        // 30 fps tick.
        let canvas = Canvas::new(4, 4);
        for i in 0..60u32 {
            let t = std::time::Duration::from_secs_f64(i as f64 / 60.0);
            finalizer.record_frame_at(&canvas, t).await.unwrap();
        }
        assert_eq!(finalizer.frames_written(), 30);
    }

    #[tokio::test]
    async fn slow_media_is_duplicated_onto_the_capture_grid() {
        let factory = StubSinkFactory::new();
        let mut finalizer = CaptureFinalizer::start(&FixedSupport::all(), &factory, 4, 4)
            .await
            .unwrap();

        // One second of 10 fps media covers the grid ticks in [0, 0.9]:
        // tick zero plus the 27 ticks up to the last timestamp.
        let canvas = Canvas::new(4, 4);
        for i in 0..10u32 {
            let t = std::time::Duration::from_secs_f64(i as f64 / 10.0);
            finalizer.record_frame_at(&canvas, t).await.unwrap();
        }
        assert_eq!(finalizer.frames_written(), 28);
    }

    #[tokio::test]
    async fn failing_start_is_a_capture_start_error() {
        let factory = StubSinkFactory::failing_start();
        let err = CaptureFinalizer::start(&FixedSupport::all(), &factory, 4, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, BackdropError::CaptureStart(_)));
    }

    #[test]
    fn capture_rate_is_fixed_at_thirty() {
        assert_eq!(CAPTURE_FRAME_RATE, 30);
    }
}
