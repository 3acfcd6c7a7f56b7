//! Frame compositing
//!
//! Drives the per-frame render: clear the surface, apply the background
//! paint, alpha-over the decoded frame at full canvas bounds, and report
//! playback progress. The draw loop is clocked by the media's own frame
//! timestamps, never by wall time, so the captured output duration matches
//! the source duration.

use crate::background::Color;
use crate::source::{BackgroundImage, FramePull, VideoFrame};
use crate::{BackdropError, BackdropResult};
use std::time::Duration;

/// Paint with any referenced image already materialized to pixels.
#[derive(Debug, Clone)]
pub enum PreparedPaint {
    None,
    Fill(Color),
    Image(BackgroundImage),
}

/// RGBA drawing surface owned by the active export job.
#[derive(Debug, Clone)]
pub struct Canvas {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; (width * height * 4) as usize],
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    fn clear(&mut self) {
        self.data.fill(0);
    }

    fn fill(&mut self, color: Color) {
        for px in self.data.chunks_exact_mut(4) {
            px[0] = color.r;
            px[1] = color.g;
            px[2] = color.b;
            px[3] = 255;
        }
    }

    fn draw_cover_image(&mut self, image: &BackgroundImage) {
        for y in 0..self.height {
            for x in 0..self.width {
                let src = image.sample_cover(x, y, self.width, self.height);
                let idx = ((y * self.width + x) * 4) as usize;
                self.data[idx..idx + 4].copy_from_slice(&src);
                self.data[idx + 3] = 255;
            }
        }
    }

    /// Alpha-over the frame across the full canvas bounds.
    ///
    /// Frames whose dimensions differ from the canvas are sampled
    /// nearest-neighbor, matching a full-bounds draw of the source.
    fn overlay_frame(&mut self, frame: &VideoFrame) -> BackdropResult<()> {
        let expected = (frame.width as usize) * (frame.height as usize) * 4;
        if frame.data.len() != expected {
            return Err(BackdropError::Composite(format!(
                "frame buffer is {} bytes, expected {} for {}x{}",
                frame.data.len(),
                expected,
                frame.width,
                frame.height
            )));
        }

        let x_ratio = frame.width as f32 / self.width as f32;
        let y_ratio = frame.height as f32 / self.height as f32;

        for y in 0..self.height {
            for x in 0..self.width {
                let sx = ((x as f32 * x_ratio) as u32).min(frame.width - 1);
                let sy = ((y as f32 * y_ratio) as u32).min(frame.height - 1);

                let src_idx = ((sy * frame.width + sx) * 4) as usize;
                let dst_idx = ((y * self.width + x) * 4) as usize;

                let src_a = frame.data[src_idx + 3];
                match src_a {
                    255 => {
                        self.data[dst_idx..dst_idx + 4]
                            .copy_from_slice(&frame.data[src_idx..src_idx + 4]);
                    }
                    0 => {}
                    _ => {
                        let sa = src_a as f32 / 255.0;
                        let da = self.data[dst_idx + 3] as f32 / 255.0;
                        let out_a = sa + da * (1.0 - sa);
                        if out_a > 0.0 {
                            for c in 0..3 {
                                let sc = frame.data[src_idx + c] as f32 / 255.0;
                                let dc = self.data[dst_idx + c] as f32 / 255.0;
                                let out = (sc * sa + dc * da * (1.0 - sa)) / out_a;
                                self.data[dst_idx + c] = (out * 255.0) as u8;
                            }
                            self.data[dst_idx + 3] = (out_a * 255.0) as u8;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Playback progress as a percentage, clamped to `[0, 100]`.
///
/// A zero total duration reports 0 rather than dividing by zero.
pub fn progress_percent(current: Duration, total: Duration) -> f32 {
    if total.is_zero() {
        return 0.0;
    }
    ((current.as_secs_f64() / total.as_secs_f64()) * 100.0).clamp(0.0, 100.0) as f32
}

/// Compositor state, driven by the source media's playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositorState {
    /// Canvas dimensioned, nothing drawn yet.
    Armed,
    Running,
    /// End of stream reached; terminal.
    Stopped,
}

/// Outcome of one compositing tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tick {
    /// Frame drawn; carries its media timestamp and the playback progress
    /// to publish.
    Drawn { progress: f32, timestamp: Duration },
    /// Frame not ready yet; tick skipped, retry on the next one.
    Skipped,
    /// End of stream.
    Finished,
}

/// Per-frame compositor over a canvas sized to the source's intrinsic
/// dimensions.
#[derive(Debug)]
pub struct FrameCompositor {
    canvas: Canvas,
    paint: PreparedPaint,
    total_duration: Duration,
    state: CompositorState,
}

impl FrameCompositor {
    pub fn new(width: u32, height: u32, paint: PreparedPaint, total_duration: Duration) -> Self {
        Self {
            canvas: Canvas::new(width, height),
            paint,
            total_duration,
            state: CompositorState::Armed,
        }
    }

    pub fn state(&self) -> CompositorState {
        self.state
    }

    /// The live drawing surface the capture sink records from.
    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    /// Process one playback tick.
    ///
    /// Clears, paints the background, overlays the frame, and computes
    /// progress. `NotReady` pulls are skipped silently; a non-transient
    /// draw fault aborts with a compositing error.
    pub fn composite(&mut self, pull: &FramePull) -> BackdropResult<Tick> {
        match pull {
            FramePull::NotReady => {
                tracing::debug!("Frame not ready, skipping tick");
                Ok(Tick::Skipped)
            }
            FramePull::EndOfStream => {
                self.state = CompositorState::Stopped;
                Ok(Tick::Finished)
            }
            FramePull::Frame(frame) => {
                self.state = CompositorState::Running;

                self.canvas.clear();
                match &self.paint {
                    PreparedPaint::None => {}
                    PreparedPaint::Fill(color) => self.canvas.fill(*color),
                    PreparedPaint::Image(image) => self.canvas.draw_cover_image(image),
                }
                self.canvas.overlay_frame(frame)?;

                Ok(Tick::Drawn {
                    progress: progress_percent(frame.timestamp, self.total_duration),
                    timestamp: frame.timestamp,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opaque_frame(width: u32, height: u32, rgba: [u8; 4], timestamp: Duration) -> VideoFrame {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..(width * height) {
            data.extend_from_slice(&rgba);
        }
        VideoFrame {
            data,
            width,
            height,
            timestamp,
        }
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(
            progress_percent(Duration::from_secs(2), Duration::from_secs(4)),
            50.0
        );
        assert_eq!(
            progress_percent(Duration::from_secs(9), Duration::from_secs(4)),
            100.0
        );
    }

    #[test]
    fn zero_duration_reports_zero() {
        assert_eq!(progress_percent(Duration::from_secs(1), Duration::ZERO), 0.0);
    }

    #[test]
    fn not_ready_tick_is_skipped_silently() {
        let mut comp = FrameCompositor::new(
            8,
            8,
            PreparedPaint::Fill(Color::rgb(0, 255, 0)),
            Duration::from_secs(1),
        );
        assert_eq!(comp.composite(&FramePull::NotReady).unwrap(), Tick::Skipped);
        assert_eq!(comp.state(), CompositorState::Armed);
    }

    #[test]
    fn end_of_stream_stops() {
        let mut comp =
            FrameCompositor::new(8, 8, PreparedPaint::None, Duration::from_secs(1));
        assert_eq!(comp.composite(&FramePull::EndOfStream).unwrap(), Tick::Finished);
        assert_eq!(comp.state(), CompositorState::Stopped);
    }

    #[test]
    fn transparent_frame_shows_fill_paint() {
        let mut comp = FrameCompositor::new(
            4,
            4,
            PreparedPaint::Fill(Color::rgb(0, 255, 0)),
            Duration::from_secs(1),
        );
        let frame = opaque_frame(4, 4, [10, 20, 30, 0], Duration::ZERO);
        comp.composite(&FramePull::Frame(frame)).unwrap();

        let px = &comp.canvas().pixels()[0..4];
        assert_eq!(px, &[0, 255, 0, 255]);
    }

    #[test]
    fn opaque_frame_covers_paint() {
        let mut comp = FrameCompositor::new(
            4,
            4,
            PreparedPaint::Fill(Color::rgb(0, 255, 0)),
            Duration::from_secs(1),
        );
        let frame = opaque_frame(4, 4, [10, 20, 30, 255], Duration::ZERO);
        comp.composite(&FramePull::Frame(frame)).unwrap();

        let px = &comp.canvas().pixels()[0..4];
        assert_eq!(px, &[10, 20, 30, 255]);
    }

    #[test]
    fn partial_alpha_blends_over_background() {
        let mut comp = FrameCompositor::new(
            1,
            1,
            PreparedPaint::Fill(Color::rgb(0, 0, 0)),
            Duration::from_secs(1),
        );
        // 50% white over black ≈ mid gray.
        let frame = opaque_frame(1, 1, [255, 255, 255, 128], Duration::ZERO);
        comp.composite(&FramePull::Frame(frame)).unwrap();

        let px = comp.canvas().pixels();
        assert!(px[0] > 120 && px[0] < 135, "got {}", px[0]);
        assert_eq!(px[3], 255);
    }

    #[test]
    fn frame_is_scaled_to_canvas_bounds() {
        let mut comp =
            FrameCompositor::new(8, 8, PreparedPaint::None, Duration::from_secs(1));
        let frame = opaque_frame(2, 2, [200, 100, 50, 255], Duration::ZERO);
        comp.composite(&FramePull::Frame(frame)).unwrap();

        // Every canvas pixel received the frame color.
        for px in comp.canvas().pixels().chunks_exact(4) {
            assert_eq!(px, &[200, 100, 50, 255]);
        }
    }

    #[test]
    fn corrupt_frame_buffer_is_a_composite_error() {
        let mut comp =
            FrameCompositor::new(4, 4, PreparedPaint::None, Duration::from_secs(1));
        let frame = VideoFrame {
            data: vec![0u8; 7],
            width: 4,
            height: 4,
            timestamp: Duration::ZERO,
        };
        let err = comp.composite(&FramePull::Frame(frame)).unwrap_err();
        assert!(matches!(err, BackdropError::Composite(_)));
    }

    #[test]
    fn drawn_tick_reports_media_time_progress() {
        let mut comp =
            FrameCompositor::new(2, 2, PreparedPaint::None, Duration::from_secs(4));
        let frame = opaque_frame(2, 2, [1, 2, 3, 255], Duration::from_secs(1));
        match comp.composite(&FramePull::Frame(frame)).unwrap() {
            Tick::Drawn {
                progress,
                timestamp,
            } => {
                assert_eq!(progress, 25.0);
                assert_eq!(timestamp, Duration::from_secs(1));
            }
            other => panic!("unexpected tick: {other:?}"),
        }
        assert_eq!(comp.state(), CompositorState::Running);
    }
}
