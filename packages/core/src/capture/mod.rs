//! Capture and encode finalization
//!
//! Attaches a capture sink to the compositor's drawing surface, negotiates
//! an output encoding from a fixed preference order, accumulates the
//! encoded chunks in emit order, and concatenates them exactly once into
//! the deliverable artifact when the source reaches end of stream.

use crate::compositor::Canvas;
use crate::{BackdropError, BackdropResult};
use std::time::Duration;

#[cfg(feature = "encoding")]
pub mod ffmpeg;
pub mod stub;

/// Capture frame rate, fixed for every export.
pub const CAPTURE_FRAME_RATE: u32 = 30;

/// A candidate output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingFormat {
    /// Full mime string including codec parameters.
    pub mime_type: &'static str,
    /// Primary media type the finished artifact is tagged with.
    pub media_type: &'static str,
    /// Container name as the encoder understands it.
    pub container: &'static str,
}

/// Negotiation preference order: most alpha-compatible first, most
/// universally playable last.
pub const NEGOTIATION_ORDER: [EncodingFormat; 4] = [
    EncodingFormat {
        mime_type: "video/webm; codecs=vp9",
        media_type: "video/webm",
        container: "webm",
    },
    EncodingFormat {
        mime_type: "video/webm; codecs=vp8",
        media_type: "video/webm",
        container: "webm",
    },
    EncodingFormat {
        mime_type: "video/webm",
        media_type: "video/webm",
        container: "webm",
    },
    EncodingFormat {
        mime_type: "video/mp4",
        media_type: "video/mp4",
        container: "mp4",
    },
];

/// Reports which encodings the runtime can actually produce.
pub trait EncoderSupport: Send + Sync {
    fn is_supported(&self, format: &EncodingFormat) -> bool;
}

/// Select the first supported encoding from the preference order.
pub fn negotiate_format(support: &dyn EncoderSupport) -> BackdropResult<EncodingFormat> {
    for format in &NEGOTIATION_ORDER {
        if support.is_supported(format) {
            tracing::debug!("Negotiated output encoding: {}", format.mime_type);
            return Ok(*format);
        }
    }
    Err(BackdropError::NoSupportedEncoding)
}

/// One encoded binary fragment as emitted by the capture sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk(pub Vec<u8>);

/// Ordered, append-only accumulator of encoded chunks.
///
/// Concatenation consumes the sequence, so nothing can be appended after
/// finalization.
#[derive(Debug, Default)]
pub struct ChunkSequence {
    chunks: Vec<EncodedChunk>,
}

impl ChunkSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: EncodedChunk) {
        if !chunk.0.is_empty() {
            self.chunks.push(chunk);
        }
    }

    pub fn extend(&mut self, chunks: impl IntoIterator<Item = EncodedChunk>) {
        for chunk in chunks {
            self.append(chunk);
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Concatenate all chunks, in emit order, into one buffer.
    pub fn concatenate(self) -> Vec<u8> {
        let total: usize = self.chunks.iter().map(|c| c.0.len()).sum();
        let mut out = Vec::with_capacity(total);
        for chunk in self.chunks {
            out.extend_from_slice(&chunk.0);
        }
        out
    }
}

/// The finished deliverable: one self-contained encoded binary blob.
#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub data: Vec<u8>,
    pub media_type: String,
}

/// Stream parameters handed to a capture sink at start.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub format: EncodingFormat,
}

/// Real-time capture sink over the drawing surface.
///
/// Chunks must be surfaced in the order they are produced; the sink never
/// reorders or drops them.
#[async_trait::async_trait]
pub trait CaptureSink: Send {
    /// Begin capture. Failure here is a capture-start error.
    async fn start(&mut self, settings: &CaptureSettings) -> BackdropResult<()>;

    /// Record the surface's current pixels as the next frame.
    async fn write_frame(&mut self, canvas: &Canvas) -> BackdropResult<()>;

    /// Chunks emitted since the last poll, in emit order.
    fn poll_chunks(&mut self) -> Vec<EncodedChunk>;

    /// Signal end of stream and flush; returns any remaining chunks.
    async fn finish(&mut self) -> BackdropResult<Vec<EncodedChunk>>;
}

/// Creates one sink per export job.
pub trait CaptureSinkFactory: Send + Sync {
    fn create(&self) -> Box<dyn CaptureSink>;
}

/// Owns a sink plus the accumulated chunk sequence for one job, and turns
/// them into the final artifact exactly once.
pub struct CaptureFinalizer {
    sink: Box<dyn CaptureSink>,
    chunks: ChunkSequence,
    format: EncodingFormat,
    frames_written: u64,
}

impl std::fmt::Debug for CaptureFinalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureFinalizer")
            .field("format", &self.format)
            .field("frames_written", &self.frames_written)
            .finish_non_exhaustive()
    }
}

impl CaptureFinalizer {
    /// Negotiate an encoding and start capture over the given surface.
    pub async fn start(
        support: &dyn EncoderSupport,
        factory: &dyn CaptureSinkFactory,
        width: u32,
        height: u32,
    ) -> BackdropResult<Self> {
        let format = negotiate_format(support)?;
        let settings = CaptureSettings {
            width,
            height,
            frame_rate: CAPTURE_FRAME_RATE,
            format,
        };

        let mut sink = factory.create();
        sink.start(&settings).await?;

        tracing::info!(
            "Capture started: {}x{} @ {} fps as {}",
            width,
            height,
            CAPTURE_FRAME_RATE,
            format.mime_type
        );

        Ok(Self {
            sink,
            chunks: ChunkSequence::new(),
            format,
            frames_written: 0,
        })
    }

    pub fn format(&self) -> EncodingFormat {
        self.format
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Capture the surface's current pixels and collect any chunks the
    /// encoder emitted meanwhile.
    pub async fn record_frame(&mut self, canvas: &Canvas) -> BackdropResult<()> {
        self.sink.write_frame(canvas).await?;
        self.frames_written += 1;
        self.chunks.extend(self.sink.poll_chunks());
        Ok(())
    }

    /// Media time of the next unrecorded capture tick on the fixed
    /// 30 fps grid.
    fn next_tick(&self) -> Duration {
        Duration::from_secs_f64(self.frames_written as f64 / CAPTURE_FRAME_RATE as f64)
    }

    /// Record the surface for every capture tick the media clock has
    /// reached.
    ///
    /// The sink always runs at [`CAPTURE_FRAME_RATE`], so sources at other
    /// rates are resampled here: frames arriving between ticks record
    /// nothing, and a frame spanning several ticks is recorded once per
    /// tick. Encoded duration therefore tracks media time, not the source
    /// frame count.
    pub async fn record_frame_at(
        &mut self,
        canvas: &Canvas,
        timestamp: Duration,
    ) -> BackdropResult<()> {
        while self.next_tick() <= timestamp {
            self.record_frame(canvas).await?;
        }
        Ok(())
    }

    /// Stop capture and concatenate the chunk sequence into the artifact.
    ///
    /// Consumes the finalizer; a job that fails before this point never
    /// produces a partial artifact.
    pub async fn finalize(mut self) -> BackdropResult<ExportArtifact> {
        let remaining = self.sink.finish().await?;
        self.chunks.extend(remaining);

        tracing::info!(
            "Capture finalized: {} frames, {} chunks",
            self.frames_written,
            self.chunks.len()
        );

        Ok(ExportArtifact {
            data: self.chunks.concatenate(),
            media_type: self.format.media_type.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::stub::FixedSupport;
    use super::*;

    #[test]
    fn negotiation_prefers_alpha_capable_webm() {
        let format = negotiate_format(&FixedSupport::all()).unwrap();
        assert_eq!(format.mime_type, "video/webm; codecs=vp9");
        assert_eq!(format.media_type, "video/webm");
    }

    #[test]
    fn negotiation_falls_back_in_order() {
        let support = FixedSupport::only(&["video/webm", "video/mp4"]);
        let format = negotiate_format(&support).unwrap();
        assert_eq!(format.mime_type, "video/webm");

        let support = FixedSupport::only(&["video/mp4"]);
        assert_eq!(negotiate_format(&support).unwrap().mime_type, "video/mp4");
    }

    #[test]
    fn negotiation_fails_when_nothing_is_supported() {
        let err = negotiate_format(&FixedSupport::none()).unwrap_err();
        assert!(matches!(err, BackdropError::NoSupportedEncoding));
    }

    #[test]
    fn chunk_sequence_concatenates_in_emit_order() {
        let mut seq = ChunkSequence::new();
        seq.append(EncodedChunk(vec![1, 2]));
        seq.append(EncodedChunk(vec![]));
        seq.append(EncodedChunk(vec![3]));
        seq.extend([EncodedChunk(vec![4, 5])]);

        assert_eq!(seq.len(), 3); // empty chunk ignored
        assert_eq!(seq.concatenate(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn media_type_is_primary_type_of_mime() {
        for format in &NEGOTIATION_ORDER {
            let primary = format.mime_type.split(';').next().unwrap().trim();
            assert_eq!(format.media_type, primary);
        }
    }
}
