//! Media source loading
//!
//! Retrieves the processed (alpha-bearing) media asset as binary data and
//! constructs a frame-by-frame readable handle with its intrinsic metadata.
//! Fetching goes through an explicit binary download first, rather than
//! pointing a decoder at the remote URL, so gateway interstitial pages can
//! be bypassed with a custom header and can never corrupt the byte stream.

use crate::background::{cover_fit, ImageHandle};
use crate::{BackdropError, BackdropResult};
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "decoding")]
pub mod ffmpeg;
pub mod stub;

/// Header sent with asset downloads to skip tunnel interstitial pages.
pub const INTERSTITIAL_BYPASS_HEADER: (&str, &str) = ("ngrok-skip-browser-warning", "true");

/// Reference to a source media asset.
#[derive(Debug, Clone)]
pub enum SourceRef {
    Url(String),
    Path(PathBuf),
}

/// A decoded video frame, RGBA8.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Duration,
}

/// Result of pulling the next frame from a stream.
///
/// `NotReady` is the tolerated transient: the compositor skips that tick
/// and retries, rather than failing the job.
#[derive(Debug)]
pub enum FramePull {
    Frame(VideoFrame),
    NotReady,
    EndOfStream,
}

/// Frame-by-frame reader over decoded source media.
#[async_trait::async_trait]
pub trait FrameStream: Send {
    async fn next_frame(&mut self) -> BackdropResult<FramePull>;
}

/// Decodable source media with intrinsic metadata, primed for reading.
///
/// Owned exclusively by the active export job; dropping it releases the
/// underlying decode resources.
pub struct SourceMedia {
    pub width: u32,
    pub height: u32,
    pub duration: Duration,
    pub frames: Box<dyn FrameStream>,
}

impl std::fmt::Debug for SourceMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceMedia")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

/// Turns retrieved bytes into playable [`SourceMedia`].
#[async_trait::async_trait]
pub trait MediaDecoder: Send + Sync {
    async fn open(&self, bytes: Vec<u8>) -> BackdropResult<SourceMedia>;
}

/// Loads source media from a reference.
#[async_trait::async_trait]
pub trait MediaLoader: Send + Sync {
    async fn load(&self, source: &SourceRef) -> BackdropResult<SourceMedia>;
}

/// Loader that retrieves the asset as binary data, then hands the bytes to
/// a [`MediaDecoder`].
pub struct HttpSourceLoader {
    client: reqwest::Client,
    decoder: std::sync::Arc<dyn MediaDecoder>,
}

impl HttpSourceLoader {
    pub fn new(decoder: std::sync::Arc<dyn MediaDecoder>) -> Self {
        Self {
            client: reqwest::Client::new(),
            decoder,
        }
    }

    pub fn with_client(client: reqwest::Client, decoder: std::sync::Arc<dyn MediaDecoder>) -> Self {
        Self { client, decoder }
    }

    async fn fetch(&self, url: &str) -> BackdropResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .header(INTERSTITIAL_BYPASS_HEADER.0, INTERSTITIAL_BYPASS_HEADER.1)
            .send()
            .await
            .map_err(|e| BackdropError::SourceFetch(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackdropError::SourceFetch(format!(
                "HTTP {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| BackdropError::SourceFetch(format!("failed to read body: {}", e)))?;

        tracing::debug!("Fetched source asset: {} bytes", bytes.len());
        Ok(bytes.to_vec())
    }
}

#[async_trait::async_trait]
impl MediaLoader for HttpSourceLoader {
    async fn load(&self, source: &SourceRef) -> BackdropResult<SourceMedia> {
        let bytes = match source {
            SourceRef::Url(url) => self.fetch(url).await?,
            SourceRef::Path(path) => tokio::fs::read(path)
                .await
                .map_err(|e| BackdropError::SourceFetch(format!("{}: {}", path.display(), e)))?,
        };

        let media = self.decoder.open(bytes).await?;
        tracing::info!(
            "Source media loaded: {}x{}, {:.2}s",
            media.width,
            media.height,
            media.duration.as_secs_f64()
        );
        Ok(media)
    }
}

/// Create the default loader backed by the ffmpeg decoder.
#[cfg(feature = "decoding")]
pub fn create_loader() -> HttpSourceLoader {
    HttpSourceLoader::new(std::sync::Arc::new(ffmpeg::FfmpegDecoder::new()))
}

/// A background still resolved to pixels, pre-placed for a target canvas.
#[derive(Debug, Clone)]
pub struct BackgroundImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl BackgroundImage {
    pub fn from_rgba(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), (width * height * 4) as usize);
        Self {
            data,
            width,
            height,
        }
    }

    /// Sample the image for a canvas pixel under cover-fit placement.
    ///
    /// Nearest-neighbor, matching the frame scaling used elsewhere in the
    /// pipeline.
    pub fn sample_cover(&self, x: u32, y: u32, canvas_w: u32, canvas_h: u32) -> [u8; 4] {
        let (scale, off_x, off_y) = cover_fit(canvas_w, canvas_h, self.width, self.height);

        let sx = ((x as f32 - off_x) / scale) as i64;
        let sy = ((y as f32 - off_y) / scale) as i64;
        let sx = sx.clamp(0, self.width as i64 - 1) as u32;
        let sy = sy.clamp(0, self.height as i64 - 1) as u32;

        let idx = ((sy * self.width + sx) * 4) as usize;
        [
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ]
    }
}

/// Materialize a background still from its handle.
///
/// Runs once per export, before the draw loop starts; failures surface as
/// compositing errors since the paint instruction cannot be applied.
pub async fn load_background_image(
    client: &reqwest::Client,
    handle: &ImageHandle,
) -> BackdropResult<BackgroundImage> {
    let bytes = match handle {
        ImageHandle::Path(path) => tokio::fs::read(path)
            .await
            .map_err(|e| BackdropError::Composite(format!("background image {}: {}", path.display(), e)))?,
        ImageHandle::Url(url) => {
            let response = client
                .get(url)
                .header(INTERSTITIAL_BYPASS_HEADER.0, INTERSTITIAL_BYPASS_HEADER.1)
                .send()
                .await
                .map_err(|e| BackdropError::Composite(format!("background image fetch: {}", e)))?;
            if !response.status().is_success() {
                return Err(BackdropError::Composite(format!(
                    "background image fetch: HTTP {}",
                    response.status().as_u16()
                )));
            }
            response
                .bytes()
                .await
                .map_err(|e| BackdropError::Composite(format!("background image read: {}", e)))?
                .to_vec()
        }
    };

    let decoded = image::load_from_memory(&bytes)
        .map_err(|e| BackdropError::Composite(format!("background image decode: {}", e)))?
        .to_rgba8();

    let (width, height) = decoded.dimensions();
    Ok(BackgroundImage::from_rgba(decoded.into_raw(), width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker_image() -> BackgroundImage {
        // 2x2: red, green / blue, white
        let data = vec![
            255, 0, 0, 255, 0, 255, 0, 255, //
            0, 0, 255, 255, 255, 255, 255, 255,
        ];
        BackgroundImage::from_rgba(data, 2, 2)
    }

    #[test]
    fn sample_cover_hits_expected_quadrants() {
        let img = checker_image();
        // Square image on square canvas: scale 50x, quadrants map directly.
        assert_eq!(img.sample_cover(10, 10, 100, 100), [255, 0, 0, 255]);
        assert_eq!(img.sample_cover(90, 10, 100, 100), [0, 255, 0, 255]);
        assert_eq!(img.sample_cover(10, 90, 100, 100), [0, 0, 255, 255]);
        assert_eq!(img.sample_cover(90, 90, 100, 100), [255, 255, 255, 255]);
    }

    #[test]
    fn sample_cover_clamps_at_cropped_edges() {
        let img = checker_image();
        // Wide canvas crops vertically; corners must still sample in-bounds.
        let px = img.sample_cover(0, 0, 400, 100);
        assert_eq!(px.len(), 4);
        let px = img.sample_cover(399, 99, 400, 100);
        assert_eq!(px.len(), 4);
    }
}
