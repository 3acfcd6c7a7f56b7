//! Background policy resolution
//!
//! Maps the user's background selection to a paint instruction applied to
//! the canvas before each frame overlay. Resolution is pure and infallible;
//! materializing image pixels happens later, in the loader.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Fallback still used when `Image` is selected without a custom upload.
pub const DEFAULT_BACKGROUND_URL: &str =
    "https://images.unsplash.com/photo-1497294815431-9365093b7331?auto=format&fit=crop&w=1950&q=80";

/// Green-screen chroma fill.
pub const GREEN_SCREEN: Color = Color::rgb(0x00, 0xFF, 0x00);

/// Neutral fill standing in for the blur mode in captured pixels; the blur
/// itself is a presentation-layer filter and is not baked into the export.
pub const BLUR_FILL: Color = Color::rgb(0xD4, 0xD4, 0xD4);

/// Background selection for one export, immutable once the job starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackgroundSpec {
    /// Keep the source pixels as-is.
    Original,
    /// Let the RGBA asset's own alpha stand; no paint behind it.
    TransparentPassthrough,
    GreenScreen,
    SolidColor(Color),
    /// Custom still; `None` falls back to [`DEFAULT_BACKGROUND_URL`].
    Image(Option<ImageHandle>),
    Blur,
}

/// Reference to a background still, resolved to pixels before compositing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ImageHandle {
    Path(PathBuf),
    Url(String),
}

/// sRGB color, 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse a `#RRGGBB` hex string, as supplied by color pickers.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.strip_prefix('#').unwrap_or(hex);
        if hex.len() != 6 {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(Self { r, g, b })
    }
}

/// Paint instruction applied to the full canvas before the frame overlay.
#[derive(Debug, Clone)]
pub enum Paint {
    /// Leave the cleared (transparent) canvas alone.
    None,
    /// Fill every pixel with a solid color.
    Fill(Color),
    /// Draw the referenced still with cover-fit scaling, centered.
    CoverImage(ImageHandle),
}

impl Paint {
    /// Whether applying this paint covers the whole canvas.
    pub fn covers_canvas(&self) -> bool {
        !matches!(self, Paint::None)
    }
}

/// Resolve a background selection to its paint instruction.
///
/// There is no error path: an `Image` selection without a handle falls back
/// to the default reference.
pub fn resolve(spec: &BackgroundSpec) -> Paint {
    match spec {
        BackgroundSpec::Original | BackgroundSpec::TransparentPassthrough => Paint::None,
        BackgroundSpec::GreenScreen => Paint::Fill(GREEN_SCREEN),
        BackgroundSpec::SolidColor(color) => Paint::Fill(*color),
        BackgroundSpec::Image(Some(handle)) => Paint::CoverImage(handle.clone()),
        BackgroundSpec::Image(None) => {
            Paint::CoverImage(ImageHandle::Url(DEFAULT_BACKGROUND_URL.to_string()))
        }
        BackgroundSpec::Blur => Paint::Fill(BLUR_FILL),
    }
}

/// Cover-fit placement of an image on a canvas: scale so the image fully
/// covers the canvas while preserving aspect ratio, centered, excess cropped.
///
/// Returns `(scale, offset_x, offset_y)`; offsets are the (possibly negative)
/// canvas coordinates of the scaled image's top-left corner.
pub fn cover_fit(
    canvas_w: u32,
    canvas_h: u32,
    image_w: u32,
    image_h: u32,
) -> (f32, f32, f32) {
    if image_w == 0 || image_h == 0 {
        return (1.0, 0.0, 0.0);
    }

    let scale = f32::max(
        canvas_w as f32 / image_w as f32,
        canvas_h as f32 / image_h as f32,
    );
    let offset_x = (canvas_w as f32 - image_w as f32 * scale) / 2.0;
    let offset_y = (canvas_h as f32 - image_h as f32 * scale) / 2.0;

    (scale, offset_x, offset_y)
}
