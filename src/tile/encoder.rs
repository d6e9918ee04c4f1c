//! Raster encoding.
//!
//! Composites leave the process as PNG or JPEG. Upstream tiles that arrive
//! in a format other than their layer's storage format are re-encoded here
//! before they are cached.
//!
//! JPEG has no alpha channel, so transparent regions (missing tiles, areas
//! outside the mercator world) are flattened onto a white background.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ImageFormat, ImageReader, Rgb, RgbImage, RgbaImage};

use crate::error::TileError;

/// Default JPEG quality (1-100).
pub const DEFAULT_JPEG_QUALITY: u8 = 75;

/// Minimum allowed JPEG quality.
pub const MIN_JPEG_QUALITY: u8 = 1;

/// Maximum allowed JPEG quality.
pub const MAX_JPEG_QUALITY: u8 = 100;

/// Background used when dropping alpha for JPEG output.
const JPEG_BACKGROUND: [u8; 3] = [255, 255, 255];

// =============================================================================
// Output format
// =============================================================================

/// Image formats the proxy can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Png,
    Jpeg,
}

impl OutputFormat {
    /// Parse a MIME type such as `image/png`. Parameters after `;` are ignored.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/png" | "png" => Some(OutputFormat::Png),
            "image/jpeg" | "image/jpg" | "jpeg" | "jpg" => Some(OutputFormat::Jpeg),
            _ => None,
        }
    }

    /// Parse a file extension (without the dot).
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "png" => Some(OutputFormat::Png),
            "jpg" | "jpeg" => Some(OutputFormat::Jpeg),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }

    fn image_format(&self) -> ImageFormat {
        match self {
            OutputFormat::Png => ImageFormat::Png,
            OutputFormat::Jpeg => ImageFormat::Jpeg,
        }
    }
}

// =============================================================================
// Encoder
// =============================================================================

/// Encodes rasters and converts tiles between formats.
#[derive(Debug, Clone, Copy)]
pub struct ImageEncoder {
    jpeg_quality: u8,
}

impl Default for ImageEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl ImageEncoder {
    /// Create an encoder; `jpeg_quality` is clamped to 1-100.
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality: clamp_quality(jpeg_quality),
        }
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    /// Encode an RGBA raster.
    ///
    /// # Errors
    ///
    /// Returns `EncodeError` if the codec fails.
    pub fn encode(&self, image: &RgbaImage, format: OutputFormat) -> Result<Bytes, TileError> {
        let mut output = Vec::new();
        let result = match format {
            OutputFormat::Png => image.write_with_encoder(PngEncoder::new(&mut output)),
            OutputFormat::Jpeg => flatten(image).write_with_encoder(JpegEncoder::new_with_quality(
                &mut output,
                self.jpeg_quality,
            )),
        };
        result.map_err(|e| TileError::EncodeError {
            message: e.to_string(),
        })?;
        Ok(Bytes::from(output))
    }

    /// Decode an image of any supported format and encode it as `format`.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` if `source` is not a decodable image and
    /// `EncodeError` if encoding fails.
    pub fn reencode(&self, source: &[u8], format: OutputFormat) -> Result<Bytes, TileError> {
        let decoded = decode(source)?;
        self.encode(&decoded.to_rgba8(), format)
    }

    /// [`reencode`](Self::reencode) on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// As `reencode`, plus `Internal` if the task is cancelled.
    pub async fn spawn_reencode(&self, source: Bytes, format: OutputFormat) -> Result<Bytes, TileError> {
        let encoder = *self;
        tokio::task::spawn_blocking(move || encoder.reencode(&source, format))
            .await
            .map_err(|e| TileError::Internal {
                message: format!("re-encode task failed: {e}"),
            })?
    }

    /// Image dimensions without a full decode.
    pub fn dimensions(&self, source: &[u8]) -> Result<(u32, u32), TileError> {
        ImageReader::new(Cursor::new(source))
            .with_guessed_format()
            .map_err(|e| TileError::DecodeError {
                message: e.to_string(),
            })?
            .into_dimensions()
            .map_err(|e| TileError::DecodeError {
                message: e.to_string(),
            })
    }
}

/// Detect the format of encoded image bytes.
pub fn detect_format(source: &[u8]) -> Option<OutputFormat> {
    match image::guess_format(source).ok()? {
        ImageFormat::Png => Some(OutputFormat::Png),
        ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
        _ => None,
    }
}

/// Whether the bytes look like an image of the given format.
pub fn is_format(source: &[u8], format: OutputFormat) -> bool {
    image::guess_format(source).is_ok_and(|found| found == format.image_format())
}

/// Decode encoded image bytes.
pub fn decode(source: &[u8]) -> Result<DynamicImage, TileError> {
    image::load_from_memory(source).map_err(|e| TileError::DecodeError {
        message: e.to_string(),
    })
}

/// Composite onto the JPEG background colour and drop alpha.
fn flatten(image: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b, a] = image.get_pixel(x, y).0;
        let alpha = u16::from(a);
        let blend = |channel: u8, background: u8| {
            ((u16::from(channel) * alpha + u16::from(background) * (255 - alpha) + 127) / 255) as u8
        };
        Rgb([
            blend(r, JPEG_BACKGROUND[0]),
            blend(g, JPEG_BACKGROUND[1]),
            blend(b, JPEG_BACKGROUND[2]),
        ])
    })
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Returns `true` if quality is in the valid range (1-100).
#[inline]
pub fn is_valid_quality(quality: u8) -> bool {
    (MIN_JPEG_QUALITY..=MAX_JPEG_QUALITY).contains(&quality)
}

/// Clamp quality to the valid range.
#[inline]
pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(MIN_JPEG_QUALITY, MAX_JPEG_QUALITY)
}

// =============================================================================
// Tests
// =============================================================================
