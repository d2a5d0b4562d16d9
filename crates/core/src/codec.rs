//! Image encode/decode at the pipeline boundary.
//!
//! Header probing reads only the container header so dimensions can be
//! validated before any pixel buffer is allocated.

use std::io::Cursor;

use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageFormat, ImageReader, Limits};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::planner::ResizeLimits;
use crate::types::{PixelBuffer, CHANNELS};

pub const DEFAULT_JPEG_QUALITY: u8 = 95;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
}

impl OutputFormat {
    /// Format implied by a file extension, if it is one we can write.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Png => write!(f, "png"),
            Self::Jpeg => write!(f, "jpeg"),
        }
    }
}

fn reader(bytes: &[u8]) -> PipelineResult<ImageReader<Cursor<&[u8]>>> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PipelineError::Decode(format!("cannot read image header: {e}")))
}

/// Dimensions from the image header, without decoding pixels.
pub fn probe_dimensions(bytes: &[u8]) -> PipelineResult<(u32, u32)> {
    if bytes.is_empty() {
        return Err(PipelineError::Decode("empty image data".to_string()));
    }
    let reader = reader(bytes)?;
    if reader.format().is_none() {
        return Err(PipelineError::Decode("unrecognized image format".to_string()));
    }
    reader
        .into_dimensions()
        .map_err(|e| PipelineError::Decode(format!("cannot read image dimensions: {e}")))
}

/// Decoder limits matching `limits`, replacing the decoder's own 512 MiB
/// allocation cap. The byte budget leaves room for 16-bit RGBA sources.
fn decoder_limits(limits: &ResizeLimits) -> Limits {
    let max_pixels = u64::from(limits.max_resolution) * u64::from(limits.max_resolution);
    let mut decoder_limits = Limits::default();
    decoder_limits.max_image_width = Some(limits.max_side);
    decoder_limits.max_image_height = Some(limits.max_side);
    decoder_limits.max_alloc = Some(max_pixels.saturating_mul(2 * CHANNELS as u64));
    decoder_limits
}

/// Decodes any supported format into RGBA8, bounded by `limits`.
pub fn decode(bytes: &[u8], limits: &ResizeLimits) -> PipelineResult<(PixelBuffer, ImageFormat)> {
    let mut reader = reader(bytes)?;
    let format = reader
        .format()
        .ok_or_else(|| PipelineError::Decode("unrecognized image format".to_string()))?;
    reader.limits(decoder_limits(limits));
    let decoded = reader
        .decode()
        .map_err(|e| PipelineError::Decode(format!("{format:?}: {e}")))?;

    let rgba = decoded.into_rgba8();
    let (width, height) = rgba.dimensions();
    let buffer = PixelBuffer::from_raw(width, height, rgba.into_raw())
        .map_err(|e| PipelineError::Decode(e.to_string()))?;
    Ok((buffer, format))
}

/// Encodes `image`. JPEG drops the alpha channel; `quality` is ignored for
/// PNG.
pub fn encode(image: &PixelBuffer, format: OutputFormat, quality: u8) -> PipelineResult<Vec<u8>> {
    let (width, height) = image.dimensions();
    let mut out = Vec::new();

    let result = match format {
        OutputFormat::Png => PngEncoder::new(&mut out).write_image(
            image.as_raw(),
            width,
            height,
            ExtendedColorType::Rgba8,
        ),
        OutputFormat::Jpeg => {
            let rgb: Vec<u8> = image
                .as_raw()
                .chunks_exact(CHANNELS)
                .flat_map(|p| [p[0], p[1], p[2]])
                .collect();
            JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).write_image(
                &rgb,
                width,
                height,
                ExtendedColorType::Rgb8,
            )
        }
    };

    result.map_err(|e| {
        PipelineError::io(
            format!("failed to encode {width}x{height} image as {format}"),
            e.into(),
        )
    })?;
    Ok(out)
}

/// Decodes base64 image data, accepting an optional `data:<mime>;base64,`
/// prefix.
pub fn decode_base64(data: &str) -> PipelineResult<Vec<u8>> {
    let normalized = data.trim();
    let payload = if normalized.starts_with("data:") {
        let start = normalized.find(";base64,").ok_or_else(|| {
            PipelineError::Decode("data URL is missing the ;base64, marker".to_string())
        })?;
        &normalized[start + ";base64,".len()..]
    } else {
        normalized
    };

    general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| PipelineError::Decode(format!("invalid base64 image data: {e}")))
}

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}
