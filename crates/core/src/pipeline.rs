//! Single-image pipeline: probe, validate, plan, decode, enlarge, snap to the
//! requested size, encode.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::codec::{self, OutputFormat, DEFAULT_JPEG_QUALITY};
use crate::config::AppConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::fitter::{fit_exact, AspectFitRequest, DEFAULT_SEAM_BUDGET};
use crate::inference::UpscaleEngine;
use crate::planner::{validate_dimensions, validate_intermediate, ResizeLimits, ResizeRequest};
use crate::resample::resize_bilinear;
use crate::types::PixelBuffer;

const PRESETS: &[(&[&str], u32, u32)] = &[
    (&["1080p", "fhd"], 1920, 1080),
    (&["1440p", "2k", "qhd"], 2560, 1440),
    (&["4k", "uhd", "2160p"], 3840, 2160),
    (&["5k"], 5120, 2880),
    (&["8k", "4320p"], 7680, 4320),
];

/// A user-facing size request, as typed on the command line or carried in a
/// batch manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DimensionSpec {
    /// Model's native scale.
    #[default]
    ModelDefault,
    /// Exactly `width x height` pixels.
    Exact { width: u32, height: u32 },
    /// Uniform scale factor.
    Scale { factor: f64 },
}

impl DimensionSpec {
    /// Accepts `WxH` (also `×`), presets such as `4K` or `1080p`, `Nx` scale
    /// factors, and `auto`/`native`/empty for the model default.
    pub fn parse(raw: &str) -> PipelineResult<Self> {
        let spec = raw.trim().to_lowercase();
        if spec.is_empty() || spec == "auto" || spec == "native" {
            return Ok(Self::ModelDefault);
        }

        if let Some((_, width, height)) = PRESETS
            .iter()
            .find(|(names, _, _)| names.contains(&spec.as_str()))
        {
            return Ok(Self::Exact {
                width: *width,
                height: *height,
            });
        }

        if let Some(factor) = spec.strip_suffix('x') {
            return match factor.trim().parse::<f64>() {
                Ok(factor) if factor.is_finite() && factor > 0.0 => Ok(Self::Scale { factor }),
                _ => Err(unparseable(raw, "scale factor must be a positive number")),
            };
        }

        let Some((width, height)) = spec.split_once(|ch| ch == 'x' || ch == '×') else {
            return Err(unparseable(raw, "expected WxH, a preset, or a scale like 2x"));
        };
        match (width.trim().parse::<u32>(), height.trim().parse::<u32>()) {
            (Ok(width), Ok(height)) if width > 0 && height > 0 => {
                Ok(Self::Exact { width, height })
            }
            _ => Err(unparseable(raw, "width and height must be positive integers")),
        }
    }

    /// Resize request used for the enlargement stage. Exact targets enlarge
    /// with aspect preserved; the snap stage lands the final size.
    pub fn to_request(&self, max_resolution: Option<u32>) -> ResizeRequest {
        let request = match *self {
            Self::ModelDefault => ResizeRequest::model_default(),
            Self::Exact { width, height } => ResizeRequest::keep_aspect(Some(width), Some(height)),
            Self::Scale { factor } => ResizeRequest::scale(factor),
        };
        match max_resolution {
            Some(max) => request.with_max_resolution(max),
            None => request,
        }
    }

    pub fn exact_target(&self) -> Option<(u32, u32)> {
        match *self {
            Self::Exact { width, height } => Some((width, height)),
            _ => None,
        }
    }
}

impl fmt::Display for DimensionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModelDefault => write!(f, "native"),
            Self::Exact { width, height } => write!(f, "{width}x{height}"),
            Self::Scale { factor } => write!(f, "{factor}x"),
        }
    }
}

impl std::str::FromStr for DimensionSpec {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn unparseable(raw: &str, reason: &str) -> PipelineError {
    PipelineError::validation(0, 0, format!("unrecognized dimension spec {raw:?}: {reason}"))
}

/// Encoded pipeline output.
#[derive(Clone, PartialEq, Eq)]
pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
}

impl fmt::Debug for ProcessedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessedImage")
            .field("bytes", &self.bytes.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

/// Ratio-corrects `image` toward `width x height` within `seam_budget`, then
/// force-resizes whatever the fitter could not absorb.
pub fn snap_to_dimensions(
    image: PixelBuffer,
    width: u32,
    height: u32,
    seam_budget: u32,
) -> PipelineResult<PixelBuffer> {
    if image.dimensions() == (width, height) {
        return Ok(image);
    }

    let fitted = fit_exact(
        image,
        &AspectFitRequest {
            target_width: width,
            target_height: height,
            max_seams_per_axis: seam_budget,
        },
    )?;

    if fitted.dimensions() == (width, height) {
        return Ok(fitted);
    }
    debug!(
        from_width = fitted.width(),
        from_height = fitted.height(),
        width,
        height,
        "Force-resizing to exact target"
    );
    resize_bilinear(&fitted, width, height)
}

/// Runs whole images through the engine. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    engine: Arc<UpscaleEngine>,
    limits: ResizeLimits,
    seam_budget: u32,
    format: OutputFormat,
    jpeg_quality: u8,
}

impl ImageProcessor {
    pub fn new(engine: Arc<UpscaleEngine>) -> Self {
        Self {
            engine,
            limits: ResizeLimits::default(),
            seam_budget: DEFAULT_SEAM_BUDGET,
            format: OutputFormat::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn from_config(engine: Arc<UpscaleEngine>, config: &AppConfig) -> Self {
        Self::new(engine)
            .with_limits(config.limits.into())
            .with_seam_budget(config.fit.seam_budget)
            .with_output(config.output.format, config.output.jpeg_quality)
    }

    pub fn with_limits(mut self, limits: ResizeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_seam_budget(mut self, seam_budget: u32) -> Self {
        self.seam_budget = seam_budget;
        self
    }

    pub fn with_output(mut self, format: OutputFormat, jpeg_quality: u8) -> Self {
        self.format = format;
        self.jpeg_quality = jpeg_quality;
        self
    }

    pub fn engine(&self) -> &UpscaleEngine {
        &self.engine
    }

    pub fn limits(&self) -> ResizeLimits {
        self.limits
    }

    pub fn output_format(&self) -> OutputFormat {
        self.format
    }

    /// Plans and validates without touching pixels: input dimensions, the
    /// native-scale intermediate, the planned enlargement and any exact
    /// target all have to pass the limits.
    pub fn plan(&self, width: u32, height: u32, spec: &DimensionSpec) -> PipelineResult<(u32, u32)> {
        validate_dimensions(width as i64, height as i64, &self.limits)?;
        validate_intermediate(width, height, self.engine.scale(), &self.limits)?;

        let request = spec.to_request(Some(self.limits.max_resolution));
        let (planned_w, planned_h) = self.engine.plan(width, height, &request)?;
        validate_dimensions(planned_w as i64, planned_h as i64, &self.limits)?;

        match spec.exact_target() {
            Some((exact_w, exact_h)) => {
                validate_dimensions(exact_w as i64, exact_h as i64, &self.limits)?;
                Ok((exact_w, exact_h))
            }
            None => Ok((planned_w, planned_h)),
        }
    }

    /// Full pipeline from encoded bytes to encoded bytes. Oversized inputs
    /// are rejected from the header alone, before decoding.
    pub fn process_bytes(
        &self,
        bytes: &[u8],
        spec: &DimensionSpec,
        cancel: &CancellationToken,
    ) -> PipelineResult<ProcessedImage> {
        let started = Instant::now();
        let (width, height) = codec::probe_dimensions(bytes)?;
        self.plan(width, height, spec)?;

        let (image, source_format) = codec::decode(bytes, &self.limits)?;
        debug!(width, height, format = ?source_format, "Decoded input");

        let output = self.process_image(image, spec, cancel)?;
        let (out_w, out_h) = output.dimensions();
        let encoded = codec::encode(&output, self.format, self.jpeg_quality)?;

        info!(
            input_width = width,
            input_height = height,
            output_width = out_w,
            output_height = out_h,
            format = %self.format,
            bytes = encoded.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image processed"
        );

        Ok(ProcessedImage {
            bytes: encoded,
            width: out_w,
            height: out_h,
            format: self.format,
        })
    }

    /// Enlarges an already-decoded image and snaps it to an exact target when
    /// `spec` names one.
    pub fn process_image(
        &self,
        image: PixelBuffer,
        spec: &DimensionSpec,
        cancel: &CancellationToken,
    ) -> PipelineResult<PixelBuffer> {
        let (width, height) = image.dimensions();
        self.plan(width, height, spec)?;

        let request = spec.to_request(Some(self.limits.max_resolution));
        let enlarged = self.engine.upscale(&image, &request, cancel)?;
        drop(image);

        match spec.exact_target() {
            Some((exact_w, exact_h)) => {
                snap_to_dimensions(enlarged, exact_w, exact_h, self.seam_budget)
            }
            None => Ok(enlarged),
        }
    }
}
