//! Seam-budgeted aspect-ratio fit.
//!
//! Squeezes one axis by nearest-neighbour proportional remapping, removing at
//! most `seam_budget` columns (image too wide) or rows (image too tall). The
//! reduced axis never drops below half its original size. There is no energy
//! map: the only content decision is which axis to squeeze.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::types::{PixelBuffer, CHANNELS};

/// Ratios closer than this are treated as already matching.
pub const RATIO_EPSILON: f64 = 0.01;

/// Smallest fraction of the reduced axis that survives a fit.
pub const MIN_AXIS_FRACTION: f64 = 0.5;

pub const DEFAULT_SEAM_BUDGET: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AspectFitRequest {
    pub target_width: u32,
    pub target_height: u32,
    /// Upper bound on rows/columns removed in one fit.
    pub max_seams_per_axis: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Width,
    Height,
}

/// Adjusts `image` toward the ratio of the request's target dimensions.
/// The result may differ from the target when the seam budget or the
/// half-size floor stops the squeeze early.
pub fn fit_exact(image: PixelBuffer, request: &AspectFitRequest) -> PipelineResult<PixelBuffer> {
    if request.target_width == 0 || request.target_height == 0 {
        return Err(PipelineError::resize(
            request.target_width,
            request.target_height,
            "fit target must have non-zero dimensions",
        ));
    }
    let ratio = request.target_width as f64 / request.target_height as f64;
    fit_aspect_ratio(image, ratio, request.max_seams_per_axis)
}

/// Squeezes `image` toward `target_ratio` (width / height). Returns the input
/// unchanged when it is already within [`RATIO_EPSILON`] of the target.
pub fn fit_aspect_ratio(
    image: PixelBuffer,
    target_ratio: f64,
    seam_budget: u32,
) -> PipelineResult<PixelBuffer> {
    let (width, height) = image.dimensions();
    if !target_ratio.is_finite() || target_ratio <= 0.0 {
        return Err(PipelineError::resize(
            width,
            height,
            format!("target ratio must be positive, got {target_ratio}"),
        ));
    }

    let current_ratio = image.aspect_ratio();
    if (current_ratio - target_ratio).abs() < RATIO_EPSILON {
        debug!(current_ratio, target_ratio, "Aspect ratio already matches");
        return Ok(image);
    }

    let (axis, original, ideal) = if current_ratio > target_ratio {
        (Axis::Width, width, target_ratio * height as f64)
    } else {
        (Axis::Height, height, width as f64 / target_ratio)
    };

    let floor = (original as f64 * MIN_AXIS_FRACTION).ceil() as u32;
    let target = (ideal as u32).max(floor);
    let removal = original.saturating_sub(target).min(seam_budget);
    if removal == 0 {
        return Ok(image);
    }

    let new_size = original - removal;
    debug!(
        ?axis,
        width,
        height,
        target_ratio,
        removal,
        new_size,
        "Squeezing image toward target ratio"
    );

    match axis {
        Axis::Width => squeeze_columns(&image, new_size),
        Axis::Height => squeeze_rows(&image, new_size),
    }
}

fn source_index(dst: u32, original: u32, new_size: u32) -> usize {
    let src = (dst as f64 * original as f64 / new_size as f64) as u32;
    src.min(original - 1) as usize
}

fn squeeze_columns(image: &PixelBuffer, new_width: u32) -> PipelineResult<PixelBuffer> {
    let (width, height) = image.dimensions();
    let src = image.as_raw();
    let src_stride = width as usize * CHANNELS;
    let columns: Vec<usize> = (0..new_width)
        .map(|x| source_index(x, width, new_width))
        .collect();

    let mut data = Vec::with_capacity(new_width as usize * height as usize * CHANNELS);
    for row in src.chunks_exact(src_stride) {
        for &sx in &columns {
            let i = sx * CHANNELS;
            data.extend_from_slice(&row[i..i + CHANNELS]);
        }
    }
    PixelBuffer::from_raw(new_width, height, data)
}

fn squeeze_rows(image: &PixelBuffer, new_height: u32) -> PipelineResult<PixelBuffer> {
    let (width, height) = image.dimensions();
    let src = image.as_raw();
    let stride = width as usize * CHANNELS;

    let mut data = Vec::with_capacity(stride * new_height as usize);
    for y in 0..new_height {
        let sy = source_index(y, height, new_height);
        data.extend_from_slice(&src[sy * stride..(sy + 1) * stride]);
    }
    PixelBuffer::from_raw(width, new_height, data)
}
