//! Resolution planning: turns a loose resize request into concrete target
//! dimensions and validates dimensions against the memory budget.
//!
//! All intermediate math is `f64`; final dimensions are truncated toward zero
//! so a plan never exceeds the bounds it was given. Degenerate results are
//! lifted to 1px so downstream buffers are never zero-sized.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

pub const DEFAULT_MAX_SIDE: u32 = 16384;
pub const DEFAULT_MAX_RESOLUTION: u32 = 16384;
/// The native-scale intermediate may hold this many times the pixel budget.
const INTERMEDIATE_BUDGET_FACTOR: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum ResizeMode {
    /// Keep the input aspect ratio. With both sides set the result fits
    /// inside the box; with one side set the other follows proportionally.
    KeepAspect {
        width: Option<u32>,
        height: Option<u32>,
    },
    /// Use the given sides verbatim; an unset side becomes `input * scale`.
    Force {
        width: Option<u32>,
        height: Option<u32>,
    },
    ScaleFactor { factor: f64 },
    ModelDefault,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    pub mode: ResizeMode,
    /// Post-hoc clamp on the longer side, in pixels.
    pub max_resolution: Option<u32>,
}

impl ResizeRequest {
    pub fn model_default() -> Self {
        Self {
            mode: ResizeMode::ModelDefault,
            max_resolution: None,
        }
    }

    pub fn keep_aspect(width: Option<u32>, height: Option<u32>) -> Self {
        Self {
            mode: ResizeMode::KeepAspect { width, height },
            max_resolution: None,
        }
    }

    pub fn force(width: u32, height: u32) -> Self {
        Self {
            mode: ResizeMode::Force {
                width: Some(width),
                height: Some(height),
            },
            max_resolution: None,
        }
    }

    pub fn scale(factor: f64) -> Self {
        Self {
            mode: ResizeMode::ScaleFactor { factor },
            max_resolution: None,
        }
    }

    pub fn with_max_resolution(mut self, max_resolution: u32) -> Self {
        self.max_resolution = Some(max_resolution);
        self
    }

    /// Exact target when the request names both sides.
    pub fn exact_target(&self) -> Option<(u32, u32)> {
        match self.mode {
            ResizeMode::Force {
                width: Some(w),
                height: Some(h),
            } => Some((w, h)),
            _ => None,
        }
    }

    fn check(&self) -> PipelineResult<()> {
        if let Some(max) = self.max_resolution {
            if max == 0 {
                return Err(PipelineError::validation(
                    0,
                    0,
                    "max resolution must be positive",
                ));
            }
        }
        match self.mode {
            ResizeMode::ScaleFactor { factor } if !factor.is_finite() || factor <= 0.0 => {
                Err(PipelineError::validation(
                    0,
                    0,
                    format!("scale factor must be positive, got {factor}"),
                ))
            }
            ResizeMode::KeepAspect { width, height } | ResizeMode::Force { width, height }
                if width == Some(0) || height == Some(0) =>
            {
                Err(PipelineError::validation(
                    width.unwrap_or(0) as i64,
                    height.unwrap_or(0) as i64,
                    "requested width and height must be positive",
                ))
            }
            _ => Ok(()),
        }
    }
}

impl Default for ResizeRequest {
    fn default() -> Self {
        Self::model_default()
    }
}

/// Bounds enforced before any pixel buffer is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResizeLimits {
    pub max_side: u32,
    pub max_resolution: u32,
}

impl Default for ResizeLimits {
    fn default() -> Self {
        Self {
            max_side: DEFAULT_MAX_SIDE,
            max_resolution: DEFAULT_MAX_RESOLUTION,
        }
    }
}

impl ResizeLimits {
    pub fn max_intermediate_pixels(&self) -> u64 {
        u64::from(self.max_resolution) * u64::from(self.max_resolution) * INTERMEDIATE_BUDGET_FACTOR
    }
}

fn truncate(value: f64) -> u32 {
    if value.is_finite() && value >= 1.0 {
        value.min(u32::MAX as f64) as u32
    } else {
        1
    }
}

fn scaled(side: u32, scale: f64) -> u32 {
    truncate(side as f64 * scale)
}

/// Computes the target dimensions for `request` applied to an input of
/// `input_width x input_height`.
pub fn plan_resolution(
    input_width: u32,
    input_height: u32,
    request: &ResizeRequest,
    model_scale: u32,
) -> PipelineResult<(u32, u32)> {
    if input_width == 0 || input_height == 0 {
        return Err(PipelineError::validation(
            input_width as i64,
            input_height as i64,
            "input dimensions must be positive",
        ));
    }
    request.check()?;

    let model_scale = model_scale.max(1);
    let native = (
        input_width.saturating_mul(model_scale),
        input_height.saturating_mul(model_scale),
    );

    let (mut width, mut height) = match request.mode {
        ResizeMode::KeepAspect {
            width: Some(tw),
            height: Some(th),
        } => {
            let scale_w = tw as f64 / input_width as f64;
            let scale_h = th as f64 / input_height as f64;
            let scale = scale_w.min(scale_h);
            (scaled(input_width, scale), scaled(input_height, scale))
        }
        ResizeMode::KeepAspect {
            width: Some(tw),
            height: None,
        } => {
            let scale = tw as f64 / input_width as f64;
            (tw, scaled(input_height, scale))
        }
        ResizeMode::KeepAspect {
            width: None,
            height: Some(th),
        } => {
            let scale = th as f64 / input_height as f64;
            (scaled(input_width, scale), th)
        }
        ResizeMode::Force { width, height } if width.is_some() || height.is_some() => {
            (width.unwrap_or(native.0), height.unwrap_or(native.1))
        }
        ResizeMode::ScaleFactor { factor } => {
            (scaled(input_width, factor), scaled(input_height, factor))
        }
        ResizeMode::KeepAspect { .. } | ResizeMode::Force { .. } | ResizeMode::ModelDefault => {
            native
        }
    };

    if let Some(max) = request.max_resolution {
        if width > max || height > max {
            if width > height {
                let scale = max as f64 / width as f64;
                width = max;
                height = scaled(height, scale);
            } else {
                let scale = max as f64 / height as f64;
                height = max;
                width = scaled(width, scale);
            }
            debug!(width, height, max_resolution = max, "Clamped planned resolution");
        }
    }

    Ok((width.max(1), height.max(1)))
}

/// Rejects dimensions that are non-positive, exceed the per-side limit, or
/// whose area exceeds `max_resolution²`. Runs on header-probed sizes, before
/// any decode.
pub fn validate_dimensions(width: i64, height: i64, limits: &ResizeLimits) -> PipelineResult<()> {
    if width <= 0 || height <= 0 {
        return Err(PipelineError::validation(
            width,
            height,
            "width and height must be positive",
        ));
    }

    let max_side = limits.max_side as i64;
    if width > max_side || height > max_side {
        return Err(PipelineError::validation(
            width,
            height,
            format!("exceeds maximum side length {max_side}"),
        ));
    }

    let max_pixels = (limits.max_resolution as i128) * (limits.max_resolution as i128);
    if (width as i128) * (height as i128) > max_pixels {
        return Err(PipelineError::validation(
            width,
            height,
            format!(
                "exceeds pixel budget {}x{}",
                limits.max_resolution, limits.max_resolution
            ),
        ));
    }

    Ok(())
}

/// Checks the `input * scale` buffer the model fills before RECTIFY. Its
/// sides may exceed `max_side`; its pixel count may not exceed
/// [`ResizeLimits::max_intermediate_pixels`].
pub fn validate_intermediate(
    width: u32,
    height: u32,
    scale: u32,
    limits: &ResizeLimits,
) -> PipelineResult<()> {
    let native_w = i64::from(width) * i64::from(scale);
    let native_h = i64::from(height) * i64::from(scale);
    let budget = limits.max_intermediate_pixels();
    if (native_w as i128) * (native_h as i128) > budget as i128 {
        return Err(PipelineError::validation(
            native_w,
            native_h,
            format!("{scale}x intermediate exceeds {budget} pixels"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_aspect_box_fits_inside_target() {
        let request = ResizeRequest::keep_aspect(Some(3840), Some(2160));
        assert_eq!(plan_resolution(1024, 600, &request, 4).unwrap(), (3686, 2160));
    }

    #[test]
    fn test_keep_aspect_box_never_exceeds_target_and_keeps_ratio() {
        let inputs = [(1, 1), (7, 3), (1920, 1080), (333, 999), (4000, 17), (640, 641)];
        let boxes = [(100, 100), (3840, 2160), (1, 5000), (1234, 567)];
        for (iw, ih) in inputs {
            for (tw, th) in boxes {
                let request = ResizeRequest::keep_aspect(Some(tw), Some(th));
                let (w, h) = plan_resolution(iw, ih, &request, 4).unwrap();
                assert!(w <= tw.max(1) && h <= th.max(1), "{iw}x{ih} -> {w}x{h} in {tw}x{th}");
                if w > 20 && h > 20 {
                    let ratio_in = iw as f64 / ih as f64;
                    let ratio_out = w as f64 / h as f64;
                    assert!((ratio_in - ratio_out).abs() / ratio_in < 0.1);
                }
            }
        }
    }

    #[test]
    fn test_keep_aspect_single_side_scales_other() {
        let width_only = ResizeRequest::keep_aspect(Some(1920), None);
        assert_eq!(plan_resolution(1000, 500, &width_only, 4).unwrap(), (1920, 960));

        let height_only = ResizeRequest::keep_aspect(None, Some(1001));
        assert_eq!(plan_resolution(300, 200, &height_only, 4).unwrap(), (1501, 1001));
    }

    #[test]
    fn test_force_fills_missing_side_from_model_scale() {
        let request = ResizeRequest {
            mode: ResizeMode::Force {
                width: Some(1000),
                height: None,
            },
            max_resolution: None,
        };
        assert_eq!(plan_resolution(100, 50, &request, 4).unwrap(), (1000, 200));
        assert_eq!(
            plan_resolution(100, 50, &ResizeRequest::force(7, 900), 4).unwrap(),
            (7, 900)
        );
    }

    #[test]
    fn test_scale_factor_truncates() {
        let request = ResizeRequest::scale(2.5);
        assert_eq!(plan_resolution(101, 33, &request, 4).unwrap(), (252, 82));
    }

    #[test]
    fn test_empty_explicit_request_falls_back_to_model_scale() {
        let request = ResizeRequest::keep_aspect(None, None);
        assert_eq!(plan_resolution(256, 128, &request, 4).unwrap(), (1024, 512));
        let request = ResizeRequest::model_default();
        assert_eq!(plan_resolution(256, 128, &request, 2).unwrap(), (512, 256));
    }

    #[test]
    fn test_max_resolution_clamps_longer_side() {
        let request = ResizeRequest::model_default().with_max_resolution(2560);
        assert_eq!(plan_resolution(1920, 1080, &request, 4).unwrap(), (2560, 1440));

        let tall = ResizeRequest::scale(3.0).with_max_resolution(1000);
        assert_eq!(plan_resolution(300, 900, &tall, 4).unwrap(), (333, 1000));
    }

    #[test]
    fn test_max_resolution_always_bounds_result() {
        let requests = [
            ResizeRequest::model_default(),
            ResizeRequest::scale(7.3),
            ResizeRequest::force(9000, 20),
            ResizeRequest::keep_aspect(Some(5000), None),
        ];
        for request in requests {
            for max in [1, 17, 512, 4096] {
                let request = request.with_max_resolution(max);
                let (w, h) = plan_resolution(1234, 777, &request, 4).unwrap();
                assert!(w.max(h) <= max, "{w}x{h} > {max}");
            }
        }
    }

    #[test]
    fn test_invalid_requests_rejected() {
        assert!(plan_resolution(0, 10, &ResizeRequest::default(), 4).is_err());
        assert!(plan_resolution(10, 10, &ResizeRequest::scale(-1.0), 4).is_err());
        let zero_max = ResizeRequest::default().with_max_resolution(0);
        assert!(plan_resolution(10, 10, &zero_max, 4).is_err());
    }

    #[test]
    fn test_explicit_zero_side_rejected() {
        let requests = [
            ResizeRequest::keep_aspect(Some(0), Some(50)),
            ResizeRequest::keep_aspect(None, Some(0)),
            ResizeRequest::force(0, 50),
            ResizeRequest {
                mode: ResizeMode::Force {
                    width: Some(10),
                    height: Some(0),
                },
                max_resolution: None,
            },
        ];
        for request in requests {
            let err = plan_resolution(100, 50, &request, 4).unwrap_err();
            assert!(matches!(err, PipelineError::Validation { .. }), "{request:?}");
        }
    }

    #[test]
    fn test_validation_rejects_bad_dimensions() {
        let limits = ResizeLimits::default();
        assert!(validate_dimensions(0, 1080, &limits).is_err());
        assert!(validate_dimensions(1920, -1, &limits).is_err());

        let err = validate_dimensions(20000, 20000, &limits).unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
        assert!(err.to_string().contains("GB"));
    }

    #[test]
    fn test_validation_enforces_pixel_budget() {
        let limits = ResizeLimits {
            max_side: 16384,
            max_resolution: 1000,
        };
        assert!(validate_dimensions(1000, 1000, &limits).is_ok());
        let err = validate_dimensions(2000, 600, &limits).unwrap_err();
        assert!(err.to_string().contains("pixel budget"));
    }

    #[test]
    fn test_validation_accepts_max_side() {
        assert!(validate_dimensions(16384, 16384, &ResizeLimits::default()).is_ok());
    }

    #[test]
    fn test_intermediate_budget() {
        let limits = ResizeLimits::default();
        assert!(validate_intermediate(4096, 4096, 4, &limits).is_ok());
        // Sides past max_side are fine while the pixel count fits.
        assert!(validate_intermediate(5000, 3000, 4, &limits).is_ok());

        let err = validate_intermediate(16384, 16384, 4, &limits).unwrap_err();
        match &err {
            PipelineError::Validation { width, height, .. } => {
                assert_eq!((*width, *height), (65536, 65536))
            }
            other => panic!("expected validation error, got {other}"),
        }
        assert!(err.to_string().contains("GB"), "{err}");
    }

    #[test]
    fn test_request_deserializes_from_tagged_json() {
        let request: ResizeRequest = serde_json::from_str(
            r#"{"mode":{"mode":"keepAspect","width":3840,"height":null},"maxResolution":4096}"#,
        )
        .unwrap();
        assert_eq!(
            request.mode,
            ResizeMode::KeepAspect {
                width: Some(3840),
                height: None
            }
        );
        assert_eq!(request.max_resolution, Some(4096));
    }
}
