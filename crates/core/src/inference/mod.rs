//! Super-resolution model capability and the tiled engine that drives it.
//!
//! The engine only sees [`SuperResModel`]; [`onnx::OnnxModel`] is the
//! production implementation and tests substitute a deterministic fake.

pub mod backend;
pub mod engine;
pub mod onnx;

use anyhow::{bail, Result};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::types::{PixelBuffer, CHANNELS};

pub use backend::{build_session, InferenceBackend, SessionConfig};
pub use engine::UpscaleEngine;
pub use onnx::OnnxModel;

/// Numeric range a model expects for its input and emits for its output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f32,
    pub max: f32,
}

impl ValueRange {
    pub const ZERO_TO_ONE: ValueRange = ValueRange { min: 0.0, max: 1.0 };
    pub const MINUS_ONE_TO_ONE: ValueRange = ValueRange {
        min: -1.0,
        max: 1.0,
    };
    pub const ZERO_TO_255: ValueRange = ValueRange {
        min: 0.0,
        max: 255.0,
    };

    pub fn normalize(&self, channel: u8) -> f32 {
        self.min + (channel as f32 / 255.0) * (self.max - self.min)
    }

    pub fn denormalize(&self, value: f32) -> u8 {
        let span = self.max - self.min;
        if span == 0.0 || !value.is_finite() {
            return 0;
        }
        let unit = (value - self.min) / span;
        (unit * 255.0).round().clamp(0.0, 255.0) as u8
    }
}

impl Default for ValueRange {
    fn default() -> Self {
        Self::ZERO_TO_ONE
    }
}

/// Fixed-shape tensor transform. Input is `[1, 3, T, T]` planar RGB in
/// [`SuperResModel::value_range`]; output must be `[1, 3, T*s, T*s]` in the
/// same range. Implementations must not carry state between calls.
pub trait SuperResModel: Send {
    fn scale(&self) -> u32;

    fn tile_size(&self) -> u32;

    fn value_range(&self) -> ValueRange {
        ValueRange::ZERO_TO_ONE
    }

    fn infer(&mut self, input: Array4<f32>) -> Result<Array4<f32>>;
}

impl<M: SuperResModel + ?Sized> SuperResModel for Box<M> {
    fn scale(&self) -> u32 {
        (**self).scale()
    }

    fn tile_size(&self) -> u32 {
        (**self).tile_size()
    }

    fn value_range(&self) -> ValueRange {
        (**self).value_range()
    }

    fn infer(&mut self, input: Array4<f32>) -> Result<Array4<f32>> {
        (**self).infer(input)
    }
}

/// Packs the RGB channels of `image` into a `[1, 3, H, W]` tensor. Alpha is
/// not fed to the model.
pub fn pixels_to_nchw(image: &PixelBuffer, range: ValueRange) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut arr = Array4::<f32>::zeros((1, 3, h, w));
    for (i, pixel) in image.as_raw().chunks_exact(CHANNELS).enumerate() {
        let (y, x) = (i / w, i % w);
        arr[[0, 0, y, x]] = range.normalize(pixel[0]);
        arr[[0, 1, y, x]] = range.normalize(pixel[1]);
        arr[[0, 2, y, x]] = range.normalize(pixel[2]);
    }
    arr
}

/// Unpacks a `[1, 3, H, W]` tensor into RGB, taking alpha from `alpha`
/// (same dimensions) or opaque when absent.
pub fn nchw_to_pixels(
    arr: &Array4<f32>,
    range: ValueRange,
    alpha: Option<&PixelBuffer>,
) -> Result<Vec<u8>> {
    let shape = arr.shape();
    if shape[0] != 1 || shape[1] != 3 {
        bail!("expected [1, 3, H, W] tensor, got {shape:?}");
    }
    let (h, w) = (shape[2], shape[3]);
    if let Some(alpha) = alpha {
        if alpha.width() as usize != w || alpha.height() as usize != h {
            bail!(
                "alpha plane {}x{} does not match tensor {w}x{h}",
                alpha.width(),
                alpha.height()
            );
        }
    }

    let mut out = vec![0u8; w * h * CHANNELS];
    for y in 0..h {
        for x in 0..w {
            let i = (y * w + x) * CHANNELS;
            out[i] = range.denormalize(arr[[0, 0, y, x]]);
            out[i + 1] = range.denormalize(arr[[0, 1, y, x]]);
            out[i + 2] = range.denormalize(arr[[0, 2, y, x]]);
            out[i + 3] = match alpha {
                Some(a) => a.as_raw()[i + 3],
                None => 255,
            };
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_range_normalize() {
        assert_eq!(ValueRange::ZERO_TO_ONE.normalize(255), 1.0);
        assert_eq!(ValueRange::ZERO_TO_ONE.normalize(0), 0.0);
        assert_eq!(ValueRange::MINUS_ONE_TO_ONE.normalize(0), -1.0);
        assert_eq!(ValueRange::MINUS_ONE_TO_ONE.normalize(255), 1.0);
        assert_eq!(ValueRange::ZERO_TO_255.normalize(128), 128.0);
    }

    #[test]
    fn test_value_range_denormalize_clamps() {
        assert_eq!(ValueRange::ZERO_TO_ONE.denormalize(1.5), 255);
        assert_eq!(ValueRange::ZERO_TO_ONE.denormalize(-0.2), 0);
        assert_eq!(ValueRange::MINUS_ONE_TO_ONE.denormalize(0.0), 128);
        assert_eq!(ValueRange::ZERO_TO_255.denormalize(f32::NAN), 0);
    }

    #[test]
    fn test_pixels_to_nchw_layout() {
        let data = vec![
            255, 0, 0, 255, 0, 255, 0, 255, //
            0, 0, 255, 255, 128, 128, 128, 0,
        ];
        let image = PixelBuffer::from_raw(2, 2, data).unwrap();
        let arr = pixels_to_nchw(&image, ValueRange::ZERO_TO_ONE);
        assert_eq!(arr.shape(), &[1, 3, 2, 2]);
        assert_eq!(arr[[0, 0, 0, 0]], 1.0);
        assert_eq!(arr[[0, 1, 0, 1]], 1.0);
        assert_eq!(arr[[0, 2, 1, 0]], 1.0);
        assert!((arr[[0, 0, 1, 1]] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_nchw_to_pixels_keeps_alpha() {
        let data = vec![10, 20, 30, 40, 50, 60, 70, 80];
        let image = PixelBuffer::from_raw(2, 1, data.clone()).unwrap();
        let arr = pixels_to_nchw(&image, ValueRange::MINUS_ONE_TO_ONE);
        let back = nchw_to_pixels(&arr, ValueRange::MINUS_ONE_TO_ONE, Some(&image)).unwrap();
        assert_eq!(back, data);

        let opaque = nchw_to_pixels(&arr, ValueRange::MINUS_ONE_TO_ONE, None).unwrap();
        assert_eq!(opaque[3], 255);
        assert_eq!(opaque[7], 255);
    }

    #[test]
    fn test_nchw_to_pixels_rejects_bad_shape() {
        let arr = Array4::<f32>::zeros((1, 4, 2, 2));
        assert!(nchw_to_pixels(&arr, ValueRange::ZERO_TO_ONE, None).is_err());
    }
}
