//! Tiled enlargement: PLAN, then a single- or multi-tile pass through the
//! model, then RECTIFY to the planned size.

use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{nchw_to_pixels, pixels_to_nchw, SuperResModel, ValueRange};
use crate::error::{PipelineError, PipelineResult};
use crate::planner::{plan_resolution, ResizeRequest};
use crate::resample::resize_bilinear;
use crate::types::{tile_grid, PixelBuffer, Tile, CHANNELS};

/// Owns the model handle. Every inference goes through one mutex, so at most
/// one tile is in flight process-wide.
pub struct UpscaleEngine {
    model: Mutex<Box<dyn SuperResModel>>,
    scale: u32,
    tile_size: u32,
    value_range: ValueRange,
}

impl std::fmt::Debug for UpscaleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpscaleEngine")
            .field("scale", &self.scale)
            .field("tile_size", &self.tile_size)
            .field("value_range", &self.value_range)
            .finish()
    }
}

impl UpscaleEngine {
    pub fn new(model: impl SuperResModel + 'static) -> PipelineResult<Self> {
        Self::from_boxed(Box::new(model))
    }

    pub fn from_boxed(model: Box<dyn SuperResModel>) -> PipelineResult<Self> {
        let scale = model.scale();
        let tile_size = model.tile_size();
        if scale == 0 || tile_size == 0 {
            return Err(PipelineError::inference(
                "load",
                format!("model reports scale={scale}, tile_size={tile_size}; both must be positive"),
            ));
        }
        let value_range = model.value_range();
        Ok(Self {
            model: Mutex::new(model),
            scale,
            tile_size,
            value_range,
        })
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn plan(&self, width: u32, height: u32, request: &ResizeRequest) -> PipelineResult<(u32, u32)> {
        plan_resolution(width, height, request, self.scale)
    }

    /// Enlarges `image` with the model and resizes the result to the planned
    /// target. Returns [`PipelineError::Cancelled`] without output when
    /// `cancel` fires before or between tiles.
    pub fn upscale(
        &self,
        image: &PixelBuffer,
        request: &ResizeRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<PixelBuffer> {
        check_cancelled(cancel, "plan")?;
        let (target_w, target_h) = self.plan(image.width(), image.height(), request)?;
        debug!(
            input_width = image.width(),
            input_height = image.height(),
            target_width = target_w,
            target_height = target_h,
            "Planned upscale"
        );

        let enlarged = self.enlarge_native(image, cancel)?;

        if enlarged.dimensions() == (target_w, target_h) {
            return Ok(enlarged);
        }

        debug!(
            from_width = enlarged.width(),
            from_height = enlarged.height(),
            target_width = target_w,
            target_height = target_h,
            "Rectifying enlarged image"
        );
        resize_bilinear(&enlarged, target_w, target_h)
    }

    /// Runs the model at its native scale: output is exactly
    /// `width*scale x height*scale`.
    pub fn enlarge_native(
        &self,
        image: &PixelBuffer,
        cancel: &CancellationToken,
    ) -> PipelineResult<PixelBuffer> {
        let (width, height) = image.dimensions();
        let out_w = width.checked_mul(self.scale);
        let out_h = height.checked_mul(self.scale);
        let (Some(out_w), Some(out_h)) = (out_w, out_h) else {
            return Err(PipelineError::resize(
                width,
                height,
                format!("{}x enlargement overflows", self.scale),
            ));
        };

        if width <= self.tile_size && height <= self.tile_size {
            check_cancelled(cancel, "tile")?;
            return self.enlarge_tile(image);
        }

        let rects = tile_grid(width, height, self.tile_size);
        let total = rects.len();
        info!(
            width,
            height,
            tile_size = self.tile_size,
            tiles = total,
            "Upscaling in tiles"
        );

        let dst_stride = out_w as usize * CHANNELS;
        let mut output = vec![0u8; dst_stride * out_h as usize];

        for (index, rect) in rects.into_iter().enumerate() {
            check_cancelled(cancel, "tile")?;

            let tile = Tile::extract(image, rect)?;
            let enlarged = self.enlarge_tile(&tile.pixels)?;

            let dst = rect.scaled(self.scale);
            let row_len = dst.width as usize * CHANNELS;
            for (row, src_row) in enlarged.as_raw().chunks_exact(row_len).enumerate() {
                let start = (dst.y as usize + row) * dst_stride + dst.x as usize * CHANNELS;
                output[start..start + row_len].copy_from_slice(src_row);
            }

            debug!(tile = index + 1, total, x = rect.x, y = rect.y, "Tile done");
        }

        PixelBuffer::from_raw(out_w, out_h, output)
    }

    fn lock_model(&self) -> PipelineResult<MutexGuard<'_, Box<dyn SuperResModel>>> {
        self.model
            .lock()
            .map_err(|_| PipelineError::inference("tile", "model handle poisoned by a panic"))
    }

    /// Pads `tile` to `T x T`, runs the model once, and scales the output
    /// back to `tile.width*scale x tile.height*scale`.
    fn enlarge_tile(&self, tile: &PixelBuffer) -> PipelineResult<PixelBuffer> {
        let t = self.tile_size;
        let out_side = t * self.scale;
        let (w, h) = tile.dimensions();

        let padded = resize_bilinear(tile, t, t)?;
        let input = pixels_to_nchw(&padded, self.value_range);

        let output = {
            let mut model = self.lock_model()?;
            model
                .infer(input)
                .map_err(|e| PipelineError::inference("tile", format!("{e:#}")))?
        };

        let expected = [1, 3, out_side as usize, out_side as usize];
        if output.shape() != expected {
            return Err(PipelineError::inference(
                "tile",
                format!(
                    "unexpected output shape {:?}, expected {expected:?}",
                    output.shape()
                ),
            ));
        }

        let rgb = nchw_to_pixels(&output, self.value_range, None)
            .map_err(|e| PipelineError::inference("tile", format!("{e:#}")))?;
        let full = PixelBuffer::from_raw(out_side, out_side, rgb)?;

        let (target_w, target_h) = (w * self.scale, h * self.scale);
        let enlarged = resize_bilinear(&full, target_w, target_h)?;

        if is_opaque(tile) {
            return Ok(enlarged);
        }

        let alpha = resize_bilinear(tile, target_w, target_h)?;
        let mut data = enlarged.into_raw();
        for (dst, src) in data
            .chunks_exact_mut(CHANNELS)
            .zip(alpha.as_raw().chunks_exact(CHANNELS))
        {
            dst[3] = src[3];
        }
        PixelBuffer::from_raw(target_w, target_h, data)
    }
}

fn is_opaque(image: &PixelBuffer) -> bool {
    image.as_raw().chunks_exact(CHANNELS).all(|p| p[3] == u8::MAX)
}

fn check_cancelled(cancel: &CancellationToken, stage: &'static str) -> PipelineResult<()> {
    if cancel.is_cancelled() {
        debug!(stage, "Upscale cancelled");
        return Err(PipelineError::Cancelled { stage });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::bail;
    use ndarray::Array4;

    use super::*;

    /// Nearest-neighbour stand-in for a real network.
    struct NearestUpscaler {
        scale: u32,
        tile_size: u32,
        calls: Arc<AtomicUsize>,
        cancel_after_first: Option<CancellationToken>,
    }

    impl NearestUpscaler {
        fn new(scale: u32, tile_size: u32) -> Self {
            Self {
                scale,
                tile_size,
                calls: Arc::new(AtomicUsize::new(0)),
                cancel_after_first: None,
            }
        }
    }

    impl SuperResModel for NearestUpscaler {
        fn scale(&self) -> u32 {
            self.scale
        }

        fn tile_size(&self) -> u32 {
            self.tile_size
        }

        fn infer(&mut self, input: Array4<f32>) -> anyhow::Result<Array4<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.cancel_after_first {
                token.cancel();
            }
            let s = self.scale as usize;
            let (h, w) = (input.shape()[2], input.shape()[3]);
            Ok(Array4::from_shape_fn((1, 3, h * s, w * s), |(n, c, y, x)| {
                input[[n, c, y / s, x / s]]
            }))
        }
    }

    /// Records how many `infer` calls overlap.
    struct OverlapTracker {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl SuperResModel for OverlapTracker {
        fn scale(&self) -> u32 {
            2
        }

        fn tile_size(&self) -> u32 {
            8
        }

        fn infer(&mut self, input: Array4<f32>) -> anyhow::Result<Array4<f32>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(2));
            self.active.fetch_sub(1, Ordering::SeqCst);

            let (h, w) = (input.shape()[2], input.shape()[3]);
            Ok(Array4::from_shape_fn((1, 3, h * 2, w * 2), |(n, c, y, x)| {
                input[[n, c, y / 2, x / 2]]
            }))
        }
    }

    struct FailingModel;

    impl SuperResModel for FailingModel {
        fn scale(&self) -> u32 {
            4
        }

        fn tile_size(&self) -> u32 {
            8
        }

        fn infer(&mut self, _input: Array4<f32>) -> anyhow::Result<Array4<f32>> {
            bail!("device lost")
        }
    }

    struct WrongShapeModel;

    impl SuperResModel for WrongShapeModel {
        fn scale(&self) -> u32 {
            2
        }

        fn tile_size(&self) -> u32 {
            8
        }

        fn infer(&mut self, input: Array4<f32>) -> anyhow::Result<Array4<f32>> {
            Ok(input)
        }
    }

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> PixelBuffer {
        PixelBuffer::filled(width, height, rgba).unwrap()
    }

    #[test]
    fn test_single_tile_default_request() {
        let model = NearestUpscaler::new(4, 512);
        let calls = model.calls.clone();
        let engine = UpscaleEngine::new(model).unwrap();

        let out = engine
            .upscale(
                &solid(256, 256, [10, 20, 30, 255]),
                &ResizeRequest::model_default(),
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(out.dimensions(), (1024, 1024));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.pixel(700, 3), [10, 20, 30, 255]);
    }

    #[test]
    fn test_multi_tile_native_then_rectify() {
        let model = NearestUpscaler::new(4, 512);
        let calls = model.calls.clone();
        let engine = UpscaleEngine::new(model).unwrap();
        let image = solid(1024, 600, [200, 100, 50, 255]);
        let cancel = CancellationToken::new();

        let native = engine.enlarge_native(&image, &cancel).unwrap();
        assert_eq!(native.dimensions(), (4096, 2400));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(native.pixel(4095, 2399), [200, 100, 50, 255]);

        let request = ResizeRequest::keep_aspect(Some(3840), Some(2160));
        let out = engine.upscale(&image, &request, &cancel).unwrap();
        assert_eq!(out.dimensions(), (3686, 2160));
        assert_eq!(out.pixel(1800, 1000), [200, 100, 50, 255]);
    }

    #[test]
    fn test_tiles_land_at_scaled_coordinates() {
        let mut data = Vec::new();
        for y in 0..12u32 {
            for x in 0..20u32 {
                let r = if x < 8 { 255 } else { 0 };
                let g = if y < 8 { 255 } else { 0 };
                data.extend_from_slice(&[r, g, 0, 255]);
            }
        }
        let image = PixelBuffer::from_raw(20, 12, data).unwrap();
        let engine = UpscaleEngine::new(NearestUpscaler::new(2, 8)).unwrap();

        let out = engine
            .enlarge_native(&image, &CancellationToken::new())
            .unwrap();
        assert_eq!(out.dimensions(), (40, 24));
        assert_eq!(out.pixel(2, 2), [255, 255, 0, 255]);
        assert_eq!(out.pixel(30, 2), [0, 255, 0, 255]);
        assert_eq!(out.pixel(2, 20), [255, 0, 0, 255]);
        assert_eq!(out.pixel(39, 23), [0, 0, 0, 255]);
    }

    #[test]
    fn test_alpha_follows_source_tile() {
        let engine = UpscaleEngine::new(NearestUpscaler::new(2, 16)).unwrap();
        let out = engine
            .enlarge_native(&solid(5, 7, [90, 90, 90, 40]), &CancellationToken::new())
            .unwrap();
        assert_eq!(out.dimensions(), (10, 14));
        assert!(out.as_raw().chunks_exact(4).all(|p| p[3] == 40));
    }

    #[test]
    fn test_cancelled_before_start() {
        let model = NearestUpscaler::new(4, 64);
        let calls = model.calls.clone();
        let engine = UpscaleEngine::new(model).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine
            .upscale(&solid(32, 32, [0, 0, 0, 255]), &ResizeRequest::default(), &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancelled_between_tiles() {
        let cancel = CancellationToken::new();
        let mut model = NearestUpscaler::new(2, 8);
        model.cancel_after_first = Some(cancel.clone());
        let calls = model.calls.clone();
        let engine = UpscaleEngine::new(model).unwrap();

        let err = engine
            .upscale(&solid(32, 8, [0, 0, 0, 255]), &ResizeRequest::default(), &cancel)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { stage: "tile" }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_model_failure_is_inference_error() {
        let engine = UpscaleEngine::new(FailingModel).unwrap();
        let err = engine
            .upscale(&solid(4, 4, [1, 2, 3, 255]), &ResizeRequest::default(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Inference { .. }));
        assert!(err.to_string().contains("device lost"));
    }

    #[test]
    fn test_unexpected_output_shape_is_rejected() {
        let engine = UpscaleEngine::new(WrongShapeModel).unwrap();
        let err = engine
            .enlarge_native(&solid(4, 4, [1, 2, 3, 255]), &CancellationToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("unexpected output shape"));
    }

    #[test]
    fn test_inference_is_serialized_across_threads() {
        let peak = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = Arc::new(
            UpscaleEngine::new(OverlapTracker {
                active: Arc::new(AtomicUsize::new(0)),
                peak: peak.clone(),
                calls: calls.clone(),
            })
            .unwrap(),
        );

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let engine = Arc::clone(&engine);
                scope.spawn(move || {
                    let out = engine
                        .upscale(
                            &solid(24, 8, [5, 6, 7, 255]),
                            &ResizeRequest::default(),
                            &CancellationToken::new(),
                        )
                        .unwrap();
                    assert_eq!(out.dimensions(), (48, 16));
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 12);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_scale_model_rejected() {
        let err = UpscaleEngine::new(NearestUpscaler::new(0, 8)).unwrap_err();
        assert!(err.to_string().contains("scale=0"));
    }
}
