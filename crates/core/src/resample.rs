//! Pure-Rust bilinear resizing of RGBA8 buffers.

use crate::error::{PipelineError, PipelineResult};
use crate::types::{PixelBuffer, CHANNELS};

fn check_target(width: u32, height: u32) -> PipelineResult<()> {
    if width == 0 || height == 0 {
        return Err(PipelineError::resize(
            width,
            height,
            "target dimensions must be positive",
        ));
    }
    Ok(())
}

/// Bilinear interpolation resize. Each channel, alpha included, is
/// interpolated independently.
pub fn resize_bilinear(
    image: &PixelBuffer,
    width: u32,
    height: u32,
) -> PipelineResult<PixelBuffer> {
    check_target(width, height)?;
    if image.dimensions() == (width, height) {
        return Ok(image.clone());
    }

    let (src_w, src_h) = (image.width() as usize, image.height() as usize);
    let (dst_w, dst_h) = (width as usize, height as usize);
    let src = image.as_raw();
    let mut dst = vec![0u8; dst_w * dst_h * CHANNELS];

    for dst_y in 0..dst_h {
        // Map destination pixel center to source coordinates
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
        let src_y0 = (src_yf.floor().max(0.0) as usize).min(src_h - 1);
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0);

        for dst_x in 0..dst_w {
            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
            let src_x0 = (src_xf.floor().max(0.0) as usize).min(src_w - 1);
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0);

            let di = (dst_y * dst_w + dst_x) * CHANNELS;

            for c in 0..CHANNELS {
                let p00 = src[(src_y0 * src_w + src_x0) * CHANNELS + c] as f64;
                let p10 = src[(src_y0 * src_w + src_x1) * CHANNELS + c] as f64;
                let p01 = src[(src_y1 * src_w + src_x0) * CHANNELS + c] as f64;
                let p11 = src[(src_y1 * src_w + src_x1) * CHANNELS + c] as f64;

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                let val = top * (1.0 - fy) + bot * fy;

                dst[di + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    PixelBuffer::from_raw(width, height, dst)
}
