use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

pub const CHANNELS: usize = 4;

/// Owned RGBA8 image. Dimensions are fixed at construction; every transform
/// produces a new buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl PixelBuffer {
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> PipelineResult<Self> {
        if width == 0 || height == 0 {
            return Err(PipelineError::resize(
                width,
                height,
                "pixel buffer must have non-zero dimensions",
            ));
        }

        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(PipelineError::resize(
                width,
                height,
                format!(
                    "RGBA data length mismatch: expected {expected}, got {}",
                    data.len()
                ),
            ));
        }

        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> PipelineResult<Self> {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * CHANNELS);
        for _ in 0..pixels {
            data.extend_from_slice(&rgba);
        }
        Self::from_raw(width, height, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * CHANNELS;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }

    /// Copies the rectangle into a new buffer. The rectangle must lie inside
    /// the image.
    pub fn crop(&self, rect: TileRect) -> PipelineResult<Self> {
        if rect.width == 0
            || rect.height == 0
            || rect.x + rect.width > self.width
            || rect.y + rect.height > self.height
        {
            return Err(PipelineError::resize(
                rect.width,
                rect.height,
                format!(
                    "crop at ({}, {}) exceeds source {}x{}",
                    rect.x, rect.y, self.width, self.height
                ),
            ));
        }

        let src_stride = self.width as usize * CHANNELS;
        let row_len = rect.width as usize * CHANNELS;
        let mut data = Vec::with_capacity(row_len * rect.height as usize);
        for y in rect.y..rect.y + rect.height {
            let start = y as usize * src_stride + rect.x as usize * CHANNELS;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }

        Self::from_raw(rect.width, rect.height, data)
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

/// Coordinate-addressed region of a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileRect {
    pub fn scaled(&self, factor: u32) -> TileRect {
        TileRect {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
        }
    }
}

/// A tile extracted from its source, alive for one inference call.
#[derive(Debug)]
pub struct Tile {
    pub rect: TileRect,
    pub pixels: PixelBuffer,
}

impl Tile {
    pub fn extract(source: &PixelBuffer, rect: TileRect) -> PipelineResult<Self> {
        Ok(Self {
            rect,
            pixels: source.crop(rect)?,
        })
    }
}

/// Non-overlapping row-major grid of at most `tile_size` squares. Edge tiles
/// are clipped to the image.
pub fn tile_grid(width: u32, height: u32, tile_size: u32) -> Vec<TileRect> {
    if tile_size == 0 {
        return Vec::new();
    }

    let mut rects = Vec::new();
    let mut y = 0;
    while y < height {
        let tile_h = tile_size.min(height - y);
        let mut x = 0;
        while x < width {
            let tile_w = tile_size.min(width - x);
            rects.push(TileRect {
                x,
                y,
                width: tile_w,
                height: tile_h,
            });
            x += tile_size;
        }
        y += tile_size;
    }
    rects
}
