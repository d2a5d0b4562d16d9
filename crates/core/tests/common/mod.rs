#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use anyhow::bail;
use ndarray::Array4;
use sweetdesk_core::codec::{self, OutputFormat};
use sweetdesk_core::fetch::Fetcher;
use sweetdesk_core::inference::{SuperResModel, UpscaleEngine};
use sweetdesk_core::pipeline::ImageProcessor;
use sweetdesk_core::types::PixelBuffer;

/// Nearest-neighbour stand-in for a super-resolution network.
pub struct NearestUpscaler {
    pub scale: u32,
    pub tile_size: u32,
    pub calls: Arc<AtomicUsize>,
}

impl NearestUpscaler {
    pub fn new(scale: u32, tile_size: u32) -> Self {
        Self {
            scale,
            tile_size,
            calls: Arc::new(AtomicUsize::new(0)),
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
        let s = self.scale as usize;
        let (h, w) = (input.shape()[2], input.shape()[3]);
        Ok(Array4::from_shape_fn((1, 3, h * s, w * s), |(n, c, y, x)| {
            input[[n, c, y / s, x / s]]
        }))
    }
}

pub fn engine(scale: u32, tile_size: u32) -> Arc<UpscaleEngine> {
    Arc::new(UpscaleEngine::new(NearestUpscaler::new(scale, tile_size)).unwrap())
}

/// 2x model on 32-pixel tiles.
pub fn processor() -> ImageProcessor {
    ImageProcessor::new(engine(2, 32))
}

/// Diagonal gradient, noisy enough that PNG compression keeps it large.
pub fn gradient(width: u32, height: u32) -> PixelBuffer {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[
                (x * 7 % 256) as u8,
                (y * 13 % 256) as u8,
                ((x ^ y) * 3 % 256) as u8,
                255,
            ]);
        }
    }
    PixelBuffer::from_raw(width, height, data).unwrap()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    codec::encode(&gradient(width, height), OutputFormat::Png, 0).unwrap()
}

/// Fetcher serving canned bodies. `panic://` URLs panic, `gate://` URLs
/// block until the test sends on the gate, anything else unknown fails.
#[derive(Default)]
pub struct CannedFetcher {
    bodies: HashMap<String, Vec<u8>>,
    gate: Option<Mutex<mpsc::Receiver<()>>>,
}

impl CannedFetcher {
    pub fn with(mut self, url: &str, body: Vec<u8>) -> Self {
        self.bodies.insert(url.to_string(), body);
        self
    }

    pub fn gated(mut self) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        self.gate = Some(Mutex::new(rx));
        (self, tx)
    }
}

impl Fetcher for CannedFetcher {
    fn download(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        if url.starts_with("panic://") {
            panic!("fetcher exploded on {url}");
        }
        if let Some(rest) = url.strip_prefix("gate://") {
            if let Some(gate) = &self.gate {
                gate.lock().unwrap().recv()?;
            }
            return match self.bodies.get(rest) {
                Some(body) => Ok(body.clone()),
                None => bail!("no canned body for {rest}"),
            };
        }
        match self.bodies.get(url) {
            Some(body) => Ok(body.clone()),
            None => bail!("download request returned HTTP 404 for {url}"),
        }
    }
}
