//! Execution provider selection for ONNX super-resolution sessions.
//!
//! Provides [`InferenceBackend`] and [`build_session`], which creates an
//! `ort::Session` with the configured execution providers and, for TensorRT,
//! a persistent engine cache.

use std::fmt;
use std::path::Path;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

const TRT_PROGRESS_TICK: Duration = Duration::from_secs(15);

/// Inference backend selection.
///
/// `Tensorrt` registers CUDA as a fallback provider; `Cuda` falls back to
/// the CPU provider when no device is present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
    Tensorrt,
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

fn cache_file_count(root: &Path) -> u64 {
    let mut count = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                count += 1;
            }
        }
    }
    count
}

/// Build an `ort::Session` for `config.backend`.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    if !config.model_path.is_file() {
        anyhow::bail!("ONNX model not found: {}", config.model_path.display());
    }

    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match config.backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with default CPU EP");
            builder.commit_from_file(config.model_path).with_context(|| {
                format!("Failed to load ONNX model: {}", config.model_path.display())
            })?
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }

            debug!(backend = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));

            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let cache_path = cache_dir.to_string_lossy().to_string();
            let files_before = cache_file_count(cache_dir);
            let started = Instant::now();

            info!(
                cache_dir = %cache_dir.display(),
                cache_files = files_before,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let (stop_tx, stop_rx) = channel::<()>();
            let progress_thread = thread::spawn(move || {
                let mut elapsed = TRT_PROGRESS_TICK.as_secs();
                loop {
                    match stop_rx.recv_timeout(TRT_PROGRESS_TICK) {
                        Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            info!(
                                elapsed_secs = elapsed,
                                "TensorRT session initialization still in progress"
                            );
                            elapsed += TRT_PROGRESS_TICK.as_secs();
                        }
                    }
                }
            });

            // TRT EP fails at runtime without libnvinfer; CUDA EP keeps the
            // session usable.
            let session_result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                });

            let _ = stop_tx.send(());
            let _ = progress_thread.join();

            let elapsed = started.elapsed().as_secs_f64();
            match session_result {
                Ok(session) => {
                    info!(
                        elapsed_secs = elapsed,
                        cache_files_before = files_before,
                        cache_files_after = cache_file_count(cache_dir),
                        "TensorRT session ready"
                    );
                    session
                }
                Err(error_value) => {
                    error!(
                        elapsed_secs = elapsed,
                        cache_dir = %cache_dir.display(),
                        error = %error_value,
                        "TensorRT session initialization failed"
                    );
                    return Err(error_value);
                }
            }
        }
    };

    Ok(session)
}
