//! Error taxonomy for the resolution pipeline.
//!
//! Single-image calls surface the first [`PipelineError`] unchanged; the batch
//! orchestrator flattens it into the per-item `error` message.

use thiserror::Error;

const BYTES_PER_PIXEL: u64 = 4;
const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(
        "invalid dimensions {width}x{height}: {reason} (estimated buffer {})",
        footprint_label(.estimated_bytes)
    )]
    Validation {
        width: i64,
        height: i64,
        estimated_bytes: u64,
        reason: String,
    },

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("inference failed during {stage}: {message}")]
    Inference { stage: &'static str, message: String },

    #[error("resize to {width}x{height} failed: {reason}")]
    Resize {
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("{context}: {source:#}")]
    Io {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cancelled during {stage}")]
    Cancelled { stage: &'static str },
}

impl PipelineError {
    /// Builds a validation error whose message carries the RGBA footprint of
    /// the rejected dimensions.
    pub fn validation(width: i64, height: i64, reason: impl Into<String>) -> Self {
        Self::Validation {
            width,
            height,
            estimated_bytes: estimated_rgba_bytes(width, height),
            reason: reason.into(),
        }
    }

    pub fn inference(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Inference {
            stage,
            message: message.into(),
        }
    }

    pub fn resize(width: u32, height: u32, reason: impl Into<String>) -> Self {
        Self::Resize {
            width,
            height,
            reason: reason.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Uncompressed RGBA8 size of a `width x height` buffer. Negative sides count
/// as zero.
pub fn estimated_rgba_bytes(width: i64, height: i64) -> u64 {
    let w = width.max(0) as u64;
    let h = height.max(0) as u64;
    w.saturating_mul(h).saturating_mul(BYTES_PER_PIXEL)
}

fn footprint_label(bytes: &u64) -> String {
    format_footprint(*bytes)
}

pub fn format_footprint(bytes: u64) -> String {
    let value = bytes as f64;
    if value >= GIB {
        format!("{:.2} GB", value / GIB)
    } else {
        format!("{:.2} MB", value / MIB)
    }
}
