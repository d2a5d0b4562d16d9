//! Core crate for sweetdesk: resolution planning, tiled super-resolution,
//! exact-dimension fitting and sequential batches.

pub mod batch;
pub mod codec;
pub mod config;
pub mod error;
pub mod fetch;
pub mod fitter;
pub mod inference;
pub mod logging;
pub mod model_registry;
pub mod pipeline;
pub mod planner;
pub mod resample;
pub mod runtime;
pub mod storage;
pub mod types;

pub use error::{PipelineError, PipelineResult};
