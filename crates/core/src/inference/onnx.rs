//! [`SuperResModel`] backed by an `ort::Session`.
//!
//! Supports FP32 models and FP16 models (input dtype detected from the
//! session); FP16 tensors are converted with `half`'s slice conversions.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use half::{f16, slice::HalfFloatSliceExt};
use ndarray::{Array4, ArrayD, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::debug;

use super::backend::{build_session, InferenceBackend, SessionConfig};
use super::{SuperResModel, ValueRange};
use crate::model_registry::ModelEntry;

pub struct OnnxModel {
    session: Session,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    scale: u32,
    tile_size: u32,
    value_range: ValueRange,
}

impl std::fmt::Debug for OnnxModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxModel")
            .field("input_name", &self.input_name)
            .field("output_name", &self.output_name)
            .field("is_fp16", &self.is_fp16)
            .field("scale", &self.scale)
            .field("tile_size", &self.tile_size)
            .finish()
    }
}

/// Load-time parameters for an ONNX model.
#[derive(Debug, Clone, Copy)]
pub struct OnnxModelOptions<'a> {
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
    pub scale: u32,
    pub tile_size: u32,
    pub value_range: ValueRange,
}

impl<'a> OnnxModelOptions<'a> {
    pub fn for_entry(entry: &ModelEntry, backend: InferenceBackend) -> Self {
        Self {
            backend,
            trt_cache_dir: None,
            scale: entry.scale,
            tile_size: entry.tile_size,
            value_range: entry.value_range,
        }
    }
}

impl OnnxModel {
    pub fn load(model_path: &Path, options: &OnnxModelOptions<'_>) -> Result<Self> {
        if options.scale == 0 || options.tile_size == 0 {
            anyhow::bail!(
                "model scale and tile size must be positive (scale={}, tile_size={})",
                options.scale,
                options.tile_size
            );
        }

        debug!(
            model = %model_path.display(),
            scale = options.scale,
            tile_size = options.tile_size,
            backend = %options.backend,
            "Loading ONNX super-resolution model"
        );

        let session = build_session(&SessionConfig {
            model_path,
            backend: options.backend,
            trt_cache_dir: options.trt_cache_dir,
        })?;

        let input = session
            .inputs()
            .first()
            .context("ONNX model declares no inputs")?;
        let output = session
            .outputs()
            .first()
            .context("ONNX model declares no outputs")?;
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        Ok(Self {
            session,
            input_name,
            output_name,
            is_fp16,
            scale: options.scale,
            tile_size: options.tile_size,
            value_range: options.value_range,
        })
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16
    }

    fn run_f32(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let input_tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output_view.to_owned())
    }

    fn run_f16(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let input = input.as_standard_layout().into_owned();
        let f32_slice = input
            .as_slice()
            .ok_or_else(|| anyhow!("input tensor is not contiguous"))?;
        let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
        fp16_data.convert_from_f32_slice(f32_slice);

        let fp16_array = ArrayD::from_shape_vec(input.shape().to_vec(), fp16_data)?;
        let input_tensor = Tensor::from_array(fp16_array)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;

        let fp16_owned = output_view.as_standard_layout().into_owned();
        let fp16_slice = fp16_owned
            .as_slice()
            .ok_or_else(|| anyhow!("output tensor is not contiguous"))?;
        let mut f32_data = vec![0.0f32; fp16_slice.len()];
        fp16_slice.convert_to_f32_slice(&mut f32_data);

        Ok(ArrayD::from_shape_vec(fp16_owned.shape().to_vec(), f32_data)?)
    }
}

impl SuperResModel for OnnxModel {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn value_range(&self) -> ValueRange {
        self.value_range
    }

    fn infer(&mut self, input: Array4<f32>) -> Result<Array4<f32>> {
        let output = if self.is_fp16 {
            self.run_f16(input)?
        } else {
            self.run_f32(input)?
        };
        Ok(output.into_dimensionality::<Ix4>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_registry::find_entry;

    #[test]
    fn test_options_for_entry() {
        let entry = find_entry("realcugan-pro").unwrap();
        let options = OnnxModelOptions::for_entry(entry, InferenceBackend::Cuda);
        assert_eq!(options.scale, 4);
        assert_eq!(options.tile_size, 512);
        assert_eq!(options.value_range, ValueRange::ZERO_TO_ONE);
        assert_eq!(options.backend, InferenceBackend::Cuda);
    }

    #[test]
    fn test_load_rejects_zero_tile_size() {
        let options = OnnxModelOptions {
            backend: InferenceBackend::Cpu,
            trt_cache_dir: None,
            scale: 4,
            tile_size: 0,
            value_range: ValueRange::ZERO_TO_ONE,
        };
        let err = OnnxModel::load(Path::new("model.onnx"), &options).unwrap_err();
        assert!(err.to_string().contains("tile_size=0"));
    }

    /// Requires the ONNX Runtime library and a model file.
    /// Run: `cargo test -p sweetdesk-core -- --ignored`
    #[test]
    #[ignore]
    fn test_real_model_output_shape() {
        let entry = find_entry("realcugan-pro").unwrap();
        let options = OnnxModelOptions {
            tile_size: 64,
            ..OnnxModelOptions::for_entry(entry, InferenceBackend::Cpu)
        };
        let mut model =
            OnnxModel::load(Path::new("models/realcugan/realcugan-pro.onnx"), &options)
                .expect("model should load");
        let output = model
            .infer(Array4::from_elem((1, 3, 64, 64), 0.5))
            .expect("inference should succeed");
        assert_eq!(output.shape(), &[1, 3, 256, 256]);
    }
}
