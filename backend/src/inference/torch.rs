use ndarray::ArrayView5;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tch::{CModule, Device, Kind, Tensor};

use super::{FrameClassifier, InferenceError};

/// TorchScript export of the video classifier.
#[derive(Clone)]
pub struct TorchClassifier {
    model: Arc<Mutex<CModule>>,
    device: Device,
}

impl TorchClassifier {
    pub fn load(model_path: &Path) -> Result<Self, InferenceError> {
        let device = Device::cuda_if_available();
        let mut module = CModule::load_on_device(model_path, device)?;
        module.set_eval();
        log::info!("Loaded model {} on {:?}", model_path.display(), device);
        Ok(Self {
            model: Arc::new(Mutex::new(module)),
            device,
        })
    }
}

impl FrameClassifier for TorchClassifier {
    fn predict(&self, input: ArrayView5<'_, f32>) -> Result<Vec<f32>, InferenceError> {
        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let data = input.as_standard_layout();
        let data = data
            .as_slice()
            .ok_or_else(|| InferenceError::Failure("input tensor is not contiguous".into()))?;

        let tensor = Tensor::from_slice(data).view(shape.as_slice()).to_device(self.device);

        let model = self
            .model
            .lock()
            .map_err(|_| InferenceError::Failure("model lock poisoned".into()))?;
        let output = tch::no_grad(|| model.forward_ts(&[tensor]))?;

        let output_flat = output.to_kind(Kind::Float).to_device(Device::Cpu).view([-1]);
        let num_elements = output_flat.size()[0] as usize;
        let mut output_vec = vec![0.0f32; num_elements];
        output_flat.copy_data(&mut output_vec, num_elements);
        Ok(output_vec)
    }
}
