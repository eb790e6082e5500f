use crate::{
    config::{ModelConfig, Validatable},
    model_service::{ModelError, ModelService},
};
use ndarray::{ArrayD, ArrayViewD, Axis};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::Mutex;

pub struct OrtModelService {
    session: Mutex<Session>,
    output_name: String,
    expand_channel: bool,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> Result<Self, ModelError> {
        model_config.validate().map_err(ModelError::Load)?;

        let session = Session::builder()
            .map_err(|e| ModelError::Load(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| ModelError::Load(e.to_string()))?
            .commit_from_file(model_config.get_path())
            .map_err(|e| ModelError::Load(e.to_string()))?;

        if !session
            .outputs
            .iter()
            .any(|output| output.name == model_config.output_name)
        {
            let available: Vec<&str> = session.outputs.iter().map(|o| o.name.as_str()).collect();
            return Err(ModelError::Load(format!(
                "model has no output named `{}` (available: {:?})",
                model_config.output_name, available
            )));
        }

        tracing::info!(
            "Loaded ONNX model from {:?} with {} input(s)",
            model_config.get_path(),
            session.inputs.len()
        );

        Ok(Self {
            session: Mutex::new(session),
            output_name: model_config.output_name.clone(),
            expand_channel: model_config.expand_channel,
        })
    }

    pub fn run_inference(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, ModelError> {
        let mut session = self
            .session
            .lock()
            .map_err(|e| ModelError::Inference(format!("session mutex poisoned: {}", e)))?;

        let owned_buffer;
        let input_view = if input.is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().into_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| ModelError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Output(e.to_string()))?;

        ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| ModelError::Output(format!("invalid tensor shape: {}", e)))
    }
}

/// Appends a channel axis to a `(1, T, H, W)` window.
fn with_channel_axis(input: ArrayViewD<'_, f32>, expand_channel: bool) -> ArrayViewD<'_, f32> {
    if expand_channel && input.ndim() == 4 {
        input.insert_axis(Axis(4))
    } else {
        input
    }
}

impl ModelService for OrtModelService {
    fn predict(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, ModelError> {
        let input = with_channel_axis(input, self.expand_channel);
        tracing::debug!("Running inference on input of shape {:?}", input.shape());
        self.run_inference(input)
    }
}
