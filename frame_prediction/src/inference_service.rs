use crate::{
    model_service::{ModelError, ModelService},
    tensor::shape_string,
};
use ndarray::{concatenate, Array2, ArrayD, ArrayViewD, Axis, Ix2};
use std::sync::Arc;
use thiserror::Error;

/// Number of frames taken from the start of the selected sequence.
pub const BASE_FRAMES: usize = 4;
/// Length of the conditioning window handed to the model.
pub const WINDOW_FRAMES: usize = BASE_FRAMES + 1;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("Index {index} is out of bounds for axis 0 with size {size}")]
    IndexOutOfBounds { index: usize, size: usize },
    #[error("expected a batch of shape (batch, time, height, width[, channel]), got {0}")]
    BatchRank(String),
    #[error("sequence has {0} frames, at least 5 are required")]
    TooFewFrames(usize),
    #[error("model output of shape {0} cannot be reduced to a single frame: {1}")]
    OutputShape(String, String),
    #[error("Dimension mismatch: frames.shape = {frames}, predicted_frame.shape = {predicted}")]
    DimensionMismatch { frames: String, predicted: String },
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Result of one prediction: the conditioning window and the frame that follows it.
#[derive(Debug, Clone)]
pub struct FramePrediction {
    pub window: ArrayD<f32>,
    pub predicted_frame: Array2<f32>,
}

#[derive(Debug)]
pub struct InferenceService<M: ModelService> {
    model_service: Arc<M>,
}

impl<M: ModelService> Clone for InferenceService<M> {
    fn clone(&self) -> Self {
        Self {
            model_service: self.model_service.clone(),
        }
    }
}

impl<M: ModelService> InferenceService<M> {
    pub fn new(model_service: M) -> Self {
        Self {
            model_service: Arc::new(model_service),
        }
    }

    /// Predicts the frame following sequence `index` of `batch`.
    pub fn predict(
        &self,
        batch: &ArrayD<f32>,
        index: usize,
    ) -> Result<FramePrediction, PredictError> {
        let size = batch.shape().first().copied().unwrap_or(0);
        if batch.ndim() == 0 || index >= size {
            return Err(PredictError::IndexOutOfBounds { index, size });
        }
        if !(4..=5).contains(&batch.ndim()) {
            return Err(PredictError::BatchRank(shape_string(batch.shape())));
        }

        let sequence = batch.index_axis(Axis(0), index);
        let window = conditioning_window(sequence)?;

        let input = window.view().insert_axis(Axis(0));
        let output = self.model_service.predict(input)?;
        let predicted = last_frame(output)?;

        tracing::debug!("frames.shape: {}", shape_string(window.shape()));
        tracing::debug!("predicted_frame.shape: {}", shape_string(predicted.shape()));

        let mismatch = || PredictError::DimensionMismatch {
            frames: shape_string(window.shape()),
            predicted: shape_string(predicted.shape()),
        };
        if spatial_shape(&window.shape()[1..]) != predicted.shape() {
            return Err(mismatch());
        }
        let predicted_frame = predicted
            .clone()
            .into_dimensionality::<Ix2>()
            .map_err(|_| mismatch())?;

        Ok(FramePrediction {
            window,
            predicted_frame,
        })
    }
}

/// First four frames followed by the fifth, as a `(5, H, W[, C])` window.
fn conditioning_window(sequence: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, PredictError> {
    let frames = sequence.shape()[0];
    if frames < WINDOW_FRAMES {
        return Err(PredictError::TooFewFrames(frames));
    }

    let base = sequence.slice_axis(Axis(0), (0..BASE_FRAMES).into());
    let fifth = sequence.index_axis(Axis(0), BASE_FRAMES).insert_axis(Axis(0));

    concatenate(Axis(0), &[base, fifth]).map_err(|e| PredictError::BatchRank(e.to_string()))
}

/// Drops the batch axis, keeps the last time step and drops a trailing channel axis.
fn last_frame(output: ArrayD<f32>) -> Result<ArrayD<f32>, PredictError> {
    let shape = shape_string(output.shape());
    let reject = |reason: &str| PredictError::OutputShape(shape.clone(), reason.to_string());

    if output.ndim() < 2 || output.shape()[0] != 1 {
        return Err(reject("expected a leading batch axis of size 1"));
    }
    let unbatched = output.index_axis_move(Axis(0), 0);
    let steps = unbatched.shape()[0];
    if steps == 0 {
        return Err(reject("output has no time steps"));
    }

    let last = unbatched.index_axis_move(Axis(0), steps - 1);
    match last.shape().last() {
        Some(1) => {
            let channel = last.ndim() - 1;
            Ok(last.index_axis_move(Axis(channel), 0))
        }
        _ => Err(reject("expected a trailing channel axis of size 1")),
    }
}

fn spatial_shape(frame_shape: &[usize]) -> &[usize] {
    match frame_shape {
        [rest @ .., 1] if rest.len() == 2 => rest,
        other => other,
    }
}

/// Maps each value to 1 when it reaches `threshold`, else 0.
pub fn binarize(frame: &Array2<f32>, threshold: f32) -> Vec<Vec<u8>> {
    frame
        .outer_iter()
        .map(|row| row.iter().map(|&v| u8::from(v >= threshold)).collect())
        .collect()
}
