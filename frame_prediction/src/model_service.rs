use ndarray::{ArrayD, ArrayViewD};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("failed to extract output: {0}")]
    Output(String),
}

/// A next-frame predictor.
///
/// `input` is a batched conditioning window of shape `(1, T, H, W[, C])`. The
/// returned array keeps the batch axis, e.g. `(1, T', H, W, 1)`.
pub trait ModelService: Send + Sync + 'static {
    fn predict(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, ModelError>;
}
