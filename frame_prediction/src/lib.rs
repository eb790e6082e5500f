mod inference_service;
mod model_service;
mod ort_service;
mod render;
mod routes;
mod server;
mod tensor;

pub mod config;

pub use inference_service::{binarize, FramePrediction, InferenceService, PredictError};
pub use model_service::{ModelError, ModelService};
pub use ort_service::OrtModelService;
pub use server::{build_router, start_server, HttpServer, SharedState};
