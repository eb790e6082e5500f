mod files;
mod health;
mod predict;

use crate::{model_service::ModelService, server::SharedState};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub(crate) fn error_response(status: StatusCode, error: String) -> Response {
    if status.is_server_error() {
        tracing::error!("Request failed with {}: {}", status, error);
    } else {
        tracing::warn!("Request rejected with {}: {}", status, error);
    }
    (status, Json(ErrorBody { error })).into_response()
}

pub fn api_routes<M: ModelService>() -> Router<SharedState<M>> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/predict", post(predict::predict::<M>))
        .route("/files/{name}", get(files::download_file::<M>))
}
