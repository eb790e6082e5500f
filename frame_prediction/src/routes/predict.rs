use crate::{
    config::ResponseMode,
    inference_service::{binarize, PredictError},
    model_service::ModelService,
    render::{save_comparison, RenderError},
    routes::error_response,
    server::SharedState,
    tensor::{from_nested_json, TensorError},
};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Failed to read request body: {}", .0.body_text())]
    Body(#[from] BytesRejection),
    #[error("Malformed request body: {0}")]
    MalformedBody(String),
    #[error("Incomplete data: missing {0}")]
    IncompleteData(String),
    #[error("max_idx must be a non-negative integer, got {0}")]
    InvalidIndex(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Predict(#[from] PredictError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Body(rejection) => rejection.status(),
            ApiError::MalformedBody(_)
            | ApiError::IncompleteData(_)
            | ApiError::InvalidIndex(_)
            | ApiError::Predict(PredictError::IndexOutOfBounds { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Tensor(_) | ApiError::Predict(_) | ApiError::Render(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.to_string())
    }
}

/// Fields are optional so that absence is reported as incomplete data rather
/// than a deserialization failure.
#[derive(Debug)]
pub struct PredictRequest {
    pub val_dataset: Option<Value>,
    pub max_idx: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_frame: Option<Vec<Vec<u8>>>,
}

impl PredictRequest {
    fn parse(body: &[u8]) -> Result<(Value, usize), ApiError> {
        let request = match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => PredictRequest::from_fields(fields),
            Ok(other) => {
                return Err(ApiError::MalformedBody(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                )))
            }
            Err(e) => return Err(ApiError::MalformedBody(e.to_string())),
        };

        let missing: Vec<&str> = [
            ("val_dataset", request.val_dataset.is_none()),
            ("max_idx", request.max_idx.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        match (request.val_dataset, request.max_idx) {
            (Some(val_dataset), Some(max_idx)) => {
                let index = max_idx
                    .as_u64()
                    .and_then(|i| usize::try_from(i).ok())
                    .ok_or_else(|| ApiError::InvalidIndex(max_idx.to_string()))?;
                Ok((val_dataset, index))
            }
            _ => Err(ApiError::IncompleteData(missing.join(" and "))),
        }
    }

    /// A key counts as present even when its value is `null`.
    fn from_fields(mut fields: Map<String, Value>) -> Self {
        Self {
            val_dataset: fields.remove("val_dataset"),
            max_idx: fields.remove("max_idx"),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[instrument(skip(state, body))]
pub async fn predict<M: ModelService>(
    State(state): State<SharedState<M>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let (val_dataset, max_idx) = PredictRequest::parse(&body?)?;

    let batch = from_nested_json(&val_dataset)?;
    tracing::debug!("val_dataset.shape: {:?}, max_idx: {}", batch.shape(), max_idx);

    let prediction = state.inference_service.predict(&batch, max_idx)?;

    let response = match state.prediction.mode {
        ResponseMode::Inline => PredictResponse {
            message: "Prediction complete.".to_string(),
            predicted_frame: Some(binarize(
                &prediction.predicted_frame,
                state.prediction.threshold,
            )),
        },
        ResponseMode::Render => {
            save_comparison(&prediction, &state.output_path)?;
            PredictResponse {
                message: format!(
                    "Prediction complete. Check the saved image '{}'.",
                    state.prediction.output_file
                ),
                predicted_frame: None,
            }
        }
    };

    Ok(Json(response))
}
