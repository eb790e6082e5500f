use crate::{model_service::ModelService, routes::error_response, server::SharedState};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum FilesError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Failed to read {0}: {1}")]
    Read(String, std::io::Error),
}

impl IntoResponse for FilesError {
    fn into_response(self) -> Response {
        let status = match self {
            FilesError::NotFound(_) => StatusCode::NOT_FOUND,
            FilesError::Read(_, _) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, self.to_string())
    }
}

fn content_type(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "json" => "application/json",
        Some(ext) if ext == "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Only plain file names on the allow-list are served, never paths.
fn is_servable(name: &str, allowed: &[String]) -> bool {
    !name.contains(&['/', '\\'][..]) && name != ".." && allowed.iter().any(|a| a == name)
}

#[instrument(skip(state))]
pub async fn download_file<M: ModelService>(
    State(state): State<SharedState<M>>,
    Path(name): Path<String>,
) -> Result<Response, FilesError> {
    if !is_servable(&name, &state.allowed_files) {
        return Err(FilesError::NotFound(name));
    }

    let path = state.files_dir.join(&name);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(FilesError::NotFound(name))
        }
        Err(e) => return Err(FilesError::Read(name, e)),
    };

    Ok(([(header::CONTENT_TYPE, content_type(&name))], bytes).into_response())
}
