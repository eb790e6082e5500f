use crate::{
    config::{Config, PredictionConfig},
    inference_service::InferenceService,
    model_service::ModelService,
    ort_service::OrtModelService,
    routes::api_routes,
};
use axum::{extract::DefaultBodyLimit, Router};
use std::{path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub struct SharedState<M: ModelService> {
    pub inference_service: InferenceService<M>,
    pub prediction: PredictionConfig,
    pub output_path: PathBuf,
    pub files_dir: PathBuf,
    pub allowed_files: Arc<Vec<String>>,
}

impl<M: ModelService> Clone for SharedState<M> {
    fn clone(&self) -> Self {
        Self {
            inference_service: self.inference_service.clone(),
            prediction: self.prediction.clone(),
            output_path: self.output_path.clone(),
            files_dir: self.files_dir.clone(),
            allowed_files: self.allowed_files.clone(),
        }
    }
}

impl<M: ModelService> SharedState<M> {
    pub fn new(model_service: M, config: &Config) -> Self {
        Self {
            inference_service: InferenceService::new(model_service),
            prediction: config.prediction.clone(),
            output_path: config.get_output_path(),
            files_dir: config.files.dir.clone(),
            allowed_files: Arc::new(config.get_allowed_files()),
        }
    }
}

/// Request bodies are not size-capped: clients post the whole validation set.
pub fn build_router<M: ModelService>(state: SharedState<M>) -> Router {
    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(model_service: impl ModelService, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let router = build_router(SharedState::new(model_service, config));
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Prediction service listening on {}", self.listener.local_addr()?);

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let model_service = OrtModelService::new(&config.model)?;
    tracing::info!(
        "Serving predictions in {:?} mode with threshold {}",
        config.prediction.mode,
        config.prediction.threshold
    );

    let server = HttpServer::new(model_service, &config).await?;
    server.run().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{FilesConfig, LogLevel, ModelConfig, ResponseMode, ServerConfig},
        model_service::ModelError,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
    use serde_json::{json, Value};
    use std::path::Path;
    use tower::ServiceExt;

    /// Returns the fifth input frame as the single predicted step.
    struct EchoModelService {}

    impl ModelService for EchoModelService {
        fn predict(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, ModelError> {
            let frame = input.index_axis(Axis(1), 4).to_owned();
            Ok(frame.insert_axis(Axis(1)).insert_axis(Axis(4)))
        }
    }

    struct FixedModelService {
        output: ArrayD<f32>,
    }

    impl ModelService for FixedModelService {
        fn predict(&self, _input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, ModelError> {
            Ok(self.output.clone())
        }
    }

    fn test_config(mode: ResponseMode, files_dir: &Path) -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            log_level: LogLevel::Debug,
            model: ModelConfig {
                onnx_file: "unused.onnx".to_string(),
                model_dir: files_dir.to_path_buf(),
                output_name: "output_0".to_string(),
                expand_channel: true,
            },
            prediction: PredictionConfig {
                mode,
                ..PredictionConfig::default()
            },
            files: FilesConfig {
                dir: files_dir.to_path_buf(),
                allowed: Vec::new(),
            },
        }
    }

    fn router(model_service: impl ModelService, mode: ResponseMode, files_dir: &Path) -> Router {
        build_router(SharedState::new(
            model_service,
            &test_config(mode, files_dir),
        ))
    }

    async fn post_predict(router: Router, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/predict")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, bytes.to_vec())
    }

    fn sequences(batch: usize, frames: usize, height: usize, width: usize) -> Value {
        let len = batch * frames * height * width;
        let data: Vec<f32> = (0..len).map(|i| (i % 7) as f32 / 6.0).collect();
        let array = ArrayD::from_shape_vec(IxDyn(&[batch, frames, height, width]), data).unwrap();
        let nested: Vec<Vec<Vec<Vec<f32>>>> = array
            .outer_iter()
            .map(|seq| {
                seq.outer_iter()
                    .map(|frame| {
                        frame
                            .outer_iter()
                            .map(|row| row.iter().copied().collect())
                            .collect()
                    })
                    .collect()
            })
            .collect();
        json!(nested)
    }

    #[tokio::test]
    async fn test_single_pixel_example() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(EchoModelService {}, ResponseMode::Inline, dir.path());

        let (status, body) = post_predict(
            router,
            json!({"val_dataset": [[[[0]],[[0]],[[0]],[[0]],[[1]]]], "max_idx": 0}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Prediction complete.");
        assert_eq!(body["predicted_frame"], json!([[1]]));
    }

    #[tokio::test]
    async fn test_predicted_frame_is_binary_with_input_shape() {
        let dir = tempfile::tempdir().unwrap();
        let payload = json!({"val_dataset": sequences(3, 6, 4, 5), "max_idx": 2});

        let (status, body) = post_predict(
            router(EchoModelService {}, ResponseMode::Inline, dir.path()),
            payload.clone(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let frame = body["predicted_frame"].as_array().unwrap();
        assert_eq!(frame.len(), 4);
        for row in frame {
            let row = row.as_array().unwrap();
            assert_eq!(row.len(), 5);
            assert!(row.iter().all(|v| v == 0 || v == 1));
        }

        let (_, again) = post_predict(
            router(EchoModelService {}, ResponseMode::Inline, dir.path()),
            payload,
        )
        .await;
        assert_eq!(body, again);
    }

    #[tokio::test]
    async fn test_large_dataset_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let payload = json!({"val_dataset": sequences(2, 5, 256, 256), "max_idx": 1});
        assert!(payload.to_string().len() > 2 * 1024 * 1024);

        let (status, body) = post_predict(
            router(EchoModelService {}, ResponseMode::Inline, dir.path()),
            payload,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let frame = body["predicted_frame"].as_array().unwrap();
        assert_eq!(frame.len(), 256);
        assert_eq!(frame[0].as_array().unwrap().len(), 256);
    }

    #[tokio::test]
    async fn test_array_body_is_client_error() {
        let dir = tempfile::tempdir().unwrap();

        let (status, body) = post_predict(
            router(EchoModelService {}, ResponseMode::Inline, dir.path()),
            json!([[[[[0]], [[0]], [[0]], [[0]], [[1]]]], 0]),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Malformed request body"));
    }

    #[tokio::test]
    async fn test_missing_fields_are_client_errors() {
        let dir = tempfile::tempdir().unwrap();

        for payload in [
            json!({"max_idx": 0}),
            json!({"val_dataset": sequences(1, 5, 2, 2)}),
            json!({}),
        ] {
            let (status, body) = post_predict(
                router(EchoModelService {}, ResponseMode::Inline, dir.path()),
                payload,
            )
            .await;

            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body["error"].as_str().unwrap().starts_with("Incomplete data"));
        }
    }

    #[tokio::test]
    async fn test_out_of_bounds_index_names_index_and_size() {
        let dir = tempfile::tempdir().unwrap();

        let (status, body) = post_predict(
            router(EchoModelService {}, ResponseMode::Inline, dir.path()),
            json!({"val_dataset": sequences(2, 5, 2, 2), "max_idx": 2}),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["error"],
            "Index 2 is out of bounds for axis 0 with size 2"
        );
    }

    #[tokio::test]
    async fn test_empty_dataset_is_never_ok() {
        let dir = tempfile::tempdir().unwrap();

        for mode in [ResponseMode::Inline, ResponseMode::Render] {
            let (status, body) = post_predict(
                router(EchoModelService {}, mode, dir.path()),
                json!({"val_dataset": [], "max_idx": 0}),
            )
            .await;

            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_ragged_dataset_is_server_error() {
        let dir = tempfile::tempdir().unwrap();

        let (status, body) = post_predict(
            router(EchoModelService {}, ResponseMode::Inline, dir.path()),
            json!({"val_dataset": [[[[0, 1]], [[0]]]], "max_idx": 0}),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let model = FixedModelService {
            output: ArrayD::zeros(IxDyn(&[1, 1, 3, 3, 1])),
        };

        let (status, body) = post_predict(
            router(model, ResponseMode::Inline, dir.path()),
            json!({"val_dataset": sequences(1, 5, 2, 2), "max_idx": 0}),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body["error"],
            "Dimension mismatch: frames.shape = [5, 2, 2], predicted_frame.shape = [3, 3]"
        );
    }

    #[tokio::test]
    async fn test_render_mode_writes_served_figure() {
        let dir = tempfile::tempdir().unwrap();

        let (status, _, _) = get(
            router(EchoModelService {}, ResponseMode::Render, dir.path()),
            "/files/prediction.png",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = post_predict(
            router(EchoModelService {}, ResponseMode::Render, dir.path()),
            json!({"val_dataset": sequences(1, 5, 3, 3), "max_idx": 0}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["message"],
            "Prediction complete. Check the saved image 'prediction.png'."
        );
        assert!(body.get("predicted_frame").is_none());
        assert!(dir.path().join("prediction.png").exists());

        let (status, content_type, bytes) = get(
            router(EchoModelService {}, ResponseMode::Render, dir.path()),
            "/files/prediction.png",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("image/png"));
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[tokio::test]
    async fn test_files_outside_allow_list_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("secret.txt"), "nope").unwrap();

        for uri in ["/files/secret.txt", "/files/missing.png", "/files/..%2Fsecret.txt"] {
            let (status, _, _) = get(
                router(EchoModelService {}, ResponseMode::Render, dir.path()),
                uri,
            )
            .await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let dir = tempfile::tempdir().unwrap();
        let (status, _, bytes) = get(
            router(EchoModelService {}, ResponseMode::Inline, dir.path()),
            "/health",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "Available");
    }
}
