//! APIエンドポイント

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::db::{PredictionStats, TrainingDataStats};
use crate::server::state::SharedState;

#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub message: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub predictor_loaded: bool,
    pub database_connected: bool,
    pub uptime_seconds: u64,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub prediction: String,
    pub confidence: f32,
    pub all_predictions: Vec<f32>,
    pub class_names: Vec<String>,
    pub filename: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct AnalyticsResponse {
    pub analytics: PredictionStats,
    pub training: TrainingDataStats,
    pub status: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

/// エラー応答（本文は`{"detail": ...}`）
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match self {
            ApiError::BadRequest(d) | ApiError::Unavailable(d) | ApiError::Internal(d) => d,
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

/// GET /
pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Furniture Classification API".to_string(),
        status: "healthy".to_string(),
    })
}

/// GET /health
pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let task_state = state.clone();
    let (predictor_loaded, database_connected) = tokio::task::spawn_blocking(move || {
        (task_state.predictor.lock().is_loaded(), task_state.db.ping())
    })
    .await
    .unwrap_or((false, false));

    Json(HealthResponse {
        status: "healthy".to_string(),
        predictor_loaded,
        database_connected,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /predict（multipartの`file`フィールド）
pub async fn predict(State(state): State<SharedState>, mut multipart: Multipart) -> Result<Json<PredictResponse>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read upload: {e}")))?;
        upload = Some((filename, bytes.to_vec()));
        break;
    }
    let (filename, bytes) = upload.ok_or_else(|| ApiError::BadRequest("No file uploaded".to_string()))?;
    predict_bytes(state, filename, bytes).await.map(Json)
}

/// アップロードされたバイト列を分類し、結果を予測ログに記録する
pub async fn predict_bytes(state: SharedState, filename: String, bytes: Vec<u8>) -> Result<PredictResponse, ApiError> {
    let task_filename = filename.clone();
    let output = tokio::task::spawn_blocking(move || {
        let image = image::load_from_memory(&bytes)
            .map_err(|e| ApiError::BadRequest(format!("File must be an image: {e}")))?;
        let (output, model_version) = {
            let mut predictor = state.predictor.lock();
            (predictor.predict_loaded_image(&image), predictor.model_version())
        };
        let output = output.ok_or_else(|| {
            ApiError::Unavailable("Model not available or prediction failed. Train a model first.".to_string())
        })?;
        if let Err(e) = state.db.log_prediction(
            &task_filename,
            &output.predicted_class,
            f64::from(output.confidence),
            None,
            &model_version,
        ) {
            tracing::warn!("Failed to log prediction for {task_filename}: {e}");
        }
        Ok::<_, ApiError>(output)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Prediction task failed: {e}")))??;

    tracing::info!(
        "Predicted {} for {} ({:.3})",
        output.predicted_class,
        filename,
        output.confidence
    );
    Ok(PredictResponse {
        prediction: output.predicted_class,
        confidence: output.confidence,
        all_predictions: output.all_predictions,
        class_names: output.class_names,
        filename,
        status: "success".to_string(),
    })
}

/// GET /analytics
pub async fn analytics(State(state): State<SharedState>) -> Result<Json<AnalyticsResponse>, ApiError> {
    let (analytics, training) = tokio::task::spawn_blocking(move || {
        Ok::<_, crate::db::StoreError>((state.db.get_prediction_stats()?, state.db.get_training_data_stats()?))
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Analytics task failed: {e}")))?
    .map_err(|e| {
        tracing::error!("Failed to read analytics: {e}");
        ApiError::Internal(format!("Failed to read analytics: {e}"))
    })?;

    Ok(Json(AnalyticsResponse {
        analytics,
        training,
        status: "success".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;
    use crate::ml::backend::{self, CpuBackend};
    use crate::ml::training::save_checkpoint;
    use crate::ml::ModelConfig;
    use crate::model::{label_encoder_path_for, BackboneKind, DeviceType, LabelEncoder, ModelMetadata};
    use crate::predictor::{Predictor, PredictorHandle, PredictorOptions};
    use crate::server::AppState;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    fn options() -> PredictorOptions {
        PredictorOptions {
            device_type: DeviceType::Cpu,
            image_size: 16,
            low_memory: false,
        }
    }

    fn state_with_model(root: &Path, model: Option<PathBuf>) -> (tempfile::TempDir, SharedState) {
        let (dir, db) = temp_db();
        let path = model.unwrap_or_else(|| root.join("models/missing.tar.gz"));
        let predictor = PredictorHandle::new(Predictor::new(path, options()));
        (dir, Arc::new(AppState::new(db, predictor)))
    }

    fn png_bytes() -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(20, 20, image::Rgb([10, 200, 10])))
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn root_reports_healthy() {
        let Json(body) = root().await;
        assert_eq!(body.message, "Furniture Classification API");
        assert_eq!(body.status, "healthy");
    }

    #[tokio::test]
    async fn health_without_model() {
        let scratch = tempfile::tempdir().unwrap();
        let (_db_dir, state) = state_with_model(scratch.path(), None);
        let Json(body) = health(State(state)).await;
        assert!(!body.predictor_loaded);
        assert!(body.database_connected);
    }

    #[tokio::test]
    async fn non_image_upload_is_bad_request() {
        let scratch = tempfile::tempdir().unwrap();
        let (_db_dir, state) = state_with_model(scratch.path(), None);
        let err = predict_bytes(state, "notes.txt".to_string(), b"hello".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_model_is_unavailable() {
        let scratch = tempfile::tempdir().unwrap();
        let (_db_dir, state) = state_with_model(scratch.path(), None);
        let err = predict_bytes(state, "x.png".to_string(), png_bytes()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn prediction_is_logged_in_analytics() {
        let scratch = tempfile::tempdir().unwrap();
        let config = ModelConfig::new(BackboneKind::Compact).with_image_size(16);
        let model = config.init::<CpuBackend>(&backend::cpu_device());
        let metadata = ModelMetadata::new(BackboneKind::Compact, false, 16, 1, 0.5);
        let model_path = save_checkpoint(&model, &metadata, &scratch.path().join("models/v2.tar.gz")).unwrap();
        LabelEncoder::canonical().save(&label_encoder_path_for(&model_path)).unwrap();

        let (_db_dir, state) = state_with_model(scratch.path(), Some(model_path));
        let response = predict_bytes(state.clone(), "green.png".to_string(), png_bytes())
            .await
            .unwrap();
        assert_eq!(response.status, "success");
        assert_eq!(response.all_predictions.len(), 5);
        assert_eq!(response.filename, "green.png");

        let Json(body) = analytics(State(state)).await.unwrap();
        assert_eq!(body.analytics.total_predictions, 1);
        assert_eq!(body.status, "success");
    }
}
