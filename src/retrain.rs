//! 再学習フロー
//!
//! アップロード画像の登録、データ要件の確認、学習、セッション記録、分類器の差し替えを順に行います。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::db::{FurnitureDb, MetricValue, NewRetrainingSession, StoreError, UserSample};
use crate::ml::Trainer;
use crate::predictor::PredictorHandle;
use crate::report::{TrainingResult, ValidationMode};
use crate::types::FurnitureClass;

/// 1回の再学習に必要なアップロード枚数
pub const MIN_UPLOADS: usize = 5;
const UPLOADED_BY: &str = "user";

/// アップロードされた画像とユーザーが選んだクラス
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedImage {
    pub source: PathBuf,
    pub class: FurnitureClass,
}

#[derive(Debug, Clone)]
pub struct RetrainRequest {
    pub session_name: String,
    pub uploads: Vec<UploadedImage>,
    pub epochs: usize,
    /// trueなら既存のユーザーデータを消してから登録する
    pub clear_user_data: bool,
}

#[derive(Debug)]
pub struct RetrainOutcome {
    pub session_id: i64,
    pub result: TrainingResult,
    /// 新しいモデルへの差し替えに成功したか
    pub predictor_swapped: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RetrainError {
    #[error("Minimum 5 images required for training. Please upload more images.")]
    TooFewImages { uploaded: usize },
    #[error("Invalid retraining request: {0}")]
    InvalidRequest(String),
    #[error("A retraining session is already running")]
    AlreadyRunning,
    #[error("Session name '{0}' is already in use; choose a new name")]
    SessionExists(String),
    #[error("{0}")]
    InsufficientData(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to store upload {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Training failed: {0:#}")]
    Training(anyhow::Error),
}

/// 実行中フラグを抜けるときに必ず下ろす
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 再学習の実行者
pub struct Retrainer {
    db: FurnitureDb,
    trainer: Trainer,
    predictor: PredictorHandle,
    uploads_dir: PathBuf,
    models_dir: PathBuf,
    busy: AtomicBool,
}

impl Retrainer {
    pub fn new(
        db: FurnitureDb,
        trainer: Trainer,
        predictor: PredictorHandle,
        uploads_dir: PathBuf,
        models_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            trainer,
            predictor,
            uploads_dir,
            models_dir,
            busy: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// 再学習を実行する
    ///
    /// 学習が最後まで終わらなかった場合、セッションは記録されません。
    /// 実行中の学習を途中で止める手段はありません。
    pub fn start_retraining(&self, request: &RetrainRequest) -> Result<RetrainOutcome, RetrainError> {
        if request.uploads.len() < MIN_UPLOADS {
            return Err(RetrainError::TooFewImages {
                uploaded: request.uploads.len(),
            });
        }
        validate_session_name(&request.session_name)?;
        if request.epochs == 0 {
            return Err(RetrainError::InvalidRequest("epochs must be at least 1".to_string()));
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RetrainError::AlreadyRunning);
        }
        let _guard = BusyGuard(&self.busy);

        tracing::info!(
            "Starting retraining session '{}' with {} uploads, {} epochs",
            request.session_name,
            request.uploads.len(),
            request.epochs
        );
        self.ensure_session_unused(&request.session_name)?;
        warn_sparse_classes(&request.uploads);

        let stored = self.store_uploads(&request.session_name, &request.uploads)?;
        if request.clear_user_data {
            self.db.clear_user_data()?;
        }
        self.db.add_user_data(&stored, UPLOADED_BY)?;

        let (ok, message) = self.db.check_training_data_requirements()?;
        if !ok {
            tracing::warn!("Retraining rejected: {message}");
            return Err(RetrainError::InsufficientData(message));
        }

        let combined = self.db.get_combined_training_data()?;
        let model_path = self.models_dir.join(format!("{}.tar.gz", request.session_name));
        let result = self
            .trainer
            .train_model(&combined, request.epochs, &model_path)
            .map_err(|e| {
                tracing::error!("Training failed for session '{}': {e:#}", request.session_name);
                RetrainError::Training(e)
            })?;

        let session_id = self.db.log_retraining_session(&NewRetrainingSession {
            session_name: request.session_name.clone(),
            original_data_count: result.original_count,
            user_data_count: result.user_count,
            total_data_count: result.total_count,
            final_accuracy: result.final_accuracy,
            training_time_minutes: result.training_time,
            model_path: result.model_path.to_string_lossy().into_owned(),
        })?;
        self.db.log_metrics(session_id, &session_metrics(&result))?;

        let predictor_swapped = self.predictor.reload(result.model_path.clone());
        if !predictor_swapped {
            tracing::warn!("Session #{session_id} trained, but the new model could not be activated");
        }
        tracing::info!(
            "Retraining session '{}' finished: accuracy {:.4}{}, {:.2} min",
            request.session_name,
            result.final_accuracy,
            if result.accuracy_reliable { "" } else { " (insufficient data)" },
            result.training_time
        );

        Ok(RetrainOutcome {
            session_id,
            result,
            predictor_swapped,
        })
    }

    /// 同じ名前のセッションが残っていないか確認する
    ///
    /// アップロード先やモデルファイルは既存の行から参照されているため上書きしません。
    fn ensure_session_unused(&self, session_name: &str) -> Result<(), RetrainError> {
        let upload_dir = self.uploads_dir.join(session_name);
        let model_path = self.models_dir.join(format!("{session_name}.tar.gz"));
        let logged = self
            .db
            .get_all_training_sessions()?
            .iter()
            .any(|s| s.session_name == session_name);
        if logged || upload_dir.exists() || model_path.exists() {
            tracing::warn!("Retraining rejected: session name '{session_name}' was used before");
            return Err(RetrainError::SessionExists(session_name.to_string()));
        }
        Ok(())
    }

    /// アップロード画像をセッション用ディレクトリへコピーする
    fn store_uploads(&self, session_name: &str, uploads: &[UploadedImage]) -> Result<Vec<UserSample>, RetrainError> {
        let dir = self.uploads_dir.join(session_name);
        std::fs::create_dir_all(&dir).map_err(|source| RetrainError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut samples = Vec::with_capacity(uploads.len());
        for (i, upload) in uploads.iter().enumerate() {
            let file_name = upload
                .source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let dest = dir.join(format!("{i:03}_{file_name}"));
            std::fs::copy(&upload.source, &dest).map_err(|source| RetrainError::Io {
                path: upload.source.clone(),
                source,
            })?;
            samples.push(UserSample {
                image_path: dest.to_string_lossy().into_owned(),
                class: upload.class,
            });
        }
        Ok(samples)
    }
}

fn validate_session_name(name: &str) -> Result<(), RetrainError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RetrainError::InvalidRequest("session name is empty".to_string()));
    }
    if trimmed != name || trimmed == "." || trimmed == ".." || name.contains(['/', '\\']) {
        return Err(RetrainError::InvalidRequest(format!(
            "session name {name:?} cannot be used as a file name"
        )));
    }
    Ok(())
}

fn warn_sparse_classes(uploads: &[UploadedImage]) {
    let mut counts: BTreeMap<FurnitureClass, usize> = BTreeMap::new();
    for upload in uploads {
        *counts.entry(upload.class).or_default() += 1;
    }
    for (class, count) in counts {
        if count < 2 {
            tracing::warn!("Only {count} upload labelled {class}; consider adding more examples");
        }
    }
}

fn session_metrics(result: &TrainingResult) -> Vec<(String, MetricValue)> {
    let insufficient = match result.validation_mode {
        ValidationMode::InsufficientData => 1.0,
        ValidationMode::Stratified => 0.0,
    };
    vec![
        ("final_accuracy".to_string(), MetricValue::Overall(result.final_accuracy)),
        (
            "training_time_minutes".to_string(),
            MetricValue::Overall(result.training_time),
        ),
        ("insufficient_data_mode".to_string(), MetricValue::Overall(insufficient)),
        (
            "class_accuracy".to_string(),
            MetricValue::PerClass(result.per_class_accuracy.clone()),
        ),
    ]
}

/// 起動時に使うモデルを決める
///
/// 最新のセッションのモデルが残っていればそれを、無ければ既定のパスを返します。
pub fn active_model_path(db: &FurnitureDb, default_path: &Path) -> PathBuf {
    match db.get_all_training_sessions() {
        Ok(sessions) => sessions
            .into_iter()
            .map(|s| PathBuf::from(s.model_path))
            .find(|p| p.is_file())
            .unwrap_or_else(|| default_path.to_path_buf()),
        Err(e) => {
            tracing::warn!("Could not read retraining sessions: {e}");
            default_path.to_path_buf()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;
    use crate::ml::TrainerSettings;
    use crate::model::AppConfig;
    use crate::predictor::{Predictor, PredictorOptions};

    fn retrainer(db: FurnitureDb, root: &Path) -> Retrainer {
        let mut config = AppConfig::default();
        config.model.image_size = 16;
        config.model.backbone_weights_dir = root.join("weights");
        let trainer = Trainer::new(TrainerSettings::from_config(&config)).unwrap();
        let predictor = PredictorHandle::new(Predictor::new(root.join("models/none.tar.gz"), PredictorOptions::default()));
        Retrainer::new(db, trainer, predictor, root.join("uploads"), root.join("models"))
    }

    fn uploads(n: usize) -> Vec<UploadedImage> {
        (0..n)
            .map(|i| UploadedImage {
                source: PathBuf::from(format!("/tmp/upload_{i}.jpg")),
                class: FurnitureClass::ALL[i % 5],
            })
            .collect()
    }

    fn request(n: usize) -> RetrainRequest {
        RetrainRequest {
            session_name: "session_1".to_string(),
            uploads: uploads(n),
            epochs: 1,
            clear_user_data: false,
        }
    }

    #[test]
    fn rejects_fewer_than_five_uploads() {
        let (dir, db) = temp_db();
        let retrainer = retrainer(db, dir.path());
        let err = retrainer.start_retraining(&request(3)).unwrap_err();
        assert!(matches!(err, RetrainError::TooFewImages { uploaded: 3 }));
        assert!(err.to_string().contains("Minimum 5 images required"));
        assert!(!retrainer.is_running());
    }

    #[test]
    fn rejects_path_like_session_names() {
        for name in ["", "  ", "../escape", "a/b", "..", " padded"] {
            assert!(validate_session_name(name).is_err(), "{name:?} should be rejected");
        }
        assert!(validate_session_name("retrain_2024-01-01").is_ok());
    }

    #[test]
    fn rejects_concurrent_run() {
        let (dir, db) = temp_db();
        let retrainer = retrainer(db, dir.path());
        retrainer.busy.store(true, Ordering::Release);
        let err = retrainer.start_retraining(&request(5)).unwrap_err();
        assert!(matches!(err, RetrainError::AlreadyRunning));
    }

    #[test]
    fn missing_upload_resets_busy_flag() {
        let (dir, db) = temp_db();
        let retrainer = retrainer(db.clone(), dir.path());
        let mut req = request(5);
        req.uploads[0].source = dir.path().join("does_not_exist.jpg");
        let err = retrainer.start_retraining(&req).unwrap_err();
        assert!(matches!(err, RetrainError::Io { .. }));
        assert!(!retrainer.is_running());
        assert!(db.get_combined_training_data().unwrap().is_empty());
    }

    fn labelled_files(dir: &Path, prefix: &str, class: FurnitureClass, content: &str) -> Vec<UploadedImage> {
        (0..MIN_UPLOADS)
            .map(|i| {
                let source = dir.join(format!("{prefix}_{i}.jpg"));
                std::fs::write(&source, content).unwrap();
                UploadedImage { source, class }
            })
            .collect()
    }

    #[test]
    fn reused_session_name_keeps_earlier_uploads() {
        let (dir, db) = temp_db();
        let retrainer = retrainer(db.clone(), dir.path());

        let first = RetrainRequest {
            session_name: "s".to_string(),
            uploads: labelled_files(dir.path(), "chair", FurnitureClass::Chair, "FIRST_CHAIR"),
            epochs: 1,
            clear_user_data: false,
        };
        // 空のストアなので学習前に拒否されるが、ユーザーデータは残る
        assert!(matches!(
            retrainer.start_retraining(&first),
            Err(RetrainError::InsufficientData(_))
        ));

        let second = RetrainRequest {
            session_name: "s".to_string(),
            uploads: labelled_files(dir.path(), "tv", FurnitureClass::TV, "SECOND_TV"),
            epochs: 1,
            clear_user_data: false,
        };
        let err = retrainer.start_retraining(&second).unwrap_err();
        assert!(matches!(err, RetrainError::SessionExists(ref name) if name == "s"));
        assert!(!retrainer.is_running());

        let combined = db.get_combined_training_data().unwrap();
        assert_eq!(combined.len(), MIN_UPLOADS);
        for sample in combined {
            assert_eq!(sample.class_name, "Chair");
            assert_eq!(std::fs::read_to_string(&sample.image_path).unwrap(), "FIRST_CHAIR");
        }
    }

    #[test]
    fn existing_model_file_blocks_session_name() {
        let (dir, db) = temp_db();
        let retrainer = retrainer(db, dir.path());
        std::fs::create_dir_all(dir.path().join("models")).unwrap();
        std::fs::write(dir.path().join("models/taken.tar.gz"), b"model").unwrap();

        let mut req = request(5);
        req.session_name = "taken".to_string();
        let err = retrainer.start_retraining(&req).unwrap_err();
        assert!(matches!(err, RetrainError::SessionExists(_)));
        assert!(!dir.path().join("uploads/taken").exists());
    }

    #[test]
    fn metrics_flag_insufficient_data() {
        let result = TrainingResult {
            final_accuracy: 0.4,
            accuracy_reliable: false,
            validation_mode: ValidationMode::InsufficientData,
            training_time: 0.1,
            original_count: 0,
            user_count: 5,
            total_count: 5,
            model_path: PathBuf::from("m.tar.gz"),
            label_encoder: crate::model::LabelEncoder::canonical(),
            label_encoder_path: PathBuf::from("m_label_encoder.json"),
            backbone: crate::model::BackboneKind::Compact,
            pretrained_backbone: false,
            epochs_run: 1,
            best_epoch: 1,
            per_class_accuracy: vec![("Chair".to_string(), 1.0)],
            history: Vec::new(),
        };
        let metrics = session_metrics(&result);
        assert!(metrics.contains(&("insufficient_data_mode".to_string(), MetricValue::Overall(1.0))));
        assert_eq!(metrics.len(), 4);
    }

    #[test]
    fn active_model_falls_back_to_default() {
        let (dir, db) = temp_db();
        let default = dir.path().join("models/furniture_classifier.tar.gz");
        assert_eq!(active_model_path(&db, &default), default);
    }
}
