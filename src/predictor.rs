//! 学習済みモデルによる家具画像の分類

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::ml::training::argmax;
use crate::ml::{EngineOptions, InferenceEngine};
use crate::model::{label_encoder_path_for, AppConfig, DeviceType, LabelEncoder, LabelSource};

/// 1枚分の分類結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutput {
    pub predicted_class: String,
    pub class_index: usize,
    /// 予測クラスの確率 [0, 1]
    pub confidence: f32,
    pub all_predictions: Vec<f32>,
    pub class_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PredictorOptions {
    pub device_type: DeviceType,
    /// 重みレコードのみのファイルに使う入力サイズ
    pub image_size: usize,
    /// バッチ推論でも1枚ずつ順伝播し、入出力バッファをその都度解放する
    pub low_memory: bool,
}

impl PredictorOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            device_type: config.device_type,
            image_size: config.model.image_size,
            low_memory: config.model.low_memory,
        }
    }
}

impl Default for PredictorOptions {
    fn default() -> Self {
        Self {
            device_type: DeviceType::Cpu,
            image_size: 224,
            low_memory: false,
        }
    }
}

/// ヘルスチェック結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub model_loaded: bool,
    pub label_encoder_source: Option<LabelSource>,
    pub inference_ok: bool,
}

struct LoadedPredictor {
    engine: InferenceEngine,
    encoder: LabelEncoder,
    encoder_source: LabelSource,
}

/// 分類器
pub struct Predictor {
    model_path: PathBuf,
    options: PredictorOptions,
    loaded: Option<LoadedPredictor>,
}

impl Predictor {
    pub fn new<P: Into<PathBuf>>(model_path: P, options: PredictorOptions) -> Self {
        Self {
            model_path: model_path.into(),
            options,
            loaded: None,
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// 予測ログに記録するモデルのバージョン（ファイル名）
    pub fn model_version(&self) -> String {
        let name = self
            .model_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.strip_suffix(".tar.gz").map(str::to_string).unwrap_or(name)
    }

    /// モデルとラベルエンコーダを読み込む
    ///
    /// 読み込み済みなら何もせずtrueを返します。失敗時は原因をログに出してfalseを返します。
    pub fn load_model(&mut self) -> bool {
        if self.loaded.is_some() {
            return true;
        }
        let models_dir = self
            .model_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if !models_dir.is_dir() {
            tracing::warn!(
                "Models directory {} does not exist; train a model first",
                models_dir.display()
            );
            return false;
        }
        if !self.model_path.is_file() {
            tracing::warn!(
                "No model found at {}; train a model first",
                self.model_path.display()
            );
            return false;
        }

        match self.try_load() {
            Ok(loaded) => {
                tracing::info!(
                    "Model loaded from {} ({:?}, labels: {:?})",
                    self.model_path.display(),
                    loaded.engine.format(),
                    loaded.encoder_source
                );
                self.loaded = Some(loaded);
                true
            }
            Err(e) => {
                tracing::error!("Failed to load model {}: {e:#}", self.model_path.display());
                false
            }
        }
    }

    fn try_load(&self) -> Result<LoadedPredictor> {
        let engine = InferenceEngine::load(
            &self.model_path,
            &EngineOptions {
                device_type: self.options.device_type,
                fallback_image_size: self.options.image_size,
            },
        )?;
        let (encoder, encoder_source) = LabelEncoder::load_for_model(&label_encoder_path_for(&self.model_path))?;
        Ok(LoadedPredictor {
            engine,
            encoder,
            encoder_source,
        })
    }

    /// 画像ファイルを分類する
    ///
    /// 読み込みや推論に失敗した場合はログを出してNoneを返します。
    pub fn predict_image<P: AsRef<Path>>(&mut self, image_path: P) -> Option<PredictionOutput> {
        let image_path = image_path.as_ref();
        if !self.load_model() {
            tracing::warn!("Prediction skipped for {}: model is not available", image_path.display());
            return None;
        }
        let image = match image::open(image_path) {
            Ok(image) => image,
            Err(e) => {
                tracing::error!("Failed to read image {}: {e}", image_path.display());
                return None;
            }
        };
        self.predict_loaded_image(&image)
    }

    /// メモリ上の画像を分類する
    pub fn predict_loaded_image(&mut self, image: &DynamicImage) -> Option<PredictionOutput> {
        if !self.load_model() {
            return None;
        }
        let loaded = self.loaded.as_ref()?;
        match classify(loaded, image) {
            Ok(output) => Some(output),
            Err(e) => {
                tracing::error!("Inference failed: {e:#}");
                None
            }
        }
    }

    /// 複数の画像ファイルを分類する（入力と同じ順で結果を返す）
    pub fn predict_batch<P: AsRef<Path>>(&mut self, image_paths: &[P]) -> Vec<Option<PredictionOutput>> {
        if !self.load_model() {
            return image_paths.iter().map(|_| None).collect();
        }
        let mut images = Vec::new();
        let mut positions = Vec::new();
        for (i, path) in image_paths.iter().enumerate() {
            match image::open(path.as_ref()) {
                Ok(image) => {
                    images.push(image);
                    positions.push(i);
                }
                Err(e) => tracing::error!("Failed to read image {}: {e}", path.as_ref().display()),
            }
        }

        let mut results: Vec<Option<PredictionOutput>> = image_paths.iter().map(|_| None).collect();
        let Some(loaded) = self.loaded.as_ref() else {
            return results;
        };
        if self.options.low_memory {
            // 1枚ずつ推論してピークメモリを抑える
            for (position, image) in positions.into_iter().zip(images) {
                results[position] = classify(loaded, &image)
                    .map_err(|e| tracing::error!("Inference failed: {e:#}"))
                    .ok();
            }
            return results;
        }
        match loaded.engine.probabilities_batch(&images) {
            Ok(batch) => {
                for (position, probs) in positions.into_iter().zip(batch) {
                    results[position] = to_output(&loaded.encoder, probs);
                }
            }
            Err(e) => tracing::error!("Batch inference failed: {e:#}"),
        }
        results
    }

    /// 黒画像を1枚流して推論が動くかを確認する
    pub fn health_check(&mut self) -> HealthReport {
        let model_loaded = self.load_model();
        let Some(loaded) = self.loaded.as_ref() else {
            return HealthReport {
                model_loaded,
                label_encoder_source: None,
                inference_ok: false,
            };
        };
        let size = loaded.engine.image_size() as u32;
        let probe = DynamicImage::new_rgb8(size, size);
        let inference_ok = match loaded.engine.probabilities(&probe) {
            Ok(probs) => probs.iter().all(|p| p.is_finite()),
            Err(e) => {
                tracing::error!("Health check inference failed: {e:#}");
                false
            }
        };
        HealthReport {
            model_loaded,
            label_encoder_source: Some(loaded.encoder_source),
            inference_ok,
        }
    }
}

fn classify(loaded: &LoadedPredictor, image: &DynamicImage) -> Result<PredictionOutput> {
    let probs = loaded.engine.probabilities(image)?;
    to_output(&loaded.encoder, probs).ok_or_else(|| anyhow::anyhow!("model output does not match label encoder"))
}

fn to_output(encoder: &LabelEncoder, probs: Vec<f32>) -> Option<PredictionOutput> {
    if probs.len() != encoder.classes.len() {
        return None;
    }
    let class_index = argmax(&probs);
    let predicted_class = encoder.class_name(class_index)?.to_string();
    Some(PredictionOutput {
        predicted_class,
        class_index,
        confidence: probs[class_index].clamp(0.0, 1.0),
        all_predictions: probs,
        class_names: encoder.classes.clone(),
    })
}

/// 複数のリクエストから共有する分類器のハンドル
#[derive(Clone)]
pub struct PredictorHandle {
    inner: Arc<Mutex<Predictor>>,
}

impl PredictorHandle {
    pub fn new(predictor: Predictor) -> Self {
        Self {
            inner: Arc::new(Mutex::new(predictor)),
        }
    }

    /// 分類器をロックする（ポイズン状態でも中身を取り出す）
    pub fn lock(&self) -> MutexGuard<'_, Predictor> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 新しいモデルで分類器を作り直す
    ///
    /// 新しいモデルの読み込みに成功した場合のみ差し替え、失敗時は現在の分類器を残します。
    pub fn reload<P: Into<PathBuf>>(&self, model_path: P) -> bool {
        let options = self.lock().options.clone();
        let mut candidate = Predictor::new(model_path, options);
        if !candidate.load_model() {
            tracing::warn!(
                "Keeping current model; {} could not be loaded",
                candidate.model_path().display()
            );
            return false;
        }
        let mut current = self.lock();
        *current = candidate;
        tracing::info!("Active model switched to {}", current.model_path().display());
        true
    }
}
