//! モデル推論機能

use anyhow::{Context, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor, TensorData},
};
use image::DynamicImage;

use crate::ml::backend::{self, CpuBackend, GpuBackend};
use crate::ml::ml_model::{normalize_image, FurnitureClassifier, ModelConfig};
use crate::ml::training::save_backbone_weights;
use crate::model::{load_model_with_metadata, log_metadata_info, ArtifactFormat, BackboneKind, DeviceType, ModelMetadata};
use crate::types::{FurnitureClass, NUM_CLASSES};

/// 推論エンジンの読み込み設定
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub device_type: DeviceType,
    /// 重みレコードのみのファイルを読む場合の入力サイズ
    pub fallback_image_size: usize,
}

enum LoadedModel {
    Cpu(FurnitureClassifier<CpuBackend>),
    Gpu(FurnitureClassifier<GpuBackend>),
}

/// 推論エンジン
pub struct InferenceEngine {
    model: LoadedModel,
    image_size: usize,
    metadata: Option<ModelMetadata>,
    format: ArtifactFormat,
}

impl InferenceEngine {
    /// モデルを読み込んで推論エンジンを初期化
    ///
    /// tar.gzとして読めない場合は、同じファイルを重みレコードとして読み直します。
    pub fn load<P: AsRef<Path>>(model_path: P, options: &EngineOptions) -> Result<Self> {
        let model_path = model_path.as_ref();
        match load_model_with_metadata(model_path) {
            Ok((metadata, model_binary)) => {
                log_metadata_info(&metadata);
                if !FurnitureClass::matches_canonical_order(&metadata.class_labels) {
                    anyhow::bail!(
                        "model {} was trained with classes [{}], which do not match the expected order",
                        model_path.display(),
                        metadata.class_labels.join(", ")
                    );
                }
                let config = ModelConfig::new(metadata.backbone).with_image_size(metadata.image_size);
                config.validate()?;
                let model = load_on_device(options.device_type, &config, model_binary)?;
                Ok(Self {
                    model,
                    image_size: metadata.image_size,
                    metadata: Some(metadata),
                    format: ArtifactFormat::Archive,
                })
            }
            Err(archive_err) => {
                tracing::warn!(
                    "Could not read {} as a model archive ({archive_err:#}); trying raw weight record",
                    model_path.display()
                );
                let bytes = std::fs::read(model_path)
                    .context(format!("Failed to read model file: {:?}", model_path))?;
                Self::load_raw(bytes, options)
            }
        }
    }

    fn load_raw(bytes: Vec<u8>, options: &EngineOptions) -> Result<Self> {
        for kind in [BackboneKind::Wide, BackboneKind::Compact] {
            let config = ModelConfig::new(kind).with_image_size(options.fallback_image_size);
            if config.validate().is_err() {
                continue;
            }
            let attempt = catch_unwind(AssertUnwindSafe(|| {
                load_on_device(options.device_type, &config, bytes.clone())
            }));
            match attempt {
                Ok(Ok(model)) => {
                    tracing::info!("Loaded raw weight record with {kind} backbone");
                    return Ok(Self {
                        model,
                        image_size: options.fallback_image_size,
                        metadata: None,
                        format: ArtifactFormat::RawRecord,
                    });
                }
                Ok(Err(e)) => tracing::debug!("Raw record does not fit {kind} backbone: {e:#}"),
                Err(_) => tracing::debug!("Raw record decoding panicked for {kind} backbone"),
            }
        }
        anyhow::bail!("file is neither a model archive nor a raw weight record")
    }

    /// 1枚の画像のクラス確率
    pub fn probabilities(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let mut all = self.probabilities_batch(std::slice::from_ref(image))?;
        all.pop().ok_or_else(|| anyhow::anyhow!("推論結果が空です"))
    }

    /// 複数画像のクラス確率（1回の順伝播）
    pub fn probabilities_batch(&self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let size = self.image_size;
        let mut pixels = Vec::with_capacity(images.len() * 3 * size * size);
        for image in images {
            pixels.extend(normalize_image(image, size));
        }

        let flat = match &self.model {
            LoadedModel::Cpu(model) => run(model, pixels, images.len(), size, &backend::cpu_device())?,
            LoadedModel::Gpu(model) => run(model, pixels, images.len(), size, &backend::wgpu_device())?,
        };
        if flat.len() != images.len() * NUM_CLASSES {
            anyhow::bail!(
                "モデル出力のサイズが不正です: {} (期待: {})",
                flat.len(),
                images.len() * NUM_CLASSES
            );
        }
        Ok(flat.chunks(NUM_CLASSES).map(<[f32]>::to_vec).collect())
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn metadata(&self) -> Option<&ModelMetadata> {
        self.metadata.as_ref()
    }

    pub fn format(&self) -> ArtifactFormat {
        self.format
    }
}

fn load_on_device(device_type: DeviceType, config: &ModelConfig, bytes: Vec<u8>) -> Result<LoadedModel> {
    Ok(match device_type {
        DeviceType::Cpu => LoadedModel::Cpu(load_weights(config, bytes, &backend::cpu_device())?),
        DeviceType::Wgpu => LoadedModel::Gpu(load_weights(config, bytes, &backend::wgpu_device())?),
    })
}

fn load_weights<B: Backend>(config: &ModelConfig, bytes: Vec<u8>, device: &B::Device) -> Result<FurnitureClassifier<B>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::load(&recorder, bytes, device)
        .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
    let model = config.init::<B>(device).load_record(record);
    if !model.has_backbone() {
        anyhow::bail!("weights do not contain a {} backbone", config.backbone);
    }
    Ok(model)
}

fn run<B: Backend>(
    model: &FurnitureClassifier<B>,
    pixels: Vec<f32>,
    batch: usize,
    size: usize,
    device: &B::Device,
) -> Result<Vec<f32>> {
    let input = Tensor::<B, 4>::from_data(TensorData::new(pixels, [batch, 3, size, size]), device);
    let probs = model.predict(input);
    probs
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))
}

/// 学習済みモデルからバックボーンの重みを取り出して保存する
///
/// 保存した重みは次回以降の学習で事前学習済みバックボーンとして使われます。
pub fn export_backbone_weights(model_path: &Path, weights_dir: &Path) -> Result<PathBuf> {
    let (metadata, bytes) = load_model_with_metadata(model_path)?;
    let config = ModelConfig::new(metadata.backbone).with_image_size(metadata.image_size);
    let model = load_weights::<CpuBackend>(&config, bytes, &backend::cpu_device())?;
    let backbone = model
        .into_backbone()
        .ok_or_else(|| anyhow::anyhow!("model has no backbone"))?;
    save_backbone_weights(backbone, weights_dir)
}
