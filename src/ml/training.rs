//! モデル学習
//!
//! 結合済みデータから転移学習モデルを学習し、最良の重みとラベルエンコーダを保存します。

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::{
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, BinFileRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use burn_dataset::Dataset;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::db::CombinedSample;
use crate::ml::augmentation::{AugmentationConfig, Augmenter};
use crate::ml::backend::{self, CpuAutodiff, GpuAutodiff};
use crate::ml::dataset::{split_dataset, DatasetSplit, FurnitureBatcher, FurnitureDataset, TrainingItem};
use crate::ml::ml_model::{min_image_size, Backbone, CompactBackbone, FurnitureClassifier, ModelConfig, WideBackbone};
use crate::ml::schedule::{EarlyStopping, ReduceLrOnPlateau};
use crate::model::{
    archive_path, label_encoder_path_for, save_model_with_metadata, AppConfig, BackboneKind, DeviceType,
    LabelEncoder, ModelMetadata, TrainingSettings,
};
use crate::report::{EpochRecord, TrainingResult, ValidationMode};
use crate::types::{FurnitureClass, Provenance, NUM_CLASSES};

/// 学習器の設定
#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub device_type: DeviceType,
    pub training: TrainingSettings,
    pub image_size: usize,
    pub backbone_weights_dir: PathBuf,
}

impl TrainerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            device_type: config.device_type,
            training: config.training.clone(),
            image_size: config.model.image_size,
            backbone_weights_dir: config.model.backbone_weights_dir.clone(),
        }
    }
}

/// 学習器
#[derive(Debug, Clone)]
pub struct Trainer {
    settings: TrainerSettings,
}

/// 検証結果
struct Evaluation {
    loss: f64,
    accuracy: f64,
    per_class: Vec<(String, f64)>,
}

/// 学習ループの結果
struct FitOutcome {
    best_accuracy: f64,
    best_epoch: usize,
    per_class: Vec<(String, f64)>,
    history: Vec<EpochRecord>,
    backbone: BackboneKind,
    pretrained: bool,
}

impl Trainer {
    pub fn new(settings: TrainerSettings) -> Result<Self> {
        if settings.training.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        let min = min_image_size(BackboneKind::Compact);
        if settings.image_size < min {
            anyhow::bail!("image_size must be at least {min}, got {}", settings.image_size);
        }
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    /// 結合済みデータでモデルを学習する
    ///
    /// 検証精度が改善するたびに`model_save_path`へチェックポイントを書き出し、
    /// 最後にラベルエンコーダを同じ場所に保存します。
    pub fn train_model(
        &self,
        combined_data: &[CombinedSample],
        epochs: usize,
        model_save_path: &Path,
    ) -> Result<TrainingResult> {
        if epochs == 0 {
            anyhow::bail!("epochs must be at least 1");
        }
        let started = Instant::now();

        let items = prepare_items(combined_data);
        if items.is_empty() {
            anyhow::bail!("No usable training samples (all rows had invalid class ids)");
        }
        let original_count = items
            .iter()
            .filter(|item| item.provenance == Provenance::Original)
            .count();
        let user_count = items.len() - original_count;
        let total_count = items.len();

        let split = split_dataset(
            items,
            self.settings.training.validation_split,
            self.settings.training.seed,
        );
        tracing::info!(
            "Training on {} samples, validating on {} ({:?})",
            split.train.len(),
            split.valid.len(),
            split.mode
        );

        let model_path = archive_path(model_save_path);
        let outcome = match self.settings.device_type {
            DeviceType::Cpu => {
                let device = backend::cpu_device();
                self.fit::<CpuAutodiff>(&split, epochs, &model_path, &device, &device)?
            }
            DeviceType::Wgpu => {
                let device = backend::wgpu_device();
                self.fit::<GpuAutodiff>(&split, epochs, &model_path, &device, &device)?
            }
        };

        let label_encoder = LabelEncoder::canonical();
        let label_encoder_path = label_encoder_path_for(&model_path);
        label_encoder.save(&label_encoder_path)?;

        let training_time = started.elapsed().as_secs_f64() / 60.0;
        tracing::info!(
            "Training finished in {:.2} min, best val accuracy {:.4} at epoch {}",
            training_time,
            outcome.best_accuracy,
            outcome.best_epoch
        );

        Ok(TrainingResult {
            final_accuracy: outcome.best_accuracy,
            accuracy_reliable: split.mode == ValidationMode::Stratified,
            validation_mode: split.mode,
            training_time,
            original_count,
            user_count,
            total_count,
            model_path,
            label_encoder,
            label_encoder_path,
            backbone: outcome.backbone,
            pretrained_backbone: outcome.pretrained,
            epochs_run: outcome.history.len(),
            best_epoch: outcome.best_epoch,
            per_class_accuracy: outcome.per_class,
            history: outcome.history,
        })
    }

    fn fit<B: AutodiffBackend>(
        &self,
        split: &DatasetSplit,
        epochs: usize,
        model_path: &Path,
        device: &B::Device,
        inner_device: &<B::InnerBackend as Backend>::Device,
    ) -> Result<FitOutcome> {
        let cfg = &self.settings.training;
        let image_size = self.settings.image_size;

        let (mut model, pretrained) = self.build_classifier::<B>(device);
        let backbone = model.backbone_kind();
        tracing::info!("Using {} backbone (pretrained: {})", backbone, pretrained);

        let mut optimizer = AdamConfig::new().init();
        let augmenter = Augmenter::new(AugmentationConfig::default());
        let train_batcher = FurnitureBatcher::<B>::new(device.clone(), image_size);
        let valid_batcher = FurnitureBatcher::<B::InnerBackend>::new(inner_device.clone(), image_size);

        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut stopper = EarlyStopping::new(cfg.early_stopping_patience);
        let mut scheduler = ReduceLrOnPlateau::new(
            cfg.learning_rate,
            cfg.lr_factor,
            cfg.lr_patience,
            cfg.min_lr,
            cfg.lr_min_delta,
        );

        let mut history = Vec::with_capacity(epochs);
        let mut best: Option<(usize, Vec<(String, f64)>)> = None;
        // 1エポックあたり最低1ステップ
        let batch_size = cfg.batch_size.max(1);

        for epoch in 1..=epochs {
            let learning_rate = scheduler.current_lr();
            let mut order: Vec<usize> = (0..split.train.len()).collect();
            order.shuffle(&mut rng);

            let mut loss_sum = 0.0;
            let mut correct = 0usize;
            let mut seen = 0usize;

            for chunk in order.chunks(batch_size) {
                let items: Vec<TrainingItem> = chunk.iter().filter_map(|&i| split.train.get(i)).collect();
                let Some(batch) = train_batcher.batch_augmented(&items, &augmenter, &mut rng) else {
                    tracing::warn!("Epoch {epoch}: skipping a batch with no readable images");
                    continue;
                };

                let output = model.forward_classification(batch.images, batch.targets);
                let loss_value: f64 = output.loss.clone().into_scalar().elem();
                correct += count_correct(output.output.clone(), &batch.labels)?;
                seen += batch.labels.len();
                loss_sum += loss_value * batch.labels.len() as f64;

                let grads = output.loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optimizer.step(learning_rate, model, grads);
            }

            if seen == 0 {
                anyhow::bail!("No training images could be loaded");
            }

            let valid_model = model.valid();
            let eval = evaluate(&valid_model, &split.valid, &valid_batcher, batch_size)?;
            let record = EpochRecord {
                epoch,
                train_loss: loss_sum / seen as f64,
                train_accuracy: correct as f64 / seen as f64,
                val_loss: eval.loss,
                val_accuracy: eval.accuracy,
                learning_rate,
            };
            tracing::info!(
                "Epoch {}/{}: loss={:.4} acc={:.4} val_loss={:.4} val_acc={:.4} lr={:e}",
                epoch,
                epochs,
                record.train_loss,
                record.train_accuracy,
                record.val_loss,
                record.val_accuracy,
                learning_rate
            );
            history.push(record);

            if stopper.update(eval.accuracy) {
                let metadata = ModelMetadata::new(backbone, pretrained, image_size, epoch, eval.accuracy);
                save_checkpoint(&valid_model, &metadata, model_path)?;
                tracing::info!("Saved checkpoint to {}", model_path.display());
                best = Some((epoch, eval.per_class));
            }

            scheduler.step(eval.loss);

            if stopper.should_stop() {
                tracing::info!(
                    "Early stopping at epoch {epoch}: no val accuracy improvement for {} epochs",
                    cfg.early_stopping_patience
                );
                break;
            }
        }

        let ((best_epoch, per_class), best_accuracy) = best
            .zip(stopper.best())
            .ok_or_else(|| anyhow::anyhow!("Training produced no checkpoint"))?;
        Ok(FitOutcome {
            best_accuracy,
            best_epoch,
            per_class,
            history,
            backbone,
            pretrained,
        })
    }

    /// 事前学習済みバックボーンを読み込み、固定して分類ヘッドを載せる
    ///
    /// 標準バックボーンが使えなければ軽量版を試し、それも無ければ軽量版を新規初期化して
    /// 全体を学習対象にします。
    fn build_classifier<B: AutodiffBackend>(&self, device: &B::Device) -> (FurnitureClassifier<B>, bool) {
        let config = |kind| ModelConfig::new(kind).with_image_size(self.settings.image_size);
        let dir = &self.settings.backbone_weights_dir;

        let primary = if self.settings.image_size >= min_image_size(BackboneKind::Wide) {
            load_pretrained_backbone::<B>(BackboneKind::Wide, dir, device)
        } else {
            Err(anyhow::anyhow!(
                "image size {} is too small for the wide backbone",
                self.settings.image_size
            ))
        };
        match primary {
            Ok(backbone) => return (config(BackboneKind::Wide).init_with(backbone.frozen(), device), true),
            Err(e) => tracing::warn!("Primary backbone unavailable ({e:#}); falling back to compact backbone"),
        }

        match load_pretrained_backbone::<B>(BackboneKind::Compact, dir, device) {
            Ok(backbone) => (config(BackboneKind::Compact).init_with(backbone.frozen(), device), true),
            Err(e) => {
                tracing::warn!(
                    "Compact backbone weights unavailable ({e:#}); training the compact backbone from scratch"
                );
                (config(BackboneKind::Compact).init(device), false)
            }
        }
    }
}

/// 範囲外のクラスIDを持つ行を除外する
fn prepare_items(combined_data: &[CombinedSample]) -> Vec<TrainingItem> {
    let mut dropped = 0usize;
    let items: Vec<TrainingItem> = combined_data
        .iter()
        .filter_map(|sample| match FurnitureClass::from_id(sample.class_id) {
            Some(class) => Some(TrainingItem {
                image_path: PathBuf::from(&sample.image_path),
                label: class.id(),
                provenance: sample.provenance,
            }),
            None => {
                dropped += 1;
                None
            }
        })
        .collect();
    if dropped > 0 {
        tracing::warn!("Dropped {dropped} samples with class ids outside 0..{}", NUM_CLASSES - 1);
    }
    items
}

fn load_pretrained_backbone<B: Backend>(kind: BackboneKind, dir: &Path, device: &B::Device) -> Result<Backbone<B>> {
    let stem = dir.join(kind.weights_file_stem());
    let file = stem.with_extension("bin");
    if !file.exists() {
        anyhow::bail!("pretrained weights not found at {}", file.display());
    }

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let backbone = match kind {
        BackboneKind::Wide => Backbone::Wide(
            WideBackbone::new(device)
                .load_file(stem, &recorder, device)
                .map_err(|e| anyhow::anyhow!("failed to load {}: {:?}", file.display(), e))?,
        ),
        BackboneKind::Compact => Backbone::Compact(
            CompactBackbone::new(device)
                .load_file(stem, &recorder, device)
                .map_err(|e| anyhow::anyhow!("failed to load {}: {:?}", file.display(), e))?,
        ),
    };
    tracing::info!("Loaded pretrained {} backbone from {}", kind, file.display());
    Ok(backbone)
}

/// バックボーンの重みだけを書き出す（次回以降の事前学習済み重みとして使う）
pub fn save_backbone_weights<B: Backend>(backbone: Backbone<B>, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stem = dir.join(backbone.kind().weights_file_stem());
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    match backbone {
        Backbone::Wide(b) => b.save_file(stem.clone(), &recorder),
        Backbone::Compact(b) => b.save_file(stem.clone(), &recorder),
    }
    .map_err(|e| anyhow::anyhow!("failed to save backbone weights: {:?}", e))?;
    Ok(stem.with_extension("bin"))
}

/// モデルの重みをメタデータと共にtar.gzへ保存する
pub fn save_checkpoint<B: Backend>(
    model: &FurnitureClassifier<B>,
    metadata: &ModelMetadata,
    model_path: &Path,
) -> Result<PathBuf> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let bytes = <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::record(
        &recorder,
        model.clone().into_record(),
        (),
    )
    .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))?;
    save_model_with_metadata(model_path, metadata, &bytes)
}

fn evaluate<B: Backend>(
    model: &FurnitureClassifier<B>,
    dataset: &FurnitureDataset,
    batcher: &FurnitureBatcher<B>,
    batch_size: usize,
) -> Result<Evaluation> {
    let mut loss_sum = 0.0;
    let mut seen = 0usize;
    let mut correct = 0usize;
    let mut per_class: BTreeMap<usize, (usize, usize)> = BTreeMap::new();

    for chunk in dataset.items().chunks(batch_size) {
        let Some(batch) = batcher.batch(chunk) else {
            continue;
        };
        let output = model.forward_classification(batch.images, batch.targets);
        let loss_value: f64 = output.loss.into_scalar().elem();
        let predictions = argmax_rows(output.output)?;

        for (predicted, &label) in predictions.iter().zip(&batch.labels) {
            let entry = per_class.entry(label).or_default();
            entry.1 += 1;
            if *predicted == label {
                entry.0 += 1;
                correct += 1;
            }
        }
        loss_sum += loss_value * batch.labels.len() as f64;
        seen += batch.labels.len();
    }

    if seen == 0 {
        tracing::warn!("No validation images could be loaded");
        return Ok(Evaluation {
            loss: f64::INFINITY,
            accuracy: 0.0,
            per_class: Vec::new(),
        });
    }

    let per_class = per_class
        .into_iter()
        .filter_map(|(label, (hits, total))| {
            FurnitureClass::from_id(label as i64).map(|class| (class.name().to_string(), hits as f64 / total as f64))
        })
        .collect();
    Ok(Evaluation {
        loss: loss_sum / seen as f64,
        accuracy: correct as f64 / seen as f64,
        per_class,
    })
}

fn count_correct<B: Backend>(logits: Tensor<B, 2>, labels: &[usize]) -> Result<usize> {
    let predictions = argmax_rows(logits)?;
    Ok(predictions
        .iter()
        .zip(labels)
        .filter(|(predicted, label)| predicted == label)
        .count())
}

/// 行ごとの最大値のインデックス（CPU側で計算）
fn argmax_rows<B: Backend>(logits: Tensor<B, 2>) -> Result<Vec<usize>> {
    let [_, num_classes] = logits.dims();
    let values = logits
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;
    Ok(values.chunks(num_classes.max(1)).map(argmax).collect())
}

pub(crate) fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best_i, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best_i, best_v)
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{load_model_with_metadata, TrainingSettings};
    use image::{Rgb, RgbImage};

    fn class_color(class: FurnitureClass) -> Rgb<u8> {
        match class {
            FurnitureClass::Almirah => Rgb([200, 30, 30]),
            FurnitureClass::Chair => Rgb([30, 200, 30]),
            FurnitureClass::Fridge => Rgb([30, 30, 200]),
            FurnitureClass::Table => Rgb([200, 200, 30]),
            FurnitureClass::TV => Rgb([30, 200, 200]),
        }
    }

    fn synthetic_samples(dir: &Path, per_class: usize) -> Vec<CombinedSample> {
        let mut samples = Vec::new();
        for class in FurnitureClass::ALL {
            for i in 0..per_class {
                let path = dir.join(format!("{}_{}.png", class.name(), i));
                RgbImage::from_pixel(24, 24, class_color(class)).save(&path).unwrap();
                samples.push(CombinedSample {
                    image_path: path.to_string_lossy().to_string(),
                    class_name: class.name().to_string(),
                    class_id: class.id() as i64,
                    provenance: if i == 0 { Provenance::User } else { Provenance::Original },
                });
            }
        }
        samples
    }

    fn cpu_trainer(weights_dir: &Path) -> Trainer {
        Trainer::new(TrainerSettings {
            device_type: DeviceType::Cpu,
            training: TrainingSettings {
                batch_size: 8,
                ..TrainingSettings::default()
            },
            image_size: 16,
            backbone_weights_dir: weights_dir.to_path_buf(),
        })
        .unwrap()
    }

    #[test]
    fn argmax_picks_largest() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), 1);
        assert_eq!(argmax(&[0.5, 0.5]), 0);
    }

    #[test]
    fn invalid_class_ids_are_dropped() {
        let samples = vec![
            CombinedSample {
                image_path: "a.png".into(),
                class_name: "Chair".into(),
                class_id: 1,
                provenance: Provenance::Original,
            },
            CombinedSample {
                image_path: "b.png".into(),
                class_name: "Sofa".into(),
                class_id: 7,
                provenance: Provenance::User,
            },
        ];
        let items = prepare_items(&samples);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].label, 1);
    }

    #[test]
    fn rejects_zero_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = cpu_trainer(dir.path());
        assert!(trainer.train_model(&[], 0, &dir.path().join("m")).is_err());
    }

    #[test]
    fn trains_and_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let samples = synthetic_samples(dir.path(), 3);
        let trainer = cpu_trainer(&dir.path().join("no_weights"));
        let model_path = dir.path().join("models").join("session.tar.gz");

        let result = trainer.train_model(&samples, 2, &model_path).unwrap();

        assert!((0.0..=1.0).contains(&result.final_accuracy));
        assert!(result.training_time > 0.0);
        assert_eq!(result.original_count, 10);
        assert_eq!(result.user_count, 5);
        assert_eq!(result.total_count, 15);
        assert_eq!(result.validation_mode, ValidationMode::Stratified);
        assert_eq!(result.backbone, BackboneKind::Compact);
        assert!(!result.pretrained_backbone);
        assert!(model_path.exists());
        assert!(dir.path().join("models/session_label_encoder.json").exists());

        // 最終精度は履歴中の最良の検証精度
        let best = result
            .history
            .iter()
            .map(|r| r.val_accuracy)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(result.final_accuracy, best);
        assert_eq!(result.history[result.best_epoch - 1].val_accuracy, best);

        let (metadata, bytes) = load_model_with_metadata(&model_path).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(metadata.image_size, 16);
        assert!(FurnitureClass::matches_canonical_order(&metadata.class_labels));
    }

    #[test]
    fn tiny_dataset_is_flagged_unreliable() {
        let dir = tempfile::tempdir().unwrap();
        let samples = synthetic_samples(dir.path(), 1);
        let trainer = cpu_trainer(&dir.path().join("no_weights"));
        let result = trainer
            .train_model(&samples, 1, &dir.path().join("tiny.tar.gz"))
            .unwrap();
        assert_eq!(result.validation_mode, ValidationMode::InsufficientData);
        assert!(!result.accuracy_reliable);
    }

    #[test]
    fn pretrained_compact_backbone_is_used_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let weights_dir = dir.path().join("weights");
        let device = backend::cpu_device();
        save_backbone_weights(
            Backbone::<backend::CpuBackend>::fresh(BackboneKind::Compact, &device),
            &weights_dir,
        )
        .unwrap();

        let samples = synthetic_samples(dir.path(), 2);
        let trainer = cpu_trainer(&weights_dir);
        let result = trainer
            .train_model(&samples, 1, &dir.path().join("pre.tar.gz"))
            .unwrap();
        assert_eq!(result.backbone, BackboneKind::Compact);
        assert!(result.pretrained_backbone);
    }
}
