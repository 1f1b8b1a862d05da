//! 学習用データセット・バッチ作成・学習/検証分割

use std::collections::BTreeMap;
use std::path::PathBuf;

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use burn_dataset::Dataset;
use image::imageops::FilterType;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::ml::augmentation::Augmenter;
use crate::ml::ml_model::normalize_rgb;
use crate::report::ValidationMode;
use crate::types::Provenance;

/// 層化分割に必要な最小データ数
const MIN_TOTAL_FOR_SPLIT: usize = 10;
/// 層化分割に必要な1クラスあたりの最小データ数
const MIN_PER_CLASS_FOR_SPLIT: usize = 2;
/// データ不足時に検証へ回す最大件数
const INSUFFICIENT_VALIDATION_SIZE: usize = 5;

/// 学習アイテム（パスとラベルのみ保持し、画像はバッチ作成時に読む）
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingItem {
    pub image_path: PathBuf,
    pub label: usize,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Default)]
pub struct FurnitureDataset {
    items: Vec<TrainingItem>,
}

impl FurnitureDataset {
    pub fn new(items: Vec<TrainingItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[TrainingItem] {
        &self.items
    }
}

impl Dataset<TrainingItem> for FurnitureDataset {
    fn get(&self, index: usize) -> Option<TrainingItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// 学習/検証の分割結果
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub train: FurnitureDataset,
    pub valid: FurnitureDataset,
    pub mode: ValidationMode,
}

/// クラス比を保って学習/検証に分割する
///
/// 総数が10未満、または最少クラスが2件未満の場合は全件を学習に使い、
/// そこから最大5件を検証用に抜き出します（InsufficientData）。
pub fn split_dataset(items: Vec<TrainingItem>, validation_fraction: f64, seed: u64) -> DatasetSplit {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut by_class: BTreeMap<usize, Vec<TrainingItem>> = BTreeMap::new();
    for item in &items {
        by_class.entry(item.label).or_default().push(item.clone());
    }
    let rarest = by_class.values().map(Vec::len).min().unwrap_or(0);

    if items.len() < MIN_TOTAL_FOR_SPLIT || rarest < MIN_PER_CLASS_FOR_SPLIT {
        tracing::warn!(
            "Insufficient data for a stratified split ({} samples, rarest class {}); \
             validating on a sample of the training data",
            items.len(),
            rarest
        );
        let sample_size = items.len().min(INSUFFICIENT_VALIDATION_SIZE);
        let valid: Vec<TrainingItem> = items.choose_multiple(&mut rng, sample_size).cloned().collect();
        return DatasetSplit {
            train: FurnitureDataset::new(items),
            valid: FurnitureDataset::new(valid),
            mode: ValidationMode::InsufficientData,
        };
    }

    let mut train = Vec::new();
    let mut valid = Vec::new();
    for (_, mut group) in by_class {
        group.shuffle(&mut rng);
        let n = group.len();
        let n_valid = ((n as f64 * validation_fraction).round() as usize).clamp(1, n - 1);
        let rest = group.split_off(n_valid);
        valid.extend(group);
        train.extend(rest);
    }
    train.shuffle(&mut rng);

    DatasetSplit {
        train: FurnitureDataset::new(train),
        valid: FurnitureDataset::new(valid),
        mode: ValidationMode::Stratified,
    }
}

/// バッチ
#[derive(Debug, Clone)]
pub struct FurnitureBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    /// 正解ラベル（CPU側での精度計算用）
    pub labels: Vec<usize>,
}

/// バッチャー
#[derive(Clone)]
pub struct FurnitureBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> FurnitureBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }

    /// 拡張なしのバッチを作る（検証用）
    pub fn batch(&self, items: &[TrainingItem]) -> Option<FurnitureBatch<B>> {
        self.build(items, |img| img)
    }

    /// データ拡張を適用したバッチを作る（学習用）
    pub fn batch_augmented(
        &self,
        items: &[TrainingItem],
        augmenter: &Augmenter,
        rng: &mut StdRng,
    ) -> Option<FurnitureBatch<B>> {
        self.build(items, |img| augmenter.augment(&img, rng))
    }

    /// 読み込めなかった画像はバッチから除外し、1枚も残らなければNone
    fn build(
        &self,
        items: &[TrainingItem],
        mut transform: impl FnMut(RgbImage) -> RgbImage,
    ) -> Option<FurnitureBatch<B>> {
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(items.len() * 3 * size * size);
        let mut labels = Vec::with_capacity(items.len());

        for item in items {
            let img = match image::open(&item.image_path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", item.image_path.display(), e);
                    continue;
                }
            };
            let resized = image::imageops::resize(&img, size as u32, size as u32, FilterType::Triangle);
            drop(img);
            all_pixels.extend(normalize_rgb(&transform(resized), size));
            labels.push(item.label);
        }

        if labels.is_empty() {
            return None;
        }

        let n = labels.len();
        let images = Tensor::<B, 4>::from_data(TensorData::new(all_pixels, [n, 3, size, size]), &self.device);
        let targets_vec: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets_vec, [n]), &self.device);

        Some(FurnitureBatch {
            images,
            targets,
            labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(per_class: &[usize]) -> Vec<TrainingItem> {
        let mut out = Vec::new();
        for (label, &count) in per_class.iter().enumerate() {
            for i in 0..count {
                out.push(TrainingItem {
                    image_path: PathBuf::from(format!("{label}/{i}.png")),
                    label,
                    provenance: Provenance::Original,
                });
            }
        }
        out
    }

    #[test]
    fn stratified_split_keeps_every_class_in_both_sets() {
        let split = split_dataset(items(&[10, 5, 2, 4, 3]), 0.2, 42);
        assert_eq!(split.mode, ValidationMode::Stratified);
        assert_eq!(split.train.len() + split.valid.len(), 24);
        for label in 0..5 {
            assert!(split.valid.items().iter().any(|i| i.label == label));
            assert!(split.train.items().iter().any(|i| i.label == label));
        }
        // 10件のクラスは2件が検証へ
        assert_eq!(split.valid.items().iter().filter(|i| i.label == 0).count(), 2);
    }

    #[test]
    fn split_is_deterministic_for_a_seed() {
        let a = split_dataset(items(&[4, 4, 4]), 0.2, 42);
        let b = split_dataset(items(&[4, 4, 4]), 0.2, 42);
        assert_eq!(a.valid.items(), b.valid.items());
        assert_eq!(a.train.items(), b.train.items());
    }

    #[test]
    fn tiny_dataset_uses_insufficient_data_mode() {
        let split = split_dataset(items(&[3, 3, 2]), 0.2, 42);
        assert_eq!(split.mode, ValidationMode::InsufficientData);
        assert_eq!(split.train.len(), 8);
        assert_eq!(split.valid.len(), 5);
    }

    #[test]
    fn singleton_class_uses_insufficient_data_mode() {
        let split = split_dataset(items(&[5, 5, 1]), 0.2, 42);
        assert_eq!(split.mode, ValidationMode::InsufficientData);
        assert_eq!(split.train.len(), 11);
    }

    #[test]
    fn batcher_skips_unreadable_images() {
        use burn_ndarray::{NdArray, NdArrayDevice};

        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.png");
        RgbImage::from_pixel(20, 10, image::Rgb([10, 200, 30])).save(&good).unwrap();
        let batch_items = vec![
            TrainingItem {
                image_path: good,
                label: 3,
                provenance: Provenance::User,
            },
            TrainingItem {
                image_path: dir.path().join("missing.png"),
                label: 1,
                provenance: Provenance::User,
            },
        ];

        let batcher = FurnitureBatcher::<NdArray>::new(NdArrayDevice::Cpu, 16);
        let batch = batcher.batch(&batch_items).unwrap();
        assert_eq!(batch.images.dims(), [1, 3, 16, 16]);
        assert_eq!(batch.labels, vec![3]);
        assert!(batcher.batch(&batch_items[1..]).is_none());
    }
}
