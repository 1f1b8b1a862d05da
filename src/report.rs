//! 学習結果の定義

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::model::{BackboneKind, LabelEncoder};

/// 検証データの作り方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// クラス比を保った分割
    Stratified,
    /// データが少なすぎるため全データで学習し、最大5件を検証に流用
    InsufficientData,
}

/// 1エポック分の記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// 学習結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    /// 観測された最良の検証精度 [0, 1]
    pub final_accuracy: f64,
    /// `validation_mode`がInsufficientDataの場合はfalse
    pub accuracy_reliable: bool,
    pub validation_mode: ValidationMode,
    /// 学習に要した時間（分）
    pub training_time: f64,
    pub original_count: usize,
    pub user_count: usize,
    pub total_count: usize,
    pub model_path: PathBuf,
    pub label_encoder: LabelEncoder,
    pub label_encoder_path: PathBuf,
    pub backbone: BackboneKind,
    pub pretrained_backbone: bool,
    pub epochs_run: usize,
    pub best_epoch: usize,
    /// 最良エポックでのクラス別検証精度
    pub per_class_accuracy: Vec<(String, f64)>,
    pub history: Vec<EpochRecord>,
}
