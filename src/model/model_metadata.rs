//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルと共に保存され、推論時の構成復元とクラス順序の検証に使われます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::CLASS_NAMES;

/// 特徴抽出に使うバックボーンの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    /// 標準のバックボーン（4ブロック, 256ch）
    Wide,
    /// 軽量バックボーン（3ブロック, 64ch）
    Compact,
}

impl BackboneKind {
    /// 事前学習済み重みのファイル名（拡張子なし）
    pub fn weights_file_stem(self) -> &'static str {
        match self {
            BackboneKind::Wide => "wide_backbone",
            BackboneKind::Compact => "compact_backbone",
        }
    }
}

impl std::fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackboneKind::Wide => write!(f, "wide"),
            BackboneKind::Compact => write!(f, "compact"),
        }
    }
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// 出力層のインデックス順のクラス名
    pub class_labels: Vec<String>,

    pub backbone: BackboneKind,

    /// バックボーンが事前学習済み重みから初期化されたか
    pub pretrained: bool,

    /// モデル入力サイズ（正方形）
    pub image_size: usize,

    /// 実際に回したエポック数
    pub num_epochs: usize,

    /// この重みを保存した時点の検証精度
    pub validation_accuracy: f64,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        backbone: BackboneKind,
        pretrained: bool,
        image_size: usize,
        num_epochs: usize,
        validation_accuracy: f64,
    ) -> Self {
        Self {
            class_labels: CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
            backbone,
            pretrained,
            image_size,
            num_epochs,
            validation_accuracy,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを復元
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
