//! ラベルエンコーダ（クラスインデックス→クラス名の対応）

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::{FurnitureClass, CLASS_NAMES};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoder {
    pub classes: Vec<String>,
}

/// ラベルエンコーダの取得元
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    /// モデルと同じ場所に保存されたファイル
    Persisted,
    /// ファイルが無いか読めないため正規の順序を使用
    CanonicalFallback,
}

impl Default for LabelEncoder {
    fn default() -> Self {
        Self::canonical()
    }
}

impl LabelEncoder {
    pub fn canonical() -> Self {
        Self {
            classes: CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create parent directory: {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize label encoder")?;
        std::fs::write(path, json).context(format!("Failed to write label encoder: {:?}", path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .context(format!("Failed to read label encoder: {:?}", path))?;
        serde_json::from_str(&json).context(format!("Failed to parse label encoder: {:?}", path))
    }

    /// クラス順序がモデル出力層と一致するか検証する
    pub fn validate(&self) -> Result<()> {
        if FurnitureClass::matches_canonical_order(&self.classes) {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "label encoder classes [{}] do not match the model output order [{}]",
                self.classes.join(", "),
                CLASS_NAMES.join(", ")
            ))
        }
    }

    /// モデルに付随するエンコーダを読み込む
    ///
    /// ファイルが無い・読めない場合は正規の順序にフォールバックし、
    /// 読めたが順序が異なる場合はエラーにします。
    pub fn load_for_model(path: &Path) -> Result<(Self, LabelSource)> {
        if !path.exists() {
            tracing::warn!(
                "Label encoder not found at {}, using canonical class order",
                path.display()
            );
            return Ok((Self::canonical(), LabelSource::CanonicalFallback));
        }
        match Self::load(path) {
            Ok(encoder) => {
                encoder.validate()?;
                Ok((encoder, LabelSource::Persisted))
            }
            Err(e) => {
                tracing::warn!("{e:#}; using canonical class order");
                Ok((Self::canonical(), LabelSource::CanonicalFallback))
            }
        }
    }

    pub fn class_name(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let (encoder, source) = LabelEncoder::load_for_model(&dir.path().join("none.json")).unwrap();
        assert_eq!(encoder, LabelEncoder::canonical());
        assert_eq!(source, LabelSource::CanonicalFallback);
    }

    #[test]
    fn unreadable_file_falls_back_to_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "[[[").unwrap();
        let (_, source) = LabelEncoder::load_for_model(&path).unwrap();
        assert_eq!(source, LabelSource::CanonicalFallback);
    }

    #[test]
    fn reordered_classes_fail_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reordered.json");
        LabelEncoder {
            classes: vec!["TV", "Table", "Fridge", "Chair", "Almirah"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
        .save(&path)
        .unwrap();
        assert!(LabelEncoder::load_for_model(&path).is_err());
    }

    #[test]
    fn persisted_canonical_encoder_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.json");
        LabelEncoder::canonical().save(&path).unwrap();
        let (encoder, source) = LabelEncoder::load_for_model(&path).unwrap();
        assert_eq!(source, LabelSource::Persisted);
        assert_eq!(encoder.class_name(4), Some("TV"));
    }
}
