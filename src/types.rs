//! 家具クラスとサンプル由来の共通定義
//!
//! クラス順序はラベルエンコーダ・モデル出力層・フォールバックの全てで共有されます。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// クラス数
pub const NUM_CLASSES: usize = 5;

/// クラス名（モデル出力のインデックス順）
pub const CLASS_NAMES: [&str; NUM_CLASSES] = ["Almirah", "Chair", "Fridge", "Table", "TV"];

/// 家具クラス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FurnitureClass {
    Almirah,
    Chair,
    Fridge,
    Table,
    TV,
}

impl FurnitureClass {
    /// 全クラス（class_id順）
    pub const ALL: [FurnitureClass; NUM_CLASSES] = [
        FurnitureClass::Almirah,
        FurnitureClass::Chair,
        FurnitureClass::Fridge,
        FurnitureClass::Table,
        FurnitureClass::TV,
    ];

    pub fn id(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        CLASS_NAMES[self.id()]
    }

    pub fn from_id(id: i64) -> Option<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }

    /// 大文字小文字の揺れを吸収してクラスに変換する
    ///
    /// 前後の空白を除いた上で小文字化し、固定のテーブルと照合します。
    pub fn normalize(name: &str) -> Option<Self> {
        const LOOKUP: [(&str, FurnitureClass); NUM_CLASSES] = [
            ("almirah", FurnitureClass::Almirah),
            ("chair", FurnitureClass::Chair),
            ("fridge", FurnitureClass::Fridge),
            ("table", FurnitureClass::Table),
            ("tv", FurnitureClass::TV),
        ];

        let key = name.trim().to_ascii_lowercase();
        LOOKUP
            .iter()
            .find(|(candidate, _)| *candidate == key)
            .map(|(_, class)| *class)
    }

    /// 指定のクラス名リストが正規の順序と一致するか
    pub fn matches_canonical_order<S: AsRef<str>>(names: &[S]) -> bool {
        names.len() == NUM_CLASSES
            && names
                .iter()
                .zip(CLASS_NAMES.iter())
                .all(|(name, expected)| name.as_ref() == *expected)
    }
}

impl fmt::Display for FurnitureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FurnitureClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s).ok_or_else(|| {
            format!(
                "unknown furniture class '{}' (expected one of {})",
                s,
                CLASS_NAMES.join(", ")
            )
        })
    }
}

/// サンプルの由来
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// 初期データセット
    Original,
    /// ユーザーがアップロードしたデータ
    User,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Original => "original",
            Provenance::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "original" => Some(Provenance::Original),
            "user" => Some(Provenance::User),
            _ => None,
        }
    }
}

/// 初期データセットの分割種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetType {
    Train,
    Val,
    Test,
    Original,
}

impl DatasetType {
    pub fn as_str(self) -> &'static str {
        match self {
            DatasetType::Train => "train",
            DatasetType::Val => "val",
            DatasetType::Test => "test",
            DatasetType::Original => "original",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "train" => Some(DatasetType::Train),
            "val" | "valid" | "validation" => Some(DatasetType::Val),
            "test" => Some(DatasetType::Test),
            "original" => Some(DatasetType::Original),
            _ => None,
        }
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
