//! 学習データ・予測履歴・再学習セッションの永続化
//!
//! SQLiteの1ファイルに5つのテーブルを保持します。接続は操作ごとに開いて閉じます。

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DatasetType, FurnitureClass, Provenance};

/// 集計・読み出し系のクエリ
pub mod read;
/// スキーマ定義
pub mod schema;
/// 書き込み系の操作
pub mod write;

pub use read::{
    ClassConfidence, ClassCount, DailyCount, OriginalDistribution, PredictionStats,
    TrainingDataStats,
};

/// ストア操作のエラー
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to prepare database directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// 初期データセットの1サンプル
#[derive(Debug, Clone, PartialEq)]
pub struct OriginalSample {
    pub image_path: String,
    /// class_namesへのインデックス
    pub label: usize,
    pub dataset_type: DatasetType,
}

/// ユーザーがアップロードした1サンプル
#[derive(Debug, Clone, PartialEq)]
pub struct UserSample {
    pub image_path: String,
    pub class: FurnitureClass,
}

/// 学習に使う結合済みサンプル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedSample {
    pub image_path: String,
    pub class_name: String,
    pub class_id: i64,
    pub provenance: Provenance,
}

/// 再学習セッションの記録内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRetrainingSession {
    pub session_name: String,
    pub original_data_count: usize,
    pub user_data_count: usize,
    pub total_data_count: usize,
    pub final_accuracy: f64,
    pub training_time_minutes: f64,
    pub model_path: String,
}

/// 保存済みの再学習セッション
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainingSession {
    pub id: i64,
    pub session_name: String,
    pub original_data_count: i64,
    pub user_data_count: i64,
    pub total_data_count: i64,
    pub final_accuracy: f64,
    pub training_time_minutes: f64,
    pub model_path: String,
    pub created_at: String,
}

/// メトリクス値（全体値またはクラス別の値）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Overall(f64),
    PerClass(Vec<(String, f64)>),
}

/// 保存済みのメトリクス行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetric {
    pub session_id: i64,
    pub metric_name: String,
    pub metric_value: f64,
    pub class_name: Option<String>,
}

/// SQLiteストア
///
/// パスのみを保持し、各操作で新しい接続を開きます。
#[derive(Debug, Clone)]
pub struct FurnitureDb {
    path: PathBuf,
}

impl FurnitureDb {
    /// データベースを開き、スキーマを適用する
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let db = Self { path };
        let conn = db.connect()?;
        schema::apply_schema(&conn)?;
        tracing::debug!("Database ready at {}", db.path.display());
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 接続確認（ヘルスチェック用）
    pub fn ping(&self) -> bool {
        match self
            .connect()
            .and_then(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
        {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!("Database ping failed: {err}");
                false
            }
        }
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(conn)
    }
}
