//! 家具画像分類器
//!
//! SQLiteに初期データ・ユーザーデータ・予測履歴を保存し、
//! アップロード画像を加えて分類モデルを再学習します。
#![recursion_limit = "256"]

pub mod types;
pub mod db;
pub mod dataset_import;
pub mod logging;
pub mod model;
pub mod report;

// 推論・学習機能のモジュール
#[cfg(feature = "ml")]
pub mod ml;
#[cfg(feature = "ml")]
pub mod predictor;
#[cfg(feature = "ml")]
pub mod retrain;
#[cfg(feature = "ml")]
pub mod server;

pub use db::{FurnitureDb, StoreError};
pub use model::AppConfig;
pub use types::{FurnitureClass, CLASS_NAMES, NUM_CLASSES};
