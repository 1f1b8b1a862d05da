//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・モデル・学習・保存先などをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// セッションごとのモデルを保存するディレクトリ
    pub models_dir: PathBuf,
    /// 推論に使用するモデルファイルのパス
    pub active_model_path: PathBuf,
    /// 事前学習済みバックボーンの重みを置くディレクトリ
    pub backbone_weights_dir: PathBuf,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// 推論時に1枚ずつ順伝播し、バッファをその都度解放する
    pub low_memory: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            active_model_path: PathBuf::from("models/furniture_classifier.tar.gz"),
            backbone_weights_dir: PathBuf::from("models/backbones"),
            image_size: 224,
            low_memory: false,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数（リクエストで指定が無い場合）
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// 検証データの割合
    pub validation_split: f64,
    /// 検証精度が改善しないまま許容するエポック数
    pub early_stopping_patience: usize,
    /// 学習率を下げるまでに待つエポック数
    pub lr_patience: usize,
    /// 学習率の減衰率
    pub lr_factor: f64,
    /// 学習率の下限
    pub min_lr: f64,
    /// 改善とみなす検証損失の最小変化量
    pub lr_min_delta: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 32,
            learning_rate: 1e-3,
            seed: 42,
            validation_split: 0.2,
            early_stopping_patience: 5,
            lr_patience: 3,
            lr_factor: 0.2,
            min_lr: 1e-7,
            lr_min_delta: 1e-4,
        }
    }
}

/// データベース設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("database/furniture.db"),
        }
    }
}

/// アップロード画像の保存先
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub uploads_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("data/uploads"),
        }
    }
}

/// HTTPサーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8517,
        }
    }
}

/// ログ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `RUST_LOG`が無い場合に使うフィルタ
    pub filter: String,
    /// 指定するとファイルにも日次で出力する
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            log_dir: None,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しないか壊れている場合はデフォルト設定を返す
    ///
    /// ロガー初期化前に呼ばれるため、結果は呼び出し側でログに出します。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, ConfigSource) {
        let path = path.as_ref();
        if !path.exists() {
            return (Self::default(), ConfigSource::Default);
        }
        match Self::load(path) {
            Ok(config) => (config, ConfigSource::File(path.to_path_buf())),
            Err(e) => (
                Self::default(),
                ConfigSource::Invalid(path.to_path_buf(), e.to_string()),
            ),
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定内容をログに出す
    pub fn log_summary(&self) {
        tracing::info!("Device: {}", self.device_type);
        tracing::info!("Database: {}", self.database.path.display());
        tracing::info!("Active model: {}", self.model.active_model_path.display());
        tracing::info!(
            "Training: epochs={}, batch={}, lr={}, seed={}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.seed
        );
    }
}

/// 設定の読み込み元
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    File(PathBuf),
    Default,
    Invalid(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.model.image_size, 224);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.training.early_stopping_patience, 5);
        assert_eq!(config.server.port, 8517);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.training, deserialized.training);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"device_type": "Wgpu", "training": {"batch_size": 4}}"#).unwrap();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.training.batch_size, 4);
        assert!(!config.model.low_memory);
        assert_eq!(config.training.seed, 42);
        assert_eq!(config.database.path, PathBuf::from("database/furniture.db"));
    }

    #[test]
    fn test_load_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let (_, source) = AppConfig::load_or_default(&path);
        assert_eq!(source, ConfigSource::Default);

        let mut config = AppConfig::default();
        config.server.port = 9000;
        config.save(&path).unwrap();
        let (loaded, source) = AppConfig::load_or_default(&path);
        assert_eq!(loaded.server.port, 9000);
        assert_eq!(source, ConfigSource::File(path.clone()));

        std::fs::write(&path, "{not json").unwrap();
        let (_, source) = AppConfig::load_or_default(&path);
        assert!(matches!(source, ConfigSource::Invalid(_, _)));
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
