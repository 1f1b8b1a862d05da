//! ログ出力の初期化
//!
//! 標準出力へ書き出し、`log_dir`が指定されていれば日ごとにローテーションするファイルにも書き出します。

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use crate::model::config::LoggingSettings;

const LOG_FILE_PREFIX: &str = "furniture_classifier.log";

static LOG_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to prepare log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid log filter {filter:?}: {message}")]
    InvalidFilter { filter: String, message: String },
    #[error("Failed to install global tracing subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// ロガーを初期化する（2回目以降の呼び出しは何もしない）
pub fn init(settings: &LoggingSettings) -> Result<(), LoggingError> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = build_env_filter(&settings.filter)?;
    let stdout_layer = fmt::layer().with_target(false).with_writer(std::io::stdout);

    let (file_layer, guard) = match &settings.log_dir {
        Some(dir) => {
            prepare_dir(dir)?;
            let appender = rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = LOG_GUARD.set(guard);

    if let Some(dir) = &settings.log_dir {
        tracing::info!("Logging initialized; log files in {}", dir.display());
    }
    Ok(())
}

/// `RUST_LOG`が設定されていればそれを優先する
fn build_env_filter(default_filter: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_filter).map_err(|e| LoggingError::InvalidFilter {
        filter: default_filter.to_string(),
        message: e.to_string(),
    })
}

fn prepare_dir(dir: &Path) -> Result<(), LoggingError> {
    std::fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_configured_filter() {
        assert!(build_env_filter("info,furniture_classifier_lib=debug").is_ok());
    }

    #[test]
    fn creates_nested_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/logs");
        prepare_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
