//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス順序、バックボーン、入力サイズなど）
//! - model.bin       - モデルの重み（バイナリ）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

/// モデルファイルの読み込み形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    /// metadata.json + model.bin のtar.gz
    Archive,
    /// 重みレコードのみのファイル
    RawRecord,
}

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";
const ARCHIVE_SUFFIX: &str = ".tar.gz";
const LABEL_ENCODER_SUFFIX: &str = "_label_encoder.json";

/// 保存先パスを`.tar.gz`付きに揃える
pub fn archive_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// モデルパスからラベルエンコーダのパスを導出する
///
/// `models/a.tar.gz` → `models/a_label_encoder.json`
pub fn label_encoder_path_for(model_path: &Path) -> PathBuf {
    let file_name = model_path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = match file_name.strip_suffix(ARCHIVE_SUFFIX) {
        Some(stem) => stem.to_string(),
        None => model_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default(),
    };
    model_path.with_file_name(format!("{stem}{LABEL_ENCODER_SUFFIX}"))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 書き込みは一時ファイルに行い、完了後にリネームします。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = archive_path(output_path);

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    let partial_path = tar_gz_path.with_extension("gz.partial");
    let tar_gz_file = File::create(&partial_path)
        .context(format!("Failed to create tar.gz file: {:?}", partial_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?;
    encoder.finish().context("Failed to finish gzip stream")?;

    std::fs::rename(&partial_path, &tar_gz_path)
        .context(format!("Failed to move archive into place: {:?}", tar_gz_path))?;
    Ok(tar_gz_path)
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .context(format!("Failed to add {name} to tar"))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().to_string();

        match path.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            MODEL_ENTRY => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// メタデータをログに出す
pub fn log_metadata_info(metadata: &ModelMetadata) {
    tracing::info!(
        "Model metadata: backbone={} (pretrained={}), input={}x{}, epochs={}, val_acc={:.4}, trained_at={}",
        metadata.backbone,
        metadata.pretrained,
        metadata.image_size,
        metadata.image_size,
        metadata.num_epochs,
        metadata.validation_accuracy,
        metadata.trained_at
    );
}
