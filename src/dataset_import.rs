//! 初期データセットの取り込み
//!
//! CSVマニフェストか`root/<split>/<Class>/`形式のディレクトリから`OriginalSample`を作ります。

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::db::OriginalSample;
use crate::types::{DatasetType, FurnitureClass};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const SPLIT_DIRS: [(&str, DatasetType); 3] = [
    ("train", DatasetType::Train),
    ("val", DatasetType::Val),
    ("test", DatasetType::Test),
];
const SPLIT_SEED: u64 = 42;

#[derive(Debug, Deserialize)]
struct ManifestRow {
    image_path: String,
    class_name: String,
    dataset_type: String,
}

/// `image_path,class_name,dataset_type`形式のCSVを読み込む
///
/// 相対パスはマニフェストのあるディレクトリ基準で解決します。
pub fn load_manifest(path: &Path) -> Result<Vec<OriginalSample>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .context(format!("Failed to open manifest: {:?}", path))?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));

    let mut samples = Vec::new();
    for (i, result) in reader.deserialize::<ManifestRow>().enumerate() {
        // ヘッダ行を1行目とする
        let row_number = i + 2;
        let row = result.context(format!("Malformed manifest row {row_number}"))?;
        let class = FurnitureClass::normalize(&row.class_name)
            .ok_or_else(|| anyhow::anyhow!("Row {row_number}: unknown class {:?}", row.class_name))?;
        let dataset_type = DatasetType::parse(&row.dataset_type)
            .ok_or_else(|| anyhow::anyhow!("Row {row_number}: unknown dataset type {:?}", row.dataset_type))?;

        let image_path = PathBuf::from(&row.image_path);
        let image_path = if image_path.is_absolute() {
            image_path
        } else {
            base.join(image_path)
        };
        samples.push(OriginalSample {
            image_path: image_path.to_string_lossy().into_owned(),
            label: class.id(),
            dataset_type,
        });
    }
    tracing::info!("Loaded {} samples from manifest {}", samples.len(), path.display());
    Ok(samples)
}

/// データセットディレクトリを走査する
///
/// `root/train|val|test/<Class>/`が無い場合は`root/<Class>/`を読み、
/// クラスごとに80/10/10で分割します。
pub fn scan_dataset_dir(root: &Path) -> Result<Vec<OriginalSample>> {
    if !root.is_dir() {
        anyhow::bail!("Dataset directory not found: {}", root.display());
    }

    let has_splits = SPLIT_DIRS.iter().any(|(dir, _)| root.join(dir).is_dir());
    let mut samples = Vec::new();
    if has_splits {
        for (dir, dataset_type) in SPLIT_DIRS {
            let split_root = root.join(dir);
            if !split_root.is_dir() {
                continue;
            }
            for (class, files) in scan_class_dirs(&split_root)? {
                samples.extend(files.into_iter().map(|file| sample(file, class, dataset_type)));
            }
        }
    } else {
        let mut rng = StdRng::seed_from_u64(SPLIT_SEED);
        for (class, mut files) in scan_class_dirs(root)? {
            files.shuffle(&mut rng);
            let n = files.len();
            let n_train = (n as f64 * 0.8).round() as usize;
            let n_val = (n as f64 * 0.1).round() as usize;
            for (i, file) in files.into_iter().enumerate() {
                let dataset_type = if i < n_train {
                    DatasetType::Train
                } else if i < n_train + n_val {
                    DatasetType::Val
                } else {
                    DatasetType::Test
                };
                samples.push(sample(file, class, dataset_type));
            }
        }
    }

    if samples.is_empty() {
        anyhow::bail!("No images found under {}", root.display());
    }
    tracing::info!("Found {} images under {}", samples.len(), root.display());
    Ok(samples)
}

fn sample(path: PathBuf, class: FurnitureClass, dataset_type: DatasetType) -> OriginalSample {
    OriginalSample {
        image_path: path.to_string_lossy().into_owned(),
        label: class.id(),
        dataset_type,
    }
}

/// クラス名のサブディレクトリごとに画像ファイルを集める（名前順）
fn scan_class_dirs(dir: &Path) -> Result<Vec<(FurnitureClass, Vec<PathBuf>)>> {
    let mut classes = Vec::new();
    for entry in std::fs::read_dir(dir).context(format!("Failed to read directory: {:?}", dir))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(class) = FurnitureClass::normalize(&name) else {
            tracing::warn!("Skipping directory with unknown class name: {}", entry.path().display());
            continue;
        };
        let mut files: Vec<PathBuf> = std::fs::read_dir(entry.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        files.sort();
        classes.push((class, files));
    }
    classes.sort_by_key(|(class, _)| *class);
    Ok(classes)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn manifest_normalizes_classes_and_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("manifest.csv");
        std::fs::write(
            &manifest,
            "image_path,class_name,dataset_type\nimgs/a.jpg, chair ,train\n/abs/b.jpg,TV,valid\n",
        )
        .unwrap();

        let samples = load_manifest(&manifest).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].label, FurnitureClass::Chair.id());
        assert_eq!(samples[0].dataset_type, DatasetType::Train);
        assert!(samples[0].image_path.ends_with("imgs/a.jpg"));
        assert!(Path::new(&samples[0].image_path).is_absolute());
        assert_eq!(samples[1].label, FurnitureClass::TV.id());
        assert_eq!(samples[1].dataset_type, DatasetType::Val);
        assert_eq!(samples[1].image_path, "/abs/b.jpg");
    }

    #[test]
    fn manifest_reports_unknown_class_row() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("manifest.csv");
        std::fs::write(
            &manifest,
            "image_path,class_name,dataset_type\na.jpg,Chair,train\nb.jpg,Sofa,train\n",
        )
        .unwrap();
        let err = load_manifest(&manifest).unwrap_err();
        assert!(err.to_string().contains("Row 3"));
    }

    #[test]
    fn scans_split_layout() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("train/Chair/1.jpg"));
        touch(&dir.path().join("train/fridge/2.PNG"));
        touch(&dir.path().join("val/Table/3.jpeg"));
        touch(&dir.path().join("train/Chair/notes.txt"));
        touch(&dir.path().join("train/Sofa/4.jpg"));

        let samples = scan_dataset_dir(dir.path()).unwrap();
        assert_eq!(samples.len(), 3);
        let train = samples.iter().filter(|s| s.dataset_type == DatasetType::Train).count();
        assert_eq!(train, 2);
        assert!(samples.iter().any(|s| s.label == FurnitureClass::Fridge.id()));
    }

    #[test]
    fn splits_flat_layout_per_class() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10 {
            touch(&dir.path().join(format!("Almirah/{i}.jpg")));
        }
        let samples = scan_dataset_dir(dir.path()).unwrap();
        let count = |t| samples.iter().filter(|s| s.dataset_type == t).count();
        assert_eq!(count(DatasetType::Train), 8);
        assert_eq!(count(DatasetType::Val), 1);
        assert_eq!(count(DatasetType::Test), 1);
    }

    #[test]
    fn empty_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_dataset_dir(dir.path()).is_err());
    }
}
