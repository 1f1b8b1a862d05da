use std::collections::BTreeMap;

use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{CombinedSample, FurnitureDb, ModelMetric, RetrainingSession, StoreError};
use crate::types::{DatasetType, FurnitureClass, Provenance};

/// 学習に必要な最小データ数
pub const MIN_TOTAL_SAMPLES: usize = 10;
/// 1クラスあたりの最小データ数
pub const MIN_SAMPLES_PER_CLASS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassCount {
    pub class_name: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassConfidence {
    pub class_name: String,
    pub avg_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionStats {
    pub total_predictions: i64,
    pub class_predictions: Vec<ClassCount>,
    pub predictions_over_time: Vec<DailyCount>,
    pub avg_confidence: Vec<ClassConfidence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalDistribution {
    pub class_name: String,
    pub dataset_type: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingDataStats {
    pub original_data: Vec<OriginalDistribution>,
    pub user_data: Vec<ClassCount>,
    pub retraining_sessions: Vec<RetrainingSession>,
}

impl FurnitureDb {
    /// 初期データのtrain分割と全ユーザーデータを結合して返す
    ///
    /// クラス名は正規化され、認識できない行は捨てられます。
    pub fn get_combined_training_data(&self) -> Result<Vec<CombinedSample>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT image_path, class_name, class_id, provenance
               FROM training_data WHERE dataset_type = ?1
             UNION ALL
             SELECT image_path, class_name, class_id, provenance
               FROM user_data",
        )?;
        let rows = stmt
            .query_map(params![DatasetType::Train.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let fetched = rows.len();
        let mut combined = Vec::with_capacity(fetched);
        for (image_path, class_name, class_id, provenance) in rows {
            let Some(class) = FurnitureClass::normalize(&class_name) else {
                tracing::warn!("Dropping {image_path}: unknown class '{class_name}'");
                continue;
            };
            let Some(provenance) = Provenance::parse(&provenance) else {
                tracing::warn!("Dropping {image_path}: unknown provenance '{provenance}'");
                continue;
            };
            if class_id != class.id() as i64 {
                tracing::debug!(
                    "Correcting class id for {image_path}: {class_id} -> {}",
                    class.id()
                );
            }
            combined.push(CombinedSample {
                image_path,
                class_name: class.name().to_string(),
                class_id: class.id() as i64,
                provenance,
            });
        }

        let original = combined
            .iter()
            .filter(|s| s.provenance == Provenance::Original)
            .count();
        tracing::info!(
            "Combined training data: {} original + {} user ({} dropped)",
            original,
            combined.len() - original,
            fetched - combined.len()
        );
        Ok(combined)
    }

    /// 学習を開始できるだけのデータがあるかを確認する
    pub fn check_training_data_requirements(&self) -> Result<(bool, String), StoreError> {
        let combined = self.get_combined_training_data()?;
        Ok(evaluate_requirements(&combined))
    }

    pub fn get_prediction_stats(&self) -> Result<PredictionStats, StoreError> {
        let conn = self.connect()?;
        let total_predictions: i64 =
            conn.query_row("SELECT COUNT(*) FROM predictions", [], |row| row.get(0))?;

        let class_predictions = conn
            .prepare(
                "SELECT predicted_class, COUNT(*) AS count FROM predictions
                 GROUP BY predicted_class ORDER BY count DESC, predicted_class",
            )?
            .query_map([], |row| {
                Ok(ClassCount {
                    class_name: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let predictions_over_time = conn
            .prepare(
                "SELECT DATE(prediction_time) AS date, COUNT(*) FROM predictions
                 GROUP BY date ORDER BY date",
            )?
            .query_map([], |row| {
                Ok(DailyCount {
                    date: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let avg_confidence = conn
            .prepare(
                "SELECT predicted_class, AVG(confidence) FROM predictions
                 GROUP BY predicted_class ORDER BY predicted_class",
            )?
            .query_map([], |row| {
                Ok(ClassConfidence {
                    class_name: row.get(0)?,
                    avg_confidence: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PredictionStats {
            total_predictions,
            class_predictions,
            predictions_over_time,
            avg_confidence,
        })
    }

    pub fn get_training_data_stats(&self) -> Result<TrainingDataStats, StoreError> {
        let conn = self.connect()?;
        let original_data = conn
            .prepare(
                "SELECT class_name, dataset_type, COUNT(*) FROM training_data
                 GROUP BY class_name, dataset_type ORDER BY dataset_type, class_name",
            )?
            .query_map([], |row| {
                Ok(OriginalDistribution {
                    class_name: row.get(0)?,
                    dataset_type: row.get(1)?,
                    count: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let user_data = conn
            .prepare("SELECT class_name, COUNT(*) FROM user_data GROUP BY class_name ORDER BY class_name")?
            .query_map([], |row| {
                Ok(ClassCount {
                    class_name: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        drop(conn);
        Ok(TrainingDataStats {
            original_data,
            user_data,
            retraining_sessions: self.get_all_training_sessions()?,
        })
    }

    /// 全セッションを新しい順に返す
    pub fn get_all_training_sessions(&self) -> Result<Vec<RetrainingSession>, StoreError> {
        let conn = self.connect()?;
        let sessions = conn
            .prepare(
                "SELECT id, session_name, original_data_count, user_data_count, total_data_count,
                        final_accuracy, training_time_minutes, model_path, COALESCE(created_at, '')
                   FROM retraining_sessions ORDER BY created_at DESC, id DESC",
            )?
            .query_map([], |row| {
                Ok(RetrainingSession {
                    id: row.get(0)?,
                    session_name: row.get(1)?,
                    original_data_count: row.get(2)?,
                    user_data_count: row.get(3)?,
                    total_data_count: row.get(4)?,
                    final_accuracy: row.get(5)?,
                    training_time_minutes: row.get(6)?,
                    model_path: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    pub fn get_session_metrics(&self, session_id: i64) -> Result<Vec<ModelMetric>, StoreError> {
        let conn = self.connect()?;
        let metrics = conn
            .prepare(
                "SELECT session_id, metric_name, metric_value, class_name FROM model_metrics
                 WHERE session_id = ?1 ORDER BY id",
            )?
            .query_map(params![session_id], |row| {
                Ok(ModelMetric {
                    session_id: row.get(0)?,
                    metric_name: row.get(1)?,
                    metric_value: row.get(2)?,
                    class_name: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(metrics)
    }
}

/// 結合済みデータに対して最小データ要件を判定する
pub fn evaluate_requirements(combined: &[CombinedSample]) -> (bool, String) {
    let total = combined.len();
    if total < MIN_TOTAL_SAMPLES {
        return (
            false,
            format!("Need at least {MIN_TOTAL_SAMPLES} total images, currently have {total}"),
        );
    }

    let mut counts: BTreeMap<FurnitureClass, usize> = BTreeMap::new();
    for sample in combined {
        if let Some(class) = FurnitureClass::from_id(sample.class_id) {
            *counts.entry(class).or_default() += 1;
        }
    }

    let insufficient: Vec<String> = counts
        .iter()
        .filter(|(_, count)| **count < MIN_SAMPLES_PER_CLASS)
        .map(|(class, count)| format!("{class}: {count}"))
        .collect();
    if !insufficient.is_empty() {
        return (
            false,
            format!(
                "Classes with insufficient data (need ≥{MIN_SAMPLES_PER_CLASS} each): {}",
                insufficient.join(", ")
            ),
        );
    }

    (true, "Training data requirements met".to_string())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{balanced_original, class_names, temp_db};
    use super::super::{OriginalSample, UserSample};
    use super::*;
    use crate::types::CLASS_NAMES;

    #[test]
    fn combined_without_user_data_is_train_split() {
        let (_dir, db) = temp_db();
        let mut samples = balanced_original(3);
        samples.push(OriginalSample {
            image_path: "data/val/Chair/0.jpg".to_string(),
            label: 1,
            dataset_type: DatasetType::Val,
        });
        samples.push(OriginalSample {
            image_path: "data/test/TV/0.jpg".to_string(),
            label: 4,
            dataset_type: DatasetType::Test,
        });
        db.populate_original_data(&samples, &class_names()).unwrap();

        let combined = db.get_combined_training_data().unwrap();
        assert_eq!(combined.len(), 15);
        for class in FurnitureClass::ALL {
            let count = combined.iter().filter(|s| s.class_id == class.id() as i64).count();
            assert_eq!(count, 3);
        }
        assert!(combined.iter().all(|s| s.provenance == Provenance::Original));
    }

    #[test]
    fn case_variants_share_class_id() {
        let (_dir, db) = temp_db();
        let names = vec![
            "almirah".to_string(),
            "chair".to_string(),
            "fridge".to_string(),
            "table".to_string(),
            "tv".to_string(),
        ];
        db.populate_original_data(
            &[OriginalSample {
                image_path: "lower.jpg".to_string(),
                label: 1,
                dataset_type: DatasetType::Train,
            }],
            &names,
        )
        .unwrap();
        db.add_user_data(
            &[UserSample {
                image_path: "upper.jpg".to_string(),
                class: FurnitureClass::Chair,
            }],
            "user",
        )
        .unwrap();

        let combined = db.get_combined_training_data().unwrap();
        assert_eq!(combined.len(), 2);
        assert!(combined.iter().all(|s| s.class_id == 1 && s.class_name == "Chair"));
    }

    #[test]
    fn unknown_class_rows_are_dropped() {
        let (_dir, db) = temp_db();
        let mut names = class_names();
        names.push("Sofa".to_string());
        db.populate_original_data(
            &[
                OriginalSample {
                    image_path: "sofa.jpg".to_string(),
                    label: 5,
                    dataset_type: DatasetType::Train,
                },
                OriginalSample {
                    image_path: "fridge.jpg".to_string(),
                    label: 2,
                    dataset_type: DatasetType::Train,
                },
            ],
            &names,
        )
        .unwrap();

        let combined = db.get_combined_training_data().unwrap();
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].class_name, "Fridge");
    }

    #[test]
    fn persisted_class_ids_round_trip() {
        let (_dir, db) = temp_db();
        db.populate_original_data(&balanced_original(2), &class_names()).unwrap();
        for sample in db.get_combined_training_data().unwrap() {
            assert_eq!(CLASS_NAMES[sample.class_id as usize], sample.class_name);
        }
    }

    #[test]
    fn requirements_reject_small_totals() {
        let (_dir, db) = temp_db();
        db.populate_original_data(&balanced_original(1), &class_names()).unwrap();
        let (ok, message) = db.check_training_data_requirements().unwrap();
        assert!(!ok);
        assert_eq!(message, "Need at least 10 total images, currently have 5");
    }

    #[test]
    fn requirements_reject_sparse_class() {
        let (_dir, db) = temp_db();
        let samples: Vec<OriginalSample> = (0..12)
            .map(|i| OriginalSample {
                image_path: format!("{i}.jpg"),
                label: if i == 0 { 4 } else { i % 4 },
                dataset_type: DatasetType::Train,
            })
            .collect();
        db.populate_original_data(&samples, &class_names()).unwrap();

        let (ok, message) = db.check_training_data_requirements().unwrap();
        assert!(!ok);
        assert!(message.starts_with("Classes with insufficient data"));
        assert!(message.contains("TV: 1"));
    }

    #[test]
    fn requirements_met_for_balanced_data() {
        let (_dir, db) = temp_db();
        db.populate_original_data(&balanced_original(2), &class_names()).unwrap();
        assert_eq!(
            db.check_training_data_requirements().unwrap(),
            (true, "Training data requirements met".to_string())
        );
    }

    #[test]
    fn prediction_stats_aggregate() {
        let (_dir, db) = temp_db();
        db.log_prediction("a.jpg", "Chair", 0.8, None, "v1.0").unwrap();
        db.log_prediction("b.jpg", "Chair", 0.6, Some("Chair"), "v1.0").unwrap();
        db.log_prediction("c.jpg", "TV", 0.9, None, "v1.0").unwrap();

        let stats = db.get_prediction_stats().unwrap();
        assert_eq!(stats.total_predictions, 3);
        assert_eq!(stats.class_predictions[0].class_name, "Chair");
        assert_eq!(stats.class_predictions[0].count, 2);
        assert_eq!(stats.predictions_over_time.iter().map(|d| d.count).sum::<i64>(), 3);
        let chair = stats
            .avg_confidence
            .iter()
            .find(|c| c.class_name == "Chair")
            .unwrap();
        assert!((chair.avg_confidence - 0.7).abs() < 1e-9);
    }
}
