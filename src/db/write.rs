use rusqlite::{params, TransactionBehavior};

use super::{FurnitureDb, MetricValue, NewRetrainingSession, OriginalSample, StoreError, UserSample};
use crate::types::Provenance;

impl FurnitureDb {
    /// 初期データセットを一括登録する
    ///
    /// 由来が`original`の既存行は全て置き換えられるため、何度呼んでも結果は同じです。
    pub fn populate_original_data(
        &self,
        samples: &[OriginalSample],
        class_names: &[String],
    ) -> Result<usize, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let removed = tx.execute(
            "DELETE FROM training_data WHERE provenance = ?1",
            params![Provenance::Original.as_str()],
        )?;
        if removed > 0 {
            tracing::info!("Replacing {removed} existing original samples");
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO training_data (image_path, class_name, class_id, dataset_type, provenance)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for sample in samples {
                let class_name = class_names.get(sample.label).ok_or_else(|| {
                    StoreError::InvalidInput(format!(
                        "label {} for {} is outside the {} known classes",
                        sample.label,
                        sample.image_path,
                        class_names.len()
                    ))
                })?;
                stmt.execute(params![
                    sample.image_path,
                    class_name,
                    sample.label as i64,
                    sample.dataset_type.as_str(),
                    Provenance::Original.as_str(),
                ])?;
            }
        }

        tx.commit()?;
        tracing::info!("Populated {} original samples", samples.len());
        Ok(samples.len())
    }

    /// アップロードされたサンプルを追加する
    pub fn add_user_data(&self, samples: &[UserSample], uploaded_by: &str) -> Result<usize, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO user_data (image_path, class_name, class_id, uploaded_by, provenance)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for sample in samples {
                stmt.execute(params![
                    sample.image_path,
                    sample.class.name(),
                    sample.class.id() as i64,
                    uploaded_by,
                    Provenance::User.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        tracing::info!("Added {} user samples", samples.len());
        Ok(samples.len())
    }

    /// ユーザーデータを全て削除する
    pub fn clear_user_data(&self) -> Result<usize, StoreError> {
        let conn = self.connect()?;
        let removed = conn.execute("DELETE FROM user_data", [])?;
        tracing::info!("Cleared {removed} user samples");
        Ok(removed)
    }

    /// 予測結果を記録する
    pub fn log_prediction(
        &self,
        image_path: &str,
        predicted_class: &str,
        confidence: f64,
        true_class: Option<&str>,
        model_version: &str,
    ) -> Result<i64, StoreError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(StoreError::InvalidInput(format!(
                "confidence {confidence} is outside [0, 1]"
            )));
        }
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO predictions (image_path, true_class, predicted_class, confidence, model_version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![image_path, true_class, predicted_class, confidence, model_version],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 再学習セッションを記録し、採番されたIDを返す
    pub fn log_retraining_session(&self, session: &NewRetrainingSession) -> Result<i64, StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO retraining_sessions
                (session_name, original_data_count, user_data_count, total_data_count,
                 final_accuracy, training_time_minutes, model_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.session_name,
                session.original_data_count as i64,
                session.user_data_count as i64,
                session.total_data_count as i64,
                session.final_accuracy,
                session.training_time_minutes,
                session.model_path,
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!("Logged retraining session '{}' as #{id}", session.session_name);
        Ok(id)
    }

    /// セッションにメトリクスを記録する
    ///
    /// クラス別の値は1クラス1行で保存されます。
    pub fn log_metrics(
        &self,
        session_id: i64,
        metrics: &[(String, MetricValue)],
    ) -> Result<usize, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO model_metrics (session_id, metric_name, metric_value, class_name)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (name, value) in metrics {
                match value {
                    MetricValue::Overall(v) => {
                        stmt.execute(params![session_id, name, v, Option::<String>::None])?;
                        written += 1;
                    }
                    MetricValue::PerClass(values) => {
                        for (class_name, v) in values {
                            stmt.execute(params![session_id, name, v, Some(class_name)])?;
                            written += 1;
                        }
                    }
                }
            }
        }
        tx.commit()?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{balanced_original, class_names, temp_db};
    use super::*;
    use crate::types::FurnitureClass;

    #[test]
    fn populate_replaces_previous_original_rows() {
        let (_dir, db) = temp_db();
        db.populate_original_data(&balanced_original(3), &class_names()).unwrap();
        db.populate_original_data(&balanced_original(2), &class_names()).unwrap();

        let stats = db.get_training_data_stats().unwrap();
        let total: i64 = stats.original_data.iter().map(|row| row.count).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn populate_rejects_unknown_label_and_rolls_back() {
        let (_dir, db) = temp_db();
        db.populate_original_data(&balanced_original(2), &class_names()).unwrap();

        let mut samples = balanced_original(1);
        samples.push(OriginalSample {
            image_path: "data/train/sofa.jpg".to_string(),
            label: 9,
            dataset_type: crate::types::DatasetType::Train,
        });
        let err = db.populate_original_data(&samples, &class_names()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));

        // 失敗時は以前のデータが残る
        assert_eq!(db.get_combined_training_data().unwrap().len(), 10);
    }

    #[test]
    fn clear_user_data_removes_everything() {
        let (_dir, db) = temp_db();
        let samples = vec![
            UserSample {
                image_path: "a.jpg".to_string(),
                class: FurnitureClass::Almirah,
            },
            UserSample {
                image_path: "b.jpg".to_string(),
                class: FurnitureClass::TV,
            },
        ];
        assert_eq!(db.add_user_data(&samples, "tester").unwrap(), 2);
        assert_eq!(db.clear_user_data().unwrap(), 2);
        assert!(db.get_combined_training_data().unwrap().is_empty());
    }

    #[test]
    fn log_prediction_validates_confidence() {
        let (_dir, db) = temp_db();
        assert!(db.log_prediction("x.jpg", "Chair", 0.9, None, "v1.0").is_ok());
        assert!(db.log_prediction("x.jpg", "Chair", 1.5, None, "v1.0").is_err());
    }

    #[test]
    fn session_and_metrics_are_linked() {
        let (_dir, db) = temp_db();
        let id = db
            .log_retraining_session(&NewRetrainingSession {
                session_name: "s1".to_string(),
                original_data_count: 10,
                user_data_count: 5,
                total_data_count: 15,
                final_accuracy: 0.8,
                training_time_minutes: 1.5,
                model_path: "models/s1.tar.gz".to_string(),
            })
            .unwrap();
        assert!(id > 0);

        let metrics = vec![
            ("final_accuracy".to_string(), MetricValue::Overall(0.8)),
            (
                "class_accuracy".to_string(),
                MetricValue::PerClass(vec![
                    ("Chair".to_string(), 1.0),
                    ("TV".to_string(), 0.5),
                ]),
            ),
        ];
        assert_eq!(db.log_metrics(id, &metrics).unwrap(), 3);

        let rows = db.get_session_metrics(id).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows
            .iter()
            .any(|m| m.class_name.as_deref() == Some("TV") && m.metric_value == 0.5));
    }

    #[test]
    fn metrics_require_existing_session() {
        let (_dir, db) = temp_db();
        let metrics = vec![("final_accuracy".to_string(), MetricValue::Overall(0.8))];
        assert!(db.log_metrics(42, &metrics).is_err());
    }
}
