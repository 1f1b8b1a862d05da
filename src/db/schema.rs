use rusqlite::Connection;

use super::StoreError;

pub(super) fn apply_schema(connection: &Connection) -> Result<(), StoreError> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS training_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            image_path TEXT NOT NULL,
            class_name TEXT NOT NULL,
            class_id INTEGER NOT NULL,
            dataset_type TEXT NOT NULL DEFAULT 'original',
            provenance TEXT NOT NULL DEFAULT 'original',
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
         );
         CREATE INDEX IF NOT EXISTS idx_training_data_type
            ON training_data (dataset_type);
         CREATE TABLE IF NOT EXISTS user_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            image_path TEXT NOT NULL,
            class_name TEXT NOT NULL,
            class_id INTEGER NOT NULL,
            uploaded_by TEXT NOT NULL DEFAULT 'user',
            provenance TEXT NOT NULL DEFAULT 'user',
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
         );
         CREATE TABLE IF NOT EXISTS predictions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            image_path TEXT NOT NULL,
            true_class TEXT,
            predicted_class TEXT NOT NULL,
            confidence REAL NOT NULL,
            model_version TEXT NOT NULL DEFAULT 'v1.0',
            prediction_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP
         );
         CREATE TABLE IF NOT EXISTS retraining_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_name TEXT NOT NULL,
            original_data_count INTEGER NOT NULL,
            user_data_count INTEGER NOT NULL,
            total_data_count INTEGER NOT NULL,
            final_accuracy REAL NOT NULL,
            training_time_minutes REAL NOT NULL,
            model_path TEXT NOT NULL,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
         );
         CREATE TABLE IF NOT EXISTS model_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES retraining_sessions(id),
            metric_name TEXT NOT NULL,
            metric_value REAL NOT NULL,
            class_name TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_model_metrics_session
            ON model_metrics (session_id);",
    )?;
    Ok(())
}
