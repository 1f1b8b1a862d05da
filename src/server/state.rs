//! HTTPサーバーの共有状態

use std::sync::Arc;
use std::time::Instant;

use crate::db::FurnitureDb;
use crate::predictor::PredictorHandle;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub db: FurnitureDb,
    pub predictor: PredictorHandle,
    started_at: Instant,
}

impl AppState {
    pub fn new(db: FurnitureDb, predictor: PredictorHandle) -> Self {
        Self {
            db,
            predictor,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
