pub mod augmentation;
pub mod backend;
pub mod dataset;
pub mod inference;
pub mod ml_model;
pub mod schedule;
pub mod training;

pub use inference::{export_backbone_weights, EngineOptions, InferenceEngine};
pub use ml_model::{FurnitureClassifier, ModelConfig};
pub use training::{Trainer, TrainerSettings};
