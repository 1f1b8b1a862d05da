pub mod config;
pub mod label_encoder;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, ConfigSource, DeviceType, ModelSettings, TrainingSettings};
pub use label_encoder::{LabelEncoder, LabelSource};
pub use model_metadata::{BackboneKind, ModelMetadata};
pub use model_storage::{
    archive_path, ArtifactFormat, label_encoder_path_for, load_model_with_metadata, log_metadata_info,
    save_model_with_metadata,
};
