//! 家具画像分類器のコマンドラインツール

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};

use furniture_classifier_lib::dataset_import::{load_manifest, scan_dataset_dir};
use furniture_classifier_lib::ml::{export_backbone_weights, Trainer, TrainerSettings};
use furniture_classifier_lib::model::ConfigSource;
use furniture_classifier_lib::predictor::{Predictor, PredictorHandle, PredictorOptions};
use furniture_classifier_lib::retrain::{active_model_path, RetrainRequest, Retrainer, UploadedImage};
use furniture_classifier_lib::server::{self, AppState};
use furniture_classifier_lib::{logging, AppConfig, FurnitureClass, FurnitureDb, CLASS_NAMES};

/// Furniture image classifier
#[derive(Parser, Debug)]
#[command(name = "furniture_classifier")]
#[command(version)]
#[command(about = "Classify furniture images and retrain the model with uploaded examples")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, global = true, env = "FURNITURE_CONFIG", default_value_os_t = AppConfig::default_path())]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP prediction API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Replace the original dataset in the database
    #[command(group(ArgGroup::new("source").required(true).args(["manifest", "dir"])))]
    Populate {
        /// CSV with image_path,class_name,dataset_type columns
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Directory laid out as <split>/<Class>/ or <Class>/
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Classify one or more images
    Predict {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Known class of the images, stored with the prediction log
        #[arg(long)]
        true_class: Option<FurnitureClass>,
    },
    /// Add labelled images and retrain the model
    Retrain {
        /// Session name, also used as the model file name
        #[arg(long)]
        session: String,
        /// Labelled upload as <path>=<Class>; repeat for each image
        #[arg(long = "image", value_parser = parse_upload, required = true)]
        images: Vec<UploadedImage>,
        #[arg(long)]
        epochs: Option<usize>,
        /// Remove previously uploaded user data first
        #[arg(long)]
        clear_user_data: bool,
    },
    /// Show training data and prediction statistics
    Stats,
    /// List retraining sessions with their metrics
    Sessions,
    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Save the backbone of a trained model as pretrained weights
    ExportBackbone {
        /// Trained model archive (defaults to the active model)
        #[arg(long)]
        model: Option<PathBuf>,
    },
}

fn parse_upload(value: &str) -> Result<UploadedImage, String> {
    let (path, class) = value
        .rsplit_once('=')
        .ok_or_else(|| format!("expected <path>=<Class>, got {value:?}"))?;
    let class = class.parse::<FurnitureClass>()?;
    Ok(UploadedImage {
        source: PathBuf::from(path),
        class,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, source) = AppConfig::load_or_default(&cli.config);
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Logging disabled: {e}");
    }
    match &source {
        ConfigSource::File(path) => tracing::info!("Loaded configuration from {}", path.display()),
        ConfigSource::Default => tracing::info!("No configuration file at {}, using defaults", cli.config.display()),
        ConfigSource::Invalid(path, e) => {
            tracing::warn!("Ignoring invalid configuration {}: {e}; using defaults", path.display())
        }
    }

    match cli.command {
        Command::Serve { host, port } => run_serve(&config, host, port),
        Command::Populate { manifest, dir } => run_populate(&config, manifest, dir),
        Command::Predict { images, true_class } => run_predict(&config, &images, true_class),
        Command::Retrain {
            session,
            images,
            epochs,
            clear_user_data,
        } => run_retrain(&config, session, images, epochs, clear_user_data),
        Command::Stats => run_stats(&config),
        Command::Sessions => run_sessions(&config),
        Command::InitConfig { force } => run_init_config(&config, &cli.config, force),
        Command::ExportBackbone { model } => run_export_backbone(&config, model),
    }
}

fn open_db(config: &AppConfig) -> Result<FurnitureDb> {
    FurnitureDb::open(&config.database.path)
        .context(format!("Failed to open database {}", config.database.path.display()))
}

fn predictor_for(config: &AppConfig, db: &FurnitureDb) -> Predictor {
    let model_path = active_model_path(db, &config.model.active_model_path);
    Predictor::new(model_path, PredictorOptions::from_config(config))
}

fn run_serve(config: &AppConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    config.log_summary();
    let db = open_db(config)?;
    let mut predictor = predictor_for(config, &db);
    if !predictor.load_model() {
        tracing::warn!("Serving without a model; /predict returns 503 until a model is trained");
    }

    let state = Arc::new(AppState::new(db, PredictorHandle::new(predictor)));
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(server::serve(state, &host, port))
}

fn run_populate(config: &AppConfig, manifest: Option<PathBuf>, dir: Option<PathBuf>) -> Result<()> {
    let samples = match (manifest, dir) {
        (Some(manifest), _) => load_manifest(&manifest)?,
        (None, Some(dir)) => scan_dataset_dir(&dir)?,
        (None, None) => anyhow::bail!("either --manifest or --dir is required"),
    };
    let db = open_db(config)?;
    let class_names: Vec<String> = CLASS_NAMES.iter().map(|s| s.to_string()).collect();
    let inserted = db.populate_original_data(&samples, &class_names)?;
    println!("Inserted {inserted} original samples into {}", db.path().display());
    Ok(())
}

fn run_predict(config: &AppConfig, images: &[PathBuf], true_class: Option<FurnitureClass>) -> Result<()> {
    let db = open_db(config)?;
    let mut predictor = predictor_for(config, &db);
    if !predictor.load_model() {
        anyhow::bail!("No model available at {}; train a model first", predictor.model_path().display());
    }
    let version = predictor.model_version();

    let mut failed = 0;
    for (path, output) in images.iter().zip(predictor.predict_batch(images)) {
        let Some(output) = output else {
            failed += 1;
            println!("{}: classification unavailable, try another image", path.display());
            continue;
        };
        db.log_prediction(
            &path.to_string_lossy(),
            &output.predicted_class,
            f64::from(output.confidence),
            true_class.map(FurnitureClass::name),
            &version,
        )?;
        println!(
            "{}: {} ({:.1}%)",
            path.display(),
            output.predicted_class,
            output.confidence * 100.0
        );
        println!("{}", serde_json::to_string(&output)?);
    }
    if failed > 0 {
        tracing::warn!("{failed} of {} images could not be classified", images.len());
    }
    Ok(())
}

fn run_retrain(
    config: &AppConfig,
    session: String,
    uploads: Vec<UploadedImage>,
    epochs: Option<usize>,
    clear_user_data: bool,
) -> Result<()> {
    let db = open_db(config)?;
    let trainer = Trainer::new(TrainerSettings::from_config(config))?;
    let predictor = PredictorHandle::new(predictor_for(config, &db));
    let retrainer = Retrainer::new(
        db,
        trainer,
        predictor,
        config.storage.uploads_dir.clone(),
        config.model.models_dir.clone(),
    );

    let request = RetrainRequest {
        session_name: session,
        uploads,
        epochs: epochs.unwrap_or(config.training.num_epochs),
        clear_user_data,
    };
    let outcome = retrainer.start_retraining(&request)?;
    let result = &outcome.result;

    println!("Session #{} '{}' completed", outcome.session_id, request.session_name);
    println!(
        "  accuracy: {:.2}%{}",
        result.final_accuracy * 100.0,
        if result.accuracy_reliable {
            ""
        } else {
            " (insufficient data, not a reliable estimate)"
        }
    );
    println!("  training time: {:.2} min", result.training_time);
    println!(
        "  samples: {} original + {} user = {}",
        result.original_count, result.user_count, result.total_count
    );
    println!("  model: {}", result.model_path.display());
    for (class_name, accuracy) in &result.per_class_accuracy {
        println!("    {class_name}: {:.2}%", accuracy * 100.0);
    }
    if !outcome.predictor_swapped {
        println!("  warning: the new model could not be loaded for prediction");
    }
    Ok(())
}

fn run_stats(config: &AppConfig) -> Result<()> {
    let db = open_db(config)?;
    let training = db.get_training_data_stats()?;
    let predictions = db.get_prediction_stats()?;
    let (ok, message) = db.check_training_data_requirements()?;

    println!("{}", serde_json::to_string_pretty(&training)?);
    println!("{}", serde_json::to_string_pretty(&predictions)?);
    println!("Training requirements: {} ({message})", if ok { "met" } else { "not met" });
    Ok(())
}

fn run_sessions(config: &AppConfig) -> Result<()> {
    let db = open_db(config)?;
    let sessions = db.get_all_training_sessions()?;
    if sessions.is_empty() {
        println!("No retraining sessions yet");
        return Ok(());
    }
    for session in sessions {
        println!(
            "#{} {} [{}] accuracy {:.2}% in {:.2} min ({} original + {} user) -> {}",
            session.id,
            session.session_name,
            session.created_at,
            session.final_accuracy * 100.0,
            session.training_time_minutes,
            session.original_data_count,
            session.user_data_count,
            session.model_path
        );
        for metric in db.get_session_metrics(session.id)? {
            match metric.class_name {
                Some(class_name) => println!("    {} [{class_name}] = {:.4}", metric.metric_name, metric.metric_value),
                None => println!("    {} = {:.4}", metric.metric_name, metric.metric_value),
            }
        }
    }
    Ok(())
}

fn run_init_config(config: &AppConfig, path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
    }
    config.save(path)?;
    println!("Wrote configuration to {}", path.display());
    Ok(())
}

fn run_export_backbone(config: &AppConfig, model: Option<PathBuf>) -> Result<()> {
    let model = match model {
        Some(model) => model,
        None => active_model_path(&open_db(config)?, &config.model.active_model_path),
    };
    let weights = export_backbone_weights(&model, &config.model.backbone_weights_dir)?;
    println!("Saved backbone weights to {}", weights.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_labelled_upload() {
        let upload = parse_upload("photos/a=b.jpg=chair").unwrap();
        assert_eq!(upload.source, PathBuf::from("photos/a=b.jpg"));
        assert_eq!(upload.class, FurnitureClass::Chair);
        assert!(parse_upload("photos/a.jpg").is_err());
        assert!(parse_upload("photos/a.jpg=Sofa").is_err());
    }

    #[test]
    fn config_defaults_to_standard_path() {
        if std::env::var_os("FURNITURE_CONFIG").is_some() {
            return;
        }
        let cli = Cli::try_parse_from(["furniture_classifier", "stats"]).unwrap();
        assert_eq!(cli.config, AppConfig::default_path());
        let cli = Cli::try_parse_from(["furniture_classifier", "stats", "--config", "other.json"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.json"));
    }

    #[test]
    fn populate_requires_a_source() {
        assert!(Cli::try_parse_from(["furniture_classifier", "populate"]).is_err());
        assert!(Cli::try_parse_from(["furniture_classifier", "populate", "--dir", "data"]).is_ok());
    }
}
