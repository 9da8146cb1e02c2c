use clap::ValueEnum;
use cli::Cli;
use detector::OnnxConfig;
use ocr::OcrConfig;
use serde::Deserialize;
use server::run_server;
use startup_coordinator::spawn_detector_initialization;
use std::{future::Future, path::PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};

pub mod api;
pub mod cli;
pub mod detector;
pub mod download_models;
pub mod image;
pub mod ocr;
pub mod plate;
pub mod preprocess;
pub mod server;
pub mod startup_coordinator;
pub mod system_info;
pub mod worker;

pub static PLATE_MODEL_FILE_NAME: &str = "plate-yolov9-s.onnx";
pub static PLATE_CLASSES_STR: &str = include_str!("../assets/plate_classes.yaml");

#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
struct PlateClasses {
    NAMES: Vec<String>,
}

/// Type alias for the service result carrying the optional worker thread handle
pub type ServiceResult = anyhow::Result<Option<std::thread::JoinHandle<()>>>;

pub fn plate_vision_service(
    args: Cli,
) -> anyhow::Result<(impl Future<Output = ServiceResult>, CancellationToken)> {
    // Make sure there is a model to load before the worker thread starts;
    // the bundled one is downloaded next to the executable when absent.
    let (model, object_classes) = match args.model.clone() {
        Some(model) => (Some(model), args.object_classes.clone()),
        None => {
            let (model_path, yaml_path) = ensure_model_files(None)?;
            (
                Some(model_path),
                args.object_classes.clone().or(Some(yaml_path)),
            )
        }
    };

    let detector_config = detector::DetectorConfig {
        onnx_config: OnnxConfig {
            force_cpu: args.force_cpu,
            gpu_index: args.gpu_index,
            intra_threads: args.intra_threads,
            inter_threads: args.inter_threads,
            model,
        },
        object_classes,
        object_filter: args.object_filter.clone(),
        confidence_threshold: args.confidence_threshold,
        save_image_path: args.save_image_path.clone(),
        save_ref_image: args.save_ref_image,
        timeout: args.request_timeout(),
        model_kind: args.model_kind.clone(),
    };

    let ocr_config = OcrConfig {
        language: args.ocr_language.clone(),
        datapath: args.tessdata_path.clone(),
        timeout: args.ocr_timeout(),
    };

    // Log available GPU information
    log_available_gpus();

    // Start the detector initialization in the background
    let detector_init_receiver =
        spawn_detector_initialization(detector_config, ocr_config, args.worker_queue_size);

    // Create placeholder metrics (will be updated when detector is ready)
    let metrics = server::Metrics::new(
        "Initializing...".to_string(),
        "Initializing...".to_string(),
        args.log_path,
    );

    let cancel_token = CancellationToken::new();
    let server_future = run_server(
        args.port,
        cancel_token.clone(),
        detector_init_receiver,
        metrics,
    );

    Ok((server_future, cancel_token))
}

pub fn get_object_classes(yaml_file: Option<PathBuf>) -> anyhow::Result<Vec<String>> {
    let yaml_data = match yaml_file {
        Some(yaml_file) => std::fs::read_to_string(yaml_file)?,
        None => PLATE_CLASSES_STR.to_string(),
    };
    Ok(serde_yaml::from_str::<PlateClasses>(yaml_data.as_str())?.NAMES)
}

pub fn direct_ml_available() -> bool {
    #[cfg(not(windows))]
    {
        false
    }
    #[cfg(windows)]
    {
        let Ok(exe_path) = std::env::current_exe() else {
            return false;
        };
        let Some(exe_dir) = exe_path.parent() else {
            return false;
        };
        exe_dir.join("DirectML.dll").exists()
    }
}

/// Log information about available GPU devices
pub fn log_available_gpus() {
    #[cfg(windows)]
    if direct_ml_available() {
        info!("DirectML is available for GPU inference");
    } else {
        info!("DirectML is not available - only CPU inference will be supported");
    }

    #[cfg(not(windows))]
    info!("GPU acceleration not available on this platform - only CPU inference will be supported");

    // Log available GPU devices
    match system_info::gpu_info(true) {
        Ok(_) => {
            // gpu_info already logs the available GPUs when log_info is true
        }
        Err(e) => {
            tracing::warn!("Failed to enumerate GPU devices: {}", e);
        }
    }
}

pub fn init_logging(
    log_level: LogLevel,
    log_path: &mut Option<PathBuf>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(log_level)));

    let guard = if let Some(path) = log_path.clone() {
        let log_directory = if path.starts_with(".") {
            let stripped = path.strip_prefix(".").unwrap_or(&path).to_path_buf();
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|p| p.join(stripped.clone())))
                .unwrap_or(stripped)
        } else {
            path
        };

        *log_path = Some(log_directory.clone());

        let log_file = log_directory.join("plate_vision.log");
        println!("Starting Plate Vision, logging into: {}", log_file.display());

        let file_appender = tracing_appender::rolling::daily(&log_directory, "plate_vision.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .try_init()
            .map_err(|_| anyhow::anyhow!("Logging already initialized"))?;

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|_| anyhow::anyhow!("Logging already initialized"))?;

        None
    };

    info!(?log_level, "Logging initialized");
    Ok(guard)
}

fn level_to_filter_string(log_level: LogLevel) -> String {
    match log_level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
    .to_string()
}

#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    ValueEnum,
    Debug,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Ensures model and yaml files exist, downloading them if needed
/// Returns the paths to the model and yaml files
pub fn ensure_model_files(model_name: Option<String>) -> anyhow::Result<(PathBuf, PathBuf)> {
    // Use default model if none provided
    let model_filename = model_name.unwrap_or_else(|| PLATE_MODEL_FILE_NAME.to_string());

    // Get the directory where models are stored (next to the executable)
    let exe_path = std::env::current_exe()?;
    let models_dir = exe_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Failed to get parent directory of executable"))?;

    let model_path = models_dir.join(&model_filename);
    let yaml_filename = model_filename.replace(".onnx", ".yaml");
    let yaml_path = models_dir.join(&yaml_filename);

    // Check if model exists, download if not
    if !model_path.exists() {
        info!("Model {} not found, downloading...", model_filename);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(async {
            download_models::download_file_to_dir(&model_filename, models_dir).await
        })?;
    }

    // Verify model file exists after download
    if !model_path.exists() {
        return Err(anyhow::anyhow!(
            "Model file {} is required but could not be found or downloaded",
            model_filename
        ));
    }

    // Check if yaml exists, download if not (MANDATORY)
    if !yaml_path.exists() {
        info!("Yaml file {} not found, downloading...", yaml_filename);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(async {
            download_models::download_file_to_dir(&yaml_filename, models_dir).await
        })?;
    }

    // Verify yaml file exists after download
    if !yaml_path.exists() {
        return Err(anyhow::anyhow!(
            "YAML file {} is required but could not be found or downloaded",
            yaml_filename
        ));
    }

    info!(
        "Model and YAML files ready: {} and {}",
        model_path.display(),
        yaml_path.display()
    );
    Ok((model_path, yaml_path))
}
