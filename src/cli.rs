use crate::{LogLevel, detector::PlateModelKind};
use clap::Parser;
use std::{path::PathBuf, time::Duration};
use tracing::info;

#[derive(Parser, Clone)]
#[command(author = "Plate Vision Team", version = env!("CARGO_PKG_VERSION"), about = "License plate recognition service")]
pub struct Cli {
    /// The port on which the server will listen for HTTP requests.
    /// Default is 5000. Example usage: --port 1337
    #[arg(long, default_value_t = 5000)]
    pub port: u16,
    /// Path to the ONNX plate detection model file.
    /// If not given the bundled plate model is used (downloaded on first
    /// start when missing).
    #[clap(long)]
    pub model: Option<PathBuf>,
    /// Output decoding flavor of the detection model
    #[clap(long, value_enum, default_value_t = PlateModelKind::Yolo)]
    pub model_kind: PlateModelKind,
    /// Path to the object classes yaml file
    /// Default: plate_classes.yaml with the single license_plate class
    #[clap(long)]
    pub object_classes: Option<PathBuf>,
    /// Filters the results to include only the specified labels. Provide labels separated by ','.
    /// Example: --object_filter "license_plate"
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub object_filter: Vec<String>,
    /// Sets the level of logging
    #[clap(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
    /// If log_path is set, then stdout logging will be disabled and it will log to file
    #[clap(long)]
    pub log_path: Option<PathBuf>,
    /// Confidence threshold for plate detection
    #[clap(long, default_value_t = 0.7)]
    pub confidence_threshold: f32,
    /// Tesseract language to recognize plates with
    #[clap(long, default_value = "eng")]
    pub ocr_language: String,
    /// Path to the Tesseract data directory (TESSDATA_PREFIX is used when
    /// not given)
    #[clap(long)]
    pub tessdata_path: Option<PathBuf>,
    /// Hard bound in seconds on a single OCR call
    #[clap(long, default_value_t = 2)]
    pub ocr_timeout: u64,
    /// Requests that wait longer than this many seconds in the worker
    /// queue are dropped
    #[clap(long, default_value_t = 15)]
    pub request_timeout: u64,
    /// Number of requests the worker queue holds before rejecting new ones
    #[clap(long)]
    pub worker_queue_size: Option<usize>,
    /// Force using CPU for inference
    #[clap(long, default_value_t = false)]
    pub force_cpu: bool,
    /// Intra thread parallelism max is cpu cores - 1
    #[clap(long, default_value_t = 192)]
    pub intra_threads: usize,
    /// Inter thread parallelism max is cpu cores - 1
    #[clap(long, default_value_t = 192)]
    pub inter_threads: usize,
    /// Optional path to save the processed images
    #[clap(long)]
    pub save_image_path: Option<PathBuf>,
    /// Save the reference image (only if save_image_path is provided)
    #[clap(long, default_value_t = false)]
    pub save_ref_image: bool,
    /// GPU Index, best effort to select the correct one if multiple GPUs exist.
    /// Default is 0. The list and actual GPU index might differ.
    /// If the wrong GPU is selected, try changing this value.
    /// Verify through GPU usage to ensure the correct GPU is selected.
    #[clap(long, default_value_t = 0)]
    pub gpu_index: i32,
    /// List the models available for download and exit
    #[clap(long, default_value_t = false)]
    pub list_models: bool,
    /// Path to download all models to
    /// This command will only download the models to the specified path
    /// and then exit
    #[clap(long)]
    pub download_model_path: Option<PathBuf>,
}

impl Cli {
    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn print_config(&self) {
        info!(
            port = self.port,
            model = ?self.model,
            model_kind = %self.model_kind,
            confidence_threshold = self.confidence_threshold,
            ocr_language = %self.ocr_language,
            ocr_timeout_s = self.ocr_timeout,
            request_timeout_s = self.request_timeout,
            force_cpu = self.force_cpu,
            "Configuration"
        );
    }
}
