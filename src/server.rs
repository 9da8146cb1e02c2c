use crate::{
    api::{ErrorResponse, PlateJobResponse, PlateRequest, PlateResponse},
    plate::{PLATE_NOT_FOUND, PlateReading},
    startup_coordinator::{DetectorInfo, InitResult},
};
use askama::Template;
use axum::{
    Json, Router,
    body::{self, Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, State},
    http::{Request, StatusCode, header::CACHE_CONTROL},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use crossbeam::channel::Sender;
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};
use tokio::{
    sync::{Mutex, oneshot},
    time::{Duration, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MEGABYTE: usize = 1024 * 1024; // 1 MB = 1024 * 1024 bytes
const THIRTY_MEGABYTES: usize = 30 * MEGABYTE; // 30 MB in bytes

/// Round-trip bound for one request, queue wait included.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

enum DetectorReady {
    NotReady,
    Ready {
        sender: Sender<(
            PlateRequest,
            oneshot::Sender<PlateJobResponse>,
            Instant,
        )>,
        #[allow(dead_code)]
        detector_info: DetectorInfo,
        worker_thread_handle: Option<std::thread::JoinHandle<()>>,
    },
    Failed(String),
}

struct ServerState {
    detector_ready: Mutex<DetectorReady>,
    metrics: Mutex<Metrics>,
}

pub async fn run_server(
    port: u16,
    cancellation_token: CancellationToken,
    detector_init_receiver: tokio::sync::oneshot::Receiver<InitResult>,
    metrics: Metrics,
) -> anyhow::Result<Option<std::thread::JoinHandle<()>>> {
    let server_state = Arc::new(ServerState {
        detector_ready: Mutex::new(DetectorReady::NotReady),
        metrics: Mutex::new(metrics),
    });

    // Spawn a task to wait for detector initialization and update the server state
    let state_clone = server_state.clone();
    tokio::spawn(async move {
        match detector_init_receiver.await {
            Ok(InitResult::Success {
                sender,
                detector_info,
                worker_thread_handle,
            }) => {
                info!(
                    model_name = %detector_info.model_name,
                    execution_provider = ?detector_info.execution_provider,
                    "Detector ready - server can now handle requests"
                );

                // Update metrics with real detector info
                {
                    let mut metrics = state_clone.metrics.lock().await;
                    metrics.update_detector_info(&detector_info);
                }

                // Update detector ready state
                {
                    let mut detector_ready = state_clone.detector_ready.lock().await;
                    *detector_ready = DetectorReady::Ready {
                        sender,
                        detector_info,
                        worker_thread_handle: Some(worker_thread_handle),
                    };
                }
            }
            Ok(InitResult::Failed(error)) => {
                error!(error = %error, "Detector initialization failed");
                let mut detector_ready = state_clone.detector_ready.lock().await;
                *detector_ready = DetectorReady::Failed(error);
            }
            Err(_) => {
                error!("Detector initialization channel was dropped");
                let mut detector_ready = state_clone.detector_ready.lock().await;
                *detector_ready =
                    DetectorReady::Failed("Initialization channel dropped".to_string());
            }
        }
    });

    let plate_vision = Router::new()
        .route("/", get(welcome_handler))
        .route("/ocr", post(ocr_base64_handler))
        .route("/ocr-file", post(ocr_file_handler))
        .route("/stats", get(stats_handler))
        .fallback(fallback_handler)
        .with_state(server_state.clone())
        .layer(DefaultBodyLimit::max(THIRTY_MEGABYTES));

    let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port);
    info!("Starting server, listening on {}", addr);
    info!("Welcome page, http://127.0.0.1:{}", port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            error!(
                "Looks like {port} is already in use by another application, please turn off the other application or pick another port with --port"
            );
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    axum::serve(listener, plate_vision.into_make_service())
        .with_graceful_shutdown(async move {
            cancellation_token.cancelled().await;
        })
        .await?;

    // Hand the worker thread handle back for clean shutdown
    let worker_handle = server_state.take_worker_thread_handle().await;
    Ok(worker_handle)
}

/// `POST /ocr`: JSON body with a base64 encoded image.
async fn ocr_base64_handler(
    State(server_state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Json<PlateResponse>, PlateVisionError> {
    let request_start_time = Instant::now();

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return Err(PlateVisionError::bad_request("Image data missing"));
    };
    let Some(encoded) = payload.get("image").and_then(|value| value.as_str()) else {
        return Err(PlateVisionError::bad_request("Image data missing"));
    };

    let image_data = Bytes::from(general_purpose::STANDARD.decode(encoded)?);
    let job = dispatch_plate_job(
        &server_state,
        image_data,
        "image.jpg".to_string(),
        request_start_time,
    )
    .await?;
    finish_job(&server_state, job, request_start_time).await
}

/// `POST /ocr-file`: multipart upload with the image in the `image` field.
async fn ocr_file_handler(
    State(server_state): State<Arc<ServerState>>,
    mut multipart: Multipart,
) -> Result<Json<PlateResponse>, PlateVisionError> {
    let request_start_time = Instant::now();

    let mut image_data: Option<Bytes> = None;
    let mut image_name = "image.jpg".to_string();
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("image") {
            if let Some(file_name) = field.file_name().map(|s| s.to_string()) {
                image_name = file_name;
            }
            image_data = Some(field.bytes().await?);
        }
    }

    let Some(image_data) = image_data else {
        return Err(PlateVisionError::bad_request("Image file missing"));
    };

    let job = dispatch_plate_job(&server_state, image_data, image_name, request_start_time).await?;
    finish_job(&server_state, job, request_start_time).await
}

/// Hand one decoded request to the plate worker and wait for its answer.
/// Shared by both endpoints; the handlers only decode and shape.
async fn dispatch_plate_job(
    server_state: &Arc<ServerState>,
    image_data: Bytes,
    image_name: String,
    request_start_time: Instant,
) -> Result<PlateJobResponse, PlateVisionError> {
    let plate_request = PlateRequest {
        image_data,
        image_name,
    };

    let detector_ready = server_state.detector_ready.lock().await;
    match &*detector_ready {
        DetectorReady::NotReady => Err(PlateVisionError::internal(
            "Server not ready yet, detector is still initializing".to_string(),
        )),
        DetectorReady::Failed(error_msg) => Err(PlateVisionError::internal(format!(
            "Detector initialization failed: {error_msg}"
        ))),
        DetectorReady::Ready { sender, .. } => {
            let (response_sender, receiver) = tokio::sync::oneshot::channel();

            if sender.is_full() {
                warn!("Worker queue is full, server is overloaded, rejecting request");
                drop(detector_ready); // Release the lock
                update_dropped_requests(server_state).await;
                return Err(PlateVisionError::internal("Worker queue is full".into()));
            }

            if let Err(err) = sender.send((plate_request, response_sender, request_start_time)) {
                warn!(?err, "Failed to send request to plate worker");
                drop(detector_ready); // Release the lock
                update_dropped_requests(server_state).await;
                return Err(PlateVisionError::internal("Worker queue is full".into()));
            }

            drop(detector_ready); // Release the lock before waiting
            match timeout(RESPONSE_TIMEOUT, receiver).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(err)) => {
                    warn!("Failed to receive plate recognition response: {:?}", err);
                    update_dropped_requests(server_state).await;
                    Err(PlateVisionError::from(err))
                }
                Err(_) => {
                    warn!("Timeout while waiting for plate recognition response");
                    update_dropped_requests(server_state).await;
                    Err(PlateVisionError::internal("Operation timed out".into()))
                }
            }
        }
    }
}

/// Account for a finished job and turn it into the wire response.
async fn finish_job(
    server_state: &Arc<ServerState>,
    job: PlateJobResponse,
    request_start_time: Instant,
) -> Result<Json<PlateResponse>, PlateVisionError> {
    let round_trip_ms = request_start_time.elapsed().as_millis() as i32;
    let (inference_ms, process_ms) = (job.inference_ms, job.process_ms);

    if let Some(error) = job.error {
        return Err(PlateVisionError::internal(error));
    }
    let reading = job.reading.unwrap_or_else(PlateReading::not_found);

    {
        let mut metrics = server_state.metrics.lock().await;
        metrics.update_metrics(
            inference_ms,
            process_ms,
            round_trip_ms,
            reading.plate != PLATE_NOT_FOUND,
        );
    }

    Ok(Json(PlateResponse::from(reading)))
}

#[derive(Template)]
#[template(path = "welcome.html")]
struct WelcomeTemplate {
    metrics: Metrics,
}

async fn welcome_handler(State(server_state): State<Arc<ServerState>>) -> impl IntoResponse {
    let metrics = {
        let metrics_guard = server_state.metrics.lock().await;
        metrics_guard.clone()
    };
    let template = WelcomeTemplate { metrics };
    render_template(template)
}

#[derive(Template)]
#[template(path = "stats.html")]
struct StatsTemplate {
    metrics: Metrics,
}

async fn stats_handler(State(server_state): State<Arc<ServerState>>) -> impl IntoResponse {
    let metrics = {
        let metrics_guard = server_state.metrics.lock().await;
        metrics_guard.clone()
    };
    let template = StatsTemplate { metrics };
    render_template(template)
}

fn render_template(template: impl Template) -> Response {
    match template.render() {
        Ok(body) => (
            [
                (CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
                (axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8"),
            ],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Template error: {e}"),
        )
            .into_response(),
    }
}

async fn fallback_handler(req: Request<Body>) -> impl IntoResponse {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    let body_bytes = body::to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap_or_else(|_| body::Bytes::new());

    debug!(
        "Unimplemented endpoint called: Method: {}, URI: {}, Headers: {:?}, Body: {:?}",
        method, uri, headers, body_bytes
    );

    (StatusCode::NOT_FOUND, "Endpoint not implemented")
}

#[derive(Debug, Clone)]
pub struct Metrics {
    version: String,
    log_path: String,
    start_time: Instant,
    started_at: String,
    model_name: String,
    execution_provider_name: String,
    number_of_requests: u128,
    dropped_requests: u128,
    plates_found: u128,
    plates_not_found: u128,
    total_inference_ms: u128,
    min_inference_ms: i32,
    max_inference_ms: i32,
    total_processing_ms: u128,
    min_processing_ms: i32,
    max_processing_ms: i32,
    total_round_trip_ms: u128,
    min_round_trip_ms: i32,
    max_round_trip_ms: i32,
}

impl Metrics {
    pub fn new(model_name: String, execution_provider: String, log_path: Option<PathBuf>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            log_path: log_path
                .unwrap_or_else(|| PathBuf::from("stdout"))
                .to_string_lossy()
                .to_string(),
            start_time: Instant::now(),
            started_at: Utc::now().to_rfc3339(),
            model_name,
            execution_provider_name: execution_provider,
            number_of_requests: 0,
            dropped_requests: 0,
            plates_found: 0,
            plates_not_found: 0,
            total_inference_ms: 0,
            min_inference_ms: 0,
            max_inference_ms: 0,
            total_processing_ms: 0,
            min_processing_ms: 0,
            max_processing_ms: 0,
            total_round_trip_ms: 0,
            min_round_trip_ms: 0,
            max_round_trip_ms: 0,
        }
    }

    fn uptime(&self) -> String {
        let elapsed = self.start_time.elapsed();
        let days = elapsed.as_secs() / 86400;
        let hours = (elapsed.as_secs() % 86400) / 3600;
        let minutes = (elapsed.as_secs() % 3600) / 60;
        format!("{days} days, {hours} hours and {minutes} minutes")
    }

    fn update_metrics(
        &mut self,
        inference_ms: i32,
        process_ms: i32,
        round_trip_ms: i32,
        plate_found: bool,
    ) {
        let first = self.number_of_requests == 0;
        self.number_of_requests = self.number_of_requests.wrapping_add(1);
        if plate_found {
            self.plates_found = self.plates_found.wrapping_add(1);
        } else {
            self.plates_not_found = self.plates_not_found.wrapping_add(1);
        }

        self.total_inference_ms = self.total_inference_ms.wrapping_add(inference_ms as u128);
        self.total_processing_ms = self.total_processing_ms.wrapping_add(process_ms as u128);
        self.total_round_trip_ms = self.total_round_trip_ms.wrapping_add(round_trip_ms as u128);
        update_range(
            &mut self.min_inference_ms,
            &mut self.max_inference_ms,
            inference_ms,
            first,
        );
        update_range(
            &mut self.min_processing_ms,
            &mut self.max_processing_ms,
            process_ms,
            first,
        );
        update_range(
            &mut self.min_round_trip_ms,
            &mut self.max_round_trip_ms,
            round_trip_ms,
            first,
        );
    }

    fn update_dropped_requests(&mut self) {
        self.dropped_requests = self.dropped_requests.wrapping_add(1);
    }

    fn avg_ms(&self, total_ms: u128) -> i32 {
        if self.number_of_requests == 0 {
            0
        } else {
            (total_ms as f64 / self.number_of_requests as f64).round() as i32
        }
    }

    fn avg_inference_ms(&self) -> i32 {
        self.avg_ms(self.total_inference_ms)
    }

    fn avg_processing_ms(&self) -> i32 {
        self.avg_ms(self.total_processing_ms)
    }

    fn avg_round_trip_ms(&self) -> i32 {
        self.avg_ms(self.total_round_trip_ms)
    }

    pub fn update_detector_info(&mut self, detector_info: &DetectorInfo) {
        self.model_name = detector_info.model_name.clone();
        self.execution_provider_name = detector_info.execution_provider.to_string();
    }
}

fn update_range(min: &mut i32, max: &mut i32, value: i32, first: bool) {
    if first {
        *min = value;
        *max = value;
    } else {
        *min = (*min).min(value);
        *max = (*max).max(value);
    }
}

impl ServerState {
    /// Extract the worker thread handle for clean shutdown
    /// Returns the handle if the detector is ready, None otherwise
    pub async fn take_worker_thread_handle(&self) -> Option<std::thread::JoinHandle<()>> {
        let mut detector_ready = self.detector_ready.lock().await;
        match &mut *detector_ready {
            DetectorReady::Ready {
                worker_thread_handle,
                ..
            } => worker_thread_handle.take(),
            _ => None,
        }
    }
}

async fn update_dropped_requests(server_state: &Arc<ServerState>) {
    warn!(
        "If you see this message spamming you should reduce the number of requests or upgrade your service to be faster."
    );
    let mut metrics = server_state.metrics.lock().await;
    metrics.update_dropped_requests();
}

pub struct PlateVisionError {
    status: StatusCode,
    error: anyhow::Error,
}

impl PlateVisionError {
    fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: anyhow::anyhow!("{message}"),
        }
    }

    fn internal(message: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: anyhow::anyhow!("{message}"),
        }
    }
}

impl IntoResponse for PlateVisionError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.error.to_string(),
            }),
        )
            .into_response()
    }
}

impl<E> From<E> for PlateVisionError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_metrics() -> Metrics {
        Metrics::new("plate-yolov9-s.onnx".to_string(), "CPU".to_string(), None)
    }

    #[test]
    fn test_metrics_averages_with_no_requests() {
        let metrics = test_metrics();
        assert_eq!(metrics.avg_inference_ms(), 0);
        assert_eq!(metrics.avg_processing_ms(), 0);
        assert_eq!(metrics.avg_round_trip_ms(), 0);
    }

    #[test]
    fn test_metrics_tracks_ranges_and_counts() {
        let mut metrics = test_metrics();
        metrics.update_metrics(10, 100, 120, true);
        metrics.update_metrics(30, 50, 60, false);
        assert_eq!(metrics.number_of_requests, 2);
        assert_eq!(metrics.plates_found, 1);
        assert_eq!(metrics.plates_not_found, 1);
        assert_eq!(metrics.min_inference_ms, 10);
        assert_eq!(metrics.max_inference_ms, 30);
        assert_eq!(metrics.avg_inference_ms(), 20);
        assert_eq!(metrics.min_processing_ms, 50);
        assert_eq!(metrics.max_round_trip_ms, 120);
    }

    #[test]
    fn test_metrics_dropped_requests() {
        let mut metrics = test_metrics();
        metrics.update_dropped_requests();
        metrics.update_dropped_requests();
        assert_eq!(metrics.dropped_requests, 2);
        assert_eq!(metrics.number_of_requests, 0);
    }

    #[tokio::test]
    async fn test_missing_image_key_is_bad_request() {
        let state = Arc::new(ServerState {
            detector_ready: Mutex::new(DetectorReady::NotReady),
            metrics: Mutex::new(test_metrics()),
        });

        let err = ocr_base64_handler(State(state.clone()), Bytes::from_static(b"{}"))
            .await
            .expect_err("missing image key must be rejected");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.error.to_string(), "Image data missing");

        let err = ocr_base64_handler(State(state), Bytes::from_static(b"not json"))
            .await
            .expect_err("invalid body must be rejected");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.error.to_string(), "Image data missing");
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            PlateVisionError::bad_request("Image data missing").status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PlateVisionError::internal("boom".to_string()).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let from_anyhow = PlateVisionError::from(anyhow::anyhow!("decode failed"));
        assert_eq!(from_anyhow.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
