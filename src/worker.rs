use crate::{
    api::{PlateJobResponse, PlateRequest},
    detector::{Detector, DetectorConfig},
    image::create_random_jpeg_name,
    ocr::{OcrConfig, TesseractOcr},
    plate::read_plate,
};
use crossbeam::channel::{Receiver, Sender, bounded};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{error, warn};

const DEFAULT_WORKER_QUEUE_SIZE: usize = 8;

type PlateJob = (PlateRequest, oneshot::Sender<PlateJobResponse>, Instant);

/// Owns the detection session and the OCR configuration and processes one
/// request at a time off a bounded queue.
pub struct PlateWorker {
    receiver: Receiver<PlateJob>,
    detector: Detector,
    ocr: TesseractOcr,
    queue_timeout: Duration,
}

impl PlateWorker {
    pub fn new(
        detector_config: DetectorConfig,
        ocr_config: OcrConfig,
        queue_size: Option<usize>,
    ) -> anyhow::Result<(Sender<PlateJob>, Self)> {
        let (sender, receiver) = bounded(queue_size.unwrap_or(DEFAULT_WORKER_QUEUE_SIZE));
        let queue_timeout = detector_config.timeout;
        let detector = Detector::new(detector_config)?;
        let ocr = TesseractOcr::new(ocr_config)?;
        Ok((
            sender,
            PlateWorker {
                receiver,
                detector,
                ocr,
                queue_timeout,
            },
        ))
    }

    pub fn get_detector(&self) -> &Detector {
        &self.detector
    }

    pub fn spawn_worker_thread(mut self) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || self.run())
    }

    pub fn run(&mut self) {
        while let Ok((plate_request, response_sender, request_start_time)) = self.receiver.recv() {
            if request_start_time.elapsed() > self.queue_timeout {
                warn!(
                    queued_for = ?request_start_time.elapsed(),
                    "Dropping request that sat in the queue past the request timeout"
                );
                let _ = response_sender.send(PlateJobResponse {
                    reading: None,
                    error: Some("Request timed out waiting for the detector".to_string()),
                    inference_ms: 0,
                    process_ms: 0,
                });
                continue;
            }

            let response = self.process(plate_request);
            if let Err(err) = response_sender.send(response) {
                error!(?err, "Failed to send response from worker");
            }
        }
    }

    fn process(&mut self, request: PlateRequest) -> PlateJobResponse {
        let PlateRequest {
            image_data,
            image_name,
        } = request;

        let image_name = if image_name == "image.jpg" {
            Some(create_random_jpeg_name())
        } else {
            Some(image_name)
        };

        let process_start_time = Instant::now();
        let detect_result = match self.detector.detect(image_data, image_name) {
            Ok(detect_result) => detect_result,
            Err(err) => {
                error!("Detection failed: {err:#}");
                return PlateJobResponse {
                    reading: None,
                    error: Some(err.to_string()),
                    inference_ms: 0,
                    process_ms: process_start_time.elapsed().as_millis() as i32,
                };
            }
        };

        let reading = read_plate(
            self.detector.decoded_image(),
            &detect_result.predictions,
            &self.ocr,
        );
        let process_ms = process_start_time.elapsed().as_millis() as i32;
        let inference_ms = detect_result.inference_time.as_millis() as i32;

        match reading {
            Ok(reading) => PlateJobResponse {
                reading: Some(reading),
                error: None,
                inference_ms,
                process_ms,
            },
            Err(err) => {
                error!("Plate pipeline failed: {err:#}");
                PlateJobResponse {
                    reading: None,
                    error: Some(err.to_string()),
                    inference_ms,
                    process_ms,
                }
            }
        }
    }
}
