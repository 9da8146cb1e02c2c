use crate::plate::PlateReading;
use axum::body::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// One plate-recognition job as it travels from the HTTP layer to the
/// detector worker.
#[derive(Default)]
pub struct PlateRequest {
    pub image_data: Bytes,
    pub image_name: String,
}

/// What the worker hands back for one job. `error` set means the request
/// failed as a whole (decode, detection or preprocessing failure); a
/// reading with the NOT_FOUND sentinel is a success.
#[derive(Debug, Default)]
pub struct PlateJobResponse {
    pub reading: Option<PlateReading>,
    pub error: Option<String>,
    // The time (ms) spent inside the detection model.
    pub inference_ms: i32,
    // The time (ms) for the whole pipeline: decode, detect, enhance, OCR.
    pub process_ms: i32,
}

/// Wire shape of a successful response on both endpoints.
///
/// `state` always serializes (as `null` when absent); `confidence` is
/// omitted entirely when no plate was found.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PlateResponse {
    pub plate: String,
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl From<PlateReading> for PlateResponse {
    fn from(reading: PlateReading) -> Self {
        Self {
            plate: reading.plate,
            state: reading.state_code,
            confidence: reading.confidence.map(round_confidence),
        }
    }
}

/// Wire shape of every failure response (400 and 500 alike).
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

/// Confidence scores are reported with two decimals.
pub fn round_confidence(confidence: f32) -> f32 {
    (confidence * 100.0).round() / 100.0
}

#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct Prediction {
    pub x_max: usize,
    pub x_min: usize,
    pub y_max: usize,
    pub y_min: usize,
    pub confidence: f32,
    pub label: String,
}

impl Debug for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prediction")
            .field("label", &self.label)
            .field("confidence", &self.confidence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plate::PLATE_NOT_FOUND;

    #[test]
    fn test_round_confidence() {
        assert_eq!(round_confidence(0.876), 0.88);
        assert_eq!(round_confidence(0.9), 0.9);
        assert_eq!(round_confidence(0.954_999), 0.95);
    }

    #[test]
    fn test_not_found_response_shape() {
        let response = PlateResponse::from(PlateReading::not_found());
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"plate": PLATE_NOT_FOUND, "state": null})
        );
    }

    #[test]
    fn test_found_response_shape() {
        let reading = PlateReading {
            plate: "MH12AB1234".to_string(),
            state_code: Some("MH".to_string()),
            confidence: Some(0.876),
        };
        let response = PlateResponse::from(reading);
        assert_eq!(response.confidence, Some(0.88));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["plate"], "MH12AB1234");
        assert_eq!(json["state"], "MH");
        // Rounded, not omitted, on a found plate.
        assert!(json.get("confidence").is_some());
    }
}
