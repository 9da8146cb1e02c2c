use crate::{
    api::Prediction,
    image::{Image, PLATE_CROP_PADDING, crop_padded},
    ocr::TextExtractor,
};
use std::cmp::Ordering;
use tracing::{debug, info};

/// Sentinel plate text returned when every candidate comes up empty.
pub const PLATE_NOT_FOUND: &str = "NOT_FOUND";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlateReading {
    /// Alphanumeric characters of the recognized plate, original order and
    /// case preserved.
    pub plate: String,
    /// Two-character region prefix, when the plate is long enough to carry
    /// one.
    pub state_code: Option<String>,
    /// Confidence of the detection box the text came from.
    pub confidence: Option<f32>,
}

impl PlateReading {
    pub fn not_found() -> Self {
        Self {
            plate: PLATE_NOT_FOUND.to_string(),
            state_code: None,
            confidence: None,
        }
    }
}

/// Walk the detected boxes from highest to lowest confidence and return the
/// first candidate that yields any text.
///
/// Per box: padded crop, enhancement + OCR through the extractor,
/// normalization. An extractor error (enhancement failure) aborts the whole
/// request; a candidate with no text just advances to the next box. With no
/// boxes, or none that read, the NOT_FOUND reading is returned.
pub fn read_plate(
    image: &Image,
    predictions: &[Prediction],
    extractor: &dyn TextExtractor,
) -> anyhow::Result<PlateReading> {
    let mut candidates: Vec<&Prediction> = predictions.iter().collect();
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    for candidate in candidates {
        let crop = crop_padded(image, candidate, PLATE_CROP_PADDING);
        let raw = extractor.extract(&crop)?;
        let plate = normalize_plate_text(&raw);
        if plate.is_empty() {
            debug!(
                confidence = candidate.confidence,
                "Candidate produced no text, trying next box"
            );
            continue;
        }

        let state_code = state_code(&plate);
        info!(
            %plate,
            ?state_code,
            confidence = candidate.confidence,
            "Plate read"
        );
        return Ok(PlateReading {
            plate,
            state_code,
            confidence: Some(candidate.confidence),
        });
    }

    Ok(PlateReading::not_found())
}

/// Strip surrounding whitespace and drop everything that is not
/// alphanumeric (OCR artifacts, separators), preserving order and case.
pub fn normalize_plate_text(raw: &str) -> String {
    raw.trim().chars().filter(|c| c.is_alphanumeric()).collect()
}

/// The first two characters of a plate, read as a region code.
fn state_code(plate: &str) -> Option<String> {
    if plate.chars().count() >= 2 {
        Some(plate.chars().take(2).collect())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use image::RgbImage;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    fn test_image(width: usize, height: usize) -> Image {
        Image {
            name: None,
            width,
            height,
            pixels: vec![128; width * height * 3],
        }
    }

    fn prediction(x_min: usize, y_min: usize, x_max: usize, y_max: usize, conf: f32) -> Prediction {
        Prediction {
            x_min,
            y_min,
            x_max,
            y_max,
            confidence: conf,
            label: "license_plate".to_string(),
        }
    }

    /// Replays a scripted sequence of extraction results and records the
    /// crop dimensions it was handed.
    struct ScriptedExtractor {
        script: RefCell<VecDeque<anyhow::Result<String>>>,
        crops: RefCell<Vec<(u32, u32)>>,
    }

    impl ScriptedExtractor {
        fn new(script: Vec<anyhow::Result<String>>) -> Self {
            Self {
                script: RefCell::new(script.into()),
                crops: RefCell::new(Vec::new()),
            }
        }
    }

    impl TextExtractor for ScriptedExtractor {
        fn extract(&self, plate_crop: &RgbImage) -> anyhow::Result<String> {
            self.crops.borrow_mut().push(plate_crop.dimensions());
            self.script
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    #[test]
    fn test_normalize_strips_separators() {
        assert_eq!(normalize_plate_text("AB-12 CD34"), "AB12CD34");
        assert_eq!(normalize_plate_text("  KA01AB1234\n"), "KA01AB1234");
        assert_eq!(normalize_plate_text("--..  "), "");
    }

    #[test]
    fn test_state_code_needs_two_characters() {
        assert_eq!(state_code("AB12CD34").as_deref(), Some("AB"));
        assert_eq!(state_code("AB").as_deref(), Some("AB"));
        assert_eq!(state_code("A"), None);
        assert_eq!(state_code(""), None);
    }

    #[test]
    fn test_no_boxes_short_circuits_to_not_found() {
        let extractor = ScriptedExtractor::new(vec![]);
        let reading = read_plate(&test_image(100, 80), &[], &extractor).unwrap();
        assert_eq!(reading, PlateReading::not_found());
        assert!(extractor.crops.borrow().is_empty());
    }

    #[test]
    fn test_highest_confidence_box_is_tried_first() {
        let image = test_image(100, 80);
        // Lower-confidence box listed first; boxes have distinct crop sizes
        // so the visit order is observable.
        let predictions = vec![
            prediction(50, 40, 90, 60, 0.9),  // 50x30 padded crop
            prediction(10, 10, 30, 20, 0.95), // 30x20 padded crop
        ];
        let extractor = ScriptedExtractor::new(vec![Ok("KA01AB1234".to_string())]);
        let reading = read_plate(&image, &predictions, &extractor).unwrap();
        assert_eq!(extractor.crops.borrow().as_slice(), &[(30, 20)]);
        assert_eq!(reading.plate, "KA01AB1234");
        assert_eq!(reading.confidence, Some(0.95));
    }

    #[test]
    fn test_empty_candidate_falls_through_to_next_box() {
        let image = test_image(100, 80);
        let predictions = vec![
            prediction(50, 40, 90, 60, 0.9),
            prediction(10, 10, 30, 20, 0.95),
        ];
        // The 0.95 box reads nothing; the 0.9 box wins and its confidence
        // is the one reported.
        let extractor = ScriptedExtractor::new(vec![
            Ok(String::new()),
            Ok("MH12AB1234".to_string()),
        ]);
        let reading = read_plate(&image, &predictions, &extractor).unwrap();
        assert_eq!(
            extractor.crops.borrow().as_slice(),
            &[(30, 20), (50, 30)]
        );
        assert_eq!(reading.plate, "MH12AB1234");
        assert_eq!(reading.state_code.as_deref(), Some("MH"));
        assert_eq!(reading.confidence, Some(0.9));
    }

    #[test]
    fn test_punctuation_only_text_counts_as_empty() {
        let image = test_image(100, 80);
        let predictions = vec![
            prediction(10, 10, 30, 20, 0.95),
            prediction(50, 40, 90, 60, 0.9),
        ];
        let extractor = ScriptedExtractor::new(vec![
            Ok("--- ..".to_string()),
            Ok("DL8CAF5031".to_string()),
        ]);
        let reading = read_plate(&image, &predictions, &extractor).unwrap();
        assert_eq!(reading.plate, "DL8CAF5031");
        assert_eq!(reading.confidence, Some(0.9));
    }

    #[test]
    fn test_all_candidates_empty_yields_not_found() {
        let image = test_image(100, 80);
        let predictions = vec![
            prediction(10, 10, 30, 20, 0.95),
            prediction(50, 40, 90, 60, 0.9),
        ];
        let extractor = ScriptedExtractor::new(vec![Ok(String::new()), Ok(String::new())]);
        let reading = read_plate(&image, &predictions, &extractor).unwrap();
        assert_eq!(reading, PlateReading::not_found());
        assert_eq!(extractor.crops.borrow().len(), 2);
    }

    #[test]
    fn test_extractor_error_fails_the_request() {
        let image = test_image(100, 80);
        let predictions = vec![
            prediction(10, 10, 30, 20, 0.95),
            prediction(50, 40, 90, 60, 0.9),
        ];
        // An enhancement failure on the first candidate aborts the request
        // even though another candidate remains.
        let extractor = ScriptedExtractor::new(vec![
            Err(anyhow!("Degenerate plate crop (0x0)")),
            Ok("MH12AB1234".to_string()),
        ]);
        let result = read_plate(&image, &predictions, &extractor);
        assert!(result.is_err());
        assert_eq!(extractor.crops.borrow().len(), 1);
    }

    #[test]
    fn test_short_plate_reports_no_state_code() {
        let image = test_image(100, 80);
        let predictions = vec![prediction(10, 10, 30, 20, 0.95)];
        let extractor = ScriptedExtractor::new(vec![Ok("A".to_string())]);
        let reading = read_plate(&image, &predictions, &extractor).unwrap();
        assert_eq!(reading.plate, "A");
        assert_eq!(reading.state_code, None);
        assert_eq!(reading.confidence, Some(0.95));
    }
}
