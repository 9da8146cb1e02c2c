use crate::preprocess::enhance_plate;
use anyhow::anyhow;
use image::{DynamicImage, GrayImage, RgbImage};
use leptess::{LepTess, Variable};
use std::{
    io::Cursor,
    path::PathBuf,
    sync::mpsc::{self, RecvTimeoutError},
    time::Duration,
};
use tracing::{debug, error, warn};

/// Plates only ever carry uppercase letters and digits.
pub const PLATE_CHAR_WHITELIST: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Assume a single uniform block of text (PSM 6).
const PAGE_SEG_MODE_SINGLE_BLOCK: &str = "6";

/// Hard bound on one recognition call, preventing hangs on difficult crops.
pub const DEFAULT_OCR_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs the crop-enhancement pipeline and character recognition on one
/// plate candidate.
///
/// `Err` is reserved for enhancement failures, which abort the whole
/// request; engine failures and timeouts collapse to `Ok("")` so the caller
/// can move on to the next candidate.
pub trait TextExtractor {
    fn extract(&self, plate_crop: &RgbImage) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub language: String,
    pub datapath: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            datapath: None,
            timeout: DEFAULT_OCR_TIMEOUT,
        }
    }
}

/// Tesseract-backed extractor.
///
/// Every candidate gets a fresh engine on a throwaway thread that is
/// abandoned on timeout, so a recognition that hangs cannot wedge the
/// detector worker or leak state into the next candidate. The engine runs
/// with its default mode (legacy plus LSTM where the traineddata allows).
pub struct TesseractOcr {
    config: OcrConfig,
}

impl TesseractOcr {
    pub fn new(config: OcrConfig) -> anyhow::Result<Self> {
        // Fail at startup, not per request, when the language data is
        // missing or unreadable.
        init_engine(&config)?;
        Ok(Self { config })
    }

    fn recognize(&self, png: Vec<u8>) -> String {
        let config = self.config.clone();
        let (sender, receiver) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = sender.send(run_tesseract(&config, &png));
        });

        match receiver.recv_timeout(self.config.timeout) {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => {
                error!("Tesseract error: {err}");
                String::new()
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout = ?self.config.timeout, "OCR timed out on candidate");
                String::new()
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("OCR thread died before producing a result");
                String::new()
            }
        }
    }
}

impl TextExtractor for TesseractOcr {
    fn extract(&self, plate_crop: &RgbImage) -> anyhow::Result<String> {
        let processed = enhance_plate(plate_crop)?;
        let png = encode_png(&processed)?;
        let text = self.recognize(png);
        debug!(raw = %text.trim(), "OCR candidate text");
        Ok(text)
    }
}

fn init_engine(config: &OcrConfig) -> anyhow::Result<LepTess> {
    let datapath = config.datapath.as_ref().and_then(|p| p.to_str());
    let mut engine = LepTess::new(datapath, &config.language)
        .map_err(|e| anyhow!("Failed to initialize Tesseract: {e}"))?;
    engine
        .set_variable(Variable::TesseditPagesegMode, PAGE_SEG_MODE_SINGLE_BLOCK)
        .map_err(|e| anyhow!("Failed to set page segmentation mode: {e}"))?;
    engine
        .set_variable(Variable::TesseditCharWhitelist, PLATE_CHAR_WHITELIST)
        .map_err(|e| anyhow!("Failed to set character whitelist: {e}"))?;
    Ok(engine)
}

fn run_tesseract(config: &OcrConfig, png: &[u8]) -> anyhow::Result<String> {
    let mut engine = init_engine(config)?;
    engine
        .set_image_from_mem(png)
        .map_err(|e| anyhow!("Failed to load image into Tesseract: {e}"))?;
    engine
        .get_utf8_text()
        .map_err(|e| anyhow!("Failed to read recognized text: {e}"))
}

/// Leptonica wants an encoded image, so the binary crop goes over as an
/// in-memory PNG.
fn encode_png(image: &GrayImage) -> anyhow::Result<Vec<u8>> {
    let mut png = Vec::new();
    DynamicImage::ImageLuma8(image.clone())
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_encode_png_round_trips() {
        let img = GrayImage::from_fn(8, 4, |x, _| Luma([if x % 2 == 0 { 0 } else { 255 }]));
        let png = encode_png(&img).unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (8, 4));
        assert_eq!(decoded.as_raw(), img.as_raw());
    }
}
