use crate::api::Prediction;
use anyhow::bail;
use bytes::Bytes;
use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};
use jpeg_encoder::{ColorType, Encoder};
use std::{fmt, path::Path, time::Instant};
use tracing::{debug, info};
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

/// Margin in pixels added on every side of a detected plate box before
/// cropping, clamped to the image bounds.
pub const PLATE_CROP_PADDING: usize = 5;

pub struct Image {
    pub name: Option<String>,
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn resize(&mut self, size: usize) {
        self.pixels.resize(size, 0);
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}, Resolution: {}x{}",
            self.name, self.width, self.height
        )
    }
}

impl Default for Image {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            pixels: Vec::with_capacity(99_532_800),
            name: None,
        }
    }
}

/// Decode image bytes into an RGB pixel buffer.
///
/// JPEG payloads go through the zune-jpeg fast path; everything else falls
/// back to the image crate's format sniffing (PNG in the default build).
pub fn decode_image(name: Option<String>, data: Bytes, image: &mut Image) -> anyhow::Result<()> {
    if data.starts_with(&[0xFF, 0xD8]) {
        return decode_jpeg(name, data, image);
    }

    let decoded = image::load_from_memory(data.as_ref())?.to_rgb8();
    let (width, height) = decoded.dimensions();
    image.width = width as usize;
    image.height = height as usize;
    image.resize(image.width * image.height * 3);
    image.pixels.copy_from_slice(decoded.as_raw());
    image.name = name;
    Ok(())
}

pub fn decode_jpeg(name: Option<String>, jpeg: Bytes, image: &mut Image) -> anyhow::Result<()> {
    let options = DecoderOptions::default()
        .set_strict_mode(true)
        .set_use_unsafe(true)
        .jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(jpeg.as_ref(), options);
    // We need to decode the headers first to get the output buffer size
    decoder.decode_headers()?;
    let output_buffer_size = decoder
        .output_buffer_size()
        .ok_or_else(|| anyhow::anyhow!("Failed to get decoder output buffer size"))?;
    // Resize the output buffer to the required size
    image.resize(output_buffer_size);
    // Decode the image into the output buffer
    decoder.decode_into(&mut image.pixels)?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| anyhow::anyhow!("Failed to get image dimensions"))?;
    image.width = width;
    image.height = height;
    image.name = name;
    Ok(())
}

/// Crop a detected plate region with `padding` extra pixels on every side.
///
/// Padding is clamped to `[0, width) x [0, height)`, so boxes touching the
/// image border come out asymmetrically padded. A box entirely outside the
/// image yields an empty crop, which the enhancement pipeline rejects.
pub fn crop_padded(image: &Image, prediction: &Prediction, padding: usize) -> RgbImage {
    let x0 = prediction.x_min.saturating_sub(padding).min(image.width);
    let y0 = prediction.y_min.saturating_sub(padding).min(image.height);
    let x1 = (prediction.x_max + padding).min(image.width);
    let y1 = (prediction.y_max + padding).min(image.height);
    let width = x1.saturating_sub(x0);
    let height = y1.saturating_sub(y0);

    let mut crop = RgbImage::new(width as u32, height as u32);
    for y in 0..height {
        let row = (y0 + y) * image.width;
        for x in 0..width {
            let src = (row + x0 + x) * 3;
            crop.put_pixel(
                x as u32,
                y as u32,
                Rgb([
                    image.pixels[src],
                    image.pixels[src + 1],
                    image.pixels[src + 2],
                ]),
            );
        }
    }
    crop
}

/// A flat mid-gray JPEG used to warm up the detector session without
/// shipping a reference image.
pub fn warmup_image_jpeg() -> anyhow::Result<Bytes> {
    const SIDE: usize = 640;
    let pixels = vec![128u8; SIDE * SIDE * 3];
    let mut jpeg = Vec::new();
    let encoder = Encoder::new(&mut jpeg, 80);
    encoder.encode(&pixels, SIDE as u16, SIDE as u16, ColorType::Rgb)?;
    Ok(Bytes::from(jpeg))
}

pub fn encode_maybe_draw_boundary_boxes_and_save_jpeg(
    image: &Image,
    jpeg_file: &String,
    predictions: Option<&[Prediction]>,
) -> anyhow::Result<()> {
    let encode_image_start_time = Instant::now();

    let image = create_dynamic_image_maybe_with_boundary_box(predictions, image)?;

    let encoder = Encoder::new_file(jpeg_file, 100)?;
    encoder.encode(
        image
            .as_rgb8()
            .ok_or_else(|| anyhow::anyhow!("Annotated image is not RGB"))?,
        image.width() as u16,
        image.height() as u16,
        ColorType::Rgb,
    )?;
    let encode_image_time = Instant::now().duration_since(encode_image_start_time);
    debug!(?encode_image_time, "Encode image time");
    info!(?jpeg_file, "Image saved");
    Ok(())
}

pub fn is_jpeg(image_name: &str) -> bool {
    image_name.to_lowercase().ends_with(".jpg") || image_name.to_lowercase().ends_with(".jpeg")
}

pub fn create_random_jpeg_name() -> String {
    format!("image_{}.jpg", uuid::Uuid::new_v4())
}

/// Derive the name the annotated copy of `image_name` is saved under.
pub fn create_annotated_image_name(image_name: &str, strip_path: bool) -> anyhow::Result<String> {
    if !is_jpeg(image_name) {
        bail!("Image is not a JPEG file");
    }

    let image_name = if strip_path {
        Path::new(image_name)
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Failed to strip path from image name"))?
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Failed to convert image name to string"))?
            .to_string()
    } else {
        image_name.to_string()
    };

    let (mut annotated_name, ext) = if let Some(pos) = image_name.rfind('.') {
        if pos + 1 >= image_name.len() {
            bail!("Failed to get image extension");
        }
        (
            image_name[..pos].to_string(),
            image_name[(pos + 1)..].to_string(),
        )
    } else {
        bail!("Failed to get image extension");
    };

    annotated_name.push_str("_plates.");
    annotated_name.push_str(&ext);
    Ok(annotated_name)
}

pub fn create_dynamic_image_maybe_with_boundary_box(
    predictions: Option<&[Prediction]>,
    decoded_image: &Image,
) -> anyhow::Result<DynamicImage> {
    let pixel_count = decoded_image.width * decoded_image.height * 3;
    let mut img = ImageBuffer::from_vec(
        decoded_image.width as u32,
        decoded_image.height as u32,
        decoded_image.pixels[..pixel_count].to_vec(),
    )
    .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))?;
    if let Some(predictions) = predictions {
        for prediction in predictions {
            let dx = prediction.x_max.saturating_sub(prediction.x_min);
            let dy = prediction.y_max.saturating_sub(prediction.y_min);

            if dx > 0 && dy > 0 {
                imageproc::drawing::draw_hollow_rect_mut(
                    &mut img,
                    imageproc::rect::Rect::at(prediction.x_min as i32, prediction.y_min as i32)
                        .of_size(dx as u32, dy as u32),
                    image::Rgb([255, 0, 0]),
                );
            }
        }
    }
    Ok(DynamicImage::ImageRgb8(img))
}

pub struct Resizer {
    resizer: fast_image_resize::Resizer,
    target_width: usize,
    target_height: usize,
}

impl Default for Resizer {
    fn default() -> Self {
        Self {
            resizer: fast_image_resize::Resizer::new(),
            target_width: 640,
            target_height: 640,
        }
    }
}

impl Resizer {
    pub fn new(target_width: usize, target_height: usize) -> anyhow::Result<Self> {
        let resizer = fast_image_resize::Resizer::new();
        Ok(Self {
            resizer,
            target_width,
            target_height,
        })
    }

    pub fn resize_image(
        &mut self,
        original_image: &mut Image,
        resized_image: &mut Image,
    ) -> anyhow::Result<()> {
        debug!(
            "Resizing image from {}x{} to {}x{}",
            original_image.width, original_image.height, self.target_width, self.target_height
        );
        let src_image = fast_image_resize::images::Image::from_slice_u8(
            original_image.width as u32,
            original_image.height as u32,
            &mut original_image.pixels,
            fast_image_resize::PixelType::U8x3,
        )?;

        if resized_image.height != self.target_height {
            resized_image.height = self.target_height
        }

        if resized_image.width != self.target_width {
            resized_image.width = self.target_width
        }

        resized_image.resize(self.target_width * self.target_height * 3);

        let mut dst_image = fast_image_resize::images::Image::from_slice_u8(
            resized_image.width as u32,
            resized_image.height as u32,
            &mut resized_image.pixels,
            fast_image_resize::PixelType::U8x3,
        )?;

        self.resizer.resize(&src_image, &mut dst_image, None)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(width: usize, height: usize) -> Image {
        let mut pixels = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[x as u8, y as u8, 0]);
            }
        }
        Image {
            name: None,
            width,
            height,
            pixels,
        }
    }

    fn prediction(x_min: usize, y_min: usize, x_max: usize, y_max: usize) -> Prediction {
        Prediction {
            x_min,
            y_min,
            x_max,
            y_max,
            confidence: 0.9,
            label: "license_plate".to_string(),
        }
    }

    #[test]
    fn test_crop_padded_interior_box() {
        let image = gradient_image(100, 80);
        let crop = crop_padded(&image, &prediction(10, 10, 20, 20), PLATE_CROP_PADDING);
        // 5 px on each side of a 10x10 box.
        assert_eq!(crop.dimensions(), (20, 20));
        // Top-left crop pixel maps to (5, 5) in the source.
        assert_eq!(crop.get_pixel(0, 0), &Rgb([5, 5, 0]));
        assert_eq!(crop.get_pixel(19, 19), &Rgb([24, 24, 0]));
    }

    #[test]
    fn test_crop_padded_clamps_at_border() {
        let image = gradient_image(100, 80);
        let crop = crop_padded(&image, &prediction(0, 0, 10, 10), PLATE_CROP_PADDING);
        // Asymmetric: no room to pad above or to the left.
        assert_eq!(crop.dimensions(), (15, 15));
        assert_eq!(crop.get_pixel(0, 0), &Rgb([0, 0, 0]));

        let crop = crop_padded(&image, &prediction(90, 70, 100, 80), PLATE_CROP_PADDING);
        assert_eq!(crop.dimensions(), (15, 15));
    }

    #[test]
    fn test_crop_padded_never_exceeds_image_bounds() {
        let image = gradient_image(30, 20);
        for (x_min, y_min, x_max, y_max) in [(0, 0, 30, 20), (25, 15, 30, 20), (2, 2, 4, 4)] {
            let crop = crop_padded(&image, &prediction(x_min, y_min, x_max, y_max), 5);
            assert!(crop.width() as usize <= image.width);
            assert!(crop.height() as usize <= image.height);
            // Clipping never shrinks below the detected box, padding never
            // adds more than 5 px per side.
            assert!(crop.width() as usize >= x_max - x_min);
            assert!(crop.height() as usize >= y_max - y_min);
            assert!(crop.width() as usize <= (x_max - x_min) + 10);
            assert!(crop.height() as usize <= (y_max - y_min) + 10);
        }
    }

    #[test]
    fn test_crop_padded_box_outside_image_is_empty() {
        let image = gradient_image(30, 20);
        let crop = crop_padded(&image, &prediction(50, 50, 60, 60), PLATE_CROP_PADDING);
        assert_eq!(crop.dimensions(), (0, 0));
    }

    #[test]
    fn test_create_annotated_image_name() {
        assert_eq!(
            create_annotated_image_name("car.jpg", false).unwrap(),
            "car_plates.jpg"
        );
        assert_eq!(
            create_annotated_image_name("/tmp/cars/car.jpeg", true).unwrap(),
            "car_plates.jpeg"
        );
        assert!(create_annotated_image_name("car.png", false).is_err());
    }

    #[test]
    fn test_warmup_image_decodes() {
        let jpeg = warmup_image_jpeg().unwrap();
        let mut image = Image::default();
        decode_image(None, jpeg, &mut image).unwrap();
        assert_eq!((image.width, image.height), (640, 640));
    }
}
