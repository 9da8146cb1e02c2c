use anyhow::bail;
use image::{GrayImage, Luma, RgbImage, imageops};
use imageproc::contrast::{ThresholdType, otsu_level, threshold};

/// OCR accuracy falls off sharply below this glyph height, so smaller crops
/// are upscaled before anything else runs.
pub const MIN_OCR_HEIGHT: u32 = 200;

const CLAHE_CLIP_LIMIT: f32 = 3.0;
const CLAHE_GRID: u32 = 8;
const NLM_FILTER_STRENGTH: f32 = 10.0;
const NLM_TEMPLATE_WINDOW: u32 = 7;
const NLM_SEARCH_WINDOW: u32 = 21;

/// Turn a raw plate crop into a binary image suitable for OCR.
///
/// Upscale-if-small, grayscale, CLAHE, non-local-means denoising, Otsu
/// binarization, 2x2 morphological close, in that order. Pure function of
/// the crop. A degenerate crop is a hard error; the caller fails the whole
/// request rather than moving on to the next candidate.
pub fn enhance_plate(crop: &RgbImage) -> anyhow::Result<GrayImage> {
    if crop.width() == 0 || crop.height() == 0 {
        bail!(
            "Degenerate plate crop ({}x{})",
            crop.width(),
            crop.height()
        );
    }

    let upscaled = upscale_for_ocr(crop);
    let gray = imageops::grayscale(&upscaled);
    let enhanced = clahe(&gray, CLAHE_CLIP_LIMIT, CLAHE_GRID, CLAHE_GRID);
    let denoised = fast_nl_means(
        &enhanced,
        NLM_FILTER_STRENGTH,
        NLM_TEMPLATE_WINDOW,
        NLM_SEARCH_WINDOW,
    );
    let binary = otsu_binarize(&denoised);
    Ok(close_2x2(&binary))
}

/// Scale the crop so its height is exactly [`MIN_OCR_HEIGHT`], preserving
/// aspect ratio (the scaled width truncates), with cubic interpolation.
/// Crops already tall enough pass through untouched.
pub fn upscale_for_ocr(crop: &RgbImage) -> RgbImage {
    let height = crop.height();
    if height >= MIN_OCR_HEIGHT {
        return crop.clone();
    }
    let scale = MIN_OCR_HEIGHT as f32 / height as f32;
    let width = ((crop.width() as f32 * scale) as u32).max(1);
    imageops::resize(crop, width, MIN_OCR_HEIGHT, imageops::FilterType::CatmullRom)
}

/// Contrast-limited adaptive histogram equalization.
///
/// Per-tile histograms are clipped at `clip_limit * tile_area / 256`
/// (never below one count), the clipped excess is redistributed evenly
/// over the range, and per-pixel values are blended bilinearly between the
/// four surrounding tile LUTs.
pub fn clahe(img: &GrayImage, clip_limit: f32, grid_x: u32, grid_y: u32) -> GrayImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }
    let tile_w = width.div_ceil(grid_x.clamp(1, width));
    let tile_h = height.div_ceil(grid_y.clamp(1, height));
    // Tiles that would start past the border are dropped so every LUT is
    // backed by pixels.
    let grid_x = width.div_ceil(tile_w);
    let grid_y = height.div_ceil(tile_h);

    let mut luts = vec![[0u8; 256]; (grid_x * grid_y) as usize];
    for ty in 0..grid_y {
        for tx in 0..grid_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);
            let area = ((x1 - x0) * (y1 - y0)) as u32;

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[img.get_pixel(x, y)[0] as usize] += 1;
                }
            }

            let clip = ((clip_limit * area as f32 / 256.0).max(1.0)) as u32;
            let mut excess = 0u32;
            for count in hist.iter_mut() {
                if *count > clip {
                    excess += *count - clip;
                    *count = clip;
                }
            }
            let bonus = excess / 256;
            let residual = (excess % 256) as usize;
            for count in hist.iter_mut() {
                *count += bonus;
            }
            for i in 0..residual {
                hist[i * 256 / residual] += 1;
            }

            let scale = 255.0 / area as f32;
            let lut = &mut luts[(ty * grid_x + tx) as usize];
            let mut cdf = 0u32;
            for (value, count) in hist.iter().enumerate() {
                cdf += count;
                lut[value] = (cdf as f32 * scale).round().min(255.0) as u8;
            }
        }
    }

    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        let fy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let (ty0, ty1, wy) = interp_tiles(fy, grid_y);
        for x in 0..width {
            let fx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
            let (tx0, tx1, wx) = interp_tiles(fx, grid_x);
            let v = img.get_pixel(x, y)[0] as usize;
            let l00 = luts[(ty0 * grid_x + tx0) as usize][v] as f32;
            let l01 = luts[(ty0 * grid_x + tx1) as usize][v] as f32;
            let l10 = luts[(ty1 * grid_x + tx0) as usize][v] as f32;
            let l11 = luts[(ty1 * grid_x + tx1) as usize][v] as f32;
            let top = l00 + (l01 - l00) * wx;
            let bottom = l10 + (l11 - l10) * wx;
            let value = top + (bottom - top) * wy;
            out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

/// Neighbouring tile indices and blend weight for a tile-center position.
fn interp_tiles(f: f32, tiles: u32) -> (u32, u32, f32) {
    if f <= 0.0 {
        return (0, 0, 0.0);
    }
    let last = tiles - 1;
    if f >= last as f32 {
        return (last, last, 0.0);
    }
    let i = f as u32;
    (i, i + 1, f - i as f32)
}

/// Non-local-means denoising.
///
/// For every search-window offset the squared pixel differences against the
/// shifted image are accumulated into an integral image, which gives the
/// patch distance for all pixels in constant time per pixel. Weights are
/// `exp(-d2 / h^2)` on the patch-mean squared distance; borders replicate.
pub fn fast_nl_means(
    img: &GrayImage,
    strength: f32,
    template_window: u32,
    search_window: u32,
) -> GrayImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }
    let w = width as i64;
    let h = height as i64;
    let t = (template_window as i64) / 2;
    let s = (search_window as i64) / 2;
    let h2 = strength * strength;

    let pixels = img.as_raw();
    let at = |x: i64, y: i64| -> i64 {
        let cx = x.clamp(0, w - 1);
        let cy = y.clamp(0, h - 1);
        pixels[(cy * w + cx) as usize] as i64
    };

    let mut weight_sum = vec![0.0f32; (w * h) as usize];
    let mut value_sum = vec![0.0f32; (w * h) as usize];
    let mut integral = vec![0u64; ((w + 1) * (h + 1)) as usize];

    for dy in -s..=s {
        for dx in -s..=s {
            for y in 0..h {
                let mut row = 0u64;
                for x in 0..w {
                    let d = at(x, y) - at(x + dx, y + dy);
                    row += (d * d) as u64;
                    integral[((y + 1) * (w + 1) + (x + 1)) as usize] =
                        integral[(y * (w + 1) + (x + 1)) as usize] + row;
                }
            }

            for y in 0..h {
                let y0 = (y - t).max(0);
                let y1 = (y + t).min(h - 1);
                for x in 0..w {
                    let x0 = (x - t).max(0);
                    let x1 = (x + t).min(w - 1);
                    let area = ((x1 - x0 + 1) * (y1 - y0 + 1)) as f32;
                    let patch = integral[((y1 + 1) * (w + 1) + x1 + 1) as usize]
                        + integral[(y0 * (w + 1) + x0) as usize]
                        - integral[(y0 * (w + 1) + x1 + 1) as usize]
                        - integral[((y1 + 1) * (w + 1) + x0) as usize];
                    let weight = (-(patch as f32 / area) / h2).exp();
                    let idx = (y * w + x) as usize;
                    weight_sum[idx] += weight;
                    value_sum[idx] += weight * at(x + dx, y + dy) as f32;
                }
            }
        }
    }

    let mut out = GrayImage::new(width, height);
    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) as usize;
            let value = (value_sum[idx] / weight_sum[idx]).round();
            out.put_pixel(x as u32, y as u32, Luma([value.clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

/// Otsu global threshold into a strict black/white image.
pub fn otsu_binarize(gray: &GrayImage) -> GrayImage {
    threshold(gray, otsu_level(gray), ThresholdType::Binary)
}

/// Morphological close (dilate then erode) with a 2x2 rectangular
/// structuring element, OpenCV anchor convention (kernel covers the pixel
/// and its up-left neighbours). Reconnects broken character strokes without
/// materially thickening them.
pub fn close_2x2(binary: &GrayImage) -> GrayImage {
    erode_2x2(&dilate_2x2(binary))
}

fn dilate_2x2(img: &GrayImage) -> GrayImage {
    morph_2x2(img, |a, b| a.max(b))
}

fn erode_2x2(img: &GrayImage) -> GrayImage {
    morph_2x2(img, |a, b| a.min(b))
}

fn morph_2x2(img: &GrayImage, fold: impl Fn(u8, u8) -> u8) -> GrayImage {
    let (width, height) = img.dimensions();
    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            // Border pixels replicate: out-of-range taps fall back on the
            // in-range ones.
            let mut value = img.get_pixel(x, y)[0];
            for (dx, dy) in [(1u32, 0u32), (0, 1), (1, 1)] {
                if x >= dx && y >= dy {
                    value = fold(value, img.get_pixel(x - dx, y - dy)[0]);
                }
            }
            out.put_pixel(x, y, Luma([value]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn constant_gray(width: u32, height: u32, value: u8) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([value]))
    }

    #[test]
    fn test_upscale_small_crop_to_exact_height() {
        let crop = RgbImage::from_pixel(100, 50, Rgb([10, 20, 30]));
        let upscaled = upscale_for_ocr(&crop);
        assert_eq!(upscaled.dimensions(), (400, 200));
    }

    #[test]
    fn test_upscale_width_truncates() {
        // 200 / 57 * 123 = 431.57..., truncated.
        let crop = RgbImage::from_pixel(123, 57, Rgb([0, 0, 0]));
        let upscaled = upscale_for_ocr(&crop);
        assert_eq!(upscaled.dimensions(), (431, 200));
    }

    #[test]
    fn test_upscale_leaves_tall_crops_alone() {
        let crop = RgbImage::from_pixel(80, 200, Rgb([1, 2, 3]));
        assert_eq!(upscale_for_ocr(&crop).dimensions(), (80, 200));
        let crop = RgbImage::from_pixel(80, 300, Rgb([1, 2, 3]));
        assert_eq!(upscale_for_ocr(&crop).dimensions(), (80, 300));
    }

    #[test]
    fn test_clahe_constant_image_stays_constant() {
        let img = constant_gray(32, 32, 90);
        let out = clahe(&img, 3.0, 8, 8);
        assert_eq!(out.dimensions(), (32, 32));
        let first = out.get_pixel(0, 0)[0];
        assert!(out.pixels().all(|p| p[0] == first));
    }

    #[test]
    fn test_clahe_is_monotone_and_expands_low_contrast() {
        // Identical 8x8 tiles so every LUT matches and interpolation is a
        // no-op; values span 100..=128.
        let img = GrayImage::from_fn(64, 64, |x, y| {
            Luma([(((x % 8) * 4 + (y % 8) * 4) % 32) as u8 + 100])
        });
        let out = clahe(&img, 3.0, 8, 8);

        let in_min = img.pixels().map(|p| p[0]).min().unwrap();
        let in_max = img.pixels().map(|p| p[0]).max().unwrap();
        let out_min = out.pixels().map(|p| p[0]).min().unwrap();
        let out_max = out.pixels().map(|p| p[0]).max().unwrap();
        assert!(
            out_max - out_min >= in_max - in_min,
            "contrast not expanded: {}..{} -> {}..{}",
            in_min,
            in_max,
            out_min,
            out_max
        );

        // Brighter input stays at least as bright in the output.
        for y in 0..64 {
            for window in (0..64).collect::<Vec<_>>().windows(2) {
                let (x0, x1) = (window[0], window[1]);
                let (a, b) = (img.get_pixel(x0, y)[0], img.get_pixel(x1, y)[0]);
                let (oa, ob) = (out.get_pixel(x0, y)[0], out.get_pixel(x1, y)[0]);
                if a < b {
                    assert!(oa <= ob);
                } else if a > b {
                    assert!(oa >= ob);
                }
            }
        }
    }

    #[test]
    fn test_nl_means_constant_image_unchanged() {
        let img = constant_gray(16, 12, 77);
        let out = fast_nl_means(&img, 10.0, 7, 21);
        assert_eq!(out.dimensions(), (16, 12));
        assert!(out.pixels().all(|p| p[0] == 77));
    }

    #[test]
    fn test_nl_means_flattens_a_small_outlier() {
        let mut img = constant_gray(15, 15, 100);
        img.put_pixel(7, 7, Luma([104]));
        let out = fast_nl_means(&img, 10.0, 7, 21);
        // Nearly every neighbourhood agrees on 100, so the outlier is
        // averaged away and nothing else moves.
        assert!(out.pixels().all(|p| p[0] == 100));
    }

    #[test]
    fn test_otsu_binarize_is_strictly_two_valued() {
        let img = GrayImage::from_fn(10, 10, |x, _| Luma([if x < 5 { 50 } else { 200 }]));
        let binary = otsu_binarize(&img);
        let mut values: Vec<u8> = binary.pixels().map(|p| p[0]).collect();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values, vec![0, 255]);
    }

    #[test]
    fn test_close_bridges_one_pixel_gap() {
        // Two vertical stroke fragments at x=1 and x=3 (rows 1..=2) with a
        // one pixel gap between them.
        let mut img = GrayImage::new(6, 5);
        for y in 1..=2 {
            img.put_pixel(1, y, Luma([255]));
            img.put_pixel(3, y, Luma([255]));
        }
        let closed = close_2x2(&img);
        // The gap column is connected at (2, 2) after the close.
        assert_eq!(closed.get_pixel(2, 2)[0], 255);
        assert_eq!(closed.get_pixel(0, 0)[0], 0);
        // Output stays strictly binary.
        assert!(closed.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    #[test]
    fn test_enhance_plate_rejects_degenerate_crop() {
        assert!(enhance_plate(&RgbImage::new(0, 0)).is_err());
        assert!(enhance_plate(&RgbImage::new(0, 10)).is_err());
        assert!(enhance_plate(&RgbImage::new(10, 0)).is_err());
    }
}
