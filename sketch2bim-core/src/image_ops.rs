//! Raster primitives on 8-bit grayscale images.
//!
//! Thin wrappers over `imageproc` where it has the operation, hand-written
//! kernels (CLAHE, non-local means) where it does not.

use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage, ImageBuffer, ImageFormat, Luma};
use imageproc::contrast::{equalize_histogram, otsu_level};
use imageproc::edges::canny;
use imageproc::filter::{gaussian_blur_f32, laplacian_filter, median_filter};
use imageproc::gradients::sobel_gradients;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::morphology::{grayscale_close, grayscale_dilate, grayscale_erode, grayscale_open, Mask};
use std::fs;
use std::path::Path;

/// Decode an image file to grayscale
pub fn load_gray(path: &Path) -> Result<GrayImage> {
    let img = image::open(path).with_context(|| format!("Failed to decode {}", path.display()))?;
    Ok(img.to_luma8())
}

/// Write a PNG under a temporary name and rename it into place
pub fn save_png_atomic(img: &DynamicImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let tmp = path.with_extension("png.tmp");
    img.save_with_format(&tmp, ImageFormat::Png)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move PNG into {}", path.display()))?;
    Ok(())
}

/// Variance of the 4-neighbour Laplacian (focus measure)
pub fn laplacian_variance(img: &GrayImage) -> f64 {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }

    let lap = laplacian_filter(img);
    let (sum, sum_sq) = lap.pixels().fold((0.0, 0.0), |(s, sq), p| {
        let v = p[0] as f64;
        (s + v, sq + v * v)
    });
    let n = (w as f64) * (h as f64);
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Mean and population standard deviation of intensities
pub fn mean_std(img: &GrayImage) -> (f64, f64) {
    let n = img.pixels().len() as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let (sum, sum_sq) = img.pixels().fold((0.0, 0.0), |(s, sq), p| {
        let v = p[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    (mean, (sum_sq / n - mean * mean).max(0.0).sqrt())
}

/// Mean |img − median(img)| over a 5×5 window, normalised to [0, 1]
pub fn median_noise(img: &GrayImage) -> f64 {
    let n = img.pixels().len() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let median = median_filter(img, 2, 2);
    let total: f64 = img
        .pixels()
        .zip(median.pixels())
        .map(|(a, b)| (a[0] as f64 - b[0] as f64).abs())
        .sum();
    total / n / 255.0
}

/// Fraction of non-zero pixels
pub fn nonzero_fraction(img: &GrayImage) -> f64 {
    let n = img.pixels().len();
    if n == 0 {
        return 0.0;
    }
    img.pixels().filter(|p| p[0] > 0).count() as f64 / n as f64
}

/// Canny edge map. Images under 3 px on a side have no interior and come
/// back empty; the low threshold is kept at 1 or above so hysteresis never
/// follows the zero border out of the image.
pub fn canny_edges(img: &GrayImage, low: f32, high: f32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w < 3 || h < 3 {
        return GrayImage::new(w, h);
    }
    let low = if low.is_finite() { low.max(1.0) } else { 1.0 };
    let high = if high.is_finite() { high.max(low) } else { low };
    canny(img, low, high)
}

/// Mean Sobel gradient magnitude; flat paper with thin strokes stays low,
/// pixel-level texture runs high
pub fn mean_gradient(img: &GrayImage) -> f64 {
    let n = img.pixels().len();
    if n == 0 {
        return 0.0;
    }
    let total: f64 = sobel_gradients(img).pixels().map(|p| p[0] as f64).sum();
    total / n as f64
}

pub fn otsu(img: &GrayImage) -> u8 {
    otsu_level(img)
}

pub fn gaussian_blur(img: &GrayImage, sigma: f32) -> GrayImage {
    gaussian_blur_f32(img, sigma)
}

pub fn equalize(img: &GrayImage) -> GrayImage {
    equalize_histogram(img)
}

/// Rotate about the image centre, filling uncovered pixels with white
pub fn rotate_white(img: &GrayImage, angle_deg: f64) -> GrayImage {
    rotate_about_center(
        img,
        angle_deg.to_radians() as f32,
        Interpolation::Bilinear,
        Luma([255u8]),
    )
}

/// `amount·img − (amount−1)·blur(img)`, blurred and blended in f32 so flat
/// regions come back unchanged
pub fn unsharp_mask(img: &GrayImage, sigma: f32, amount: f32) -> GrayImage {
    let float: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_fn(img.width(), img.height(), |x, y| Luma([img.get_pixel(x, y)[0] as f32]));
    let blurred = gaussian_blur_f32(&float, sigma);
    let mut out = GrayImage::new(img.width(), img.height());
    for ((o, a), b) in out.pixels_mut().zip(img.pixels()).zip(blurred.pixels()) {
        let orig = a[0] as f32;
        let v = orig + (amount - 1.0) * (orig - b[0]);
        o[0] = v.round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// Axis-aligned crop; the rectangle is clipped to the image
pub fn crop(img: &GrayImage, x: u32, y: u32, width: u32, height: u32) -> GrayImage {
    let x = x.min(img.width());
    let y = y.min(img.height());
    let width = width.min(img.width() - x);
    let height = height.min(img.height() - y);
    image::imageops::crop_imm(img, x, y, width, height).to_image()
}

/// Contrast-limited adaptive histogram equalisation
pub fn clahe(img: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let tiles = tiles.max(1);
    let tile_w = w.div_ceil(tiles).max(1);
    let tile_h = h.div_ceil(tiles).max(1);
    let nx = w.div_ceil(tile_w) as usize;
    let ny = h.div_ceil(tile_h) as usize;

    let mut luts = vec![[0u8; 256]; nx * ny];
    for ty in 0..ny {
        for tx in 0..nx {
            let x0 = tx as u32 * tile_w;
            let y0 = ty as u32 * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[img.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            let area = (x1 - x0) * (y1 - y0);
            luts[ty * nx + tx] = clipped_lut(&mut hist, area, clip_limit);
        }
    }

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        let fy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let ty0 = fy.floor().max(0.0) as usize;
        let ty0 = ty0.min(ny - 1);
        let ty1 = (ty0 + 1).min(ny - 1);
        let ay = (fy - ty0 as f32).clamp(0.0, 1.0);

        for x in 0..w {
            let fx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
            let tx0 = fx.floor().max(0.0) as usize;
            let tx0 = tx0.min(nx - 1);
            let tx1 = (tx0 + 1).min(nx - 1);
            let ax = (fx - tx0 as f32).clamp(0.0, 1.0);

            let v = img.get_pixel(x, y)[0] as usize;
            let top = luts[ty0 * nx + tx0][v] as f32 * (1.0 - ax) + luts[ty0 * nx + tx1][v] as f32 * ax;
            let bottom = luts[ty1 * nx + tx0][v] as f32 * (1.0 - ax) + luts[ty1 * nx + tx1][v] as f32 * ax;
            let value = top * (1.0 - ay) + bottom * ay;
            out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

fn clipped_lut(hist: &mut [u32; 256], area: u32, clip_limit: f32) -> [u8; 256] {
    if clip_limit > 0.0 {
        let limit = ((clip_limit * area as f32) / 256.0).max(1.0) as u32;
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > limit {
                excess += *bin - limit;
                *bin = limit;
            }
        }
        let share = excess / 256;
        let mut residual = excess % 256;
        for bin in hist.iter_mut() {
            *bin += share;
            if residual > 0 {
                *bin += 1;
                residual -= 1;
            }
        }
    }

    let mut lut = [0u8; 256];
    let scale = 255.0 / area.max(1) as f32;
    let mut cumulative = 0u32;
    for (i, bin) in hist.iter().enumerate() {
        cumulative += bin;
        lut[i] = (cumulative as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Non-local means denoising.
///
/// Patch distances for each search offset come from one integral image of
/// squared differences, so the cost is O(search² · pixels).
pub fn non_local_means(img: &GrayImage, h: f32, template_window: u32, search_window: u32) -> GrayImage {
    let (w, hgt) = img.dimensions();
    if w == 0 || hgt == 0 || search_window <= 1 || h <= 0.0 {
        return img.clone();
    }
    let (wu, hu) = (w as usize, hgt as usize);
    let t = (template_window / 2) as i64;
    let s = (search_window / 2) as i64;
    let h2 = (h as f64) * (h as f64);

    let src: Vec<f64> = img.pixels().map(|p| p[0] as f64).collect();
    let sample = |x: i64, y: i64| -> f64 {
        let cx = x.clamp(0, wu as i64 - 1) as usize;
        let cy = y.clamp(0, hu as i64 - 1) as usize;
        src[cy * wu + cx]
    };

    let mut weight_sum = vec![0.0f64; wu * hu];
    let mut value_sum = vec![0.0f64; wu * hu];
    // Integral image with a one-pixel zero border
    let iw = wu + 1;
    let mut integral = vec![0.0f64; iw * (hu + 1)];

    for dy in -s..=s {
        for dx in -s..=s {
            for y in 0..hu {
                let mut row = 0.0;
                for x in 0..wu {
                    let d = src[y * wu + x] - sample(x as i64 + dx, y as i64 + dy);
                    row += d * d;
                    integral[(y + 1) * iw + x + 1] = integral[y * iw + x + 1] + row;
                }
            }

            for y in 0..hu {
                let y0 = (y as i64 - t).max(0) as usize;
                let y1 = ((y as i64 + t) as usize).min(hu - 1) + 1;
                for x in 0..wu {
                    let x0 = (x as i64 - t).max(0) as usize;
                    let x1 = ((x as i64 + t) as usize).min(wu - 1) + 1;
                    let ssd = integral[y1 * iw + x1] - integral[y0 * iw + x1] - integral[y1 * iw + x0]
                        + integral[y0 * iw + x0];
                    let n = ((y1 - y0) * (x1 - x0)) as f64;
                    let dist = ssd / n.max(1.0);
                    let weight = (-dist / h2).exp();
                    let idx = y * wu + x;
                    weight_sum[idx] += weight;
                    value_sum[idx] += weight * sample(x as i64 + dx, y as i64 + dy);
                }
            }
        }
    }

    let mut out = GrayImage::new(w, hgt);
    for (i, p) in out.pixels_mut().enumerate() {
        let v = if weight_sum[i] > 0.0 { value_sum[i] / weight_sum[i] } else { src[i] };
        p[0] = v.round().clamp(0.0, 255.0) as u8;
    }
    out
}

fn is_empty(img: &GrayImage) -> bool {
    img.width() == 0 || img.height() == 0
}

/// `kw`×`kh` rectangle anchored at its centre (upper-left of centre for even sides)
fn rect_mask(kw: u32, kh: u32) -> Mask {
    let (kw, kh) = (kw.clamp(1, 255), kh.clamp(1, 255));
    let ones = GrayImage::from_pixel(kw, kh, Luma([255u8]));
    Mask::from_image(&ones, (kw / 2) as u8, (kh / 2) as u8)
}

pub fn erode_rect(img: &GrayImage, kw: u32, kh: u32, iterations: u32) -> GrayImage {
    if is_empty(img) {
        return img.clone();
    }
    let mask = rect_mask(kw, kh);
    let mut out = img.clone();
    for _ in 0..iterations {
        out = grayscale_erode(&out, &mask);
    }
    out
}

pub fn dilate_rect(img: &GrayImage, kw: u32, kh: u32, iterations: u32) -> GrayImage {
    if is_empty(img) {
        return img.clone();
    }
    let mask = rect_mask(kw, kh);
    let mut out = img.clone();
    for _ in 0..iterations {
        out = grayscale_dilate(&out, &mask);
    }
    out
}

/// Erode then dilate
pub fn open_rect(img: &GrayImage, kw: u32, kh: u32) -> GrayImage {
    if is_empty(img) {
        return img.clone();
    }
    grayscale_open(img, &rect_mask(kw, kh))
}

/// Dilate then erode
pub fn close_rect(img: &GrayImage, kw: u32, kh: u32) -> GrayImage {
    if is_empty(img) {
        return img.clone();
    }
    grayscale_close(img, &rect_mask(kw, kh))
}

/// Per-pixel maximum
pub fn bitwise_or(a: &GrayImage, b: &GrayImage) -> GrayImage {
    let mut out = a.clone();
    for (o, p) in out.pixels_mut().zip(b.pixels()) {
        o[0] = o[0].max(p[0]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_image(size: u32, inner: (u32, u32), value: u8, background: u8) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if x >= inner.0 && x < inner.1 && y >= inner.0 && y < inner.1 {
                Luma([value])
            } else {
                Luma([background])
            }
        })
    }

    #[test]
    fn test_flat_image_statistics() {
        let flat = GrayImage::from_pixel(32, 32, Luma([128]));
        assert_eq!(laplacian_variance(&flat), 0.0);
        let (mean, std) = mean_std(&flat);
        assert_eq!(mean, 128.0);
        assert_eq!(std, 0.0);
        assert_eq!(median_noise(&flat), 0.0);
    }

    #[test]
    fn test_edges_raise_laplacian_variance() {
        let img = square_image(64, (16, 48), 0, 255);
        assert!(laplacian_variance(&img) > 100.0);
    }

    #[test]
    fn test_dilate_and_erode_rectangles() {
        let mut img = GrayImage::new(9, 9);
        img.put_pixel(4, 4, Luma([255]));

        let dilated = dilate_rect(&img, 3, 3, 1);
        assert_eq!(dilated.pixels().filter(|p| p[0] == 255).count(), 9);

        let twice = dilate_rect(&img, 3, 3, 2);
        assert_eq!(twice.pixels().filter(|p| p[0] == 255).count(), 25);

        let eroded = erode_rect(&dilated, 3, 3, 1);
        assert_eq!(eroded.pixels().filter(|p| p[0] == 255).count(), 1);

        let even = dilate_rect(&img, 2, 2, 1);
        assert_eq!(even.pixels().filter(|p| p[0] == 255).count(), 4);
    }

    #[test]
    fn test_morphology_on_empty_image() {
        let empty = GrayImage::new(0, 0);
        assert_eq!(close_rect(&open_rect(&empty, 2, 2), 3, 3).dimensions(), (0, 0));
        assert_eq!(dilate_rect(&empty, 3, 3, 2).dimensions(), (0, 0));
    }

    #[test]
    fn test_open_removes_isolated_pixels() {
        let mut img = GrayImage::new(10, 10);
        img.put_pixel(2, 2, Luma([255]));
        for y in 5..9 {
            for x in 5..9 {
                img.put_pixel(x, y, Luma([255]));
            }
        }
        let opened = open_rect(&img, 2, 2);
        assert_eq!(opened.get_pixel(2, 2)[0], 0);
        assert_eq!(opened.get_pixel(6, 6)[0], 255);
    }

    #[test]
    fn test_clahe_keeps_white_background() {
        let img = square_image(64, (20, 44), 0, 255);
        let out = clahe(&img, 2.0, 8);
        assert_eq!(out.dimensions(), (64, 64));
        assert_eq!(out.get_pixel(2, 2)[0], 255);
        assert!(out.get_pixel(32, 32)[0] < 128);
    }

    #[test]
    fn test_non_local_means_smooths_speckle() {
        let mut img = GrayImage::from_pixel(24, 24, Luma([200]));
        img.put_pixel(12, 12, Luma([0]));
        let out = non_local_means(&img, 100.0, 3, 5);
        assert!(out.get_pixel(12, 12)[0] > 0);
        assert_eq!(out.get_pixel(2, 2)[0], 200);
    }

    #[test]
    fn test_unsharp_identity_on_flat() {
        for value in [0u8, 1, 90, 128, 254, 255] {
            let flat = GrayImage::from_pixel(16, 16, Luma([value]));
            assert_eq!(unsharp_mask(&flat, 2.0, 1.5), flat, "value {}", value);
        }
    }

    #[test]
    fn test_unsharp_steepens_step() {
        let img = GrayImage::from_fn(32, 8, |x, _| if x < 16 { Luma([100]) } else { Luma([160]) });
        let out = unsharp_mask(&img, 2.0, 1.5);
        assert!(out.get_pixel(15, 4)[0] < 100);
        assert!(out.get_pixel(16, 4)[0] > 160);
        assert_eq!(out.get_pixel(0, 4)[0], 100);
    }

    #[test]
    fn test_canny_on_flat_and_tiny_images() {
        let flat = GrayImage::from_pixel(120, 120, Luma([255]));
        let t = otsu(&flat) as f32;
        assert_eq!(nonzero_fraction(&canny_edges(&flat, 0.5 * t, 1.5 * t)), 0.0);
        assert_eq!(nonzero_fraction(&canny_edges(&flat, 0.0, 0.0)), 0.0);

        for size in [0u32, 1, 2, 3, 5] {
            let tiny = GrayImage::from_fn(size, size, |x, y| Luma([((x + y) * 40) as u8]));
            let edges = canny_edges(&tiny, 0.0, 0.0);
            assert_eq!(edges.dimensions(), (size, size));
        }
    }

    #[test]
    fn test_mean_gradient_separates_strokes_from_texture() {
        let strokes = square_image(200, (40, 160), 0, 255);
        let mut state: u64 = 3;
        let texture = GrayImage::from_fn(200, 200, |_, _| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            Luma([((state >> 33) % 256) as u8])
        });
        assert!(mean_gradient(&strokes) < 40.0);
        assert!(mean_gradient(&texture) > 150.0);
        assert_eq!(mean_gradient(&GrayImage::new(0, 0)), 0.0);
    }

    #[test]
    fn test_crop_is_clipped() {
        let img = GrayImage::new(100, 50);
        let c = crop(&img, 80, 40, 50, 50);
        assert_eq!(c.dimensions(), (20, 10));
    }

    #[test]
    fn test_png_written_atomically() {
        let dir = std::env::temp_dir().join(format!("sketch2bim_ops_{}", uuid::Uuid::new_v4()));
        let path = dir.join("out.png");
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, Luma([10])));
        save_png_atomic(&img, &path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("png.tmp").exists());
        assert_eq!(load_gray(&path).unwrap().get_pixel(0, 0)[0], 10);
        fs::remove_dir_all(&dir).ok();
    }
}
