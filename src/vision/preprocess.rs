//! Image preprocessing for the encoder
//!
//! Follows the Nougat image processor: crop margins, resize, thumbnail,
//! center-pad, then normalize into an NCHW tensor.

use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage};
use ndarray::{Array3, Array4};

use crate::config::PreprocessSettings;
use crate::vision::InferenceError;

/// Pixels darker than this (after contrast stretch) count as content
const MARGIN_THRESHOLD: u8 = 200;

/// Crop uniform background margins around the content
pub fn crop_margin(image: &RgbImage) -> RgbImage {
    let gray: GrayImage = imageops::grayscale(image);
    let (min, max) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if max == min {
        return image.clone();
    }

    let range = (max - min) as f32;
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, p) in gray.enumerate_pixels() {
        let stretched = (p[0] - min) as f32 / range * 255.0;
        if stretched < MARGIN_THRESHOLD as f32 {
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
    }

    match bounds {
        Some((x0, y0, x1, y1)) => {
            imageops::crop_imm(image, x0, y0, x1 - x0 + 1, y1 - y0 + 1).to_image()
        }
        None => image.clone(),
    }
}

/// Size after scaling the shorter side to `shortest_edge`, keeping aspect ratio
fn shortest_edge_size(w: u32, h: u32, shortest_edge: u32) -> (f64, f64) {
    let scale = shortest_edge as f64 / w.min(h) as f64;
    (
        (w as f64 * scale).round().max(1.0),
        (h as f64 * scale).round().max(1.0),
    )
}

/// Size after shrinking (never enlarging) to fit within `max_width` x `max_height`
fn thumbnail_size(in_w: f64, in_h: f64, max_width: u32, max_height: u32) -> (u32, u32) {
    let height = in_h.min(max_height as f64);
    let width = in_w.min(max_width as f64);
    let (width, height) = if in_h > in_w {
        ((in_w * height / in_h).floor().max(1.0), height)
    } else if in_w > in_h {
        (width, (in_h * width / in_w).floor().max(1.0))
    } else {
        (width, height)
    };
    (width as u32, height as u32)
}

/// Final size of the shortest-edge resize followed by the thumbnail step.
///
/// Computed up front so the image is resampled once and no intermediate
/// buffer exceeds the target size.
pub fn fitted_size(w: u32, h: u32, shortest_edge: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    let (scaled_w, scaled_h) = shortest_edge_size(w, h, shortest_edge);
    thumbnail_size(scaled_w, scaled_h, max_width, max_height)
}

/// Resize into the target box in a single resampling pass
pub fn fit_to_target(image: &RgbImage, settings: &PreprocessSettings) -> RgbImage {
    let (w, h) = image.dimensions();
    let shortest_edge = settings.height.min(settings.width);
    let (new_w, new_h) = fitted_size(w, h, shortest_edge, settings.width, settings.height);
    if (new_w, new_h) == (w, h) {
        return image.clone();
    }
    imageops::resize(image, new_w, new_h, FilterType::Triangle)
}

/// Center the image on a black canvas of the target size
pub fn pad_centered(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
    let (w, h) = image.dimensions();
    let left = width.saturating_sub(w) / 2;
    let top = height.saturating_sub(h) / 2;
    imageops::replace(&mut canvas, image, left as i64, top as i64);
    canvas
}

/// Convert RGB image data to an HWC f32 array in 0-1
pub fn rgb_to_f32(image: &RgbImage) -> Array3<f32> {
    let (w, h) = image.dimensions();
    Array3::<f32>::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
        image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

/// Normalize image with mean and std
pub fn normalize(image: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let (h, w, _) = image.dim();
    Array3::<f32>::from_shape_fn((h, w, 3), |(y, x, c)| (image[[y, x, c]] - mean[c]) / std[c])
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    let (h, w, c) = image.dim();
    Array4::<f32>::from_shape_fn((1, c, h, w), |(_, ch, y, x)| image[[y, x, ch]])
}

/// Full preprocessing pipeline producing `[1, 3, height, width]`
pub fn preprocess(image: &RgbImage, settings: &PreprocessSettings) -> Result<Array4<f32>, InferenceError> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Err(InferenceError::Preprocess(format!("empty image ({}x{})", w, h)));
    }
    if settings.width == 0 || settings.height == 0 {
        return Err(InferenceError::Preprocess("target size must be non-zero".to_string()));
    }

    let cropped = if settings.crop_margin {
        crop_margin(image)
    } else {
        image.clone()
    };
    let fitted = fit_to_target(&cropped, settings);
    let padded = pad_centered(&fitted, settings.width, settings.height);

    let normalized = normalize(&rgb_to_f32(&padded), &settings.mean, &settings.std);
    Ok(hwc_to_nchw(&normalized))
}
