//! Crop, resize and normalize a face image for the quantized encoder.
//!
//! Output layout is NHWC `[1, 112, 112, 3]`, RGB, scaled to [-1, 1].

use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

pub const INPUT_SIZE: u32 = 112;
const PIXEL_HALF_RANGE: f32 = 127.5;
/// Padding added on every side of a detected face, as a fraction of its larger side.
const FACE_PADDING_RATIO: f32 = 0.1;

/// Pixel rectangle to crop from the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropWindow {
    /// Centered square of side `min(width, height)`.
    pub fn center_square(width: u32, height: u32) -> Self {
        let side = width.min(height);
        CropWindow {
            x: (width - side) / 2,
            y: (height - side) / 2,
            width: side,
            height: side,
        }
    }

    /// Face region grown by 10% of its larger side, clamped to the image.
    ///
    /// Returns `None` when nothing of the padded region lies inside the image.
    pub fn padded_face(region: &FaceRegion, width: u32, height: u32) -> Option<Self> {
        let coords = [region.x, region.y, region.width, region.height];
        if coords.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let (x, y) = (region.x.round(), region.y.round());
        let (w, h) = (region.width.round(), region.height.round());
        let pad = (w.max(h) * FACE_PADDING_RATIO).trunc();
        let (max_x, max_y) = (width as f32, height as f32);

        // Clamped while still in f32 so the casts below stay in range
        let x1 = (x - pad).clamp(0.0, max_x);
        let y1 = (y - pad).clamp(0.0, max_y);
        let x2 = (x + w + pad).clamp(0.0, max_x);
        let y2 = (y + h + pad).clamp(0.0, max_y);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(CropWindow {
            x: x1 as u32,
            y: y1 as u32,
            width: (x2 - x1) as u32,
            height: (y2 - y1) as u32,
        })
    }

    /// Choose the crop for an image: the padded face if usable, else the center square.
    pub fn select(region: Option<&FaceRegion>, width: u32, height: u32) -> Self {
        region
            .and_then(|r| Self::padded_face(r, width, height))
            .unwrap_or_else(|| Self::center_square(width, height))
    }
}

/// Build the encoder input tensor for an image and optional face region.
///
/// Returns `None` only for an empty image.
pub fn preprocess(image: &RgbImage, region: Option<&FaceRegion>) -> Option<Array4<f32>> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }

    let window = CropWindow::select(region, width, height);
    let crop = imageops::crop_imm(image, window.x, window.y, window.width, window.height).to_image();
    let resized = imageops::resize(&crop, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);

    let side = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, side, side, 3));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / PIXEL_HALF_RANGE - 1.0;
        }
    }

    Some(tensor)
}
