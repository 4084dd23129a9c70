//! Frame-to-crop extraction with validation.
//!
//! Every candidate crop goes through the same gate before a detection may
//! carry it:
//! 1. the source frame must be a 3-channel image with positive dimensions,
//! 2. the bounding box is clamped to the frame,
//! 3. the clamped region must be at least [`MIN_CROP_DIM`] pixels on each side,
//! 4. a solid-color region is accepted but flagged.

use image::{imageops, DynamicImage, RgbImage};

use crate::models::detection::{BBox, Crop};

/// Smallest crop edge, in pixels, that is accepted.
pub const MIN_CROP_DIM: u32 = 5;

/// Margin added around localized boxes before cropping.
pub const CROP_PADDING: i32 = 5;

/// Why a crop was refused. Rejections drop the detection; they never fail a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CropRejection {
    #[error("frame has {0} channels, expected 3")]
    NotThreeChannel(u8),

    #[error("frame has empty dimensions {width}x{height}")]
    EmptyFrame { width: u32, height: u32 },

    #[error("clamped crop {width}x{height} is below the {MIN_CROP_DIM}px minimum")]
    TooSmall { width: u32, height: u32 },
}

/// Clamp a box to `[0, width] x [0, height]`, returning `(x, y, w, h)`.
pub fn clamp_bbox(bbox: &BBox, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let max_x = width as i64;
    let max_y = height as i64;

    let x1 = (bbox.x1 as i64).clamp(0, max_x);
    let y1 = (bbox.y1 as i64).clamp(0, max_y);
    let x2 = (bbox.x2 as i64).clamp(0, max_x);
    let y2 = (bbox.y2 as i64).clamp(0, max_y);

    let w = (x2 - x1).max(0);
    let h = (y2 - y1).max(0);

    (x1 as u32, y1 as u32, w as u32, h as u32)
}

/// Grow a box by `pad` pixels on each side (clamping happens at crop time).
pub fn pad_bbox(bbox: &BBox, pad: i32) -> BBox {
    BBox::new(
        bbox.x1.saturating_sub(pad),
        bbox.y1.saturating_sub(pad),
        bbox.x2.saturating_add(pad),
        bbox.y2.saturating_add(pad),
    )
}

/// Check that a decoded frame can produce crops, returning its RGB view.
pub fn validate_frame(frame: &DynamicImage) -> Result<&RgbImage, CropRejection> {
    let rgb = match frame {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => return Err(CropRejection::NotThreeChannel(other.color().channel_count())),
    };

    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(CropRejection::EmptyFrame {
            width: rgb.width(),
            height: rgb.height(),
        });
    }

    Ok(rgb)
}

/// Cut a validated crop for `bbox` out of an RGB frame.
pub fn extract_crop(frame: &RgbImage, bbox: &BBox) -> Result<Crop, CropRejection> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(CropRejection::EmptyFrame {
            width: frame.width(),
            height: frame.height(),
        });
    }

    let (x, y, w, h) = clamp_bbox(bbox, frame.width(), frame.height());
    if w < MIN_CROP_DIM || h < MIN_CROP_DIM {
        return Err(CropRejection::TooSmall { width: w, height: h });
    }

    let image = imageops::crop_imm(frame, x, y, w, h).to_image();
    let solid_color = is_solid_color(&image);

    Ok(Crop { image, solid_color })
}

/// Crop from an arbitrary decoded frame, applying the full validation gate.
pub fn crop_from_frame(frame: &DynamicImage, bbox: &BBox) -> Result<Crop, CropRejection> {
    let rgb = validate_frame(frame)?;
    extract_crop(rgb, bbox)
}

/// Min/max over every channel value of an image.
pub fn pixel_range(image: &RgbImage) -> (u8, u8) {
    image
        .as_raw()
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

pub fn is_solid_color(image: &RgbImage) -> bool {
    let (lo, hi) = pixel_range(image);
    lo == hi
}
