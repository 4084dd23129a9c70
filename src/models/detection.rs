use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }
}

/// Validated plate crop.
#[derive(Debug, Clone)]
pub struct Crop {
    pub image: RgbImage,
    /// Every pixel value identical; usually a decode failure upstream.
    pub solid_color: bool,
}

/// Backend output before normalization and filtering.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub plate_text: String,
    pub normalized_plate: Option<String>,
    pub confidence: f32,
    pub bbox: BBox,
    pub frame_no: u64,
    pub crop: Option<Crop>,
    pub frame: Option<Arc<RgbImage>>,
    pub camera_id: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
}

/// Detection that passed the global filter, with every field resolved.
#[derive(Debug, Clone)]
pub struct Detection {
    pub plate: String,
    pub normalized_plate: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub frame_no: u64,
    pub crop: Option<Crop>,
    pub frame: Option<Arc<RgbImage>>,
    pub camera_id: Option<String>,
    pub captured_at: DateTime<Utc>,
}
