use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Side length of the square face crops used for training and prediction.
pub const FACE_SIZE: u32 = 100;

/// Rectangle around a detected face, in pixel coordinates of the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Cut this region out of `image` and resample it to `size`×`size`.
    ///
    /// The region is clipped to the image bounds first. Returns `None` when
    /// nothing of the region lies inside the image.
    pub fn crop_resized(&self, image: &GrayImage, size: u32) -> Option<GrayImage> {
        if self.x >= image.width() || self.y >= image.height() {
            return None;
        }
        let width = self.width.min(image.width() - self.x);
        let height = self.height.min(image.height() - self.y);
        if width == 0 || height == 0 {
            return None;
        }

        let crop = imageops::crop_imm(image, self.x, self.y, width, height).to_image();
        if crop.dimensions() == (size, size) {
            return Some(crop);
        }
        Some(imageops::resize(&crop, size, size, FilterType::Triangle))
    }
}

/// Parameters for a multi-scale detection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    /// Ratio between consecutive search scales (must be > 1).
    pub scale_factor: f64,
    /// Candidates a group needs beyond this count to be kept. 0 disables grouping.
    pub min_neighbors: u32,
    /// Smallest face size considered, (width, height).
    pub min_size: (u32, u32),
    /// Largest face size considered. `None` means the image size.
    pub max_size: Option<(u32, u32)>,
}

impl DetectParams {
    pub fn new(scale_factor: f64, min_neighbors: u32) -> Self {
        Self {
            scale_factor,
            min_neighbors,
            min_size: (0, 0),
            max_size: None,
        }
    }
}

impl Default for DetectParams {
    fn default() -> Self {
        Self::new(1.1, 3)
    }
}
