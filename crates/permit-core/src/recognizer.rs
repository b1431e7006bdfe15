//! Local binary pattern histogram (LBPH) face recognizer.
//!
//! Each training face is reduced to a spatial histogram of extended LBP
//! codes; prediction returns the label of the nearest training histogram
//! under the chi-square distance.

use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

// --- Named constants ---
const DEFAULT_RADIUS: u32 = 1;
const DEFAULT_NEIGHBORS: u32 = 8;
const DEFAULT_GRID: u32 = 8;
const MAX_NEIGHBORS: u32 = 16;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("empty training data was given")]
    EmptyTrainingSet,
    #[error("got {faces} faces but {labels} labels")]
    LabelCountMismatch { faces: usize, labels: usize },
    #[error("model is not trained yet")]
    NotTrained,
    #[error("face of {width}x{height} is too small for radius {radius} and a {grid_x}x{grid_y} grid")]
    FaceTooSmall {
        width: u32,
        height: u32,
        radius: u32,
        grid_x: u32,
        grid_y: u32,
    },
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("inconsistent model: {0}")]
    Inconsistent(String),
}

/// LBPH operator and grid parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
    /// Predictions at or beyond this distance are treated as unknown.
    pub threshold: f64,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: DEFAULT_RADIUS,
            neighbors: DEFAULT_NEIGHBORS,
            grid_x: DEFAULT_GRID,
            grid_y: DEFAULT_GRID,
            threshold: f64::MAX,
        }
    }
}

impl LbphParams {
    fn validate(&self) -> Result<(), RecognizerError> {
        if self.radius == 0 {
            return Err(RecognizerError::InvalidParams("radius must be at least 1".into()));
        }
        if self.neighbors == 0 || self.neighbors > MAX_NEIGHBORS {
            return Err(RecognizerError::InvalidParams(format!(
                "neighbors must be in 1..={MAX_NEIGHBORS}, got {}",
                self.neighbors
            )));
        }
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(RecognizerError::InvalidParams("grid must be at least 1x1".into()));
        }
        Ok(())
    }

    fn bins(&self) -> usize {
        1usize << self.neighbors
    }

    /// Length of one spatial histogram.
    pub fn histogram_len(&self) -> usize {
        self.bins() * (self.grid_x * self.grid_y) as usize
    }
}

/// Result of a prediction: the nearest label and its distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: i32,
    pub distance: f64,
}

/// A trained (or empty) LBPH model. Serializable as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    params: LbphParams,
    histograms: Vec<Vec<f32>>,
    labels: Vec<i32>,
}

impl Default for LbphModel {
    fn default() -> Self {
        Self::new(LbphParams::default())
    }
}

impl LbphModel {
    pub fn new(params: LbphParams) -> Self {
        Self {
            params,
            histograms: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn params(&self) -> &LbphParams {
        &self.params
    }

    /// Number of training samples held by the model.
    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }

    pub fn labels(&self) -> &[i32] {
        &self.labels
    }

    /// Train from scratch, discarding any previous samples.
    pub fn train(&mut self, faces: &[GrayImage], labels: &[i32]) -> Result<(), RecognizerError> {
        self.params.validate()?;
        if faces.is_empty() {
            return Err(RecognizerError::EmptyTrainingSet);
        }
        if faces.len() != labels.len() {
            return Err(RecognizerError::LabelCountMismatch {
                faces: faces.len(),
                labels: labels.len(),
            });
        }

        let histograms = faces
            .iter()
            .map(|face| spatial_histogram(face, &self.params))
            .collect::<Result<Vec<_>, _>>()?;

        self.histograms = histograms;
        self.labels = labels.to_vec();

        tracing::debug!(
            samples = self.histograms.len(),
            histogram_len = self.params.histogram_len(),
            "LBPH model trained"
        );

        Ok(())
    }

    /// Find the nearest training sample. `None` when nothing is under the threshold.
    pub fn predict(&self, face: &GrayImage) -> Result<Option<Prediction>, RecognizerError> {
        if self.histograms.is_empty() {
            return Err(RecognizerError::NotTrained);
        }
        let query = spatial_histogram(face, &self.params)?;

        let mut best: Option<Prediction> = None;
        for (hist, &label) in self.histograms.iter().zip(&self.labels) {
            let distance = chi_square_alt(hist, &query);
            let closer = best.map_or(true, |b| distance < b.distance);
            if closer && distance < self.params.threshold {
                best = Some(Prediction { label, distance });
            }
        }

        Ok(best)
    }

    /// Check that a deserialized model is internally consistent.
    pub fn validate(&self) -> Result<(), RecognizerError> {
        self.params.validate()?;
        if self.histograms.len() != self.labels.len() {
            return Err(RecognizerError::Inconsistent(format!(
                "{} histograms but {} labels",
                self.histograms.len(),
                self.labels.len()
            )));
        }
        let expected = self.params.histogram_len();
        if let Some(bad) = self.histograms.iter().position(|h| h.len() != expected) {
            return Err(RecognizerError::Inconsistent(format!(
                "histogram {bad} has {} bins, expected {expected}",
                self.histograms[bad].len()
            )));
        }
        Ok(())
    }
}

/// Extended (circular) LBP codes, row-major, `(w - 2r) x (h - 2r)`.
fn elbp(image: &GrayImage, radius: u32, neighbors: u32) -> (Vec<u32>, usize, usize) {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let r = radius as usize;
    let out_w = w.saturating_sub(2 * r);
    let out_h = h.saturating_sub(2 * r);
    let mut codes = vec![0u32; out_w * out_h];
    if out_w == 0 || out_h == 0 {
        return (codes, out_w, out_h);
    }

    let src = image.as_raw();
    let px = |y: isize, x: isize| src[y as usize * w + x as usize] as f32;

    for n in 0..neighbors {
        let angle = 2.0 * PI * n as f64 / neighbors as f64;
        let sx = (radius as f64 * angle.cos()) as f32;
        let sy = (-(radius as f64) * angle.sin()) as f32;

        let (fx, fy) = (sx.floor() as isize, sy.floor() as isize);
        let (cx, cy) = (sx.ceil() as isize, sy.ceil() as isize);
        let tx = sx - fx as f32;
        let ty = sy - fy as f32;

        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for i in r..h - r {
            for j in r..w - r {
                let (yi, xj) = (i as isize, j as isize);
                let t = w1 * px(yi + fy, xj + fx)
                    + w2 * px(yi + fy, xj + cx)
                    + w3 * px(yi + cy, xj + fx)
                    + w4 * px(yi + cy, xj + cx);
                let center = px(yi, xj);
                if t > center || (t - center).abs() < f32::EPSILON {
                    codes[(i - r) * out_w + (j - r)] |= 1 << n;
                }
            }
        }
    }

    (codes, out_w, out_h)
}

/// Concatenated per-cell LBP histograms, each normalized by the cell area.
fn spatial_histogram(face: &GrayImage, params: &LbphParams) -> Result<Vec<f32>, RecognizerError> {
    let (codes, w, h) = elbp(face, params.radius, params.neighbors);
    let (gx, gy) = (params.grid_x as usize, params.grid_y as usize);
    let (cell_w, cell_h) = (w / gx, h / gy);
    if cell_w == 0 || cell_h == 0 {
        return Err(RecognizerError::FaceTooSmall {
            width: face.width(),
            height: face.height(),
            radius: params.radius,
            grid_x: params.grid_x,
            grid_y: params.grid_y,
        });
    }

    let bins = params.bins();
    let cell_area = (cell_w * cell_h) as f32;
    let mut result = Vec::with_capacity(bins * gx * gy);

    for row in 0..gy {
        for col in 0..gx {
            let mut hist = vec![0f32; bins];
            for y in row * cell_h..(row + 1) * cell_h {
                for x in col * cell_w..(col + 1) * cell_w {
                    hist[codes[y * w + x] as usize] += 1.0;
                }
            }
            result.extend(hist.into_iter().map(|c| c / cell_area));
        }
    }

    Ok(result)
}

/// Alternative chi-square distance: `2 * sum((a - b)^2 / (a + b))`.
fn chi_square_alt(a: &[f32], b: &[f32]) -> f64 {
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| {
            let (x, y) = (x as f64, y as f64);
            let denom = x + y;
            if denom.abs() > f64::EPSILON {
                (x - y) * (x - y) / denom
            } else {
                0.0
            }
        })
        .sum();
    2.0 * sum
}
