//! Viola-Jones Haar cascade face detector.
//!
//! Loads boosted cascades in the OpenCV XML format (for example
//! `haarcascade_frontalface_default.xml`), scans the image at multiple
//! scales with integral images, and merges overlapping candidates with
//! the classic `groupRectangles` clustering.

use crate::types::{DetectParams, FaceRegion};
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::Deserialize;
use std::borrow::Cow;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const GROUP_EPS: f64 = 0.2;
const STAGE_THRESHOLD_EPS: f64 = 1e-5;
const MAX_FEATURE_RECTS: usize = 3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade file not found: {0}")]
    CascadeNotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("cascade XML could not be parsed: {0}")]
    Xml(#[from] quick_xml::de::DeError),
    #[error("malformed cascade: {0}")]
    Malformed(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid detection parameters: {0}")]
    InvalidParams(String),
}

/// Anything that can find face rectangles in a grayscale image.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &GrayImage, params: &DetectParams) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// One weighted rectangle of a Haar feature, in window coordinates.
#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

/// Split node of a weak classifier tree. Child indices `<= 0` point at leaves.
#[derive(Debug, Clone, Copy)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<Node>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    classifiers: Vec<WeakClassifier>,
}

/// Haar cascade classifier.
#[derive(Debug, Clone)]
pub struct CascadeDetector {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl CascadeDetector {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DetectorError::CascadeNotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let detector = Self::from_xml(&xml)?;

        tracing::info!(
            path = %path.display(),
            window = ?(detector.window_width, detector.window_height),
            stages = detector.stages.len(),
            features = detector.features.len(),
            "loaded Haar cascade"
        );

        Ok(detector)
    }

    /// Parse a cascade from OpenCV XML text.
    pub fn from_xml(xml: &str) -> Result<Self, DetectorError> {
        let storage: StorageXml = quick_xml::de::from_str(xml)?;
        let cascade = storage.cascade.ok_or_else(|| {
            DetectorError::Unsupported("no <cascade> node (legacy cascade format?)".into())
        })?;
        Self::from_parsed(cascade)
    }

    /// Cascade window size as (width, height).
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    fn from_parsed(cascade: CascadeXml) -> Result<Self, DetectorError> {
        if cascade.stage_type.trim() != "BOOST" {
            return Err(DetectorError::Unsupported(format!("stage type {}", cascade.stage_type.trim())));
        }
        if cascade.feature_type.trim() != "HAAR" {
            return Err(DetectorError::Unsupported(format!("feature type {}", cascade.feature_type.trim())));
        }

        let window_width: u32 = parse_number(&cascade.width, "width")?;
        let window_height: u32 = parse_number(&cascade.height, "height")?;
        if window_width < 3 || window_height < 3 {
            return Err(DetectorError::Malformed(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let features = cascade
            .features
            .items
            .iter()
            .enumerate()
            .map(|(i, f)| parse_feature(i, f, window_width, window_height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = cascade
            .stages
            .items
            .iter()
            .enumerate()
            .map(|(i, s)| parse_stage(i, s, features.len()))
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err(DetectorError::Malformed("cascade has no stages".into()));
        }

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    /// Run the full cascade on the window whose top-left corner is (wx, wy).
    fn classify(&self, integral: &IntegralImage, wx: u32, wy: u32) -> bool {
        let (nw, nh) = (self.window_width - 2, self.window_height - 2);
        let sum = integral.sum(wx + 1, wy + 1, nw, nh) as f64;
        let sqsum = integral.sqsum(wx + 1, wy + 1, nw, nh) as f64;
        let area = (nw * nh) as f64;
        let nf = area * sqsum - sum * sum;
        let nf = if nf > 0.0 { nf.sqrt() } else { 1.0 };
        let inv_norm = 1.0 / nf;

        for stage in &self.stages {
            let mut stage_sum = 0.0;
            for weak in &stage.classifiers {
                let mut idx = 0usize;
                loop {
                    let node = weak.nodes[idx];
                    let value = self.feature_value(node.feature, integral, wx, wy) * inv_norm;
                    let next = if value < node.threshold { node.left } else { node.right };
                    if next <= 0 {
                        stage_sum += weak.leaves[(-next) as usize];
                        break;
                    }
                    idx = next as usize;
                }
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }

    fn feature_value(&self, feature: usize, integral: &IntegralImage, wx: u32, wy: u32) -> f64 {
        self.features[feature]
            .rects
            .iter()
            .map(|r| r.weight * integral.sum(wx + r.x, wy + r.y, r.width, r.height) as f64)
            .sum()
    }
}

impl FaceDetector for CascadeDetector {
    /// Multi-scale detection. Regions are returned in cluster order.
    fn detect(&self, image: &GrayImage, params: &DetectParams) -> Result<Vec<FaceRegion>, DetectorError> {
        if !(params.scale_factor > 1.0) {
            return Err(DetectorError::InvalidParams(format!(
                "scale factor must be greater than 1, got {}",
                params.scale_factor
            )));
        }

        let (width, height) = image.dimensions();
        let (ww, wh) = (self.window_width, self.window_height);
        let (max_w, max_h) = params.max_size.unwrap_or((width, height));
        let (min_w, min_h) = params.min_size;

        let mut candidates = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let win_w = (ww as f64 * factor).round() as u32;
            let win_h = (wh as f64 * factor).round() as u32;
            if win_w > max_w || win_h > max_h {
                break;
            }

            let scaled_w = (width as f64 / factor).round() as u32;
            let scaled_h = (height as f64 / factor).round() as u32;
            if scaled_w <= ww || scaled_h <= wh {
                break;
            }

            if win_w >= min_w && win_h >= min_h {
                let scaled: Cow<'_, GrayImage> = if scaled_w == width && scaled_h == height {
                    Cow::Borrowed(image)
                } else {
                    Cow::Owned(imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle))
                };
                let integral = IntegralImage::new(&scaled);
                let step = if factor > 2.0 { 1 } else { 2 };

                for y in (0..scaled_h - wh).step_by(step) {
                    for x in (0..scaled_w - ww).step_by(step) {
                        if self.classify(&integral, x, y) {
                            candidates.push(Rect {
                                x: (x as f64 * factor).round() as i32,
                                y: (y as f64 * factor).round() as i32,
                                width: win_w as i32,
                                height: win_h as i32,
                            });
                        }
                    }
                }
            }

            factor *= params.scale_factor;
        }

        let raw = candidates.len();
        let grouped = group_rectangles(candidates, params.min_neighbors, GROUP_EPS);

        tracing::debug!(
            width,
            height,
            scale_factor = params.scale_factor,
            min_neighbors = params.min_neighbors,
            candidates = raw,
            faces = grouped.len(),
            "cascade detection finished"
        );

        Ok(grouped
            .into_iter()
            .map(|r| {
                let x = r.x.max(0) as u32;
                let y = r.y.max(0) as u32;
                FaceRegion::new(x, y, r.width.max(0) as u32, r.height.max(0) as u32)
            })
            .collect())
    }
}

/// Summed-area tables for pixel values and squared pixel values.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sqsum: Vec<u64>,
}

impl IntegralImage {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sqsum = vec![0u64; stride * (h + 1)];
        let raw = image.as_raw();

        for y in 0..h {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = raw[y * w + x] as u64;
                row_sum += p;
                row_sq += p * p;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sqsum[(y + 1) * stride + x + 1] = sqsum[y * stride + x + 1] + row_sq;
            }
        }

        Self { stride, sum, sqsum }
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::area(&self.sum, self.stride, x, y, w, h)
    }

    fn sqsum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::area(&self.sqsum, self.stride, x, y, w, h)
    }

    fn area(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0] - table[y0 * stride + x1] - table[y1 * stride + x0]
    }
}

/// Candidate rectangle before grouping; signed like the averaging math.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
}

fn similar_rects(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    ((a.x - b.x).abs() as f64) <= delta
        && ((a.y - b.y).abs() as f64) <= delta
        && ((a.x + a.width - b.x - b.width).abs() as f64) <= delta
        && ((a.y + a.height - b.y - b.height).abs() as f64) <= delta
}

/// Cluster similar rectangles and average each cluster.
///
/// Clusters with `group_threshold` or fewer members are dropped, as are
/// clusters nested inside a stronger one. A threshold of 0 returns the
/// input unchanged.
fn group_rectangles(rects: Vec<Rect>, group_threshold: u32, eps: f64) -> Vec<Rect> {
    if group_threshold == 0 || rects.is_empty() {
        return rects;
    }
    let threshold = group_threshold as usize;

    let (labels, nclasses) = partition(&rects, |a, b| similar_rects(a, b, eps));

    let mut sums = vec![[0i64; 4]; nclasses];
    let mut counts = vec![0usize; nclasses];
    for (rect, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += rect.x as i64;
        s[1] += rect.y as i64;
        s[2] += rect.width as i64;
        s[3] += rect.height as i64;
        counts[label] += 1;
    }

    let averaged: Vec<Rect> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let inv = 1.0 / n as f64;
            Rect {
                x: (s[0] as f64 * inv).round() as i32,
                y: (s[1] as f64 * inv).round() as i32,
                width: (s[2] as f64 * inv).round() as i32,
                height: (s[3] as f64 * inv).round() as i32,
            }
        })
        .collect();

    let mut grouped = Vec::new();
    for i in 0..nclasses {
        let n1 = counts[i];
        if n1 <= threshold {
            continue;
        }
        let r1 = averaged[i];

        let nested = (0..nclasses).any(|j| {
            let n2 = counts[j];
            if j == i || n2 <= threshold {
                return false;
            }
            let r2 = averaged[j];
            let dx = (r2.width as f64 * eps).round() as i32;
            let dy = (r2.height as f64 * eps).round() as i32;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.width <= r2.x + r2.width + dx
                && r1.y + r1.height <= r2.y + r2.height + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !nested {
            grouped.push(r1);
        }
    }

    grouped
}

/// Equivalence-class labelling (union-find). Labels follow first appearance.
fn partition<T>(items: &[T], same: impl Fn(&T, &T) -> bool) -> (Vec<usize>, usize) {
    let n = items.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if same(&items[i], &items[j]) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj.max(ri)] = ri.min(rj);
                }
            }
        }
    }

    let mut root_label = vec![usize::MAX; n];
    let mut labels = Vec::with_capacity(n);
    let mut nclasses = 0;
    for i in 0..n {
        let root = find(&mut parent, i);
        if root_label[root] == usize::MAX {
            root_label[root] = nclasses;
            nclasses += 1;
        }
        labels.push(root_label[root]);
    }

    (labels, nclasses)
}

// --- OpenCV cascade XML schema ---

#[derive(Deserialize)]
struct StorageXml {
    cascade: Option<CascadeXml>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CascadeXml {
    stage_type: String,
    feature_type: String,
    height: String,
    width: String,
    stages: StagesXml,
    features: FeaturesXml,
}

#[derive(Deserialize)]
struct StagesXml {
    #[serde(rename = "_", default)]
    items: Vec<StageXml>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StageXml {
    stage_threshold: String,
    weak_classifiers: WeakClassifiersXml,
}

#[derive(Deserialize)]
struct WeakClassifiersXml {
    #[serde(rename = "_", default)]
    items: Vec<WeakClassifierXml>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WeakClassifierXml {
    internal_nodes: String,
    leaf_values: String,
}

#[derive(Deserialize)]
struct FeaturesXml {
    #[serde(rename = "_", default)]
    items: Vec<FeatureXml>,
}

#[derive(Deserialize)]
struct FeatureXml {
    rects: RectsXml,
    #[serde(default)]
    tilted: Option<String>,
}

#[derive(Deserialize)]
struct RectsXml {
    #[serde(rename = "_", default)]
    items: Vec<String>,
}

fn parse_number<T: std::str::FromStr>(text: &str, what: &str) -> Result<T, DetectorError> {
    text.trim()
        .parse()
        .map_err(|_| DetectorError::Malformed(format!("bad {what}: {:?}", text.trim())))
}

fn parse_feature(index: usize, xml: &FeatureXml, ww: u32, wh: u32) -> Result<HaarFeature, DetectorError> {
    if let Some(tilted) = &xml.tilted {
        if tilted.trim() != "0" {
            return Err(DetectorError::Unsupported(format!("feature {index} is tilted")));
        }
    }
    if xml.rects.items.is_empty() || xml.rects.items.len() > MAX_FEATURE_RECTS {
        return Err(DetectorError::Malformed(format!(
            "feature {index} has {} rects",
            xml.rects.items.len()
        )));
    }

    let rects = xml
        .rects
        .items
        .iter()
        .map(|text| {
            let parts: Vec<&str> = text.split_whitespace().collect();
            if parts.len() != 5 {
                return Err(DetectorError::Malformed(format!("feature {index}: bad rect {text:?}")));
            }
            let rect = WeightedRect {
                x: parse_number(parts[0], "rect x")?,
                y: parse_number(parts[1], "rect y")?,
                width: parse_number(parts[2], "rect width")?,
                height: parse_number(parts[3], "rect height")?,
                weight: parse_number(parts[4], "rect weight")?,
            };
            if rect.x + rect.width > ww || rect.y + rect.height > wh {
                return Err(DetectorError::Malformed(format!(
                    "feature {index}: rect {text:?} exceeds the {ww}x{wh} window"
                )));
            }
            Ok(rect)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(HaarFeature { rects })
}

fn parse_stage(index: usize, xml: &StageXml, feature_count: usize) -> Result<Stage, DetectorError> {
    let threshold: f64 = parse_number(&xml.stage_threshold, "stage threshold")?;
    let classifiers = xml
        .weak_classifiers
        .items
        .iter()
        .map(|w| parse_weak_classifier(index, w, feature_count))
        .collect::<Result<Vec<_>, _>>()?;

    if classifiers.is_empty() {
        return Err(DetectorError::Malformed(format!("stage {index} has no weak classifiers")));
    }

    Ok(Stage {
        threshold: threshold - STAGE_THRESHOLD_EPS,
        classifiers,
    })
}

fn parse_weak_classifier(
    stage: usize,
    xml: &WeakClassifierXml,
    feature_count: usize,
) -> Result<WeakClassifier, DetectorError> {
    let raw: Vec<&str> = xml.internal_nodes.split_whitespace().collect();
    if raw.is_empty() || raw.len() % 4 != 0 {
        return Err(DetectorError::Unsupported(format!(
            "stage {stage}: internal nodes must be groups of 4 values (categorical features are not supported)"
        )));
    }

    let nodes = raw
        .chunks(4)
        .map(|c| {
            Ok(Node {
                left: parse_number(c[0], "node left")?,
                right: parse_number(c[1], "node right")?,
                feature: parse_number(c[2], "node feature")?,
                threshold: parse_number(c[3], "node threshold")?,
            })
        })
        .collect::<Result<Vec<_>, DetectorError>>()?;

    let leaves = xml
        .leaf_values
        .split_whitespace()
        .map(|v| parse_number(v, "leaf value"))
        .collect::<Result<Vec<f64>, _>>()?;

    for (i, node) in nodes.iter().enumerate() {
        if node.feature >= feature_count {
            return Err(DetectorError::Malformed(format!(
                "stage {stage}: feature index {} out of range ({feature_count} features)",
                node.feature
            )));
        }
        for child in [node.left, node.right] {
            let ok = if child <= 0 {
                ((-child) as usize) < leaves.len()
            } else {
                // Children only point forward, so evaluation always terminates.
                (child as usize) > i && (child as usize) < nodes.len()
            };
            if !ok {
                return Err(DetectorError::Malformed(format!(
                    "stage {stage}: child index {child} out of range"
                )));
            }
        }
    }

    Ok(WeakClassifier { nodes, leaves })
}
