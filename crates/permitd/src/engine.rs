use crate::passcode::generate_passcode;
use image::GrayImage;
use permit_core::store::validate_identity;
use permit_core::{
    decode, DecodeError, DecodeMode, DetectParams, DetectorError, FaceDetector, LbphModel, LbphParams,
    ModelStore, RecognizerError, StoreError,
};
use std::sync::Arc;
use thiserror::Error;

/// Every enrolled face of an identity carries this label.
pub const ENROLLED_LABEL: i32 = 1;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid identity {0:?}")]
    InvalidIdentity(String),
    #[error("image could not be decoded: {0}")]
    Decode(#[from] DecodeError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("no model registered for identity {0:?}")]
    ModelNotFound(String),
    #[error("model store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidIdentity(id) => Self::InvalidIdentity(id),
            StoreError::NotFound(id) => Self::ModelNotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Tunables for registration and authentication.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub scan_detection: DetectParams,
    pub authenticate_detection: DetectParams,
    /// Side of the square crops fed to the recognizer.
    pub face_size: u32,
    /// Minimum confidence that yields a passcode.
    pub confidence_threshold: i32,
    /// Distance that maps to zero confidence.
    pub distance_scale: f64,
    pub lbph: LbphParams,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scan_detection: DetectParams::new(1.2, 5),
            authenticate_detection: DetectParams::new(1.05, 5),
            face_size: permit_core::types::FACE_SIZE,
            confidence_threshold: 80,
            distance_scale: 425.0,
            lbph: LbphParams::default(),
        }
    }
}

/// Result of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSummary {
    pub images: usize,
    pub faces: usize,
}

/// Result of an authentication attempt that reached prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthOutcome {
    /// Present only when the face was identified.
    pub passcode: Option<String>,
    /// `None` when the recognizer found nothing under its threshold.
    pub confidence: Option<i32>,
}

/// Map a recognizer distance onto a 0–100 confidence, truncating toward zero.
pub fn confidence_from_distance(distance: f64, scale: f64) -> i32 {
    (100.0 * (1.0 - distance / scale)) as i32
}

/// Registration and authentication over an injected detector and model store.
pub struct FaceEngine {
    detector: Arc<dyn FaceDetector>,
    store: Arc<dyn ModelStore>,
    settings: EngineSettings,
}

impl FaceEngine {
    pub fn new(detector: Arc<dyn FaceDetector>, store: Arc<dyn ModelStore>, settings: EngineSettings) -> Self {
        Self {
            detector,
            store,
            settings,
        }
    }

    /// Train a fresh model from every face found in `images` and store it
    /// for `identity`, replacing any earlier model.
    ///
    /// Nothing is written when no face is found.
    pub fn register(&self, identity: &str, images: &[String]) -> Result<RegisterSummary, EngineError> {
        validate_identity(identity)?;

        let mut faces: Vec<GrayImage> = Vec::new();
        for (index, base) in images.iter().enumerate() {
            let image = decode(base, DecodeMode::Scanning)?;
            let regions = self.detector.detect(&image, &self.settings.scan_detection)?;
            tracing::debug!(identity, image = index, faces = regions.len(), "scan: faces detected");

            faces.extend(
                regions
                    .iter()
                    .filter_map(|region| region.crop_resized(&image, self.settings.face_size)),
            );
        }

        if faces.is_empty() {
            tracing::warn!(identity, images = images.len(), "scan: no face detected in any image");
            return Err(EngineError::NoFaceDetected);
        }

        let labels = vec![ENROLLED_LABEL; faces.len()];
        let mut model = LbphModel::new(self.settings.lbph);
        model.train(&faces, &labels)?;
        self.store.put(identity, &model)?;

        tracing::info!(identity, images = images.len(), faces = faces.len(), "training completed");

        Ok(RegisterSummary {
            images: images.len(),
            faces: faces.len(),
        })
    }

    /// Check the first face found in `image` against the identity's model.
    ///
    /// Any further faces in the image are ignored.
    pub fn authenticate(&self, identity: &str, image: &str) -> Result<AuthOutcome, EngineError> {
        validate_identity(identity)?;

        let image = decode(image, DecodeMode::Single)?;
        let regions = self.detector.detect(&image, &self.settings.authenticate_detection)?;
        let model = self.store.get(identity)?;

        let Some(region) = regions.first() else {
            tracing::warn!(identity, "authenticate: no face detected");
            return Err(EngineError::NoFaceDetected);
        };
        if regions.len() > 1 {
            tracing::debug!(identity, ignored = regions.len() - 1, "authenticate: using the first face only");
        }

        let face = region
            .crop_resized(&image, self.settings.face_size)
            .ok_or(EngineError::NoFaceDetected)?;

        let confidence = model
            .predict(&face)?
            .map(|p| confidence_from_distance(p.distance, self.settings.distance_scale));

        match confidence {
            Some(confidence) if confidence >= self.settings.confidence_threshold => {
                tracing::info!(identity, confidence, "identified");
                Ok(AuthOutcome {
                    passcode: Some(generate_passcode()),
                    confidence: Some(confidence),
                })
            }
            _ => {
                tracing::info!(identity, ?confidence, "person is unknown");
                Ok(AuthOutcome {
                    passcode: None,
                    confidence,
                })
            }
        }
    }
}
