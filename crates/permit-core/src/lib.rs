//! permit-core: face detection and recognition engine.
//!
//! Uses a Viola-Jones Haar cascade for face detection and local binary
//! pattern histograms (LBPH) for face recognition, both implemented on
//! 8-bit grayscale images. Trained models are kept per identity in a
//! [`ModelStore`].

pub mod decoder;
pub mod detector;
pub mod recognizer;
pub mod store;
pub mod types;

pub use decoder::{decode, DecodeError, DecodeMode};
pub use detector::{CascadeDetector, DetectorError, FaceDetector};
pub use recognizer::{LbphModel, LbphParams, Prediction, RecognizerError};
pub use store::{FsModelStore, ModelStore, StoreError};
pub use types::{DetectParams, FaceRegion};
