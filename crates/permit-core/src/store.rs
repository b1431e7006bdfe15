//! Per-identity model storage.
//!
//! Each identity owns at most one serialized [`LbphModel`]. The filesystem
//! store keeps them as `<dir>/<identity>.yml` and replaces files atomically
//! (write to a temporary sibling, then rename), so readers see either the
//! old model or the new one.

use crate::recognizer::LbphModel;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MODEL_EXTENSION: &str = "yml";
const MAX_IDENTITY_LEN: usize = 255;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid identity {0:?}")]
    InvalidIdentity(String),
    #[error("no model stored for identity {0:?}")]
    NotFound(String),
    #[error("model for identity {identity:?} is corrupt: {reason}")]
    Corrupt { identity: String, reason: String },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Storage of one recognition model per identity.
pub trait ModelStore: Send + Sync {
    /// Load the model for `identity`. Fails with [`StoreError::NotFound`] if absent.
    fn get(&self, identity: &str) -> Result<LbphModel, StoreError>;
    /// Store `model` for `identity`, replacing any previous one.
    fn put(&self, identity: &str, model: &LbphModel) -> Result<(), StoreError>;
    /// Remove the model. Returns whether one existed.
    fn delete(&self, identity: &str) -> Result<bool, StoreError>;
    fn exists(&self, identity: &str) -> Result<bool, StoreError>;
}

/// Reject identities that cannot be used verbatim as a file name.
pub fn validate_identity(identity: &str) -> Result<(), StoreError> {
    let valid = !identity.is_empty()
        && identity.len() <= MAX_IDENTITY_LEN
        && !identity.starts_with('.')
        && !identity.chars().any(|c| c == '/' || c == '\\' || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentity(identity.to_string()))
    }
}

/// Directory-backed model store.
#[derive(Debug, Clone)]
pub struct FsModelStore {
    dir: PathBuf,
}

impl FsModelStore {
    /// Open (and create if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        tracing::debug!(dir = %dir.display(), "model store opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path holding the model for `identity`.
    pub fn model_path(&self, identity: &str) -> Result<PathBuf, StoreError> {
        validate_identity(identity)?;
        Ok(self.dir.join(format!("{identity}.{MODEL_EXTENSION}")))
    }
}

impl ModelStore for FsModelStore {
    fn get(&self, identity: &str) -> Result<LbphModel, StoreError> {
        let path = self.model_path(identity)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(identity.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let corrupt = |reason: String| StoreError::Corrupt {
            identity: identity.to_string(),
            reason,
        };
        let model: LbphModel = serde_json::from_slice(&data).map_err(|e| corrupt(e.to_string()))?;
        model.validate().map_err(|e| corrupt(e.to_string()))?;

        Ok(model)
    }

    fn put(&self, identity: &str, model: &LbphModel) -> Result<(), StoreError> {
        let path = self.model_path(identity)?;
        let encoded = serde_json::to_vec(model)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".model-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        tmp.write_all(&encoded)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;

        tracing::debug!(identity, path = %path.display(), bytes = encoded.len(), "model stored");
        Ok(())
    }

    fn delete(&self, identity: &str) -> Result<bool, StoreError> {
        let path = self.model_path(identity)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.model_path(identity)?.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn trained(samples: usize, seed: u32) -> LbphModel {
        let face = GrayImage::from_fn(50, 50, |x, y| Luma([((x * seed + y * 3) % 256) as u8]));
        let faces = vec![face; samples];
        let labels = vec![1; samples];
        let mut model = LbphModel::default();
        model.train(&faces, &labels).unwrap();
        model
    }

    fn store() -> (tempfile::TempDir, FsModelStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsModelStore::open(dir.path().join("database")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_then_get() {
        let (_dir, store) = store();
        store.put("alice", &trained(3, 7)).unwrap();
        let model = store.get("alice").unwrap();
        assert_eq!(model.len(), 3);
        assert_eq!(model.labels(), &[1, 1, 1]);
        assert!(store.dir().join("alice.yml").is_file());
    }

    #[test]
    fn test_get_missing() {
        let (_dir, store) = store();
        assert!(matches!(store.get("nobody"), Err(StoreError::NotFound(_))));
        assert!(!store.exists("nobody").unwrap());
    }

    #[test]
    fn test_put_replaces_model() {
        let (_dir, store) = store();
        store.put("alice", &trained(3, 7)).unwrap();
        store.put("alice", &trained(1, 11)).unwrap();
        assert_eq!(store.get("alice").unwrap().len(), 1);
    }

    #[test]
    fn test_identities_are_isolated() {
        let (_dir, store) = store();
        store.put("bob", &trained(2, 5)).unwrap();
        let before = fs::read(store.model_path("bob").unwrap()).unwrap();
        store.put("alice", &trained(3, 7)).unwrap();
        let after = fs::read(store.model_path("bob").unwrap()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_no_temporary_files_left() {
        let (_dir, store) = store();
        store.put("alice", &trained(1, 7)).unwrap();
        store.put("alice", &trained(1, 9)).unwrap();
        let names: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["alice.yml".to_string()]);
    }

    #[test]
    fn test_readers_never_see_partial_model() {
        let (_dir, store) = store();
        let small = trained(1, 7);
        let large = trained(6, 11);
        store.put("alice", &small).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..40 {
                    let model = if i % 2 == 0 { &large } else { &small };
                    store.put("alice", model).unwrap();
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        let model = store.get("alice").unwrap();
                        assert!(model.len() == 1 || model.len() == 6, "got {} samples", model.len());
                    }
                });
            }
        });
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = store();
        store.put("alice", &trained(1, 7)).unwrap();
        assert!(store.delete("alice").unwrap());
        assert!(!store.delete("alice").unwrap());
        assert!(matches!(store.get("alice"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_corrupt_file() {
        let (_dir, store) = store();
        fs::write(store.model_path("alice").unwrap(), b"{ not a model").unwrap();
        assert!(matches!(store.get("alice"), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_invalid_identities() {
        let (_dir, store) = store();
        for bad in ["", "../alice", "a/b", "a\\b", ".hidden", "..", "tab\there"] {
            assert!(
                matches!(store.put(bad, &trained(1, 7)), Err(StoreError::InvalidIdentity(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_identity("uid_123-ABC@example.com").is_ok());
    }
}
