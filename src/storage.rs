//
// storage.rs
// Dicom-Frames-rs
//
// Content-addressed file store for ingested DICOM bytes, with path sanitization.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{RenderError, Result};

/// Where an ingested object landed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub filename: String,
    pub path: PathBuf,
    /// Hex SHA-256 of the stored bytes.
    pub content_id: String,
    pub byte_size: u64,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        // Create the upload directory eagerly so saves do not fail later.
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn save(&self, original_name: Option<&str>, bytes: &[u8]) -> Result<StoredObject> {
        // Sanitized stem plus a content hash: no collisions, no unsafe paths.
        let stem = original_name
            .and_then(|n| Path::new(n).file_stem().and_then(|s| s.to_str()))
            .map(sanitize_filename)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "dicom".to_string());

        let content_id = hex::encode(Sha256::digest(bytes));
        let filename = format!("{}-{}.dcm", stem, &content_id[..12]);
        let path = self.root.join(&filename);
        // Identical bytes land on the same name; keep the existing copy.
        if !path.exists() {
            let tmp = path.with_extension("dcm.part");
            fs::write(&tmp, bytes)?;
            fs::rename(&tmp, &path)?;
        }
        Ok(StoredObject {
            filename,
            path,
            content_id,
            byte_size: bytes.len() as u64,
        })
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let candidate = self.root.join(name);
        let canonical_root = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone());
        let canonical = candidate
            .canonicalize()
            .map_err(|_| RenderError::NotFound(name.to_string()))?;
        // Path traversal guard.
        if !canonical.starts_with(&canonical_root) {
            return Err(RenderError::NotFound(name.to_string()));
        }
        Ok(canonical)
    }
}

pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}
