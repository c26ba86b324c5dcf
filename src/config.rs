//
// config.rs
// Dicom-Frames-rs
//
// Runtime settings shared by the CLI and the HTTP server.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_CACHE_BUDGET;
use crate::render::{MAX_OUTPUT_EDGE, THUMBNAIL_EDGE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Holds `records/` (registry) and `uploads/` (ingested bytes).
    pub storage_root: PathBuf,
    pub cache_budget_bytes: usize,
    pub thumbnail_edge: u32,
    /// Upper bound on the width or height of a resized frame.
    pub max_output_edge: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("target/dicom-frames"),
            cache_budget_bytes: DEFAULT_CACHE_BUDGET,
            thumbnail_edge: THUMBNAIL_EDGE,
            max_output_edge: MAX_OUTPUT_EDGE,
        }
    }
}

impl ServiceConfig {
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            storage_root: root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.storage_root.join("uploads")
    }
}
