use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::metadata::{self, ExtractedAsset};
use crate::registry::ConflictPolicy;
use crate::service::RenderService;

/// One file found under a batch directory.
pub struct ScannedFile {
    pub path: PathBuf,
    /// Path relative to the scanned root, `/`-separated; used as the origin filename.
    pub origin_filename: String,
    pub extracted: Result<ExtractedAsset>,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub ingested: Vec<(String, String)>,
    pub failed: Vec<(String, String)>,
}

fn is_dicom(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("dcm"))
}

fn origin_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Reads the header of every `.dcm` file under `dir` in parallel.
pub fn scan_directory(dir: &Path) -> Vec<ScannedFile> {
    let files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_dicom(e.path()))
        .map(|e| e.into_path())
        .collect();

    info!(directory = %dir.display(), files = files.len(), "scanning directory");

    let mut scanned: Vec<ScannedFile> = files
        .into_par_iter()
        .map(|path| ScannedFile {
            origin_filename: origin_name(dir, &path),
            extracted: metadata::read_asset(&path),
            path,
        })
        .collect();
    scanned.sort_by(|a, b| a.origin_filename.cmp(&b.origin_filename));
    scanned
}

/// Scans `dir` and registers every readable file for `patient_id`, in place.
pub async fn ingest_directory(
    service: &RenderService,
    dir: &Path,
    patient_id: &str,
    policy: ConflictPolicy,
) -> Result<BatchReport> {
    let root = dir.to_path_buf();
    let scanned = tokio::task::spawn_blocking(move || scan_directory(&root)).await?;

    let mut report = BatchReport::default();
    for file in scanned {
        let outcome = match file.extracted {
            Ok(extracted) => {
                service
                    .register_extracted(extracted, patient_id, &file.origin_filename, policy)
                    .await
            }
            Err(err) => Err(err),
        };
        match outcome {
            Ok(ingested) => report.ingested.push((file.origin_filename, ingested.asset_id)),
            Err(err) => {
                warn!(path = %file.path.display(), kind = err.kind(), "skipping file: {}", err);
                report.failed.push((file.origin_filename, err.to_string()));
            }
        }
    }
    Ok(report)
}
