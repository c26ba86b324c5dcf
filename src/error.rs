//
// error.rs
// Dicom-Frames-rs
//
// Typed failure taxonomy shared by extraction, windowing, rendering, and the asset registry.
//
// Thales Matheus Mendonça Santos - November 2025

use thiserror::Error;

/// Every failure a render or registry call can surface to its caller.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Header or pixel declaration missing or inconsistent. Not retried.
    #[error("Unreadable asset: {0}")]
    UnreadableAsset(String),

    #[error("Unsupported encoding: transfer syntax {transfer_syntax} ({reason})")]
    UnsupportedEncoding {
        transfer_syntax: String,
        reason: String,
    },

    #[error("Frame index {requested} out of bounds ({available} frame(s) available)")]
    FrameIndexOutOfBounds { requested: u32, available: u32 },

    #[error("Degenerate window: {0}")]
    DegenerateWindow(String),

    #[error("Registry conflict: asset {asset_id} already registered with different content")]
    RegistryConflict { asset_id: String },

    #[error("Encoding failure: {0}")]
    EncodingFailure(String),

    #[error("Asset not found: {0}")]
    NotFound(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RenderError {
    pub fn unreadable(reason: impl Into<String>) -> Self {
        RenderError::UnreadableAsset(reason.into())
    }

    /// Short machine-readable name of the failure kind, used in logs and HTTP payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::UnreadableAsset(_) => "UnreadableAsset",
            RenderError::UnsupportedEncoding { .. } => "UnsupportedEncoding",
            RenderError::FrameIndexOutOfBounds { .. } => "FrameIndexOutOfBounds",
            RenderError::DegenerateWindow(_) => "DegenerateWindow",
            RenderError::RegistryConflict { .. } => "RegistryConflict",
            RenderError::EncodingFailure(_) => "EncodingFailure",
            RenderError::NotFound(_) => "NotFound",
            RenderError::TaskFailed(_) => "TaskFailed",
            RenderError::Storage(_) => "Storage",
            RenderError::Serialization(_) => "Serialization",
        }
    }

    /// Copy of a failure shared between several waiters. I/O errors keep their kind.
    pub fn duplicate(&self) -> Self {
        match self {
            RenderError::UnreadableAsset(reason) => RenderError::UnreadableAsset(reason.clone()),
            RenderError::UnsupportedEncoding {
                transfer_syntax,
                reason,
            } => RenderError::UnsupportedEncoding {
                transfer_syntax: transfer_syntax.clone(),
                reason: reason.clone(),
            },
            RenderError::FrameIndexOutOfBounds {
                requested,
                available,
            } => RenderError::FrameIndexOutOfBounds {
                requested: *requested,
                available: *available,
            },
            RenderError::DegenerateWindow(reason) => RenderError::DegenerateWindow(reason.clone()),
            RenderError::RegistryConflict { asset_id } => RenderError::RegistryConflict {
                asset_id: asset_id.clone(),
            },
            RenderError::EncodingFailure(reason) => RenderError::EncodingFailure(reason.clone()),
            RenderError::NotFound(what) => RenderError::NotFound(what.clone()),
            RenderError::TaskFailed(reason) => RenderError::TaskFailed(reason.clone()),
            RenderError::Storage(err) => {
                RenderError::Storage(std::io::Error::new(err.kind(), err.to_string()))
            }
            RenderError::Serialization(err) => RenderError::TaskFailed(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for RenderError {
    fn from(err: tokio::task::JoinError) -> Self {
        RenderError::TaskFailed(err.to_string())
    }
}

pub type Result<T, E = RenderError> = std::result::Result<T, E>;
