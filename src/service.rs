//
// service.rs
// Dicom-Frames-rs
//
// Render service: resolves an asset, extracts one frame, windows it and encodes it, tracing each stage.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::DecodeCache;
use crate::config::ServiceConfig;
use crate::error::{RenderError, Result};
use crate::metadata::{self, ExtractedAsset};
use crate::models::{
    FrameMetadata, MetadataWarning, OutputFormat, PixelEncoding, RenderedFrame, StudyRecord,
    StudySummary,
};
use crate::registry::{AssetRegistry, ConflictPolicy, RegistrationOutcome};
use crate::render::{self, SizeHint};
use crate::storage::FileStore;
use crate::window::{self, WindowingMode};

/// Progress of one render request. A failure is reported with the last stage reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    Requested,
    MetadataResolved,
    FrameExtracted,
    Windowed,
    Encoded,
    Delivered,
}

impl fmt::Display for RenderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RenderStage::Requested => "requested",
            RenderStage::MetadataResolved => "metadata-resolved",
            RenderStage::FrameExtracted => "frame-extracted",
            RenderStage::Windowed => "windowed",
            RenderStage::Encoded => "encoded",
            RenderStage::Delivered => "delivered",
        };
        f.write_str(name)
    }
}

/// Result of an ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct Ingested {
    pub asset_id: String,
    pub warnings: Vec<MetadataWarning>,
    #[serde(skip)]
    pub outcome: RegistrationOutcome,
}

/// Viewer-facing response: encoded bytes plus a description of the frame.
#[derive(Debug, Clone)]
pub struct ViewerFrame {
    pub image_bytes: Vec<u8>,
    pub format: OutputFormat,
    pub asset_id: String,
    pub metadata: FrameMetadata,
}

pub struct RenderService {
    registry: Arc<AssetRegistry>,
    cache: Arc<DecodeCache>,
    store: FileStore,
    config: ServiceConfig,
}

impl RenderService {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let registry = Arc::new(AssetRegistry::open(&config.storage_root)?);
        let cache = Arc::new(DecodeCache::new(config.cache_budget_bytes));
        let store = FileStore::new(config.uploads_dir())?;
        Ok(Self::from_parts(config, registry, cache, store))
    }

    pub fn from_parts(
        config: ServiceConfig,
        registry: Arc<AssetRegistry>,
        cache: Arc<DecodeCache>,
        store: FileStore,
    ) -> Self {
        Self {
            registry,
            cache,
            store,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<DecodeCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<AssetRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Stores uploaded bytes, extracts their header and registers them.
    pub async fn ingest(
        &self,
        bytes: Vec<u8>,
        patient_id: &str,
        origin_filename: &str,
        policy: ConflictPolicy,
    ) -> Result<Ingested> {
        let store = self.store.clone();
        let name = origin_filename.to_string();
        let extracted = tokio::task::spawn_blocking(move || {
            let stored = store.save(Some(&name), &bytes)?;
            // Records keep the canonical path so they stay valid from any working directory.
            let path = store.resolve(&stored.filename)?;
            metadata::read_header(&path, stored.content_id, stored.byte_size)
        })
        .await??;
        self.register_extracted(extracted, patient_id, origin_filename, policy)
            .await
    }

    /// Registers a file in place, without copying it into the upload store.
    pub async fn ingest_path(
        &self,
        path: &Path,
        patient_id: &str,
        policy: ConflictPolicy,
    ) -> Result<Ingested> {
        let owned: PathBuf = path.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || metadata::read_asset(&owned)).await??;
        let origin_filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed.dcm")
            .to_string();
        self.register_extracted(extracted, patient_id, &origin_filename, policy)
            .await
    }

    pub async fn register_extracted(
        &self,
        extracted: ExtractedAsset,
        patient_id: &str,
        origin_filename: &str,
        policy: ConflictPolicy,
    ) -> Result<Ingested> {
        for warning in &extracted.warnings {
            debug!(field = %warning.field, "{}", warning.message);
        }
        let registration = self
            .registry
            .register_with(
                &extracted.asset,
                patient_id,
                origin_filename,
                chrono::Utc::now().date_naive(),
                policy,
            )
            .await?;
        if registration.outcome == RegistrationOutcome::Replaced {
            self.cache.invalidate(&registration.asset_id);
        }
        Ok(Ingested {
            asset_id: registration.asset_id,
            warnings: extracted.warnings,
            outcome: registration.outcome,
        })
    }

    pub async fn lookup(&self, asset_id: &str) -> Result<StudyRecord> {
        self.registry.lookup(asset_id).await
    }

    pub async fn list_for_patient(&self, patient_id: &str) -> Result<Vec<StudySummary>> {
        let records = self.registry.list_for_patient(patient_id).await?;
        Ok(records.iter().map(StudySummary::from).collect())
    }

    /// Renders one frame of a registered asset.
    pub async fn render(
        &self,
        asset_id: &str,
        frame_index: u32,
        mode: WindowingMode,
        format: OutputFormat,
        size: SizeHint,
    ) -> Result<RenderedFrame> {
        let record = self.registry.lookup(asset_id).await?;
        self.render_record(&record, frame_index, mode, format, size)
            .await
    }

    /// Viewer entry point: resolves the newest study for a patient's filename and renders it.
    pub async fn render_for_viewer(
        &self,
        patient_id: &str,
        origin_filename: &str,
        frame_index: u32,
        mode: WindowingMode,
        format: OutputFormat,
        size: SizeHint,
    ) -> Result<ViewerFrame> {
        let record = self.registry.find(patient_id, origin_filename).await?;
        let rendered = self
            .render_record(&record, frame_index, mode, format, size)
            .await?;
        let asset = &record.metadata;
        Ok(ViewerFrame {
            image_bytes: rendered.bytes,
            format: rendered.format,
            asset_id: rendered.asset_id,
            metadata: FrameMetadata {
                rows: asset.rows,
                columns: asset.columns,
                bits_allocated: asset.bits_allocated,
                frame_count: asset.frame_count,
                extracted_frame: rendered.frame_index,
            },
        })
    }

    /// First frame fitted into the configured thumbnail box, PNG encoded.
    pub async fn thumbnail(&self, asset_id: &str) -> Result<RenderedFrame> {
        self.render(
            asset_id,
            0,
            WindowingMode::default(),
            OutputFormat::Png,
            SizeHint::bounding(self.config.thumbnail_edge),
        )
        .await
    }

    async fn render_record(
        &self,
        record: &StudyRecord,
        frame_index: u32,
        mode: WindowingMode,
        format: OutputFormat,
        size: SizeHint,
    ) -> Result<RenderedFrame> {
        let started = Instant::now();
        let mut stage = RenderStage::Requested;
        let asset_id = record.asset_id.as_str();
        let result = self
            .run_stages(record, frame_index, mode, format, size, &mut stage)
            .await;

        match &result {
            Ok(frame) => info!(
                asset_id,
                frame = frame_index,
                stage = %RenderStage::Delivered,
                width = frame.width,
                height = frame.height,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "frame rendered"
            ),
            Err(err) => warn!(
                asset_id,
                frame = frame_index,
                failed_after = %stage,
                kind = err.kind(),
                "render failed: {}",
                err
            ),
        }
        result
    }

    async fn run_stages(
        &self,
        record: &StudyRecord,
        frame_index: u32,
        mode: WindowingMode,
        format: OutputFormat,
        size: SizeHint,
        stage: &mut RenderStage,
    ) -> Result<RenderedFrame> {
        let asset_id = record.asset_id.clone();
        let asset = Arc::new(record.metadata.clone());

        // Bounds and encoding are settled from metadata alone, before any decode.
        if frame_index >= asset.frame_count {
            return Err(RenderError::FrameIndexOutOfBounds {
                requested: frame_index,
                available: asset.frame_count,
            });
        }
        if asset.encoding == PixelEncoding::Compressed {
            return Err(RenderError::UnsupportedEncoding {
                transfer_syntax: asset.transfer_syntax.clone(),
                reason: "compressed pixel data is not decoded".into(),
            });
        }
        advance(stage, RenderStage::MetadataResolved, &asset_id);

        let pixels = self.cache.get_or_decode(&asset_id, &asset).await?;
        let frame = tokio::task::spawn_blocking(move || pixels.frame(frame_index)).await??;
        advance(stage, RenderStage::FrameExtracted, &asset_id);

        // Each CPU stage is spawned only after the previous one was awaited,
        // so a dropped request stops before windowing or encoding begins.
        let windowing_asset = Arc::clone(&asset);
        let windowed = tokio::task::spawn_blocking(move || {
            if tracing::enabled!(tracing::Level::DEBUG) {
                let stats = window::frame_statistics(&frame);
                debug!(
                    frame = frame.index,
                    min = stats.min,
                    max = stats.max,
                    mean = stats.mean,
                    "frame statistics"
                );
            }
            window::window_frame(&frame, &windowing_asset, mode)
        })
        .await??;
        debug!(
            center = windowed.parameters.center,
            width = windowed.parameters.width,
            source = ?windowed.parameters.source,
            "window applied"
        );
        advance(stage, RenderStage::Windowed, &asset_id);

        let max_edge = self.config.max_output_edge;
        let raster = tokio::task::spawn_blocking(move || {
            render::encode_frame(&windowed.pixels, format, size, max_edge)
        })
        .await??;
        advance(stage, RenderStage::Encoded, &asset_id);

        Ok(RenderedFrame {
            bytes: raster.bytes,
            width: raster.width,
            height: raster.height,
            frame_index,
            asset_id,
            format,
        })
    }
}

fn advance(stage: &mut RenderStage, next: RenderStage, asset_id: &str) {
    debug!(asset_id, from = %stage, to = %next, "render stage");
    *stage = next;
}
