//
// cli.rs
// Dicom-Frames-rs
//
// Defines the CLI surface with Clap and dispatches commands to the render service.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use crate::config::ServiceConfig;
use crate::models::OutputFormat;
use crate::registry::ConflictPolicy;
use crate::render::SizeHint;
use crate::service::RenderService;
use crate::window::WindowingMode;
use crate::{batch, metadata, web};

#[derive(Parser)]
#[command(name = "dicom-frames")]
#[command(about = "Multi-frame DICOM frame extraction and rendering", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that touches the registry.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Root holding the registry records and uploaded files
    #[arg(long, global = true, default_value = "target/dicom-frames")]
    pub storage_root: PathBuf,
    /// Decode cache budget in MiB
    #[arg(long, global = true, default_value_t = 512)]
    pub cache_mb: usize,
    /// Edge of the thumbnail bounding box
    #[arg(long, global = true, default_value_t = crate::render::THUMBNAIL_EDGE)]
    pub thumbnail_edge: u32,
    /// Largest width or height a resized frame may have
    #[arg(long, global = true, default_value_t = crate::render::MAX_OUTPUT_EDGE)]
    pub max_edge: u32,
}

impl From<&Settings> for ServiceConfig {
    fn from(settings: &Settings) -> Self {
        ServiceConfig {
            storage_root: settings.storage_root.clone(),
            cache_budget_bytes: settings.cache_mb * 1024 * 1024,
            thumbnail_edge: settings.thumbnail_edge,
            max_output_edge: settings.max_edge,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the header metadata of a file without loading its pixels
    Info { file: PathBuf },
    /// Register a file, or every .dcm file under a directory, for a patient
    Ingest {
        path: PathBuf,
        #[arg(short, long)]
        patient_id: String,
        /// Overwrite an existing record holding different content
        #[arg(long)]
        replace: bool,
    },
    /// List the studies registered for a patient
    List { patient_id: String },
    /// Render one frame of a registered asset
    Render {
        asset_id: String,
        #[arg(short, long, default_value_t = 0)]
        frame: u32,
        /// auto, none, or a preset name (wide, narrow, 8-bit)
        #[arg(short, long, default_value = "none")]
        enhancement: String,
        #[arg(long, default_value = "png")]
        format: String,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Render the thumbnail instead (first frame, bounding box)
        #[arg(long)]
        thumbnail: bool,
    },
    /// Start the web server
    Web {
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value_t = 3000)]
        port: u16,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServiceConfig::from(&cli.settings);

    match cli.command {
        Commands::Info { file } => metadata::print_info(&file)?,
        Commands::Ingest {
            path,
            patient_id,
            replace,
        } => {
            let service = RenderService::new(config).context("Failed to open storage")?;
            let policy = if replace {
                ConflictPolicy::Replace
            } else {
                ConflictPolicy::Reject
            };
            if path.is_dir() {
                let report = batch::ingest_directory(&service, &path, &patient_id, policy).await?;
                for (name, asset_id) in &report.ingested {
                    println!("{}  {}", asset_id, name);
                }
                for (name, reason) in &report.failed {
                    eprintln!("failed  {}: {}", name, reason);
                }
                println!(
                    "Ingested {} file(s), {} failed",
                    report.ingested.len(),
                    report.failed.len()
                );
            } else {
                let ingested = service
                    .ingest_path(&path, &patient_id, policy)
                    .await
                    .with_context(|| format!("Failed to ingest {}", path.display()))?;
                println!("{}", ingested.asset_id);
                for warning in &ingested.warnings {
                    eprintln!("warning  {}: {}", warning.field, warning.message);
                }
            }
        }
        Commands::List { patient_id } => {
            let service = RenderService::new(config).context("Failed to open storage")?;
            let studies = service.list_for_patient(&patient_id).await?;
            if studies.is_empty() {
                println!("No studies for patient {}", patient_id);
            }
            for study in studies {
                println!(
                    "{}  {:>4} frame(s)  {}  {}",
                    study.asset_id,
                    study.frame_count,
                    study.created_at.format("%Y-%m-%d %H:%M:%S"),
                    study.origin_filename
                );
            }
        }
        Commands::Render {
            asset_id,
            frame,
            enhancement,
            format,
            width,
            height,
            output,
            thumbnail,
        } => {
            let service = RenderService::new(config).context("Failed to open storage")?;
            let format: OutputFormat = format.parse().map_err(anyhow::Error::msg)?;
            let mode: WindowingMode = enhancement.parse().map_err(anyhow::Error::msg)?;
            if thumbnail && (width.is_some() || height.is_some()) {
                bail!("--thumbnail uses the configured bounding box; drop --width/--height");
            }

            let rendered = if thumbnail {
                service.thumbnail(&asset_id).await?
            } else {
                service
                    .render(&asset_id, frame, mode, format, SizeHint { width, height })
                    .await?
            };
            let output = output.unwrap_or_else(|| {
                PathBuf::from(format!(
                    "{}-{}.{}",
                    asset_id,
                    rendered.frame_index,
                    rendered.format.extension()
                ))
            });
            std::fs::write(&output, &rendered.bytes)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "Frame {} ({}x{}) written to {}",
                rendered.frame_index,
                rendered.width,
                rendered.height,
                output.display()
            );
        }
        Commands::Web { host, port } => web::start_server(&host, port, config).await?,
    }

    Ok(())
}
