//
// models.rs
// Dicom-Frames-rs
//
// Defines the validated imaging-asset metadata, registry records, and rendered-frame payloads.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Signedness of stored samples, from Pixel Representation (0028,0103).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelRepresentation {
    Unsigned,
    Signed,
}

/// How the pixel data of an asset is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelEncoding {
    /// Uncompressed samples; frames can be addressed by byte offset.
    Native,
    /// Encapsulated or deflated stream. Recorded, never decoded.
    Compressed,
}

/// Photometric Interpretation (0028,0004).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Photometric {
    Monochrome1,
    Monochrome2,
    Rgb,
    YbrFull,
    Other(String),
}

impl Photometric {
    pub fn is_monochrome(&self) -> bool {
        matches!(self, Photometric::Monochrome1 | Photometric::Monochrome2)
    }

    pub fn is_color(&self) -> bool {
        matches!(self, Photometric::Rgb | Photometric::YbrFull)
    }
}

impl From<String> for Photometric {
    fn from(value: String) -> Self {
        match value.trim().trim_end_matches('\0').to_ascii_uppercase().as_str() {
            "MONOCHROME1" => Photometric::Monochrome1,
            "MONOCHROME2" => Photometric::Monochrome2,
            "RGB" => Photometric::Rgb,
            "YBR_FULL" => Photometric::YbrFull,
            _ => Photometric::Other(value.trim().to_string()),
        }
    }
}

impl From<Photometric> for String {
    fn from(value: Photometric) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Photometric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Photometric::Monochrome1 => f.write_str("MONOCHROME1"),
            Photometric::Monochrome2 => f.write_str("MONOCHROME2"),
            Photometric::Rgb => f.write_str("RGB"),
            Photometric::YbrFull => f.write_str("YBR_FULL"),
            Photometric::Other(name) => f.write_str(name),
        }
    }
}

/// One window center/width pair as stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowLevel {
    pub center: f64,
    pub width: f64,
}

/// Non-fatal annotation raised when an optional header field is missing or defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataWarning {
    pub field: String,
    pub message: String,
}

impl MetadataWarning {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Byte range of a native Pixel Data value inside the stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelDataSpan {
    pub offset: u64,
    pub length: u64,
}

/// Validated header metadata, populated once at extraction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagingAsset {
    /// Hex SHA-256 of the file bytes.
    pub content_id: String,
    pub storage_path: PathBuf,
    pub byte_size: u64,
    pub transfer_syntax: String,
    pub encoding: PixelEncoding,
    pub rows: u32,
    pub columns: u32,
    pub samples_per_pixel: u16,
    pub bits_allocated: u16,
    pub bits_stored: u16,
    pub high_bit: u16,
    pub pixel_representation: PixelRepresentation,
    pub photometric_interpretation: Photometric,
    pub planar_configuration: u16,
    pub frame_count: u32,
    pub windows: Vec<WindowLevel>,
    pub pixel_spacing: Option<(f64, f64)>,
    pub rescale_slope: Option<f64>,
    pub rescale_intercept: Option<f64>,
    pub modality: Option<String>,
    /// Located during the header pass; `None` for encapsulated data.
    #[serde(default)]
    pub pixel_data: Option<PixelDataSpan>,
}

impl ImagingAsset {
    pub fn is_signed(&self) -> bool {
        self.pixel_representation == PixelRepresentation::Signed
    }

    /// Bytes taken by one frame of native pixel data.
    pub fn frame_byte_len(&self) -> usize {
        self.rows as usize
            * self.columns as usize
            * self.samples_per_pixel as usize
            * (self.bits_allocated as usize / 8)
    }

    /// Bytes of native pixel data across every frame.
    pub fn pixel_byte_len(&self) -> usize {
        self.frame_byte_len() * self.frame_count as usize
    }
}

/// Durable registry entry, one per asset id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub asset_id: String,
    pub patient_id: String,
    pub origin_filename: String,
    pub created_at: DateTime<Utc>,
    pub file_size: u64,
    pub metadata: ImagingAsset,
}

/// Row returned to study-browsing collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySummary {
    pub asset_id: String,
    pub origin_filename: String,
    pub frame_count: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&StudyRecord> for StudySummary {
    fn from(record: &StudyRecord) -> Self {
        Self {
            asset_id: record.asset_id.clone(),
            origin_filename: record.origin_filename.clone(),
            frame_count: record.metadata.frame_count,
            created_at: record.created_at,
        }
    }
}

/// Raster codecs a frame can be delivered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
    Bmp,
    Tiff,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpg" | "jpeg" => Ok(OutputFormat::Jpeg),
            "bmp" => Ok(OutputFormat::Bmp),
            "tif" | "tiff" => Ok(OutputFormat::Tiff),
            other => Err(format!("unsupported output format `{}`", other)),
        }
    }
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Bmp => "bmp",
            OutputFormat::Tiff => "tiff",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Bmp => "image/bmp",
            OutputFormat::Tiff => "image/tiff",
        }
    }
}

/// Encoded frame, the only thing a render call hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFrame {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub frame_index: u32,
    pub asset_id: String,
    pub format: OutputFormat,
}

/// Frame description returned next to the encoded bytes of a viewer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub rows: u32,
    pub columns: u32,
    pub bits_allocated: u16,
    pub frame_count: u32,
    pub extracted_frame: u32,
}
