//
// metadata.rs
// Dicom-Frames-rs
//
// Reads the header of a stored DICOM object into a validated ImagingAsset without touching pixel data.
//
// Thales Matheus Mendonça Santos - November 2025

use std::cell::Cell;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::encoding::{Codec, TransferSyntaxIndex};
use dicom::object::{DefaultDicomObject, FileMetaTable, OpenFileOptions};
use dicom::parser::dataset::{DataSetReader, DataToken};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use sha2::{Digest, Sha256};

use crate::dicom_access::ElementAccess;
use crate::error::{RenderError, Result};
use crate::models::{
    ImagingAsset, MetadataWarning, Photometric, PixelDataSpan, PixelEncoding,
    PixelRepresentation, WindowLevel,
};

pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

/// What the header pass found out about the Pixel Data element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelDataPresence {
    /// Native value at a known byte span of the file.
    Native(PixelDataSpan),
    /// Encapsulated fragments.
    Encapsulated,
    /// Deflated data set: byte offsets are not meaningful, presence is not verified.
    Deflated,
    /// The object was parsed in full, so the element is looked up on the object itself.
    InObject,
    Missing,
}

/// Where the object came from; carried into the asset record unchanged.
#[derive(Debug, Clone)]
pub struct AssetSource {
    pub content_id: String,
    pub storage_path: PathBuf,
    pub byte_size: u64,
    pub pixel_data: PixelDataPresence,
}

/// Extraction result: the asset plus the non-fatal annotations raised on the way.
#[derive(Debug, Clone)]
pub struct ExtractedAsset {
    pub asset: ImagingAsset,
    pub warnings: Vec<MetadataWarning>,
}

/// Classifies a transfer syntax UID; anything but the uncompressed syntaxes counts as compressed.
pub fn classify_transfer_syntax(uid: &str) -> PixelEncoding {
    match uid.trim().trim_end_matches('\0') {
        IMPLICIT_VR_LITTLE_ENDIAN | EXPLICIT_VR_LITTLE_ENDIAN | EXPLICIT_VR_BIG_ENDIAN => {
            PixelEncoding::Native
        }
        _ => PixelEncoding::Compressed,
    }
}

/// Opens `path` header-only and extracts its metadata.
pub fn read_asset(path: &Path) -> Result<ExtractedAsset> {
    let (content_id, byte_size) = content_digest(path)?;
    read_header(path, content_id, byte_size)
}

/// Header-only read when the content digest is already known (e.g. right after storing).
pub fn read_header(path: &Path, content_id: String, byte_size: u64) -> Result<ExtractedAsset> {
    // Stop at Pixel Data so the samples are never loaded here.
    let obj: DefaultDicomObject = OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .map_err(|e| RenderError::unreadable(format!("{}: {}", path.display(), e)))?;
    let pixel_data = locate_pixel_data(path, obj.meta())?;

    let source = AssetSource {
        content_id,
        storage_path: path.to_path_buf(),
        byte_size,
        pixel_data,
    };
    extract_asset(&obj, source)
}

/// Counts the bytes pulled through a reader, so token boundaries map back to file offsets.
struct Tally<R> {
    inner: R,
    consumed: Rc<Cell<u64>>,
}

impl<R: Read> Read for Tally<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.set(self.consumed.get() + n as u64);
        Ok(n)
    }
}

/// Offset of the first data set byte, past the preamble, the magic code and the meta group.
fn data_set_start(file: &mut File, meta: &FileMetaTable) -> Result<u64> {
    let mut lead = Vec::with_capacity(132);
    file.by_ref().take(132).read_to_end(&mut lead)?;
    let magic_end = if lead.len() == 132 && &lead[128..132] == b"DICM" {
        132
    } else if lead.starts_with(b"DICM") {
        4
    } else {
        return Err(RenderError::unreadable("missing DICM magic code"));
    };
    // (0002,0000) itself takes 12 bytes in explicit VR little endian.
    Ok(magic_end + 12 + meta.information_group_length as u64)
}

/// Streams data set tokens up to the top-level Pixel Data header without reading its value.
pub fn locate_pixel_data(path: &Path, meta: &FileMetaTable) -> Result<PixelDataPresence> {
    let uid = meta.transfer_syntax().trim_end_matches('\0').trim();
    let ts = TransferSyntaxRegistry
        .get(uid)
        .ok_or_else(|| RenderError::unreadable(format!("unknown transfer syntax {}", uid)))?;
    if matches!(ts.codec(), Codec::Dataset(_)) {
        return Ok(PixelDataPresence::Deflated);
    }

    let mut file = File::open(path)?;
    let start = data_set_start(&mut file, meta)?;
    file.seek(SeekFrom::Start(start))?;

    let consumed = Rc::new(Cell::new(0u64));
    let source = Tally {
        inner: BufReader::new(file),
        consumed: Rc::clone(&consumed),
    };
    let reader = DataSetReader::new_with_ts(source, ts).map_err(|e| unreadable_at(path, e))?;

    // Icon sequences carry their own Pixel Data; only depth 0 counts.
    let mut depth = 0usize;
    for token in reader {
        match token.map_err(|e| unreadable_at(path, e))? {
            DataToken::PixelSequenceStart if depth == 0 => return Ok(PixelDataPresence::Encapsulated),
            DataToken::SequenceStart { .. } | DataToken::PixelSequenceStart => depth += 1,
            DataToken::SequenceEnd => depth = depth.saturating_sub(1),
            DataToken::ElementHeader(header) if depth == 0 && header.tag == tags::PIXEL_DATA => {
                let length = header
                    .len
                    .get()
                    .ok_or_else(|| RenderError::unreadable("Pixel Data has an undefined length"))?;
                return Ok(PixelDataPresence::Native(PixelDataSpan {
                    offset: start + consumed.get(),
                    length: length as u64,
                }));
            }
            _ => {}
        }
    }
    Ok(PixelDataPresence::Missing)
}

fn unreadable_at(path: &Path, err: impl std::fmt::Display) -> RenderError {
    RenderError::unreadable(format!("{}: {}", path.display(), err))
}

/// Streams the file through SHA-256, returning the hex digest and byte count.
pub fn content_digest(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let byte_size = io::copy(&mut file, &mut hasher)?;
    Ok((hex::encode(hasher.finalize()), byte_size))
}

fn required_u32<T: ElementAccess>(obj: &T, tag: Tag, name: &str) -> Result<u32> {
    match obj.element_u32(tag) {
        Some(value) if value > 0 => Ok(value),
        Some(_) => Err(RenderError::unreadable(format!("{} must be positive", name))),
        None => Err(RenderError::unreadable(format!("missing {}", name))),
    }
}

fn optional_u16<T: ElementAccess>(
    obj: &T,
    tag: Tag,
    name: &str,
    default: u16,
    warnings: &mut Vec<MetadataWarning>,
) -> u16 {
    match obj.element_u32(tag).and_then(|v| u16::try_from(v).ok()) {
        Some(value) => value,
        None => {
            warnings.push(MetadataWarning::new(
                name,
                format!("missing, defaulting to {}", default),
            ));
            default
        }
    }
}

fn finite_float<T: ElementAccess>(
    obj: &T,
    tag: Tag,
    name: &str,
    warnings: &mut Vec<MetadataWarning>,
) -> Option<f64> {
    let value = obj.element_floats(tag).and_then(|v| v.first().copied())?;
    if value.is_finite() {
        Some(value)
    } else {
        warnings.push(MetadataWarning::new(name, format!("{} is not finite, ignoring", value)));
        None
    }
}

pub fn extract_asset<T: ElementAccess>(obj: &T, source: AssetSource) -> Result<ExtractedAsset> {
    let mut warnings = Vec::new();

    let rows = required_u32(obj, tags::ROWS, "Rows")?;
    let columns = required_u32(obj, tags::COLUMNS, "Columns")?;
    let bits_allocated = required_u32(obj, tags::BITS_ALLOCATED, "BitsAllocated")?;
    let bits_allocated = u16::try_from(bits_allocated).map_err(|_| {
        RenderError::unreadable(format!("BitsAllocated {} out of range", bits_allocated))
    })?;
    let pixel_data = match source.pixel_data {
        PixelDataPresence::Missing => return Err(RenderError::unreadable("missing PixelData")),
        PixelDataPresence::InObject if !obj.has_element(tags::PIXEL_DATA) => {
            return Err(RenderError::unreadable("missing PixelData"))
        }
        PixelDataPresence::Native(span) => Some(span),
        PixelDataPresence::Deflated => {
            warnings.push(MetadataWarning::new(
                "PixelData",
                "deflated data set; Pixel Data presence not verified",
            ));
            None
        }
        PixelDataPresence::Encapsulated | PixelDataPresence::InObject => None,
    };

    let transfer_syntax = match obj.transfer_syntax() {
        Some(uid) => uid,
        None => {
            warnings.push(MetadataWarning::new(
                "TransferSyntaxUID",
                "no file meta group, assuming explicit VR little endian",
            ));
            EXPLICIT_VR_LITTLE_ENDIAN.to_string()
        }
    };
    let encoding = classify_transfer_syntax(&transfer_syntax);
    if encoding == PixelEncoding::Compressed {
        warnings.push(MetadataWarning::new(
            "TransferSyntaxUID",
            format!("{} is compressed; frames cannot be rendered", transfer_syntax),
        ));
    }

    let samples_per_pixel = optional_u16(obj, tags::SAMPLES_PER_PIXEL, "SamplesPerPixel", 1, &mut warnings);
    let bits_stored = optional_u16(
        obj,
        tags::BITS_STORED,
        "BitsStored",
        bits_allocated,
        &mut warnings,
    );
    if bits_stored == 0 || bits_stored > bits_allocated {
        return Err(RenderError::unreadable(format!(
            "BitsStored {} inconsistent with BitsAllocated {}",
            bits_stored, bits_allocated
        )));
    }
    let high_bit = obj
        .element_u32(tags::HIGH_BIT)
        .and_then(|v| u16::try_from(v).ok())
        .unwrap_or(bits_stored - 1);

    let pixel_representation = match obj.element_u32(tags::PIXEL_REPRESENTATION) {
        Some(1) => PixelRepresentation::Signed,
        Some(_) => PixelRepresentation::Unsigned,
        None => {
            warnings.push(MetadataWarning::new(
                "PixelRepresentation",
                "missing, defaulting to unsigned",
            ));
            PixelRepresentation::Unsigned
        }
    };

    let photometric_interpretation = match obj.element_str(tags::PHOTOMETRIC_INTERPRETATION) {
        Some(value) => Photometric::from(value),
        None => {
            let fallback = if samples_per_pixel > 1 {
                Photometric::Rgb
            } else {
                Photometric::Monochrome2
            };
            warnings.push(MetadataWarning::new(
                "PhotometricInterpretation",
                format!("missing, defaulting to {}", fallback),
            ));
            fallback
        }
    };

    let planar_configuration = obj
        .element_u32(tags::PLANAR_CONFIGURATION)
        .map(|v| if v == 1 { 1 } else { 0 })
        .unwrap_or(0);

    // Number of Frames is legitimately absent on single-frame objects.
    let frame_count = match obj.element_u32(tags::NUMBER_OF_FRAMES) {
        Some(0) => return Err(RenderError::unreadable("NumberOfFrames must be at least 1")),
        Some(n) => n,
        None => 1,
    };

    let windows = window_levels(obj, &mut warnings);

    let pixel_spacing = match obj.element_floats(tags::PIXEL_SPACING) {
        Some(values) if values.len() >= 2 => Some((values[0], values[1])),
        Some(_) => {
            warnings.push(MetadataWarning::new(
                "PixelSpacing",
                "expected two values, ignoring",
            ));
            None
        }
        None => None,
    };

    let asset = ImagingAsset {
        content_id: source.content_id,
        storage_path: source.storage_path,
        byte_size: source.byte_size,
        transfer_syntax,
        encoding,
        rows,
        columns,
        samples_per_pixel,
        bits_allocated,
        bits_stored,
        high_bit,
        pixel_representation,
        photometric_interpretation,
        planar_configuration,
        frame_count,
        windows,
        pixel_spacing,
        rescale_slope: finite_float(obj, tags::RESCALE_SLOPE, "RescaleSlope", &mut warnings),
        rescale_intercept: finite_float(
            obj,
            tags::RESCALE_INTERCEPT,
            "RescaleIntercept",
            &mut warnings,
        ),
        modality: obj.element_str(tags::MODALITY),
        pixel_data,
    };

    if let Some(span) = pixel_data {
        if span.length < asset.pixel_byte_len() as u64 {
            warnings.push(MetadataWarning::new(
                "PixelData",
                format!(
                    "{} bytes, {} expected; trailing frames are unreadable",
                    span.length,
                    asset.pixel_byte_len()
                ),
            ));
        }
    }

    Ok(ExtractedAsset { asset, warnings })
}

fn window_levels<T: ElementAccess>(obj: &T, warnings: &mut Vec<MetadataWarning>) -> Vec<WindowLevel> {
    let centers = obj.element_floats(tags::WINDOW_CENTER).unwrap_or_default();
    let widths = obj.element_floats(tags::WINDOW_WIDTH).unwrap_or_default();

    if centers.is_empty() && widths.is_empty() {
        warnings.push(MetadataWarning::new(
            "WindowCenter/WindowWidth",
            "absent, windowing falls back to presets",
        ));
        return Vec::new();
    }
    if centers.len() != widths.len() {
        warnings.push(MetadataWarning::new(
            "WindowCenter/WindowWidth",
            format!(
                "{} center(s) but {} width(s); pairing the first {}",
                centers.len(),
                widths.len(),
                centers.len().min(widths.len())
            ),
        ));
    }

    let mut windows = Vec::new();
    for (center, width) in centers.into_iter().zip(widths) {
        if center.is_finite() && width.is_finite() {
            windows.push(WindowLevel { center, width });
        } else {
            warnings.push(MetadataWarning::new(
                "WindowCenter/WindowWidth",
                format!("dropping non-finite pair {} / {}", center, width),
            ));
        }
    }
    windows
}

pub fn print_info(path: &Path) -> anyhow::Result<()> {
    let extracted = read_asset(path)?;
    let asset = &extracted.asset;

    println!("{}", "=".repeat(80));
    println!("DICOM Asset: {}", path.display());
    println!("{}", "=".repeat(80));

    println!("ENCODING");
    println!("  Transfer Syntax: {} ({:?})", asset.transfer_syntax, asset.encoding);
    println!("  Content ID:      {}", asset.content_id);
    println!("  Size:            {} bytes", asset.byte_size);

    println!("\nPIXELS");
    println!("  Dimensions: {} x {}", asset.columns, asset.rows);
    println!("  Frames:     {}", asset.frame_count);
    println!(
        "  Samples:    {} ({})",
        asset.samples_per_pixel, asset.photometric_interpretation
    );
    println!(
        "  Bits:       {} allocated / {} stored ({:?})",
        asset.bits_allocated, asset.bits_stored, asset.pixel_representation
    );

    println!("\nWINDOWS");
    if asset.windows.is_empty() {
        println!("  none");
    }
    for (idx, window) in asset.windows.iter().enumerate() {
        println!("  [{}] center {} / width {}", idx, window.center, window.width);
    }

    if !extracted.warnings.is_empty() {
        println!("\nWARNINGS");
        for warning in &extracted.warnings {
            println!("  {}: {}", warning.field, warning.message);
        }
    }

    Ok(())
}
