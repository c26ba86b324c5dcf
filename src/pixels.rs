//
// pixels.rs
// Dicom-Frames-rs
//
// Normalizes pixel buffers to [frame, row, col, channel] order and extracts single frames,
// reading only the byte span of the requested frame before handing it to dicom-pixeldata.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::{DefaultDicomObject, FileDicomObject, FileMetaTableBuilder};
use dicom::pixeldata::PixelDecoder;
use dicom_pixeldata::{ConvertOptions, ModalityLutOption};
use ndarray::{Array3, ArrayView4, ArrayViewD, Axis, IxDyn};
use parking_lot::Mutex;

use crate::error::{RenderError, Result};
use crate::metadata::{EXPLICIT_VR_BIG_ENDIAN, EXPLICIT_VR_LITTLE_ENDIAN};
use crate::models::{ImagingAsset, Photometric, PixelDataSpan, PixelEncoding};

const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";
const FRAME_INSTANCE_UID: &str = "2.25.0";

/// Shape descriptor needed to interpret a pixel buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameShape {
    pub rows: usize,
    pub columns: usize,
    pub frames: usize,
    pub samples_per_pixel: usize,
    pub photometric: Photometric,
    /// 0 = interleaved channels, 1 = one plane per channel.
    pub planar_configuration: u16,
}

impl FrameShape {
    pub fn from_asset(asset: &ImagingAsset) -> Self {
        Self {
            rows: asset.rows as usize,
            columns: asset.columns as usize,
            frames: asset.frame_count as usize,
            samples_per_pixel: asset.samples_per_pixel.max(1) as usize,
            photometric: asset.photometric_interpretation.clone(),
            planar_configuration: asset.planar_configuration,
        }
    }

    fn plane(&self) -> usize {
        self.rows * self.columns
    }

    /// Resolves (frames, samples) from the element count, settling the channel/frame ambiguity.
    fn resolve_counts(&self, len: usize) -> Result<(usize, usize)> {
        let (frames, spp) = (self.frames.max(1), self.samples_per_pixel.max(1));
        let plane = self.plane();
        if plane == 0 {
            return Err(RenderError::unreadable("empty frame geometry"));
        }
        if len == frames * plane * spp {
            return Ok((frames, spp));
        }
        if spp > 1 && frames > 1 {
            if len == frames * plane && !self.photometric.is_color() {
                return Ok((frames, 1));
            }
            if len == plane * spp && self.photometric.is_color() {
                return Ok((1, spp));
            }
        }
        Err(RenderError::unreadable(format!(
            "buffer of {} samples does not match {} frame(s) of {}x{}x{}",
            len, frames, self.rows, self.columns, spp
        )))
    }
}

/// One frame in canonical `[row, col, channel]` order.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: u32,
    pub samples: Array3<f32>,
}

impl Frame {
    pub fn rows(&self) -> usize {
        self.samples.shape()[0]
    }

    pub fn columns(&self) -> usize {
        self.samples.shape()[1]
    }

    pub fn channels(&self) -> usize {
        self.samples.shape()[2]
    }
}

/// Rearranges `buffer` into a `[frame, row, col, channel]` view without copying.
pub fn canonical_view<'a>(buffer: ArrayViewD<'a, f32>, shape: &FrameShape) -> Result<ArrayView4<'a, f32>> {
    let (frames, spp) = shape.resolve_counts(buffer.len())?;
    let (rows, cols) = (shape.rows, shape.columns);
    let dims = buffer.shape().to_vec();
    let planar = shape.planar_configuration == 1;

    let reshape = |view: ArrayViewD<'a, f32>, target: &[usize]| {
        view.into_shape(IxDyn(target))
            .map_err(|e| RenderError::unreadable(format!("cannot reshape pixel buffer: {}", e)))
    };

    // Each arm yields a view plus the axis permutation that puts it in canonical order.
    let (view, order): (ArrayViewD<'a, f32>, [usize; 4]) = match dims.as_slice() {
        [_] if planar && spp > 1 => (reshape(buffer, &[frames, spp, rows, cols])?, [0, 2, 3, 1]),
        [_] => (reshape(buffer, &[frames, rows, cols, spp])?, [0, 1, 2, 3]),
        [r, c] if *r == rows && *c == cols => (reshape(buffer, &[1, rows, cols, 1])?, [0, 1, 2, 3]),
        [f, r, c] if spp == 1 && *f == frames && *r == rows && *c == cols => {
            (reshape(buffer, &[frames, rows, cols, 1])?, [0, 1, 2, 3])
        }
        [s, r, c] if frames == 1 && planar && *s == spp && *r == rows && *c == cols => {
            (reshape(buffer, &[1, spp, rows, cols])?, [0, 2, 3, 1])
        }
        [r, c, s] if frames == 1 && *r == rows && *c == cols && *s == spp => {
            (reshape(buffer, &[1, rows, cols, spp])?, [0, 1, 2, 3])
        }
        [s, r, c] if frames == 1 && *s == spp && *r == rows && *c == cols => {
            (reshape(buffer, &[1, spp, rows, cols])?, [0, 2, 3, 1])
        }
        [f, r, c, s] if *f == frames && *r == rows && *c == cols && *s == spp => {
            (buffer, [0, 1, 2, 3])
        }
        [f, s, r, c] if *f == frames && *s == spp && *r == rows && *c == cols => {
            (buffer, [0, 2, 3, 1])
        }
        other => {
            return Err(RenderError::unreadable(format!(
                "unrecognized pixel buffer layout {:?} for {} frame(s) of {}x{}x{}",
                other, frames, rows, cols, spp
            )))
        }
    };

    view.permuted_axes(IxDyn(&order))
        .into_dimensionality()
        .map_err(|e| RenderError::unreadable(format!("pixel buffer is not 4D: {}", e)))
}

/// Copies out frame `index` of an arbitrary-layout buffer as `[row, col, channel]`.
pub fn extract_frame(buffer: ArrayViewD<'_, f32>, shape: &FrameShape, index: u32) -> Result<Frame> {
    let canonical = canonical_view(buffer, shape)?;
    let available = canonical.shape()[0] as u32;
    if index >= available {
        return Err(RenderError::FrameIndexOutOfBounds {
            requested: index,
            available,
        });
    }
    Ok(Frame {
        index,
        samples: canonical.index_axis(Axis(0), index as usize).to_owned(),
    })
}

/// Pixel Data of one asset as held by the decode cache.
///
/// Construction only validates the header. Frames are read and decoded on demand:
/// a request for frame 50 of 96 seeks to that frame's byte span and decodes nothing else.
#[derive(Debug)]
pub struct NativePixelData {
    asset: ImagingAsset,
    span: PixelDataSpan,
    shape: FrameShape,
    frames: Mutex<HashMap<u32, Arc<Frame>>>,
}

impl NativePixelData {
    pub fn new(asset: ImagingAsset) -> Result<Self> {
        let unsupported = |reason: String| RenderError::UnsupportedEncoding {
            transfer_syntax: asset.transfer_syntax.clone(),
            reason,
        };
        if asset.encoding == PixelEncoding::Compressed {
            return Err(unsupported("compressed pixel data is not decoded".into()));
        }
        let span = asset
            .pixel_data
            .ok_or_else(|| unsupported("encapsulated pixel data".into()))?;
        if !matches!(asset.bits_allocated, 8 | 16 | 32) {
            return Err(unsupported(format!(
                "BitsAllocated {} is not supported",
                asset.bits_allocated
            )));
        }
        if let Photometric::Other(name) = &asset.photometric_interpretation {
            return Err(unsupported(format!("photometric interpretation {}", name)));
        }
        let shape = FrameShape::from_asset(&asset);
        Ok(Self {
            asset,
            span,
            shape,
            frames: Mutex::new(HashMap::new()),
        })
    }

    pub fn shape(&self) -> &FrameShape {
        &self.shape
    }

    /// Bytes reserved in the cache: every frame decoded to `f32` samples.
    pub fn byte_len(&self) -> usize {
        let channels = if self.shape.photometric.is_color() { 3 } else { 1 };
        self.shape.frames * self.shape.plane() * channels * std::mem::size_of::<f32>()
    }

    pub fn decoded_frames(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn frame(&self, index: u32) -> Result<Arc<Frame>> {
        let available = self.asset.frame_count;
        if index >= available {
            return Err(RenderError::FrameIndexOutOfBounds {
                requested: index,
                available,
            });
        }
        if let Some(frame) = self.frames.lock().get(&index) {
            return Ok(Arc::clone(frame));
        }

        let raw = self.read_frame_bytes(index)?;
        let mut frame = self.decode(raw)?;
        frame.index = index;
        let frame = Arc::new(frame);
        self.frames.lock().insert(index, Arc::clone(&frame));
        Ok(frame)
    }

    fn read_frame_bytes(&self, index: u32) -> Result<Vec<u8>> {
        let frame_len = self.asset.frame_byte_len() as u64;
        let start = index as u64 * frame_len;
        let end = start + frame_len;
        let truncated = || {
            RenderError::unreadable(format!(
                "pixel data truncated: frame {} needs bytes {}..{} of {}",
                index, start, end, self.span.length
            ))
        };
        if end > self.span.length {
            return Err(truncated());
        }

        let mut file = File::open(&self.asset.storage_path)?;
        file.seek(SeekFrom::Start(self.span.offset + start))?;
        let mut raw = vec![0u8; frame_len as usize];
        file.read_exact(&mut raw).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => truncated(),
            _ => RenderError::from(e),
        })?;
        Ok(raw)
    }

    /// Wraps one frame's bytes in a single-frame object and lets dicom-pixeldata decode it.
    fn decode(&self, raw: Vec<u8>) -> Result<Frame> {
        let obj = single_frame_object(&self.asset, raw)?;
        let decoded = obj.decode_pixel_data().map_err(|e| RenderError::UnsupportedEncoding {
            transfer_syntax: self.asset.transfer_syntax.clone(),
            reason: e.to_string(),
        })?;

        if self.shape.photometric.is_color() {
            // YBR_FULL is converted to RGB by the crate.
            let rgb = decoded
                .to_dynamic_image_with_options(0, &ConvertOptions::new())
                .map_err(conversion_error)?
                .to_rgb8();
            let (width, height) = rgb.dimensions();
            let samples = rgb.into_raw().into_iter().map(f32::from).collect();
            let samples = Array3::from_shape_vec((height as usize, width as usize, 3), samples)
                .map_err(|e| RenderError::unreadable(e.to_string()))?;
            return Ok(Frame { index: 0, samples });
        }

        let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::Default);
        let values = decoded
            .to_ndarray_with_options::<f32>(&options)
            .map_err(conversion_error)?
            .into_dyn();
        let single = FrameShape {
            frames: 1,
            ..self.shape.clone()
        };
        extract_frame(values.view(), &single, 0)
    }
}

fn conversion_error(err: impl std::fmt::Display) -> RenderError {
    RenderError::unreadable(format!("pixel data: {}", err))
}

/// Minimal explicit VR little endian object carrying one frame of `asset`.
fn single_frame_object(asset: &ImagingAsset, raw: Vec<u8>) -> Result<DefaultDicomObject> {
    let dimension = |value: u32, name: &str| {
        u16::try_from(value).map_err(|_| RenderError::unreadable(format!("{} {} out of range", name, value)))
    };
    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
        .media_storage_sop_class_uid(SECONDARY_CAPTURE)
        .media_storage_sop_instance_uid(FRAME_INSTANCE_UID)
        .build()
        .map_err(|e| RenderError::unreadable(format!("frame object: {}", e)))?;
    let mut obj = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);

    let spp = asset.samples_per_pixel.max(1);
    let mut us = |tag, value: u16| obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
    us(tags::SAMPLES_PER_PIXEL, spp);
    us(tags::ROWS, dimension(asset.rows, "Rows")?);
    us(tags::COLUMNS, dimension(asset.columns, "Columns")?);
    us(tags::BITS_ALLOCATED, asset.bits_allocated);
    us(tags::BITS_STORED, asset.bits_stored);
    us(tags::HIGH_BIT, asset.high_bit);
    us(tags::PIXEL_REPRESENTATION, asset.is_signed() as u16);
    if spp > 1 {
        us(tags::PLANAR_CONFIGURATION, 0);
    }
    obj.put(DataElement::new(
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        PrimitiveValue::from(asset.photometric_interpretation.to_string()),
    ));
    obj.put(DataElement::new(tags::NUMBER_OF_FRAMES, VR::IS, PrimitiveValue::from("1")));
    for (tag, value) in [
        (tags::RESCALE_SLOPE, asset.rescale_slope),
        (tags::RESCALE_INTERCEPT, asset.rescale_intercept),
    ] {
        if let Some(value) = value {
            obj.put(DataElement::new(tag, VR::DS, PrimitiveValue::from(value.to_string())));
        }
    }

    let bytes_per_sample = asset.bits_allocated as usize / 8;
    let mut raw = raw;
    if asset.transfer_syntax.trim_end_matches('\0') == EXPLICIT_VR_BIG_ENDIAN {
        for sample in raw.chunks_exact_mut(bytes_per_sample) {
            sample.reverse();
        }
    }
    if spp > 1 && asset.planar_configuration == 1 {
        raw = interleave_planes(raw, spp as usize, bytes_per_sample)?;
    }
    let vr = if bytes_per_sample > 1 { VR::OW } else { VR::OB };
    obj.put(DataElement::new(tags::PIXEL_DATA, vr, PrimitiveValue::from(raw)));
    Ok(obj)
}

/// `[sample, pixel, byte]` plane order to `[pixel, sample, byte]`.
fn interleave_planes(raw: Vec<u8>, spp: usize, bytes_per_sample: usize) -> Result<Vec<u8>> {
    let pixels = raw.len() / (spp * bytes_per_sample);
    let planes = Array3::from_shape_vec((spp, pixels, bytes_per_sample), raw)
        .map_err(|e| RenderError::unreadable(format!("planar pixel data: {}", e)))?;
    Ok(planes.permuted_axes([1, 0, 2]).iter().copied().collect())
}

/// Validates `asset` for on-demand frame reads, checking the stored file still covers its Pixel Data.
pub fn load_native_pixels(asset: &ImagingAsset) -> Result<NativePixelData> {
    let pixels = NativePixelData::new(asset.clone())?;
    let file_len = std::fs::metadata(&asset.storage_path)?.len();
    if file_len < pixels.span.offset + pixels.span.length {
        return Err(RenderError::unreadable(format!(
            "{} is shorter than its Pixel Data",
            asset.storage_path.display()
        )));
    }
    Ok(pixels)
}
