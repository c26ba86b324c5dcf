//
// render.rs
// Dicom-Frames-rs
//
// Encodes windowed 8-bit frames into raster formats, fitting them into an optional bounding box.
//
// Thales Matheus Mendonça Santos - November 2025

use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::error::{RenderError, Result};
use crate::models::OutputFormat;

/// Edge of the square box thumbnails are fitted into.
pub const THUMBNAIL_EDGE: u32 = 128;

/// Largest width or height a resize may produce.
pub const MAX_OUTPUT_EDGE: u32 = 8192;

impl OutputFormat {
    pub fn image_format(self) -> ImageFormat {
        match self {
            OutputFormat::Png => ImageFormat::Png,
            OutputFormat::Jpeg => ImageFormat::Jpeg,
            OutputFormat::Bmp => ImageFormat::Bmp,
            OutputFormat::Tiff => ImageFormat::Tiff,
        }
    }
}

/// Requested output bounds. Zero counts as unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeHint {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl SizeHint {
    pub fn bounding(edge: u32) -> Self {
        Self {
            width: Some(edge),
            height: Some(edge),
        }
    }

    /// Output size that fits `width` x `height` into the hint, keeping the aspect ratio.
    pub fn fit(&self, width: u32, height: u32) -> (u32, u32) {
        let target_w = self.width.filter(|w| *w > 0);
        let target_h = self.height.filter(|h| *h > 0);
        let (src_w, src_h) = (width as f64, height as f64);

        let scale = match (target_w, target_h) {
            (Some(w), Some(h)) => (w as f64 / src_w).min(h as f64 / src_h),
            (Some(w), None) => w as f64 / src_w,
            (None, Some(h)) => h as f64 / src_h,
            (None, None) => return (width, height),
        };

        let fitted_w = (src_w * scale).round().max(1.0) as u32;
        let fitted_h = (src_h * scale).round().max(1.0) as u32;
        (fitted_w, fitted_h)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRaster {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

fn to_dynamic_image(pixels: &Array3<u8>) -> Result<DynamicImage> {
    let (rows, cols, channels) = pixels.dim();
    let data: Vec<u8> = pixels.iter().copied().collect();
    let (w, h) = (cols as u32, rows as u32);
    let image = match channels {
        1 => GrayImage::from_raw(w, h, data).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(w, h, data).map(DynamicImage::ImageRgb8),
        other => {
            return Err(RenderError::EncodingFailure(format!(
                "cannot encode {} channel(s)",
                other
            )))
        }
    };
    image.ok_or_else(|| RenderError::EncodingFailure("pixel buffer does not match dimensions".into()))
}

/// Overlap of each destination cell with the source cells on one axis.
fn area_weights(src: usize, dst: usize) -> Vec<Vec<(usize, f64)>> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|o| {
            let start = o as f64 * scale;
            let end = ((o + 1) as f64 * scale).min(src as f64);
            let first = start.floor() as usize;
            let last = (end.ceil() as usize).min(src);
            (first..last)
                .filter_map(|i| {
                    let overlap = end.min((i + 1) as f64) - start.max(i as f64);
                    (overlap > 0.0).then_some((i, overlap))
                })
                .collect()
        })
        .collect()
}

/// Area-averaging downscale: every output pixel is the mean of the source area it covers.
fn area_downscale(pixels: &Array3<u8>, width: u32, height: u32) -> Array3<u8> {
    let (rows, cols, channels) = pixels.dim();
    let row_weights = area_weights(rows, height as usize);
    let col_weights = area_weights(cols, width as usize);

    Array3::from_shape_fn((height as usize, width as usize, channels), |(oy, ox, c)| {
        let mut acc = 0.0;
        let mut total = 0.0;
        for &(iy, wy) in &row_weights[oy] {
            for &(ix, wx) in &col_weights[ox] {
                let weight = wy * wx;
                acc += pixels[[iy, ix, c]] as f64 * weight;
                total += weight;
            }
        }
        if total > 0.0 {
            (acc / total).round().clamp(0.0, 255.0) as u8
        } else {
            0
        }
    })
}

fn bilinear_upscale(image: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => {
            DynamicImage::ImageRgb8(imageops::resize(rgb, width, height, FilterType::Triangle))
        }
        other => DynamicImage::ImageLuma8(imageops::resize(
            &other.to_luma8(),
            width,
            height,
            FilterType::Triangle,
        )),
    }
}

fn encode_image(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), format)
        .map_err(|e| RenderError::EncodingFailure(e.to_string()))?;
    Ok(buffer)
}

/// Resizes to fit `size` (area averaging down, bilinear up) and encodes as `format`.
///
/// A resize whose output would exceed `max_edge` on either side is refused.
pub fn encode_frame(
    pixels: &Array3<u8>,
    format: OutputFormat,
    size: SizeHint,
    max_edge: u32,
) -> Result<EncodedRaster> {
    let (rows, cols, _) = pixels.dim();
    if rows == 0 || cols == 0 {
        return Err(RenderError::EncodingFailure("empty raster".into()));
    }
    let (src_w, src_h) = (cols as u32, rows as u32);
    let (width, height) = size.fit(src_w, src_h);
    if (width, height) != (src_w, src_h) && width.max(height) > max_edge {
        return Err(RenderError::EncodingFailure(format!(
            "requested output {}x{} exceeds the {} pixel limit",
            width, height, max_edge
        )));
    }

    let image = if (width, height) == (src_w, src_h) {
        to_dynamic_image(pixels)?
    } else if width as u64 * height as u64 <= src_w as u64 * src_h as u64 {
        to_dynamic_image(&area_downscale(pixels, width, height))?
    } else {
        bilinear_upscale(&to_dynamic_image(pixels)?, width, height)
    };

    let bytes = encode_image(&image, format.image_format())?;
    Ok(EncodedRaster {
        bytes,
        width,
        height,
    })
}

/// Thumbnail: the regular encode path with a square bounding box.
pub fn encode_thumbnail(pixels: &Array3<u8>, format: OutputFormat, edge: u32) -> Result<EncodedRaster> {
    encode_frame(pixels, format, SizeHint::bounding(edge), edge)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(rows: usize, cols: usize) -> Array3<u8> {
        Array3::from_shape_fn((rows, cols, 1), |(r, c, _)| ((r * 7 + c * 3) % 256) as u8)
    }

    #[test]
    fn single_dimension_target_keeps_aspect_ratio() {
        for &(w, h) in &[(512u32, 512u32), (640, 480), (300, 1000), (97, 13)] {
            for target in [1u32, 7, 64, 129, 1024] {
                let (fw, fh) = SizeHint {
                    width: Some(target),
                    height: None,
                }
                .fit(w, h);
                assert_eq!(fw, target);
                let expected_h = h as f64 * target as f64 / w as f64;
                assert!((fh as f64 - expected_h).abs() <= 1.0, "{}x{} -> {}x{}", w, h, fw, fh);

                let (fw, fh) = SizeHint {
                    width: None,
                    height: Some(target),
                }
                .fit(w, h);
                assert_eq!(fh, target);
                let expected_w = w as f64 * target as f64 / h as f64;
                assert!((fw as f64 - expected_w).abs() <= 1.0, "{}x{} -> {}x{}", w, h, fw, fh);
            }
        }
    }

    #[test]
    fn bounding_box_fits_without_padding() {
        assert_eq!(SizeHint::bounding(128).fit(512, 256), (128, 64));
        assert_eq!(SizeHint::bounding(128).fit(100, 400), (32, 128));
        assert_eq!(SizeHint::default().fit(33, 44), (33, 44));
    }

    #[test]
    fn area_downscale_averages_blocks() {
        let pixels = Array3::from_shape_vec((2, 2, 1), vec![0, 100, 200, 100]).unwrap();
        let out = area_downscale(&pixels, 1, 1);
        assert_eq!(out[[0, 0, 0]], 100);
    }

    #[test]
    fn png_and_jpeg_encode_with_requested_size() {
        let pixels = gradient(64, 32);
        let png = encode_frame(&pixels, OutputFormat::Png, SizeHint::default(), MAX_OUTPUT_EDGE).unwrap();
        assert!(png.bytes.starts_with(&[0x89, b'P', b'N', b'G']));
        assert_eq!((png.width, png.height), (32, 64));

        let jpeg = encode_frame(
            &pixels,
            OutputFormat::Jpeg,
            SizeHint {
                width: None,
                height: Some(128),
            },
            MAX_OUTPUT_EDGE,
        )
        .unwrap();
        assert!(jpeg.bytes.starts_with(&[0xFF, 0xD8]));
        assert_eq!((jpeg.width, jpeg.height), (64, 128));
        let decoded = image::load_from_memory(&jpeg.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 128));
    }

    #[test]
    fn oversized_resize_is_refused() {
        let pixels = gradient(512, 512);
        let err = encode_frame(
            &pixels,
            OutputFormat::Png,
            SizeHint {
                width: Some(1_000_000),
                height: None,
            },
            MAX_OUTPUT_EDGE,
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::EncodingFailure(_)));

        // A source already above the limit is still served at its own size.
        let small_limit = encode_frame(&gradient(16, 16), OutputFormat::Png, SizeHint::default(), 8).unwrap();
        assert_eq!((small_limit.width, small_limit.height), (16, 16));
    }

    #[test]
    fn thumbnail_uses_the_same_fit() {
        let pixels = gradient(512, 256);
        let thumb = encode_thumbnail(&pixels, OutputFormat::Png, THUMBNAIL_EDGE).unwrap();
        assert_eq!((thumb.width, thumb.height), (64, 128));
    }

    #[test]
    fn rgb_frames_encode() {
        let pixels = Array3::from_shape_fn((4, 4, 3), |(r, c, ch)| (r * 40 + c * 10 + ch) as u8);
        let png = encode_frame(&pixels, OutputFormat::Png, SizeHint::default(), MAX_OUTPUT_EDGE).unwrap();
        let decoded = image::load_from_memory(&png.bytes).unwrap();
        assert_eq!(decoded.color(), image::ColorType::Rgb8);
    }
}
