//
// window.rs
// Dicom-Frames-rs
//
// Maps raw frame samples to 8-bit display values: explicit VOI windows, named presets,
// and per-frame percentile windows, tried in that order.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;
use std::str::FromStr;

use ndarray::{Array, Array3, ArrayView, Dimension, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{RenderError, Result};
use crate::models::{ImagingAsset, Photometric, WindowLevel};
use crate::pixels::Frame;

const LOW_PERCENTILE: f64 = 0.5;
const HIGH_PERCENTILE: f64 = 99.5;

/// Fixed window pairs selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    Wide,
    Narrow,
    #[serde(rename = "8-bit")]
    EightBit,
}

impl Preset {
    pub fn level(self) -> WindowLevel {
        match self {
            Preset::Wide => WindowLevel {
                center: 500.0,
                width: 1000.0,
            },
            Preset::Narrow => WindowLevel {
                center: 40.0,
                width: 80.0,
            },
            Preset::EightBit => WindowLevel {
                center: 128.0,
                width: 255.0,
            },
        }
    }

    /// Preset tried when an asset's own window is missing or useless.
    pub fn fallback_for(bits_stored: u16) -> Self {
        if bits_stored <= 8 {
            Preset::EightBit
        } else {
            Preset::Wide
        }
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wide" => Ok(Preset::Wide),
            "narrow" => Ok(Preset::Narrow),
            "8-bit" | "8bit" | "eight-bit" => Ok(Preset::EightBit),
            other => Err(format!("unknown window preset `{}`", other)),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Preset::Wide => f.write_str("wide"),
            Preset::Narrow => f.write_str("narrow"),
            Preset::EightBit => f.write_str("8-bit"),
        }
    }
}

/// Windowing requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowingMode {
    /// The asset's own window; `index` picks among multiple pairs (default first).
    Explicit { index: Option<usize> },
    Preset(Preset),
    Auto,
}

impl Default for WindowingMode {
    fn default() -> Self {
        WindowingMode::Explicit { index: None }
    }
}

impl FromStr for WindowingMode {
    type Err = String;

    /// Parses the viewer's `enhancement` field: `auto`, `none`, or a preset name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(WindowingMode::Auto),
            "none" | "explicit" | "" => Ok(WindowingMode::Explicit { index: None }),
            other => other.parse().map(WindowingMode::Preset),
        }
    }
}

/// Where the parameters actually used came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WindowSource {
    Explicit { index: usize },
    Preset(Preset),
    Percentile { low: f64, high: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowParameters {
    pub center: f64,
    pub width: f64,
    pub source: WindowSource,
}

impl WindowParameters {
    pub fn preset(preset: Preset) -> Self {
        let level = preset.level();
        Self {
            center: level.center,
            width: level.width,
            source: WindowSource::Preset(preset),
        }
    }
}

/// Windowed frame plus the parameters that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowedFrame {
    pub index: u32,
    pub pixels: Array3<u8>,
    pub parameters: WindowParameters,
}

/// Linear VOI mapping into 0..=255. Same input, same bytes.
pub fn apply_window<D: Dimension>(
    samples: ArrayView<'_, f32, D>,
    params: &WindowParameters,
) -> Result<Array<u8, D>> {
    if samples.is_empty() {
        return Err(RenderError::DegenerateWindow("empty frame".into()));
    }
    if !params.center.is_finite() || !params.width.is_finite() {
        return Err(RenderError::DegenerateWindow(format!(
            "window {} / {} is not finite",
            params.center, params.width
        )));
    }
    if !(params.width > 0.0) {
        return Err(RenderError::DegenerateWindow(format!(
            "window width {} is not positive",
            params.width
        )));
    }
    let lower = params.center - params.width / 2.0;
    let upper = params.center + params.width / 2.0;
    Ok(samples.mapv(|sample| {
        let clamped = (sample as f64).clamp(lower, upper);
        ((clamped - lower) / params.width * 255.0).round() as u8
    }))
}

/// Percentile of `sorted` with linear interpolation between order statistics.
fn percentile(sorted: &[f32], pct: f64) -> f64 {
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let below = rank.floor() as usize;
    let above = rank.ceil() as usize;
    let fraction = rank - below as f64;
    sorted[below] as f64 + (sorted[above] as f64 - sorted[below] as f64) * fraction
}

/// Window spanning the 0.5th..99.5th percentiles; a flat frame gets the 8-bit preset.
pub fn percentile_window<D: Dimension>(samples: ArrayView<'_, f32, D>) -> Result<WindowParameters> {
    if samples.is_empty() {
        return Err(RenderError::DegenerateWindow("empty frame".into()));
    }
    let mut sorted: Vec<f32> = samples.iter().copied().collect();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));

    let low = percentile(&sorted, LOW_PERCENTILE);
    let high = percentile(&sorted, HIGH_PERCENTILE);
    if !(high - low > 0.0) {
        return Ok(WindowParameters::preset(Preset::EightBit));
    }
    Ok(WindowParameters {
        center: (low + high) / 2.0,
        width: high - low,
        source: WindowSource::Percentile { low, high },
    })
}

/// Summary numbers over one frame, reported alongside diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameStatistics {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std_dev: f32,
    pub total_pixels: usize,
}

pub fn frame_statistics(frame: &Frame) -> FrameStatistics {
    let array = &frame.samples;
    let min = array.iter().fold(f32::INFINITY, |a, &b| a.min(b));
    let max = array.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let count = array.len() as f32;
    let mean = array.iter().sum::<f32>() / count;
    let variance = array
        .iter()
        .map(|x| {
            let diff = mean - x;
            diff * diff
        })
        .sum::<f32>()
        / count;

    FrameStatistics {
        min,
        max,
        mean,
        std_dev: variance.sqrt(),
        total_pixels: array.len(),
    }
}

fn is_uniform(pixels: &Array3<u8>) -> bool {
    let mut iter = pixels.iter();
    match iter.next() {
        Some(first) => iter.all(|v| v == first),
        None => true,
    }
}

/// Range of modality values a frame with this header can hold.
fn representable_range(asset: &ImagingAsset) -> (f64, f64) {
    let bits = asset.bits_stored.clamp(1, 32) as i32;
    let (raw_lo, raw_hi) = if asset.is_signed() {
        (-(2f64.powi(bits - 1)), 2f64.powi(bits - 1) - 1.0)
    } else {
        (0.0, 2f64.powi(bits) - 1.0)
    };
    let slope = asset.rescale_slope.unwrap_or(1.0);
    let intercept = asset.rescale_intercept.unwrap_or(0.0);
    let (a, b) = (raw_lo * slope + intercept, raw_hi * slope + intercept);
    (a.min(b), a.max(b))
}

/// Rescales a stored window that was written for a different bit depth than BitsStored.
///
/// A window whose interval misses the representable range entirely is assumed to be
/// expressed in the smallest bit depth that contains its upper bound, and is scaled by
/// `2^bits_stored / 2^implied_bits`.
pub fn reconcile_window(level: WindowLevel, asset: &ImagingAsset) -> WindowLevel {
    let (lo, hi) = representable_range(asset);
    let lower = level.center - level.width / 2.0;
    let upper = level.center + level.width / 2.0;
    if upper >= lo && lower <= hi {
        return level;
    }

    let magnitude = lower.abs().max(upper.abs()).max(1.0);
    let implied_bits = magnitude.log2().ceil().max(1.0);
    let factor = 2f64.powi(asset.bits_stored as i32) / 2f64.powf(implied_bits);
    let scaled = WindowLevel {
        center: level.center * factor,
        width: level.width * factor,
    };
    let (s_lower, s_upper) = (
        scaled.center - scaled.width / 2.0,
        scaled.center + scaled.width / 2.0,
    );
    if s_upper >= lo && s_lower <= hi {
        scaled
    } else {
        level
    }
}

fn try_window(samples: &Array3<f32>, params: WindowParameters) -> Option<(Array3<u8>, WindowParameters)> {
    match apply_window(samples.view(), &params) {
        Ok(pixels) if !is_uniform(&pixels) => Some((pixels, params)),
        _ => None,
    }
}

/// Runs the explicit → preset → percentile chain over modality values.
pub fn resolve_window(
    samples: &Array3<f32>,
    asset: &ImagingAsset,
    mode: WindowingMode,
) -> Result<(Array3<u8>, WindowParameters)> {
    if let WindowingMode::Explicit { index } = mode {
        let index = index.unwrap_or(0);
        if let Some(level) = asset.windows.get(index) {
            let level = reconcile_window(*level, asset);
            let params = WindowParameters {
                center: level.center,
                width: level.width,
                source: WindowSource::Explicit { index },
            };
            if let Some(found) = try_window(samples, params) {
                return Ok(found);
            }
        }
    }

    if mode != WindowingMode::Auto {
        let preset = match mode {
            WindowingMode::Preset(preset) => preset,
            _ => Preset::fallback_for(asset.bits_stored),
        };
        if let Some(found) = try_window(samples, WindowParameters::preset(preset)) {
            return Ok(found);
        }
    }

    let params = percentile_window(samples.view())?;
    let pixels = apply_window(samples.view(), &params)?;
    Ok((pixels, params))
}

/// Full windowing stage for one frame. Samples arrive with the modality LUT and color
/// conversion already applied; color frames are display-ready 8-bit RGB.
pub fn window_frame(frame: &Frame, asset: &ImagingAsset, mode: WindowingMode) -> Result<WindowedFrame> {
    if frame.channels() == 3 {
        let parameters = WindowParameters::preset(Preset::EightBit);
        let pixels = apply_window(frame.samples.view(), &parameters)?;
        return Ok(WindowedFrame {
            index: frame.index,
            pixels,
            parameters,
        });
    }

    let (mut pixels, parameters) = resolve_window(&frame.samples, asset, mode)?;
    if asset.photometric_interpretation == Photometric::Monochrome1 {
        Zip::from(&mut pixels).for_each(|v| *v = 255 - *v);
    }

    Ok(WindowedFrame {
        index: frame.index,
        pixels,
        parameters,
    })
}
