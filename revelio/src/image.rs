//! Image binding: typed pixel planes with runtime element-type dispatch.
//!
//! Sample, noise, mask and segmentation planes each carry their own element
//! type, chosen independently from `{u8, i32, f32, f64}`. Dispatch happens
//! once at the binding boundary: pipeline stages convert whole planes (or
//! whole rows) into `f32`/`f64` working buffers instead of branching on the
//! element type per pixel.

use crate::buffer::Buffer2;
use crate::error::{Error, illegal_arg};

/// Values at or below this magnitude (negative) are invalid-pixel sentinels.
pub(crate) const SENTINEL: f32 = -1e30;

/// True when a sample is usable (not NaN, not a sentinel).
#[inline]
pub(crate) fn is_valid_value(v: f32) -> bool {
    !v.is_nan() && v > SENTINEL
}

// ============================================================================
// Typed planes
// ============================================================================

/// A read-only pixel plane in one of the supported element types.
#[derive(Debug, Clone, Copy)]
pub enum PixelData<'a> {
    U8(&'a [u8]),
    I32(&'a [i32]),
    F32(&'a [f32]),
    F64(&'a [f64]),
}

impl<'a> PixelData<'a> {
    pub fn len(&self) -> usize {
        match self {
            PixelData::U8(s) => s.len(),
            PixelData::I32(s) => s.len(),
            PixelData::F32(s) => s.len(),
            PixelData::F64(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype_name(&self) -> &'static str {
        match self {
            PixelData::U8(_) => "u8",
            PixelData::I32(_) => "i32",
            PixelData::F32(_) => "f32",
            PixelData::F64(_) => "f64",
        }
    }

    /// Convert the whole plane to an `f32` working buffer.
    pub(crate) fn to_f32(&self, width: usize, height: usize) -> Buffer2<f32> {
        let values = match self {
            PixelData::U8(s) => s.iter().map(|&v| v as f32).collect(),
            PixelData::I32(s) => s.iter().map(|&v| v as f32).collect(),
            PixelData::F32(s) => s.to_vec(),
            PixelData::F64(s) => s.iter().map(|&v| v as f32).collect(),
        };
        Buffer2::new(width, height, values)
    }

    /// Copy `[x0, x1)` of row `y` into `out` as `f64`.
    ///
    /// This is the read path for aperture walkers, which touch small regions
    /// of large images; dispatch happens once per row.
    pub(crate) fn copy_row_f64(
        &self,
        width: usize,
        y: usize,
        x0: usize,
        x1: usize,
        out: &mut [f64],
    ) {
        debug_assert_eq!(out.len(), x1 - x0);
        let start = y * width + x0;
        let end = y * width + x1;
        match self {
            PixelData::U8(s) => {
                for (o, &v) in out.iter_mut().zip(&s[start..end]) {
                    *o = v as f64;
                }
            }
            PixelData::I32(s) => {
                for (o, &v) in out.iter_mut().zip(&s[start..end]) {
                    *o = v as f64;
                }
            }
            PixelData::F32(s) => {
                for (o, &v) in out.iter_mut().zip(&s[start..end]) {
                    *o = v as f64;
                }
            }
            PixelData::F64(s) => out.copy_from_slice(&s[start..end]),
        }
    }

    /// Copy `[x0, x1)` of row `y` into `out` as `i64` (segmentation ids).
    pub(crate) fn copy_row_i64(
        &self,
        width: usize,
        y: usize,
        x0: usize,
        x1: usize,
        out: &mut [i64],
    ) {
        debug_assert_eq!(out.len(), x1 - x0);
        let start = y * width + x0;
        let end = y * width + x1;
        match self {
            PixelData::U8(s) => {
                for (o, &v) in out.iter_mut().zip(&s[start..end]) {
                    *o = v as i64;
                }
            }
            PixelData::I32(s) => {
                for (o, &v) in out.iter_mut().zip(&s[start..end]) {
                    *o = v as i64;
                }
            }
            PixelData::F32(s) => {
                for (o, &v) in out.iter_mut().zip(&s[start..end]) {
                    *o = v as i64;
                }
            }
            PixelData::F64(s) => {
                for (o, &v) in out.iter_mut().zip(&s[start..end]) {
                    *o = v as i64;
                }
            }
        }
    }
}

/// A mutable pixel plane, used for background evaluation and subtraction
/// into caller-owned storage. Only floating-point element types can receive
/// background values; integer planes are rejected with
/// [`Error::UnsupportedDtype`].
#[derive(Debug)]
pub enum PixelDataMut<'a> {
    U8(&'a mut [u8]),
    I32(&'a mut [i32]),
    F32(&'a mut [f32]),
    F64(&'a mut [f64]),
}

impl<'a> PixelDataMut<'a> {
    pub fn len(&self) -> usize {
        match self {
            PixelDataMut::U8(s) => s.len(),
            PixelDataMut::I32(s) => s.len(),
            PixelDataMut::F32(s) => s.len(),
            PixelDataMut::F64(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype_name(&self) -> &'static str {
        match self {
            PixelDataMut::U8(_) => "u8",
            PixelDataMut::I32(_) => "i32",
            PixelDataMut::F32(_) => "f32",
            PixelDataMut::F64(_) => "f64",
        }
    }
}

// ============================================================================
// Noise model
// ============================================================================

/// Interpretation of noise values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoiseKind {
    /// Values are 1-sigma standard deviations.
    #[default]
    Stddev,
    /// Values are variances.
    Variance,
}

/// Per-pixel or scalar noise attached to an image.
#[derive(Debug, Clone, Copy)]
pub enum Noise<'a> {
    Scalar { value: f64, kind: NoiseKind },
    Array { data: PixelData<'a>, kind: NoiseKind },
}

// ============================================================================
// Segmentation map
// ============================================================================

/// An integer plane labelling pixels by external object id. Used to restrict
/// aperture sums to one object and to measure pre-segmented objects.
#[derive(Debug, Clone, Copy)]
pub struct Segmap<'a> {
    pub data: PixelData<'a>,
    /// Unique nonzero ids present in the map, in the order objects should be
    /// reported. When `None`, ids are discovered by scanning the map.
    pub ids: Option<&'a [i64]>,
}

// ============================================================================
// Image
// ============================================================================

/// A read-only view of a sky image and its auxiliary planes.
///
/// The view borrows caller storage; nothing is retained beyond the call that
/// consumes it.
#[derive(Debug, Clone, Copy)]
pub struct Image<'a> {
    data: PixelData<'a>,
    width: usize,
    height: usize,
    noise: Option<Noise<'a>>,
    mask: Option<PixelData<'a>>,
    mask_thresh: f64,
    segmap: Option<Segmap<'a>>,
    gain: f64,
}

impl<'a> Image<'a> {
    /// Bind a sample plane of the given dimensions.
    pub fn new(data: PixelData<'a>, width: usize, height: usize) -> Result<Self, Error> {
        if width == 0 || height == 0 {
            return Err(illegal_arg(format!(
                "image dimensions must be nonzero, got {width}x{height}"
            )));
        }
        if data.len() != width * height {
            return Err(illegal_arg(format!(
                "data length {} does not match {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            noise: None,
            mask: None,
            mask_thresh: 0.0,
            segmap: None,
            gain: 0.0,
        })
    }

    /// Attach a per-pixel noise plane.
    pub fn with_noise_array(mut self, data: PixelData<'a>, kind: NoiseKind) -> Result<Self, Error> {
        if data.len() != self.width * self.height {
            return Err(illegal_arg(format!(
                "noise length {} does not match {}x{}",
                data.len(),
                self.width,
                self.height
            )));
        }
        self.noise = Some(Noise::Array { data, kind });
        Ok(self)
    }

    /// Attach a scalar noise value applying to every pixel.
    pub fn with_noise_scalar(mut self, value: f64, kind: NoiseKind) -> Self {
        self.noise = Some(Noise::Scalar { value, kind });
        self
    }

    /// Attach a mask plane; a pixel is masked when `mask > thresh`.
    pub fn with_mask(mut self, data: PixelData<'a>, thresh: f64) -> Result<Self, Error> {
        if data.len() != self.width * self.height {
            return Err(illegal_arg(format!(
                "mask length {} does not match {}x{}",
                data.len(),
                self.width,
                self.height
            )));
        }
        self.mask = Some(data);
        self.mask_thresh = thresh;
        Ok(self)
    }

    /// Attach a segmentation map.
    pub fn with_segmap(mut self, segmap: Segmap<'a>) -> Result<Self, Error> {
        if segmap.data.len() != self.width * self.height {
            return Err(illegal_arg(format!(
                "segmap length {} does not match {}x{}",
                segmap.data.len(),
                self.width,
                self.height
            )));
        }
        self.segmap = Some(segmap);
        Ok(self)
    }

    /// Set the gain (poisson counts per data unit). Zero disables the
    /// poisson contribution to error estimates.
    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn data(&self) -> PixelData<'a> {
        self.data
    }

    #[inline]
    pub fn noise(&self) -> Option<Noise<'a>> {
        self.noise
    }

    #[inline]
    pub fn mask(&self) -> Option<PixelData<'a>> {
        self.mask
    }

    #[inline]
    pub fn mask_thresh(&self) -> f64 {
        self.mask_thresh
    }

    #[inline]
    pub fn segmap(&self) -> Option<Segmap<'a>> {
        self.segmap
    }

    #[inline]
    pub fn gain(&self) -> f64 {
        self.gain
    }

    // ========================================================================
    // Working-buffer materialization
    // ========================================================================

    /// Sample plane as an `f32` working buffer.
    pub(crate) fn data_f32(&self) -> Buffer2<f32> {
        self.data.to_f32(self.width, self.height)
    }

    /// Per-pixel 1-sigma noise as an `f32` buffer, when an array was bound.
    /// Variance planes are converted by square root.
    pub(crate) fn sigma_f32(&self) -> Option<Buffer2<f32>> {
        match self.noise {
            Some(Noise::Array { data, kind }) => {
                let mut buf = data.to_f32(self.width, self.height);
                if kind == NoiseKind::Variance {
                    for v in buf.values_mut() {
                        *v = v.max(0.0).sqrt();
                    }
                }
                Some(buf)
            }
            _ => None,
        }
    }

    /// Scalar 1-sigma noise, when one was bound.
    pub(crate) fn sigma_scalar(&self) -> Option<f64> {
        match self.noise {
            Some(Noise::Scalar { value, kind }) => Some(match kind {
                NoiseKind::Stddev => value,
                NoiseKind::Variance => value.max(0.0).sqrt(),
            }),
            _ => None,
        }
    }

    /// Per-pixel bad flags: masked, NaN, or sentinel samples.
    ///
    /// Returns `None` when every pixel is usable so callers can skip the
    /// per-pixel test entirely on clean images.
    pub(crate) fn bad_pixels(&self, data: &Buffer2<f32>) -> Option<Vec<bool>> {
        let n = self.width * self.height;
        let mut bad = vec![false; n];
        let mut any = false;

        for (flag, &v) in bad.iter_mut().zip(data.values()) {
            if !is_valid_value(v) {
                *flag = true;
                any = true;
            }
        }

        if let Some(mask) = self.mask {
            let thresh = self.mask_thresh;
            let mut row = vec![0.0f64; self.width];
            for y in 0..self.height {
                mask.copy_row_f64(self.width, y, 0, self.width, &mut row);
                let flags = &mut bad[y * self.width..(y + 1) * self.width];
                for (flag, &m) in flags.iter_mut().zip(&row) {
                    if m > thresh {
                        *flag = true;
                        any = true;
                    }
                }
            }
        }

        any.then_some(bad)
    }
}
