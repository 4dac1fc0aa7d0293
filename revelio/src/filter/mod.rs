//! Detection-image construction: convolution and matched filtering.
//!
//! The segmenter scans a filtered "detection image" rather than the raw
//! samples. Two semantics are supported:
//!
//! - **Convolution**: plain correlation with the kernel, pixels outside the
//!   image contributing zero. The result is compared against a per-pixel
//!   threshold by the caller.
//! - **Matched filter**: noise-weighted correlation
//!   `t = sum(K * D / sigma^2)` normalized by `n = sqrt(sum(K^2 / sigma^2))`,
//!   which maximizes point-source SNR under known per-pixel noise. Kernel
//!   positions that fall off the image, or land on masked or sentinel
//!   pixels, are excluded from both sums, so image edges renormalize instead
//!   of dimming. The output is in sigma units and is thresholded directly.


use rayon::prelude::*;

use crate::buffer::Buffer2;
use crate::error::{Error, illegal_arg};

/// A small convolution kernel with odd dimensions.
#[derive(Debug, Clone)]
pub struct Kernel {
    weights: Vec<f32>,
    width: usize,
    height: usize,
}

impl Kernel {
    pub fn new(weights: Vec<f32>, width: usize, height: usize) -> Result<Self, Error> {
        if width == 0 || height == 0 || width % 2 == 0 || height % 2 == 0 {
            return Err(illegal_arg(format!(
                "kernel dimensions must be odd and nonzero, got {width}x{height}"
            )));
        }
        if weights.len() != width * height {
            return Err(illegal_arg(format!(
                "kernel length {} does not match {width}x{height}",
                weights.len()
            )));
        }
        if weights.iter().all(|&w| w == 0.0) {
            return Err(illegal_arg("kernel must have at least one nonzero weight"));
        }
        Ok(Self {
            weights,
            width,
            height,
        })
    }

    /// The 3x3 pyramidal kernel used by default for detection filtering.
    pub fn default_3x3() -> Self {
        Self {
            weights: vec![1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0],
            width: 3,
            height: 3,
        }
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
    fn half(&self) -> (isize, isize) {
        ((self.width / 2) as isize, (self.height / 2) as isize)
    }

    /// Copy of the kernel scaled to unit sum. Plain convolution uses this so
    /// the filtered image stays comparable to thresholds drawn from the
    /// unfiltered noise; the matched filter is scale-invariant and uses the
    /// weights as given.
    pub(crate) fn normalized(&self) -> Kernel {
        let sum: f32 = self.weights.iter().sum();
        if sum.abs() <= f32::EPSILON {
            return self.clone();
        }
        Kernel {
            weights: self.weights.iter().map(|w| w / sum).collect(),
            width: self.width,
            height: self.height,
        }
    }
}

/// Plain correlation of `image` with `kernel`.
///
/// Out-of-image positions contribute zero; masked and sentinel pixels
/// (`bad`) also contribute zero.
pub(crate) fn convolve(
    image: &Buffer2<f32>,
    bad: Option<&[bool]>,
    kernel: &Kernel,
) -> Buffer2<f32> {
    let width = image.width();
    let height = image.height();
    let (hw, hh) = kernel.half();

    let mut out = Buffer2::filled(width, height, 0.0f32);
    out.values_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, out_row)| {
            for (x, o) in out_row.iter_mut().enumerate() {
                let mut sum = 0.0f64;
                let mut k = 0;
                for ky in 0..kernel.height {
                    let sy = y as isize + ky as isize - hh;
                    if sy < 0 || sy >= height as isize {
                        k += kernel.width;
                        continue;
                    }
                    let row_base = sy as usize * width;
                    for kx in 0..kernel.width {
                        let w = kernel.weights[k];
                        k += 1;
                        let sx = x as isize + kx as isize - hw;
                        if sx < 0 || sx >= width as isize {
                            continue;
                        }
                        let idx = row_base + sx as usize;
                        if bad.is_some_and(|b| b[idx]) {
                            continue;
                        }
                        sum += w as f64 * image[idx] as f64;
                    }
                }
                *o = sum as f32;
            }
        });
    out
}

/// Noise-weighted matched filter of `image` with `kernel`.
///
/// `sigma` holds per-pixel 1-sigma noise. Positions with non-positive noise
/// are excluded along with masked, sentinel and off-image positions; the
/// output is the local SNR of a kernel-shaped source.
pub(crate) fn matched_filter(
    image: &Buffer2<f32>,
    sigma: &Buffer2<f32>,
    bad: Option<&[bool]>,
    kernel: &Kernel,
) -> Buffer2<f32> {
    debug_assert_eq!(image.len(), sigma.len());
    let width = image.width();
    let height = image.height();
    let (hw, hh) = kernel.half();

    let mut out = Buffer2::filled(width, height, 0.0f32);
    out.values_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, out_row)| {
            for (x, o) in out_row.iter_mut().enumerate() {
                let mut t = 0.0f64;
                let mut norm2 = 0.0f64;
                let mut k = 0;
                for ky in 0..kernel.height {
                    let sy = y as isize + ky as isize - hh;
                    if sy < 0 || sy >= height as isize {
                        k += kernel.width;
                        continue;
                    }
                    let row_base = sy as usize * width;
                    for kx in 0..kernel.width {
                        let w = kernel.weights[k] as f64;
                        k += 1;
                        let sx = x as isize + kx as isize - hw;
                        if sx < 0 || sx >= width as isize {
                            continue;
                        }
                        let idx = row_base + sx as usize;
                        if bad.is_some_and(|b| b[idx]) {
                            continue;
                        }
                        let s = sigma[idx] as f64;
                        if s <= 0.0 {
                            continue;
                        }
                        let inv_var = 1.0 / (s * s);
                        t += w * image[idx] as f64 * inv_var;
                        norm2 += w * w * inv_var;
                    }
                }
                *o = if norm2 > 0.0 {
                    (t / norm2.sqrt()) as f32
                } else {
                    0.0
                };
            }
        });
    out
}
