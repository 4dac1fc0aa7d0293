//! Source extraction: filtering, segmentation, deblending, cleaning.
//!
//! # Pipeline
//!
//! 1. Materialize `f32` working buffers from the bound image planes and
//!    resolve the detection thresholds (relative thresholds scale the noise,
//!    absolute thresholds are used as-is).
//! 2. Build the detection image: plain convolution, or a noise-weighted
//!    matched filter when per-pixel noise is available and requested.
//! 3. Raster-scan segmentation into provisional objects ([`segment`]).
//! 4. Multi-threshold deblending of each finalized object ([`deblend`]).
//! 5. Optional cleaning of faint detections in bright wings ([`clean`]).
//! 6. Shape analysis and catalog assembly.
//!
//! When the image carries a segmentation map, steps 2 to 5 are bypassed and
//! the map's objects are measured directly.

mod clean;
mod deblend;
pub(crate) mod object;
mod segment;

#[cfg(test)]
mod tests;

use crate::buffer::Buffer2;
use crate::catalog::Catalog;
use crate::error::{Error, illegal_arg};
use crate::filter::{Kernel, convolve, matched_filter};
use crate::image::{Image, Segmap};
use crate::tunables;
use object::{Accum, DetectionContext, RawObject, Threshold, VarSource, analyse};

pub use object::{OBJ_MERGED, OBJ_SINGU, OBJ_TRUNC};

// ============================================================================
// Configuration
// ============================================================================

/// Interpretation of the detection threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreshKind {
    /// Multiples of the per-pixel noise sigma.
    #[default]
    Relative,
    /// Absolute data values.
    Absolute,
}

/// Detection-filter semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Plain convolution against a noise-scaled threshold.
    #[default]
    Conv,
    /// Noise-weighted matched filter; needs a per-pixel noise plane and
    /// falls back to convolution without one.
    Matched,
}

/// Extraction parameters.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Detection threshold; sigmas for [`ThreshKind::Relative`], data units
    /// for [`ThreshKind::Absolute`].
    pub thresh: f64,
    pub thresh_kind: ThreshKind,
    /// Minimum member pixels for an object to survive.
    pub minarea: usize,
    /// Detection kernel; `None` scans the unfiltered image.
    pub kernel: Option<Kernel>,
    pub filter_mode: FilterMode,
    /// Number of rungs in the deblending threshold ladder.
    pub deblend_nthresh: usize,
    /// Minimum branch flux as a fraction of its parent's.
    pub deblend_cont: f64,
    pub clean: bool,
    /// Scale applied to the ellipse gate of the cleaning pass.
    pub clean_param: f64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            thresh: 1.5,
            thresh_kind: ThreshKind::Relative,
            minarea: 5,
            kernel: Some(Kernel::default_3x3()),
            filter_mode: FilterMode::Conv,
            deblend_nthresh: 32,
            deblend_cont: 0.005,
            clean: true,
            clean_param: 1.0,
        }
    }
}

impl ExtractConfig {
    fn validate(&self) -> Result<(), Error> {
        if !self.thresh.is_finite() {
            return Err(illegal_arg("detection threshold must be finite"));
        }
        if self.minarea == 0 {
            return Err(illegal_arg("minarea must be at least 1"));
        }
        if self.deblend_nthresh == 0 {
            return Err(illegal_arg("deblend_nthresh must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.deblend_cont) {
            return Err(illegal_arg(format!(
                "deblend_cont must be in [0, 1], got {}",
                self.deblend_cont
            )));
        }
        if self.clean && self.clean_param <= 0.0 {
            return Err(illegal_arg(format!(
                "clean_param must be positive, got {}",
                self.clean_param
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Extract sources from `image` and return their catalog.
pub fn extract(image: &Image, config: &ExtractConfig) -> Result<Catalog, Error> {
    config.validate()?;

    let raw = image.data_f32();
    let bad = image.bad_pixels(&raw);

    if let Some(segmap) = image.segmap() {
        return measure_segmap(image, &raw, bad.as_deref(), segmap);
    }

    let sigma_arr = image.sigma_f32();
    let sigma_scalar = image.sigma_scalar();
    let thresh = config.thresh as f32;

    // Threshold on the raw image, in data units.
    let rthresh_buf: Option<Buffer2<f32>> = match config.thresh_kind {
        ThreshKind::Relative => sigma_arr.as_ref().map(|sigma| {
            let mut buf = sigma.clone();
            for v in buf.values_mut() {
                *v *= thresh;
            }
            buf
        }),
        ThreshKind::Absolute => None,
    };
    let rthresh_scalar: Option<f32> = match config.thresh_kind {
        ThreshKind::Absolute => Some(thresh),
        ThreshKind::Relative => {
            if rthresh_buf.is_some() {
                None
            } else {
                sigma_scalar.map(|s| (config.thresh * s) as f32)
            }
        }
    };
    let rthresh = match (&rthresh_buf, rthresh_scalar) {
        (Some(buf), _) => Threshold::PerPixel(buf),
        (None, Some(s)) => Threshold::Scalar(s),
        (None, None) => return Err(Error::RelthreshNoNoise),
    };

    // Detection image and its threshold.
    let matched = config.filter_mode == FilterMode::Matched && sigma_arr.is_some();
    let conv_buf: Option<Buffer2<f32>> = match (&config.kernel, &sigma_arr) {
        (Some(kernel), Some(sigma)) if matched => {
            Some(matched_filter(&raw, sigma, bad.as_deref(), kernel))
        }
        (Some(kernel), _) => Some(convolve(&raw, bad.as_deref(), &kernel.normalized())),
        (None, _) => None,
    };
    let conv = conv_buf.as_ref().unwrap_or(&raw);
    // Matched output is in sigma units and takes the user threshold
    // directly; convolution compares against the noise-scaled threshold.
    let dthresh = if matched && config.kernel.is_some() {
        Threshold::Scalar(thresh)
    } else {
        rthresh
    };

    let ctx = DetectionContext {
        conv,
        raw: &raw,
        bad: bad.as_deref(),
        dthresh,
        rthresh,
        var: var_source(&sigma_arr, sigma_scalar),
        gain: image.gain(),
        minarea: config.minarea,
    };

    let detected = segment::scan(&ctx)?;

    let sub_limit = tunables::sub_object_limit();
    let mut objects: Vec<RawObject> = Vec::with_capacity(detected.len());
    for obj in detected {
        objects.extend(deblend::deblend(
            obj,
            &ctx,
            config.deblend_nthresh,
            config.deblend_cont,
            sub_limit,
        )?);
    }

    if config.clean {
        clean::clean(&mut objects, config.clean_param);
    }

    let mut catalog = Catalog::with_capacity(objects.len());
    for obj in &objects {
        let an = analyse(&obj.acc);
        catalog.push(&obj.acc, &an, &obj.pixels);
    }

    tracing::debug!(objects = catalog.len(), "extraction complete");
    Ok(catalog)
}

fn var_source<'a>(
    sigma_arr: &'a Option<Buffer2<f32>>,
    sigma_scalar: Option<f64>,
) -> VarSource<'a> {
    match (sigma_arr, sigma_scalar) {
        (Some(sigma), _) => VarSource::Sigma(sigma),
        (None, Some(s)) => VarSource::Scalar(s * s),
        (None, None) => VarSource::None,
    }
}

// ============================================================================
// Segmap-driven measurement
// ============================================================================

/// Measure the objects defined by an existing segmentation map: no
/// thresholding, deblending or cleaning, one catalog entry per id in the
/// map's id order.
fn measure_segmap(
    image: &Image,
    raw: &Buffer2<f32>,
    bad: Option<&[bool]>,
    segmap: Segmap,
) -> Result<Catalog, Error> {
    let width = image.width();
    let height = image.height();

    let mut plane = vec![0i64; width * height];
    for y in 0..height {
        segmap.data.copy_row_i64(
            width,
            y,
            0,
            width,
            &mut plane[y * width..(y + 1) * width],
        );
    }

    let ids: Vec<i64> = match segmap.ids {
        Some(ids) => {
            if ids.iter().any(|&id| id == 0) {
                return Err(illegal_arg("segmap id 0 is reserved for background"));
            }
            ids.to_vec()
        }
        None => {
            let mut ids: Vec<i64> = plane.iter().copied().filter(|&id| id != 0).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        }
    };

    let mut lookup: Vec<(i64, usize)> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    lookup.sort_unstable();

    let sigma_arr = image.sigma_f32();
    let ctx = DetectionContext {
        conv: raw,
        raw,
        bad,
        dthresh: Threshold::Scalar(0.0),
        rthresh: Threshold::Scalar(0.0),
        var: var_source(&sigma_arr, image.sigma_scalar()),
        gain: image.gain(),
        minarea: 1,
    };

    let mut objects: Vec<RawObject> = ids
        .iter()
        .map(|_| RawObject {
            acc: Accum::new(),
            pixels: Vec::new(),
        })
        .collect();

    for (idx, &id) in plane.iter().enumerate() {
        if id == 0 || bad.is_some_and(|b| b[idx]) {
            continue;
        }
        if let Ok(pos) = lookup.binary_search_by_key(&id, |&(id, _)| id) {
            let slot = lookup[pos].1;
            objects[slot].acc.add_pixel(idx, &ctx);
            objects[slot].pixels.push(idx);
        }
    }

    let mut catalog = Catalog::with_capacity(objects.len());
    for obj in &objects {
        if obj.pixels.is_empty() {
            continue;
        }
        let an = analyse(&obj.acc);
        catalog.push(&obj.acc, &an, &obj.pixels);
    }

    tracing::debug!(objects = catalog.len(), "segmap measurement complete");
    Ok(catalog)
}
