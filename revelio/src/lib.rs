//! Revelio - astronomical source extraction.
//!
//! Given a two-dimensional image of sky brightness (optionally with
//! per-pixel noise, mask and segmentation planes), this library estimates a
//! spatially varying background, filters and thresholds the image,
//! segments connected regions into candidate sources, deblends merged
//! sources, cleans spurious detections, and reports a catalog of geometric
//! moments and photometric summaries. A second set of routines performs
//! aperture photometry around arbitrary positions.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use revelio::{Background, BackgroundConfig, ExtractConfig, Image, PixelData, PixelDataMut};
//!
//! let image = Image::new(PixelData::F32(&data), width, height)?;
//!
//! // Model and subtract the background.
//! let bkg = Background::new(&image, &BackgroundConfig::default())?;
//! bkg.subtract_from(&mut PixelDataMut::F32(&mut data))?;
//!
//! // Extract sources from the subtracted image.
//! let subtracted = Image::new(PixelData::F32(&data), width, height)?
//!     .with_noise_scalar(bkg.global_rms() as f64, revelio::NoiseKind::Stddev);
//! let catalog = revelio::extract(&subtracted, &ExtractConfig::default())?;
//! println!("found {} sources", catalog.len());
//! ```

mod aperture;
mod background;
mod buffer;
mod catalog;
mod ellipse;
mod error;
mod extract;
mod filter;
mod image;
pub(crate) mod math;
pub mod tunables;

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Image binding
// ============================================================================

pub use image::{Image, Noise, NoiseKind, PixelData, PixelDataMut, Segmap};

// ============================================================================
// Background estimation
// ============================================================================

pub use background::{Background, BackgroundConfig};

// ============================================================================
// Source extraction
// ============================================================================

pub use catalog::Catalog;
pub use extract::{
    ExtractConfig,
    FilterMode,
    // Object flag bits
    OBJ_MERGED,
    OBJ_SINGU,
    OBJ_TRUNC,
    ThreshKind,
    extract,
};
pub use filter::Kernel;

// ============================================================================
// Aperture photometry
// ============================================================================

pub use aperture::{
    APER_ALLMASKED,
    APER_HASMASKED,
    APER_NONPOSITIVE,
    // Aperture flag bits
    APER_TRUNC,
    AnnuliSums,
    ApertureOptions,
    SumResult,
    WinPosition,
    flux_radius,
    kron_radius,
    sum_circann,
    sum_circann_multi,
    sum_circle,
    sum_ellipann,
    sum_ellipse,
    winpos,
};

// ============================================================================
// Ellipse utilities
// ============================================================================

pub use ellipse::{ellipse_axes, ellipse_coeffs, mask_ellipse};

// ============================================================================
// Errors
// ============================================================================

pub use error::Error;
