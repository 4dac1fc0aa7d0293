//! Spatially varying background estimation.
//!
//! The image is tiled on a regular grid and each tile is reduced to a robust
//! (mean, sigma) pair by iterative sigma clipping. The tile grids are
//! median-filtered to suppress contamination from bright sources, then
//! turned into natural cubic splines for per-pixel evaluation.
//!
//! # Algorithm
//!
//! 1. Partition the image into `bw x bh` tiles (edge tiles truncated) and
//!    collect usable samples per tile, skipping masked and sentinel pixels.
//! 2. Clip each tile iteratively at 3 sigma around the running mean until
//!    the sigma stabilizes; when the clipped distribution is skewed, switch
//!    the tile value to the mode estimate `2.5*median - 1.5*mean`.
//! 3. Fill starved tiles from their nearest populated neighbor.
//! 4. Median-filter the tile grids with an `fw x fh` window, replacing only
//!    tiles that deviate from the window median by more than
//!    `fthresh * local_sigma`.
//! 5. Precompute spline second derivatives along each tile-grid column so a
//!    full image row is a y-interpolation plus one x-spline solve.

mod spline;

#[cfg(test)]
mod tests;

use rayon::prelude::*;

use crate::error::{Error, illegal_arg};
use crate::image::{Image, PixelDataMut};
use crate::math::{mean_sigma, median_f32_mut};
use spline::{linear_interp, natural_spline, spline_interp};

// ============================================================================
// Constants
// ============================================================================

/// Clip width in sigmas.
const CLIP_KAPPA: f64 = 3.0;

/// Iteration cap for the clipping loop.
const CLIP_MAX_ITERS: usize = 100;

/// Relative sigma change below which the clip has converged.
const CLIP_EPS: f64 = 1e-4;

/// Skewness trigger `|mean - median| / sigma` above which the tile value
/// switches from the clipped mean to the mode estimate.
const SKEW_TRIGGER: f64 = 0.3;

/// Minimum usable samples for a tile to contribute its own statistics.
const MIN_TILE_SAMPLES: usize = 4;

// ============================================================================
// Configuration
// ============================================================================

/// Tiling and filtering parameters for background estimation.
#[derive(Debug, Clone, Copy)]
pub struct BackgroundConfig {
    /// Tile width in pixels.
    pub bw: usize,
    /// Tile height in pixels.
    pub bh: usize,
    /// Median filter width, in tiles.
    pub fw: usize,
    /// Median filter height, in tiles.
    pub fh: usize,
    /// Filter threshold: a tile is replaced by the window median only when
    /// it deviates by more than `fthresh * local_sigma`.
    pub fthresh: f64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            bw: 64,
            bh: 64,
            fw: 3,
            fh: 3,
            fthresh: 0.0,
        }
    }
}

// ============================================================================
// Background model
// ============================================================================

/// A background model: tile grids of clipped statistics plus spline
/// coefficients for per-pixel evaluation. Built once from an image and
/// read-only afterwards.
#[derive(Debug, Clone)]
pub struct Background {
    width: usize,
    height: usize,
    bw: usize,
    bh: usize,
    nx: usize,
    ny: usize,
    /// Tile background values, `ny` rows of `nx`.
    back: Vec<f32>,
    /// Spline second derivatives of `back` along y, per tile-grid column.
    dback: Vec<f32>,
    /// Tile noise values.
    sigma: Vec<f32>,
    /// Spline second derivatives of `sigma` along y.
    dsigma: Vec<f32>,
    global: f32,
    global_rms: f32,
}

impl Background {
    /// Estimate the background of `image`.
    pub fn new(image: &Image, config: &BackgroundConfig) -> Result<Self, Error> {
        let width = image.width();
        let height = image.height();
        let BackgroundConfig {
            bw,
            bh,
            fw,
            fh,
            fthresh,
        } = *config;

        if bw == 0 || bh == 0 {
            return Err(illegal_arg("background tile dimensions must be nonzero"));
        }
        if width < bw || height < bh {
            return Err(illegal_arg(format!(
                "image {width}x{height} is smaller than one {bw}x{bh} tile"
            )));
        }
        if fw == 0 || fh == 0 {
            return Err(illegal_arg("background filter dimensions must be nonzero"));
        }

        let nx = width.div_ceil(bw);
        let ny = height.div_ceil(bh);

        let data = image.data_f32();
        let bad = image.bad_pixels(&data);

        // Per-tile clipped statistics, tiles independent.
        let stats: Vec<TileStats> = (0..nx * ny)
            .into_par_iter()
            .map_init(
                || Vec::with_capacity(bw * bh),
                |samples, idx| {
                    let tx = idx % nx;
                    let ty = idx / nx;
                    let x0 = tx * bw;
                    let x1 = (x0 + bw).min(width);
                    let y0 = ty * bh;
                    let y1 = (y0 + bh).min(height);

                    samples.clear();
                    for y in y0..y1 {
                        let row = &data.values()[y * width + x0..y * width + x1];
                        match bad.as_deref() {
                            None => samples.extend_from_slice(row),
                            Some(bad) => {
                                let flags = &bad[y * width + x0..y * width + x1];
                                samples.extend(
                                    row.iter()
                                        .zip(flags)
                                        .filter(|&(_, &b)| !b)
                                        .map(|(&v, _)| v),
                                );
                            }
                        }
                    }
                    tile_stats(samples)
                },
            )
            .collect();

        let mut back: Vec<f32> = stats.iter().map(|s| s.value).collect();
        let mut sigma: Vec<f32> = stats.iter().map(|s| s.sigma).collect();
        let populated: Vec<bool> = stats.iter().map(|s| s.populated).collect();

        let starved = populated.iter().filter(|&&p| !p).count();
        if starved > 0 {
            tracing::debug!(starved, total = nx * ny, "filling starved background tiles");
            fill_starved_tiles(&mut back, &populated, nx, ny);
            fill_starved_tiles(&mut sigma, &populated, nx, ny);
        }

        if (fw > 1 || fh > 1) && nx * ny > 1 {
            median_filter_grids(&mut back, &mut sigma, nx, ny, fw, fh, fthresh);
        }

        let global = grid_median(&back);
        let global_rms = grid_median(&sigma);

        let dback = column_derivs(&back, nx, ny);
        let dsigma = column_derivs(&sigma, nx, ny);

        tracing::debug!(nx, ny, global, global_rms, "background model built");

        Ok(Self {
            width,
            height,
            bw,
            bh,
            nx,
            ny,
            back,
            dback,
            sigma,
            dsigma,
            global,
            global_rms,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of tiles along x and y.
    #[inline]
    pub fn tiles(&self) -> (usize, usize) {
        (self.nx, self.ny)
    }

    /// Global background level: the median of the tile means.
    #[inline]
    pub fn global(&self) -> f32 {
        self.global
    }

    /// Global background noise: the median of the tile sigmas.
    #[inline]
    pub fn global_rms(&self) -> f32 {
        self.global_rms
    }

    // ========================================================================
    // Point evaluation
    // ========================================================================

    /// Background at pixel `(x, y)` by bilinear interpolation between tile
    /// nodes. Row evaluation uses the spline instead.
    pub fn pixel(&self, x: usize, y: usize) -> f32 {
        debug_assert!(x < self.width && y < self.height);
        let ux = (x as f64 + 0.5) / self.bw as f64 - 0.5;
        let uy = (y as f64 + 0.5) / self.bh as f64 - 0.5;

        if self.ny == 1 {
            return linear_interp(&self.back[..self.nx], ux);
        }

        let uy = uy.clamp(0.0, (self.ny - 1) as f64);
        let ky = (uy.floor() as usize).min(self.ny - 2);
        let t = (uy - ky as f64) as f32;

        let row0 = &self.back[ky * self.nx..(ky + 1) * self.nx];
        let row1 = &self.back[(ky + 1) * self.nx..(ky + 2) * self.nx];
        (1.0 - t) * linear_interp(row0, ux) + t * linear_interp(row1, ux)
    }

    // ========================================================================
    // Row and image evaluation
    // ========================================================================

    /// Evaluate the background along row `y` into `out` (length `width`).
    pub fn line(&self, y: usize, out: &mut PixelDataMut) -> Result<(), Error> {
        self.write_row(Grid::Back, y, out, WriteMode::Store)
    }

    /// Evaluate the background RMS along row `y` into `out`.
    pub fn rms_line(&self, y: usize, out: &mut PixelDataMut) -> Result<(), Error> {
        self.write_row(Grid::Rms, y, out, WriteMode::Store)
    }

    /// Subtract the background of row `y` from `out` in place.
    pub fn subtract_line(&self, y: usize, out: &mut PixelDataMut) -> Result<(), Error> {
        self.write_row(Grid::Back, y, out, WriteMode::Subtract)
    }

    /// Evaluate the background for the whole image into `out`
    /// (length `width * height`).
    pub fn array(&self, out: &mut PixelDataMut) -> Result<(), Error> {
        self.write_image(Grid::Back, out, WriteMode::Store)
    }

    /// Evaluate the background RMS for the whole image into `out`.
    pub fn rms_array(&self, out: &mut PixelDataMut) -> Result<(), Error> {
        self.write_image(Grid::Rms, out, WriteMode::Store)
    }

    /// Subtract the background from the whole image `out` in place.
    pub fn subtract_from(&self, out: &mut PixelDataMut) -> Result<(), Error> {
        self.write_image(Grid::Back, out, WriteMode::Subtract)
    }

    /// Row of background values as `f32`, the internal fast path.
    pub(crate) fn line_f32(&self, y: usize, out: &mut [f32]) {
        self.eval_row(&self.back, &self.dback, y, out);
    }

    /// Row of background RMS values as `f32`.
    pub(crate) fn rms_line_f32(&self, y: usize, out: &mut [f32]) {
        self.eval_row(&self.sigma, &self.dsigma, y, out);
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Interpolate the tile nodes at image row `y` (spline along y), then
    /// spline the node row along x to fill a full pixel row.
    fn eval_row(&self, grid: &[f32], derivs: &[f32], y: usize, out: &mut [f32]) {
        debug_assert_eq!(out.len(), self.width);
        let nx = self.nx;

        let mut nodes = vec![0.0f32; nx];
        if self.ny == 1 {
            nodes.copy_from_slice(&grid[..nx]);
        } else {
            let u = ((y as f64 + 0.5) / self.bh as f64 - 0.5).clamp(0.0, (self.ny - 1) as f64);
            let ky = (u.floor() as usize).min(self.ny - 2);
            let b = u - ky as f64;
            let a = 1.0 - b;
            let ca = (a * a * a - a) / 6.0;
            let cb = (b * b * b - b) / 6.0;

            let i0 = ky * nx;
            let i1 = (ky + 1) * nx;
            for tx in 0..nx {
                let val = a * grid[i0 + tx] as f64
                    + b * grid[i1 + tx] as f64
                    + ca * derivs[i0 + tx] as f64
                    + cb * derivs[i1 + tx] as f64;
                nodes[tx] = val as f32;
            }
        }

        if nx == 1 {
            out.fill(nodes[0]);
            return;
        }

        let mut xderivs = vec![0.0f32; nx];
        let mut work = vec![0.0f64; nx];
        natural_spline(&nodes, &mut xderivs, &mut work);

        let inv_bw = 1.0 / self.bw as f64;
        for (x, o) in out.iter_mut().enumerate() {
            let u = (x as f64 + 0.5) * inv_bw - 0.5;
            *o = spline_interp(&nodes, &xderivs, u);
        }
    }

    fn write_row(
        &self,
        grid: Grid,
        y: usize,
        out: &mut PixelDataMut,
        mode: WriteMode,
    ) -> Result<(), Error> {
        if y >= self.height {
            return Err(illegal_arg(format!(
                "row {y} outside image of height {}",
                self.height
            )));
        }
        if out.len() != self.width {
            return Err(illegal_arg(format!(
                "line buffer length {} does not match width {}",
                out.len(),
                self.width
            )));
        }

        let mut row = vec![0.0f32; self.width];
        match grid {
            Grid::Back => self.line_f32(y, &mut row),
            Grid::Rms => self.rms_line_f32(y, &mut row),
        }
        write_values(&row, out, mode, "background output")
    }

    fn write_image(
        &self,
        grid: Grid,
        out: &mut PixelDataMut,
        mode: WriteMode,
    ) -> Result<(), Error> {
        if out.len() != self.width * self.height {
            return Err(illegal_arg(format!(
                "image buffer length {} does not match {}x{}",
                out.len(),
                self.width,
                self.height
            )));
        }

        let width = self.width;
        let eval = |y: usize, row: &mut [f32]| match grid {
            Grid::Back => self.eval_row(&self.back, &self.dback, y, row),
            Grid::Rms => self.eval_row(&self.sigma, &self.dsigma, y, row),
        };

        match out {
            PixelDataMut::F32(slice) => {
                slice
                    .par_chunks_mut(width)
                    .enumerate()
                    .for_each_init(
                        || vec![0.0f32; width],
                        |scratch, (y, row)| {
                            eval(y, scratch);
                            apply_f32(row, scratch, mode);
                        },
                    );
                Ok(())
            }
            PixelDataMut::F64(slice) => {
                slice
                    .par_chunks_mut(width)
                    .enumerate()
                    .for_each_init(
                        || vec![0.0f32; width],
                        |scratch, (y, row)| {
                            eval(y, scratch);
                            apply_f64(row, scratch, mode);
                        },
                    );
                Ok(())
            }
            other => Err(Error::UnsupportedDtype {
                dtype: other.dtype_name(),
                context: "background output",
            }),
        }
    }
}

#[derive(Clone, Copy)]
enum Grid {
    Back,
    Rms,
}

#[derive(Clone, Copy)]
enum WriteMode {
    Store,
    Subtract,
}

fn write_values(
    row: &[f32],
    out: &mut PixelDataMut,
    mode: WriteMode,
    context: &'static str,
) -> Result<(), Error> {
    match out {
        PixelDataMut::F32(slice) => {
            apply_f32(slice, row, mode);
            Ok(())
        }
        PixelDataMut::F64(slice) => {
            apply_f64(slice, row, mode);
            Ok(())
        }
        other => Err(Error::UnsupportedDtype {
            dtype: other.dtype_name(),
            context,
        }),
    }
}

fn apply_f32(out: &mut [f32], values: &[f32], mode: WriteMode) {
    match mode {
        WriteMode::Store => out.copy_from_slice(values),
        WriteMode::Subtract => {
            for (o, &v) in out.iter_mut().zip(values) {
                *o -= v;
            }
        }
    }
}

fn apply_f64(out: &mut [f64], values: &[f32], mode: WriteMode) {
    match mode {
        WriteMode::Store => {
            for (o, &v) in out.iter_mut().zip(values) {
                *o = v as f64;
            }
        }
        WriteMode::Subtract => {
            for (o, &v) in out.iter_mut().zip(values) {
                *o -= v as f64;
            }
        }
    }
}

// ============================================================================
// Tile statistics
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct TileStats {
    value: f32,
    sigma: f32,
    populated: bool,
}

/// Clipped statistics of one tile's samples. The buffer is compacted in
/// place by the clipping loop.
fn tile_stats(samples: &mut Vec<f32>) -> TileStats {
    if samples.len() < MIN_TILE_SAMPLES {
        return TileStats {
            value: 0.0,
            sigma: 0.0,
            populated: false,
        };
    }

    let (mut mean, mut sigma) = mean_sigma(samples);
    let mut len = samples.len();

    for _ in 0..CLIP_MAX_ITERS {
        if sigma <= 0.0 {
            break;
        }
        let lo = mean - CLIP_KAPPA * sigma;
        let hi = mean + CLIP_KAPPA * sigma;

        let mut keep = 0;
        for i in 0..len {
            let v = samples[i];
            if (v as f64) >= lo && (v as f64) <= hi {
                samples[keep] = v;
                keep += 1;
            }
        }
        if keep == len || keep < MIN_TILE_SAMPLES {
            break;
        }
        len = keep;

        let (new_mean, new_sigma) = mean_sigma(&samples[..len]);
        let converged = (new_sigma - sigma).abs() <= CLIP_EPS * sigma;
        mean = new_mean;
        sigma = new_sigma;
        if converged {
            break;
        }
    }

    let median = median_f32_mut(&mut samples[..len]) as f64;
    let value = if sigma > 0.0 && ((mean - median) / sigma).abs() > SKEW_TRIGGER {
        // Source-contaminated tile: switch to the mode estimate.
        2.5 * median - 1.5 * mean
    } else {
        mean
    };

    TileStats {
        value: value as f32,
        sigma: sigma as f32,
        populated: true,
    }
}

/// Replace starved tiles with the value of the nearest populated tile
/// (row-major scan order breaks distance ties); fall back to the median of
/// the populated tiles when a ring search finds nothing.
fn fill_starved_tiles(grid: &mut [f32], populated: &[bool], nx: usize, ny: usize) {
    let source = grid.to_vec();

    let mut populated_values: Vec<f32> = source
        .iter()
        .zip(populated)
        .filter(|&(_, &p)| p)
        .map(|(&v, _)| v)
        .collect();
    let fallback = if populated_values.is_empty() {
        0.0
    } else {
        median_f32_mut(&mut populated_values)
    };

    let max_ring = nx.max(ny);
    for ty in 0..ny {
        for tx in 0..nx {
            let idx = ty * nx + tx;
            if populated[idx] {
                continue;
            }

            let mut filled = fallback;
            'search: for ring in 1..=max_ring {
                let y0 = ty.saturating_sub(ring);
                let y1 = (ty + ring).min(ny - 1);
                let x0 = tx.saturating_sub(ring);
                let x1 = (tx + ring).min(nx - 1);
                for sy in y0..=y1 {
                    for sx in x0..=x1 {
                        // Ring border only.
                        let on_border = sy == y0 || sy == y1 || sx == x0 || sx == x1;
                        if on_border && populated[sy * nx + sx] {
                            filled = source[sy * nx + sx];
                            break 'search;
                        }
                    }
                }
            }
            grid[idx] = filled;
        }
    }
}

/// Median filter both tile grids with an `fw x fh` window, replacing only
/// tiles that deviate from the window median by more than
/// `fthresh * local_sigma` (the window median of the sigma grid).
fn median_filter_grids(
    back: &mut [f32],
    sigma: &mut [f32],
    nx: usize,
    ny: usize,
    fw: usize,
    fh: usize,
    fthresh: f64,
) {
    let src_back = back.to_vec();
    let src_sigma = sigma.to_vec();
    let hw = fw / 2;
    let hh = fh / 2;

    let mut window = Vec::with_capacity(fw * fh);
    for ty in 0..ny {
        for tx in 0..nx {
            let x0 = tx.saturating_sub(hw);
            let x1 = (tx + hw).min(nx - 1);
            let y0 = ty.saturating_sub(hh);
            let y1 = (ty + hh).min(ny - 1);

            window.clear();
            for sy in y0..=y1 {
                window.extend_from_slice(&src_back[sy * nx + x0..sy * nx + x1 + 1]);
            }
            let med_back = median_f32_mut(&mut window);

            window.clear();
            for sy in y0..=y1 {
                window.extend_from_slice(&src_sigma[sy * nx + x0..sy * nx + x1 + 1]);
            }
            let med_sigma = median_f32_mut(&mut window);

            let idx = ty * nx + tx;
            let gate = (fthresh * med_sigma as f64) as f32;
            if (src_back[idx] - med_back).abs() > gate {
                back[idx] = med_back;
            }
            if (src_sigma[idx] - med_sigma).abs() > gate {
                sigma[idx] = med_sigma;
            }
        }
    }
}

fn grid_median(grid: &[f32]) -> f32 {
    let mut scratch = grid.to_vec();
    median_f32_mut(&mut scratch)
}

/// Natural-spline second derivatives along y for every tile-grid column.
fn column_derivs(grid: &[f32], nx: usize, ny: usize) -> Vec<f32> {
    let mut derivs = vec![0.0f32; nx * ny];
    if ny < 3 {
        return derivs;
    }

    let mut column = vec![0.0f32; ny];
    let mut col_derivs = vec![0.0f32; ny];
    let mut work = vec![0.0f64; ny];
    for tx in 0..nx {
        for ty in 0..ny {
            column[ty] = grid[ty * nx + tx];
        }
        natural_spline(&column, &mut col_derivs, &mut work);
        for ty in 0..ny {
            derivs[ty * nx + tx] = col_derivs[ty];
        }
    }
    derivs
}
