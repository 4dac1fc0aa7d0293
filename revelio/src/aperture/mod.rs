//! Aperture photometry: sums over circular, annular and elliptical
//! apertures, plus the derived quantities built on them (Kron radius, flux
//! radii, windowed positions).
//!
//! Pixel overlap uses subpixel sampling (`subpix^2` samples per boundary
//! pixel). Masked pixels are corrected with the mean of the valid aperture
//! pixels and reported through the flag bits; variance comes from the
//! image's noise model plus the Poisson term `sum / gain` when a gain is
//! set. With a segmentation id, pixels labeled with a different nonzero id
//! count as masked.


use crate::ellipse::ellipse_coeffs;
use crate::error::{Error, illegal_arg};
use crate::image::{Image, Noise, NoiseKind, is_valid_value};

// ============================================================================
// Aperture flags
// ============================================================================

/// The aperture is truncated by the image boundary.
pub const APER_TRUNC: u16 = 0x0010;
/// At least one pixel in the aperture is masked.
pub const APER_HASMASKED: u16 = 0x0020;
/// Every pixel in the aperture is masked.
pub const APER_ALLMASKED: u16 = 0x0040;
/// A nonpositive numerator or denominator was encountered.
pub const APER_NONPOSITIVE: u16 = 0x0080;

// ============================================================================
// Options and results
// ============================================================================

/// Options shared by the aperture routines.
#[derive(Debug, Clone, Copy)]
pub struct ApertureOptions {
    /// Subpixel sampling factor for boundary pixels.
    pub subpix: usize,
    /// Restrict the aperture to this segmentation id; pixels carrying a
    /// different nonzero id are treated as masked.
    pub seg_id: Option<i64>,
}

impl Default for ApertureOptions {
    fn default() -> Self {
        Self {
            subpix: 5,
            seg_id: None,
        }
    }
}

/// Result of an aperture sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumResult {
    pub sum: f64,
    pub sumerr: f64,
    /// Pixel area included in the sum, masked-and-corrected pixels included.
    pub area: f64,
    pub flags: u16,
}

/// Result of [`sum_circann_multi`]: one entry per concentric annulus.
#[derive(Debug, Clone, Default)]
pub struct AnnuliSums {
    pub sum: Vec<f64>,
    pub sumvar: Vec<f64>,
    pub area: Vec<f64>,
    pub maskarea: Vec<f64>,
    pub flags: u16,
}

/// Result of [`winpos`].
#[derive(Debug, Clone, Copy)]
pub struct WinPosition {
    pub x: f64,
    pub y: f64,
    pub niter: usize,
    pub flags: u16,
}

// ============================================================================
// Aperture shapes
// ============================================================================

/// Half-width of a pixel's diagonal: the band around an aperture edge where
/// pixels need subpixel sampling.
const EDGE_BAND: f64 = std::f64::consts::FRAC_1_SQRT_2;

#[derive(Debug, Clone, Copy)]
enum Shape {
    Circle {
        r: f64,
    },
    CircAnn {
        rin: f64,
        rout: f64,
    },
    /// `cxx*dx^2 + cyy*dy^2 + cxy*dx*dy <= r^2`, optionally with an inner
    /// exclusion at `rin`.
    EllipAnn {
        cxx: f64,
        cyy: f64,
        cxy: f64,
        rin: f64,
        rout: f64,
    },
}

impl Shape {
    /// Half-extents of the bounding box around the aperture center.
    fn extents(&self) -> (f64, f64) {
        match *self {
            Shape::Circle { r } => (r, r),
            Shape::CircAnn { rout, .. } => (rout, rout),
            Shape::EllipAnn {
                cxx, cyy, cxy, rout, ..
            } => {
                let det = cxx * cyy - cxy * cxy * 0.25;
                (rout * (cyy / det).sqrt(), rout * (cxx / det).sqrt())
            }
        }
    }

    /// Overlap fraction of the unit pixel centered at `(dx, dy)`.
    fn frac(&self, dx: f64, dy: f64, subpix: usize) -> f64 {
        match *self {
            Shape::Circle { r } => {
                let d = (dx * dx + dy * dy).sqrt();
                if d <= r - EDGE_BAND {
                    1.0
                } else if d >= r + EDGE_BAND {
                    0.0
                } else {
                    self.sample(dx, dy, subpix)
                }
            }
            Shape::CircAnn { rin, rout } => {
                let d = (dx * dx + dy * dy).sqrt();
                if d - EDGE_BAND >= rout || d + EDGE_BAND <= rin {
                    0.0
                } else if d + EDGE_BAND <= rout && (rin <= 0.0 || d - EDGE_BAND >= rin) {
                    1.0
                } else {
                    self.sample(dx, dy, subpix)
                }
            }
            // The quadratic form has no cheap inside/outside band; sample
            // every candidate pixel.
            Shape::EllipAnn { .. } => self.sample(dx, dy, subpix),
        }
    }

    fn sample(&self, dx: f64, dy: f64, subpix: usize) -> f64 {
        let step = 1.0 / subpix as f64;
        let origin = -0.5 + 0.5 * step;
        let mut hit = 0usize;
        for sy in 0..subpix {
            let py = dy + origin + sy as f64 * step;
            for sx in 0..subpix {
                let px = dx + origin + sx as f64 * step;
                if self.contains(px, py) {
                    hit += 1;
                }
            }
        }
        hit as f64 * step * step
    }

    #[inline]
    fn contains(&self, dx: f64, dy: f64) -> bool {
        match *self {
            Shape::Circle { r } => dx * dx + dy * dy <= r * r,
            Shape::CircAnn { rin, rout } => {
                let d2 = dx * dx + dy * dy;
                d2 <= rout * rout && d2 >= rin * rin
            }
            Shape::EllipAnn {
                cxx,
                cyy,
                cxy,
                rin,
                rout,
            } => {
                let q = cxx * dx * dx + cyy * dy * dy + cxy * dx * dy;
                q <= rout * rout && q >= rin * rin
            }
        }
    }
}

// ============================================================================
// Public sums
// ============================================================================

/// Sum image values within a circle of radius `r` around `(x, y)`.
pub fn sum_circle(
    image: &Image,
    x: f64,
    y: f64,
    r: f64,
    opts: &ApertureOptions,
) -> Result<SumResult, Error> {
    if !(r > 0.0) {
        return Err(illegal_arg(format!("aperture radius must be positive, got {r}")));
    }
    sum_shape(image, x, y, Shape::Circle { r }, opts)
}

/// Sum image values within the annulus `rin <= d <= rout` around `(x, y)`.
pub fn sum_circann(
    image: &Image,
    x: f64,
    y: f64,
    rin: f64,
    rout: f64,
    opts: &ApertureOptions,
) -> Result<SumResult, Error> {
    if !(rin >= 0.0 && rout > rin) {
        return Err(illegal_arg(format!(
            "annulus radii must satisfy 0 <= rin < rout, got {rin}, {rout}"
        )));
    }
    sum_shape(image, x, y, Shape::CircAnn { rin, rout }, opts)
}

/// Sum image values within the ellipse of semi-axes `a`, `b` rotated by
/// `theta`, scaled by `r`.
#[allow(clippy::too_many_arguments)]
pub fn sum_ellipse(
    image: &Image,
    x: f64,
    y: f64,
    a: f64,
    b: f64,
    theta: f64,
    r: f64,
    opts: &ApertureOptions,
) -> Result<SumResult, Error> {
    let (cxx, cyy, cxy) = validated_coeffs(a, b, theta)?;
    if !(r > 0.0) {
        return Err(illegal_arg(format!("ellipse scale must be positive, got {r}")));
    }
    sum_shape(
        image,
        x,
        y,
        Shape::EllipAnn {
            cxx,
            cyy,
            cxy,
            rin: 0.0,
            rout: r,
        },
        opts,
    )
}

/// Sum image values within the elliptical annulus `rin <= rho <= rout`.
#[allow(clippy::too_many_arguments)]
pub fn sum_ellipann(
    image: &Image,
    x: f64,
    y: f64,
    a: f64,
    b: f64,
    theta: f64,
    rin: f64,
    rout: f64,
    opts: &ApertureOptions,
) -> Result<SumResult, Error> {
    let (cxx, cyy, cxy) = validated_coeffs(a, b, theta)?;
    if !(rin >= 0.0 && rout > rin) {
        return Err(illegal_arg(format!(
            "annulus radii must satisfy 0 <= rin < rout, got {rin}, {rout}"
        )));
    }
    sum_shape(
        image,
        x,
        y,
        Shape::EllipAnn {
            cxx,
            cyy,
            cxy,
            rin,
            rout,
        },
        opts,
    )
}

fn validated_coeffs(a: f64, b: f64, theta: f64) -> Result<(f64, f64, f64), Error> {
    if !(a > 0.0 && b > 0.0 && b <= a) {
        return Err(illegal_arg(format!(
            "ellipse axes must satisfy a >= b > 0, got a = {a}, b = {b}"
        )));
    }
    if !theta.is_finite() {
        return Err(illegal_arg("ellipse angle must be finite"));
    }
    Ok(ellipse_coeffs(a, b, theta))
}

// ============================================================================
// Walker
// ============================================================================

/// Per-row views of the image planes over a pixel span, converted once per
/// row so the inner loop stays type-free.
struct RowBuffers {
    values: Vec<f64>,
    /// Per-pixel variance, already squared for stddev noise.
    variance: Vec<f64>,
    masked: Vec<bool>,
}

impl RowBuffers {
    fn new() -> Self {
        Self {
            values: Vec::new(),
            variance: Vec::new(),
            masked: Vec::new(),
        }
    }

    fn load(&mut self, image: &Image, y: usize, x0: usize, x1: usize, seg_id: Option<i64>) {
        let width = image.width();
        let n = x1 - x0;

        self.values.resize(n, 0.0);
        image
            .data()
            .copy_row_f64(width, y, x0, x1, &mut self.values);

        self.masked.clear();
        self.masked
            .extend(self.values.iter().map(|&v| !is_valid_value(v as f32)));

        if let Some(mask) = image.mask() {
            let thresh = image.mask_thresh();
            let mut row = vec![0.0f64; n];
            mask.copy_row_f64(width, y, x0, x1, &mut row);
            for (m, &v) in self.masked.iter_mut().zip(&row) {
                if v > thresh {
                    *m = true;
                }
            }
        }

        if let (Some(id), Some(segmap)) = (seg_id, image.segmap()) {
            let mut row = vec![0i64; n];
            segmap.data.copy_row_i64(width, y, x0, x1, &mut row);
            for (m, &s) in self.masked.iter_mut().zip(&row) {
                if s != 0 && s != id {
                    *m = true;
                }
            }
        }

        self.variance.resize(n, 0.0);
        match image.noise() {
            Some(Noise::Array { data, kind }) => {
                data.copy_row_f64(width, y, x0, x1, &mut self.variance);
                if kind == NoiseKind::Stddev {
                    for v in &mut self.variance {
                        *v *= *v;
                    }
                }
            }
            Some(Noise::Scalar { value, kind }) => {
                let var = match kind {
                    NoiseKind::Stddev => value * value,
                    NoiseKind::Variance => value,
                };
                self.variance.fill(var);
            }
            None => self.variance.fill(0.0),
        }
    }
}

/// Clip the aperture bounding box to the image; returns the pixel ranges
/// and whether clipping occurred.
fn clipped_bbox(
    image: &Image,
    x: f64,
    y: f64,
    rx: f64,
    ry: f64,
) -> Option<(usize, usize, usize, usize, bool)> {
    let width = image.width() as f64;
    let height = image.height() as f64;
    if x + rx < -0.5 || x - rx > width - 0.5 || y + ry < -0.5 || y - ry > height - 0.5 {
        return None;
    }

    let x0 = (x - rx).floor();
    let x1 = (x + rx).ceil();
    let y0 = (y - ry).floor();
    let y1 = (y + ry).ceil();
    let truncated = x0 < 0.0 || y0 < 0.0 || x1 > width - 1.0 || y1 > height - 1.0;

    let x0 = x0.max(0.0) as usize;
    let y0 = y0.max(0.0) as usize;
    let x1 = x1.min(width - 1.0) as usize;
    let y1 = y1.min(height - 1.0) as usize;
    Some((x0, x1, y0, y1, truncated))
}

fn sum_shape(
    image: &Image,
    x: f64,
    y: f64,
    shape: Shape,
    opts: &ApertureOptions,
) -> Result<SumResult, Error> {
    if opts.subpix == 0 {
        return Err(illegal_arg("subpix must be at least 1"));
    }

    let (rx, ry) = shape.extents();
    let Some((x0, x1, y0, y1, truncated)) = clipped_bbox(image, x, y, rx, ry) else {
        return Ok(SumResult {
            flags: APER_TRUNC,
            ..Default::default()
        });
    };

    let mut flags = if truncated { APER_TRUNC } else { 0 };
    let mut sum = 0.0f64;
    let mut sumvar = 0.0f64;
    let mut area = 0.0f64;
    let mut maskarea = 0.0f64;

    let mut rows = RowBuffers::new();
    for py in y0..=y1 {
        rows.load(image, py, x0, x1 + 1, opts.seg_id);
        let dy = py as f64 - y;
        for px in x0..=x1 {
            let dx = px as f64 - x;
            let frac = shape.frac(dx, dy, opts.subpix);
            if frac <= 0.0 {
                continue;
            }
            let i = px - x0;
            if rows.masked[i] {
                maskarea += frac;
            } else {
                sum += rows.values[i] * frac;
                sumvar += rows.variance[i] * frac;
                area += frac;
            }
        }
    }

    if maskarea > 0.0 {
        flags |= APER_HASMASKED;
        if area <= 0.0 {
            flags |= APER_ALLMASKED;
            return Ok(SumResult {
                flags,
                ..Default::default()
            });
        }
        // Correct masked area with the mean of the valid pixels.
        let scale = maskarea / area;
        sum += sum * scale;
        sumvar += sumvar * scale;
    }

    let mut variance = sumvar;
    if image.gain() > 0.0 && sum > 0.0 {
        variance += sum / image.gain();
    }

    Ok(SumResult {
        sum,
        sumerr: variance.sqrt(),
        area: area + maskarea,
        flags,
    })
}

// ============================================================================
// Concentric annuli
// ============================================================================

/// Sum `n` concentric annuli with outer radii `rmax/n, 2*rmax/n, ..., rmax`
/// in a single pass. Entry `i` covers radii `[i*rmax/n, (i+1)*rmax/n)`.
pub fn sum_circann_multi(
    image: &Image,
    x: f64,
    y: f64,
    rmax: f64,
    n: usize,
    opts: &ApertureOptions,
) -> Result<AnnuliSums, Error> {
    if !(rmax > 0.0) || n == 0 {
        return Err(illegal_arg("circann_multi needs rmax > 0 and n >= 1"));
    }
    if opts.subpix == 0 {
        return Err(illegal_arg("subpix must be at least 1"));
    }

    let mut out = AnnuliSums {
        sum: vec![0.0; n],
        sumvar: vec![0.0; n],
        area: vec![0.0; n],
        maskarea: vec![0.0; n],
        flags: 0,
    };

    let Some((x0, x1, y0, y1, truncated)) = clipped_bbox(image, x, y, rmax, rmax) else {
        out.flags = APER_TRUNC;
        return Ok(out);
    };
    if truncated {
        out.flags |= APER_TRUNC;
    }

    let step = 1.0 / opts.subpix as f64;
    let origin = -0.5 + 0.5 * step;
    let sample_weight = step * step;
    let ring_scale = n as f64 / rmax;

    let mut rows = RowBuffers::new();
    for py in y0..=y1 {
        rows.load(image, py, x0, x1 + 1, opts.seg_id);
        let dy = py as f64 - y;
        for px in x0..=x1 {
            let dx = px as f64 - x;
            // Skip pixels entirely outside the outer circle.
            let d = (dx * dx + dy * dy).sqrt();
            if d >= rmax + EDGE_BAND {
                continue;
            }
            let i = px - x0;
            for sy in 0..opts.subpix {
                let sdy = dy + origin + sy as f64 * step;
                for sx in 0..opts.subpix {
                    let sdx = dx + origin + sx as f64 * step;
                    let sd = (sdx * sdx + sdy * sdy).sqrt();
                    if sd >= rmax {
                        continue;
                    }
                    let ring = ((sd * ring_scale) as usize).min(n - 1);
                    if rows.masked[i] {
                        out.maskarea[ring] += sample_weight;
                        out.flags |= APER_HASMASKED;
                    } else {
                        out.sum[ring] += rows.values[i] * sample_weight;
                        out.sumvar[ring] += rows.variance[i] * sample_weight;
                        out.area[ring] += sample_weight;
                    }
                }
            }
        }
    }

    Ok(out)
}

// ============================================================================
// Kron radius
// ============================================================================

/// First-moment (Kron) radius within the ellipse
/// `cxx*dx^2 + cyy*dy^2 + cxy*dx*dy <= r^2`: the flux-weighted mean of the
/// elliptical radius. Returns zero with [`APER_NONPOSITIVE`] when either
/// moment sum is nonpositive.
#[allow(clippy::too_many_arguments)]
pub fn kron_radius(
    image: &Image,
    x: f64,
    y: f64,
    cxx: f64,
    cyy: f64,
    cxy: f64,
    r: f64,
    seg_id: Option<i64>,
) -> Result<(f64, u16), Error> {
    if !(r > 0.0) {
        return Err(illegal_arg(format!("kron integration radius must be positive, got {r}")));
    }
    let det = cxx * cyy - cxy * cxy * 0.25;
    if det <= 0.0 {
        return Err(illegal_arg("kron coefficients do not describe an ellipse"));
    }

    let rx = r * (cyy / det).sqrt();
    let ry = r * (cxx / det).sqrt();
    let Some((x0, x1, y0, y1, truncated)) = clipped_bbox(image, x, y, rx, ry) else {
        return Ok((0.0, APER_TRUNC | APER_NONPOSITIVE));
    };
    let mut flags = if truncated { APER_TRUNC } else { 0 };

    let r2 = r * r;
    let mut sum_rv = 0.0f64;
    let mut sum_v = 0.0f64;
    let mut inside = 0usize;
    let mut valid = 0usize;

    let mut rows = RowBuffers::new();
    for py in y0..=y1 {
        rows.load(image, py, x0, x1 + 1, seg_id);
        let dy = py as f64 - y;
        for px in x0..=x1 {
            let dx = px as f64 - x;
            let q = cxx * dx * dx + cyy * dy * dy + cxy * dx * dy;
            if q > r2 {
                continue;
            }
            inside += 1;
            let i = px - x0;
            if rows.masked[i] {
                flags |= APER_HASMASKED;
                continue;
            }
            valid += 1;
            let v = rows.values[i];
            sum_rv += q.sqrt() * v;
            sum_v += v;
        }
    }

    if inside > 0 && valid == 0 {
        flags |= APER_ALLMASKED;
    }
    if sum_v <= 0.0 || sum_rv <= 0.0 {
        flags |= APER_NONPOSITIVE;
        return Ok((0.0, flags));
    }

    Ok((sum_rv / sum_v, flags))
}

// ============================================================================
// Flux radius
// ============================================================================

/// Annuli per unit radius used to build the growth curve.
const FLUX_RADIUS_RINGS_PER_PIXEL: f64 = 2.0;

/// Radii enclosing the requested flux fractions, relative to the flux
/// within `rmax` (or `fluxtot` when given).
pub fn flux_radius(
    image: &Image,
    x: f64,
    y: f64,
    rmax: f64,
    fluxfrac: &[f64],
    fluxtot: Option<f64>,
    opts: &ApertureOptions,
) -> Result<(Vec<f64>, u16), Error> {
    let n = ((rmax * FLUX_RADIUS_RINGS_PER_PIXEL).ceil() as usize).max(16);
    let annuli = sum_circann_multi(image, x, y, rmax, n, opts)?;

    let total = match fluxtot {
        Some(t) => t,
        None => annuli.sum.iter().sum(),
    };

    let mut flags = annuli.flags;
    let ring_width = rmax / n as f64;
    let mut radii = Vec::with_capacity(fluxfrac.len());
    for &frac in fluxfrac {
        let target = frac * total;
        if !(target > 0.0) {
            radii.push(0.0);
            if target < 0.0 {
                flags |= APER_NONPOSITIVE;
            }
            continue;
        }
        let mut cum = 0.0f64;
        let mut radius = rmax;
        for (ring, &ring_sum) in annuli.sum.iter().enumerate() {
            if cum + ring_sum >= target {
                // Interpolate within the ring.
                let inner = ring as f64 * ring_width;
                let f = if ring_sum > 0.0 {
                    (target - cum) / ring_sum
                } else {
                    0.0
                };
                radius = inner + f * ring_width;
                break;
            }
            cum += ring_sum;
        }
        radii.push(radius);
    }

    Ok((radii, flags))
}

// ============================================================================
// Windowed positions
// ============================================================================

const WINPOS_MAX_ITER: usize = 16;
/// Squared centroid shift below which the iteration has converged.
const WINPOS_STOP: f64 = 1e-8;
/// Integration radius in units of the window sigma.
const WINPOS_RADIUS_SIGMAS: f64 = 4.0;

/// Windowed position: iterative centroid under a Gaussian weight of sigma
/// `sig`, integrated to four sigmas.
pub fn winpos(
    image: &Image,
    x: f64,
    y: f64,
    sig: f64,
    opts: &ApertureOptions,
) -> Result<WinPosition, Error> {
    if !(sig > 0.0) {
        return Err(illegal_arg(format!("window sigma must be positive, got {sig}")));
    }
    if opts.subpix == 0 {
        return Err(illegal_arg("subpix must be at least 1"));
    }

    let r = WINPOS_RADIUS_SIGMAS * sig;
    let inv_two_sig2 = 1.0 / (2.0 * sig * sig);
    let shape = Shape::Circle { r };

    let mut cx = x;
    let mut cy = y;
    let mut flags = 0u16;
    let mut niter = 0usize;
    let mut rows = RowBuffers::new();

    for iter in 0..WINPOS_MAX_ITER {
        niter = iter + 1;
        let Some((x0, x1, y0, y1, truncated)) = clipped_bbox(image, cx, cy, r, r) else {
            flags |= APER_TRUNC;
            break;
        };
        if truncated {
            flags |= APER_TRUNC;
        }

        let mut wsum = 0.0f64;
        let mut wx = 0.0f64;
        let mut wy = 0.0f64;
        for py in y0..=y1 {
            rows.load(image, py, x0, x1 + 1, opts.seg_id);
            let dy = py as f64 - cy;
            for px in x0..=x1 {
                let dx = px as f64 - cx;
                let frac = shape.frac(dx, dy, opts.subpix);
                if frac <= 0.0 {
                    continue;
                }
                let i = px - x0;
                if rows.masked[i] {
                    flags |= APER_HASMASKED;
                    continue;
                }
                let w = (-(dx * dx + dy * dy) * inv_two_sig2).exp() * frac;
                let wv = w * rows.values[i];
                wsum += wv;
                wx += wv * dx;
                wy += wv * dy;
            }
        }

        if wsum <= 0.0 {
            flags |= APER_NONPOSITIVE;
            break;
        }

        // The factor 2 corrects for the shrinkage the Gaussian window
        // applies to the true offset.
        let dx = 2.0 * wx / wsum;
        let dy = 2.0 * wy / wsum;
        cx += dx;
        cy += dy;
        if dx * dx + dy * dy < WINPOS_STOP {
            break;
        }
    }

    Ok(WinPosition {
        x: cx,
        y: cy,
        niter,
        flags,
    })
}
