//! Natural cubic splines over the background tile grid.
//!
//! Tile statistics form an `nx x ny` grid of nodes at unit spacing in tile
//! coordinates. Row evaluation interpolates along y with precomputed second
//! derivatives, then solves a fresh spline along x for the resulting node
//! row. Image coordinate `p` maps to tile coordinate `(p + 0.5)/tile - 0.5`.

/// Second derivatives of the natural cubic spline through `values` at unit
/// node spacing. Written into `derivs`; `work` is caller scratch of the same
/// length.
pub(crate) fn natural_spline(values: &[f32], derivs: &mut [f32], work: &mut [f64]) {
    let n = values.len();
    debug_assert_eq!(derivs.len(), n);
    debug_assert!(work.len() >= n);

    if n < 3 {
        derivs[..n].fill(0.0);
        return;
    }

    // Forward elimination of the tridiagonal system; natural boundary
    // conditions pin the second derivative to zero at both ends.
    let mut d = vec![0.0f64; n];
    work[0] = 0.0;
    d[0] = 0.0;
    for i in 1..n - 1 {
        let p = 0.5 * d[i - 1] + 2.0;
        d[i] = -0.5 / p;
        let rhs =
            3.0 * (values[i + 1] as f64 - 2.0 * values[i] as f64 + values[i - 1] as f64);
        work[i] = (rhs - 0.5 * work[i - 1]) / p;
    }

    derivs[n - 1] = 0.0;
    let mut next = 0.0f64;
    for i in (0..n - 1).rev() {
        let val = d[i] * next + work[i];
        derivs[i] = val as f32;
        next = val;
    }
}

/// Evaluate the spline through `values` (second derivatives `derivs`) at
/// tile coordinate `u`, clamped to the node range.
#[inline]
pub(crate) fn spline_interp(values: &[f32], derivs: &[f32], u: f64) -> f32 {
    let n = values.len();
    debug_assert_eq!(derivs.len(), n);

    if n == 1 {
        return values[0];
    }

    let u = u.clamp(0.0, (n - 1) as f64);
    let k = (u.floor() as usize).min(n - 2);
    let b = u - k as f64;
    let a = 1.0 - b;

    let v0 = values[k] as f64;
    let v1 = values[k + 1] as f64;
    let d0 = derivs[k] as f64;
    let d1 = derivs[k + 1] as f64;

    let val = a * v0 + b * v1 + ((a * a * a - a) * d0 + (b * b * b - b) * d1) / 6.0;
    val as f32
}

/// Linear interpolation at tile coordinate `u`, used by point evaluation.
#[inline]
pub(crate) fn linear_interp(values: &[f32], u: f64) -> f32 {
    let n = values.len();
    if n == 1 {
        return values[0];
    }
    let u = u.clamp(0.0, (n - 1) as f64);
    let k = (u.floor() as usize).min(n - 2);
    let t = (u - k as f64) as f32;
    (1.0 - t) * values[k] + t * values[k + 1]
}
