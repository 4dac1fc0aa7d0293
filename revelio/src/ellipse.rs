//! Conversions between the two ellipse representations used by the catalog.
//!
//! An ellipse can be written with semi-axes and a position angle
//! `(a, b, theta)` or as the quadratic form
//! `cxx*dx^2 + cyy*dy^2 + cxy*dx*dy = r^2`, where `r = 1` traces the ellipse
//! itself. Catalog entries carry both; aperture routines consume the
//! coefficient form.

use crate::error::{Error, illegal_arg};

/// Convert semi-axes and position angle to quadratic-form coefficients.
///
/// `theta` is measured counter-clockwise from the positive x axis, in
/// radians.
pub fn ellipse_coeffs(a: f64, b: f64, theta: f64) -> (f64, f64, f64) {
    let cos = theta.cos();
    let sin = theta.sin();
    let inv_a2 = 1.0 / (a * a);
    let inv_b2 = 1.0 / (b * b);

    let cxx = cos * cos * inv_a2 + sin * sin * inv_b2;
    let cyy = sin * sin * inv_a2 + cos * cos * inv_b2;
    let cxy = 2.0 * cos * sin * (inv_a2 - inv_b2);
    (cxx, cyy, cxy)
}

/// Convert quadratic-form coefficients back to `(a, b, theta)`.
///
/// Fails with [`Error::IllegalArg`] when the coefficients do not describe an
/// ellipse (non-positive-definite form).
pub fn ellipse_axes(cxx: f64, cyy: f64, cxy: f64) -> Result<(f64, f64, f64), Error> {
    let p = cxx + cyy;
    let q = cxx - cyy;
    let t = (q * q + cxy * cxy).sqrt();

    // Eigenvalues of the form matrix are (p -+ t) / 2; both must be positive.
    if p - t <= 0.0 || p + t <= 0.0 {
        return Err(illegal_arg(format!(
            "coefficients ({cxx}, {cyy}, {cxy}) do not describe an ellipse"
        )));
    }

    let a = (2.0 / (p - t)).sqrt();
    let b = (2.0 / (p + t)).sqrt();
    let theta = if cxy == 0.0 && q >= 0.0 {
        // Already axis-aligned with the major axis along x (or a circle).
        0.0
    } else {
        // For a >= b the common factor (1/a^2 - 1/b^2) is negative, so the
        // angle comes from the negated components.
        0.5 * (-cxy).atan2(cyy - cxx)
    };
    Ok((a, b, theta))
}

/// Set elements of a byte mask inside the ellipse
/// `cxx*dx^2 + cyy*dy^2 + cxy*dx*dy <= r^2` centered on `(x, y)`.
#[allow(clippy::too_many_arguments)]
pub fn mask_ellipse(
    arr: &mut [u8],
    width: usize,
    height: usize,
    x: f64,
    y: f64,
    cxx: f64,
    cyy: f64,
    cxy: f64,
    r: f64,
    val: u8,
) {
    assert_eq!(arr.len(), width * height, "mask length mismatch");
    if width == 0 || height == 0 {
        return;
    }

    // Bounding box of the ellipse: the quadratic form reaches r^2 at
    // dx = r * sqrt(cyy / det), dy = r * sqrt(cxx / det).
    let det = cxx * cyy - cxy * cxy * 0.25;
    if det <= 0.0 {
        return;
    }
    let dx_max = r * (cyy / det).sqrt();
    let dy_max = r * (cxx / det).sqrt();

    let x0 = ((x - dx_max).floor().max(0.0)) as usize;
    let x1 = ((x + dx_max).ceil().min((width - 1) as f64)) as usize;
    let y0 = ((y - dy_max).floor().max(0.0)) as usize;
    let y1 = ((y + dy_max).ceil().min((height - 1) as f64)) as usize;

    let r2 = r * r;
    for py in y0..=y1 {
        let dy = py as f64 - y;
        for px in x0..=x1 {
            let dx = px as f64 - x;
            if cxx * dx * dx + cyy * dy * dy + cxy * dx * dy <= r2 {
                arr[py * width + px] = val;
            }
        }
    }
}
