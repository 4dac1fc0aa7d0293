//! Cleaning: suppression of faint detections sitting in the wings of
//! brighter neighbors.
//!
//! For every pair with the brighter object A and fainter object B, B is
//! absorbed into A when (a) B's center lies inside A's second-moment
//! ellipse scaled by `clean_param`, and (b) A's Gaussian wing model at B's
//! center exceeds B's detection threshold, meaning B would not have been
//! detected without A underneath it. Absorption appends B's pixels to A and
//! recomputes A's moments; passes repeat until a fixpoint so the result
//! does not depend on initial ordering.

use super::object::{RawObject, analyse};

/// Spatial gate in units of the moment semi-axes. The isophotal footprint
/// of a detection extends to roughly three moment sigmas.
const CLEAN_ZONE: f64 = 3.0;

pub(crate) fn clean(objects: &mut Vec<RawObject>, clean_param: f64) {
    if objects.len() < 2 {
        return;
    }

    let before = objects.len();
    while clean_pass(objects, clean_param) {}
    if objects.len() != before {
        tracing::debug!(
            removed = before - objects.len(),
            remaining = objects.len(),
            "cleaning absorbed faint detections"
        );
    }
}

/// One absorption pass. Returns true when an object was removed.
fn clean_pass(objects: &mut Vec<RawObject>, clean_param: f64) -> bool {
    // Brightest first; index breaks flux ties deterministically.
    let mut order: Vec<usize> = (0..objects.len()).collect();
    order.sort_by(|&i, &j| {
        objects[j]
            .acc
            .csum
            .total_cmp(&objects[i].acc.csum)
            .then(i.cmp(&j))
    });

    let gate = (CLEAN_ZONE * clean_param).powi(2);

    for oi in 0..order.len() {
        let bright = order[oi];
        let an = analyse(&objects[bright].acc);
        // Gaussian wing amplitude implied by the moments: the quadratic
        // form q equals the Mahalanobis distance squared of that Gaussian.
        let det = (an.x2 * an.y2 - an.xy * an.xy).max(f64::MIN_POSITIVE);
        let wing_norm = objects[bright].acc.csum / (2.0 * std::f64::consts::PI * det.sqrt());

        for &faint in order.iter().skip(oi + 1) {
            let fan = analyse(&objects[faint].acc);
            let dx = fan.x - an.x;
            let dy = fan.y - an.y;
            let q = an.cxx as f64 * dx * dx
                + an.cyy as f64 * dy * dy
                + an.cxy as f64 * dx * dy;
            if q > gate {
                continue;
            }

            let wing = wing_norm * (-0.5 * q).exp();
            if wing <= objects[faint].acc.thresh as f64 {
                continue;
            }

            let absorbed = objects.remove(faint);
            let survivor = if faint < bright { bright - 1 } else { bright };
            objects[survivor].acc.merge(&absorbed.acc);
            objects[survivor].pixels.extend_from_slice(&absorbed.pixels);
            objects[survivor].pixels.sort_unstable();
            return true;
        }
    }
    false
}
