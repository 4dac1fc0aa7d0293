//! Small numeric helpers shared by the pipeline stages.

/// Median of `data`, computed in place with quickselect (partial sort).
pub(crate) fn median_f32_mut(data: &mut [f32]) -> f32 {
    debug_assert!(!data.is_empty());

    let mid = data.len() / 2;
    let (_, upper, _) = data.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let upper = *upper;

    if data.len() % 2 == 1 {
        upper
    } else {
        // Even length: average with the max of the lower partition.
        let lower = data[..mid]
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        0.5 * (lower + upper)
    }
}

/// Mean and standard deviation of `data`, accumulated in double precision.
pub(crate) fn mean_sigma(data: &[f32]) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let n = data.len() as f64;
    let mut sum = 0.0f64;
    let mut sum2 = 0.0f64;
    for &v in data {
        let v = v as f64;
        sum += v;
        sum2 += v * v;
    }
    let mean = sum / n;
    let var = (sum2 / n - mean * mean).max(0.0);
    (mean, var.sqrt())
}
