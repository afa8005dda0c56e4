//! Correlation statistics between two equally long series.
//!
//! All functions return NaN instead of failing when the correlation is undefined:
//! fewer than two samples, series of different length, or a series without
//! variance.

use crate::math_tools::rank_transform;

/// Tolerance of [`fast_z_correlation`] against [`z_correlation`] for `|r| <= 0.999`.
pub const FAST_Z_TOLERANCE: f64 = 1e-4;

fn defined(x: &[f64], y: &[f64]) -> bool {
    x.len() == y.len() && x.len() >= 2
}

/// Pearson's product-moment correlation coefficient.
///
/// # Examples
/// ```
/// use restingstate_tools::correlation::pearson;
///
/// let r = pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]);
/// assert!((r - 1.0).abs() < 1e-12);
/// assert!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_nan());
/// ```
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    if !defined(x, y) {
        return f64::NAN;
    }
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return f64::NAN;
    }
    (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0)
}

/// Fisher z-transformed Pearson correlation, `atanh(r)`.
pub fn z_correlation(x: &[f64], y: &[f64]) -> f64 {
    pearson(x, y).atanh()
}

/// Cheaper variant of [`z_correlation`].
///
/// The correlation is accumulated in one pass over the centered series and the
/// logarithm is taken in single precision. The result stays within
/// [`FAST_Z_TOLERANCE`] of the exact transform for `|r| <= 0.999`, also for
/// series with a large mean.
pub fn fast_z_correlation(x: &[f64], y: &[f64]) -> f64 {
    if !defined(x, y) {
        return f64::NAN;
    }
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let (sxx, syy, sxy) = x.iter().zip(y).fold((0.0, 0.0, 0.0), |(sxx, syy, sxy), (a, b)| {
        let (dx, dy) = (a - mean_x, b - mean_y);
        (sxx + dx * dx, syy + dy * dy, sxy + dx * dy)
    });
    if sxx <= 0.0 || syy <= 0.0 {
        return f64::NAN;
    }
    let r = (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0);
    let ratio = ((1.0 + r) / (1.0 - r)) as f32;
    0.5 * f64::from(ratio.ln())
}

/// Correlation weighted by its significance, `r * sqrt((n - 2) / (1 - r²))`.
///
/// Needs at least three samples. Perfectly correlated series yield an
/// infinite value.
pub fn t_correlation(x: &[f64], y: &[f64]) -> f64 {
    if x.len() < 3 {
        return f64::NAN;
    }
    let r = pearson(x, y);
    let n = x.len() as f64;
    r * ((n - 2.0) / (1.0 - r * r)).sqrt()
}

/// Spearman's rank correlation: Pearson's correlation of the fractional ranks.
pub fn spearman(x: &[f64], y: &[f64]) -> f64 {
    if !defined(x, y) {
        return f64::NAN;
    }
    pearson(&rank_transform(x), &rank_transform(y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn noisy_pair(len: usize, coupling: f64) -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..len).map(|i| (i as f64 * 0.37).sin()).collect();
        let y: Vec<f64> = (0..len)
            .map(|i| coupling * x[i] + (i as f64 * 1.91).cos() * (1.0 - coupling))
            .collect();
        (x, y)
    }

    #[test]
    fn pearson_of_linear_relation() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [8.0, 6.0, 4.0, 2.0];
        assert_abs_diff_eq!(pearson(&x, &y), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn undefined_inputs_are_nan() {
        assert!(pearson(&[1.0], &[2.0]).is_nan());
        assert!(pearson(&[1.0, 2.0], &[1.0, 2.0, 3.0]).is_nan());
        assert!(z_correlation(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0]).is_nan());
        assert!(fast_z_correlation(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0]).is_nan());
        assert!(t_correlation(&[1.0, 2.0], &[2.0, 1.0]).is_nan());
        assert!(spearman(&[1.0], &[1.0]).is_nan());
    }

    #[test]
    fn z_correlation_is_atanh() {
        let (x, y) = noisy_pair(64, 0.6);
        let r = pearson(&x, &y);
        assert_abs_diff_eq!(z_correlation(&x, &y), 0.5 * ((1.0 + r) / (1.0 - r)).ln(), epsilon = 1e-12);
    }

    #[test]
    fn fast_z_correlation_within_tolerance() {
        for coupling in [0.0, 0.3, 0.6, 0.8, 0.9] {
            let (x, y) = noisy_pair(200, coupling);
            let r = pearson(&x, &y);
            assert!(r.abs() <= 0.999);
            assert_abs_diff_eq!(
                fast_z_correlation(&x, &y),
                z_correlation(&x, &y),
                epsilon = FAST_Z_TOLERANCE
            );
        }
    }

    #[test]
    fn fast_z_correlation_within_tolerance_for_offset_series() {
        for offset in [1e3, 1e5, 1e7] {
            for coupling in [0.3, 0.9] {
                let (x, y) = noisy_pair(200, coupling);
                let x: Vec<f64> = x.iter().map(|v| v + offset).collect();
                let y: Vec<f64> = y.iter().map(|v| v - offset).collect();
                assert_abs_diff_eq!(
                    fast_z_correlation(&x, &y),
                    z_correlation(&x, &y),
                    epsilon = FAST_Z_TOLERANCE
                );
            }
        }
    }

    #[test]
    fn t_correlation_scales_with_sample_count() {
        let (x, y) = noisy_pair(30, 0.5);
        let r = pearson(&x, &y);
        assert_abs_diff_eq!(
            t_correlation(&x, &y),
            r * (28.0 / (1.0 - r * r)).sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn spearman_is_rank_based() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [1.0, 4.0, 9.0, 16.0, 1000.0];
        assert_abs_diff_eq!(spearman(&x, &y), 1.0, epsilon = 1e-12);
        assert!(pearson(&x, &y) < 1.0);
    }
}
