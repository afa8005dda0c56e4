//! This module provides the dense numeric primitives used by the correlation,
//! regression and timecourse stages: a power-iteration eigenvector solver, basic
//! vector and matrix operations, element-wise matrix conversions, inverse error
//! function approximations and fractional ranking.

use crate::error::{Result, RsError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};
use std::cmp::Ordering;
use std::f64::consts::PI;
use std::fmt::{Display, Formatter};

/// Element-wise transformations applied by [`matrix_conversion`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MatrixConversion {
    /// Absolute value of every entry.
    Absolute,
    /// Negative entries are set to zero.
    Positive,
    /// Positive entries are set to zero.
    Negative,
    /// Min-max rescaling to `[0, 1]`.
    Scaled,
}

impl Display for MatrixConversion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MatrixConversion::Absolute => {
                write!(f, "absolute")
            }
            MatrixConversion::Positive => {
                write!(f, "positive")
            }
            MatrixConversion::Negative => {
                write!(f, "negative")
            }
            MatrixConversion::Scaled => {
                write!(f, "scaled")
            }
        }
    }
}

/// Why the power iteration stopped.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Termination {
    /// The change between two iterates fell below the requested precision.
    Converged,
    /// The iteration limit was reached first. The returned vector is the last
    /// iterate.
    MaxIterations,
    /// The matrix mapped every start vector to zero. The eigenvalue is `0` and
    /// the vector is the last start vector.
    Degenerate,
}

/// Result of [`first_eigenvector`].
#[derive(Debug, Clone, PartialEq)]
pub struct Eigenpair {
    /// Unit-norm eigenvector estimate.
    pub vector: Array1<f64>,
    /// Rayleigh quotient of `vector`.
    pub eigenvalue: f64,
    /// Matrix-vector products over all start vectors.
    pub iterations: usize,
    pub termination: Termination,
}

/// Deterministic, irregular unit vector with strictly positive entries.
///
/// Entries follow the golden ratio sequence, so the vector is unlikely to be
/// orthogonal to structured eigenvectors such as constant, alternating or
/// ramp-shaped ones.
pub(crate) fn start_vector(n: usize) -> Array1<f64> {
    const GOLDEN: f64 = 0.618_033_988_749_894_9;
    let v = Array1::from_shape_fn(n, |i| ((i + 1) as f64 * GOLDEN).fract() + 0.5);
    let norm = v.dot(&v).sqrt();
    v / norm
}

fn ramp_vector(n: usize) -> Array1<f64> {
    let v = Array1::from_shape_fn(n, |i| (i + 1) as f64);
    let norm = v.dot(&v).sqrt();
    v / norm
}

fn basis_vector(n: usize, k: usize) -> Array1<f64> {
    let mut v = Array1::zeros(n);
    v[k] = 1.0;
    v
}

struct PowerRun {
    pair: Eigenpair,
    /// The first product was zero or left the start vector unchanged.
    settled_at_start: bool,
}

fn power_iteration(
    a: &ArrayView2<f64>,
    start: Array1<f64>,
    max_iterations: usize,
    precision: f64,
) -> Result<PowerRun> {
    let mut current = start;
    let mut iterations = 0;
    let mut termination = Termination::MaxIterations;

    while iterations < max_iterations {
        iterations += 1;
        let mut next = matrix_by_vector_product(a, &current.view())?;
        let norm = next.dot(&next).sqrt();
        if norm == 0.0 {
            termination = Termination::Degenerate;
            break;
        }
        next.mapv_inplace(|v| v / norm);
        let change = (&next - &current).mapv(|d| d * d).sum().sqrt();
        current = next;
        if change < precision {
            termination = Termination::Converged;
            break;
        }
    }

    let eigenvalue = if termination == Termination::Degenerate {
        0.0
    } else {
        current.dot(&matrix_by_vector_product(a, &current.view())?)
    };
    Ok(PowerRun {
        settled_at_start: iterations == 1 && termination != Termination::MaxIterations,
        pair: Eigenpair {
            vector: current,
            eigenvalue,
            iterations,
            termination,
        },
    })
}

/// Estimates the dominant eigenvector of a square matrix by power iteration.
///
/// Each step multiplies by `a` and renormalizes to unit Euclidean norm, and
/// stops once the Euclidean distance between two consecutive iterates is below
/// `precision`.
///
/// The first start vector is an irregular positive vector. If the matrix maps it
/// to zero or leaves it unchanged, it may be orthogonal to the dominant
/// eigenvector, so the iteration is repeated from the ramp `(1, 2, ..., n)` and
/// from the basis vector of the largest diagonal entry. The result with the
/// largest eigenvalue magnitude is returned.
///
/// # Arguments
/// - `a`: Square `n × n` matrix.
/// - `max_iterations`: Upper bound on the number of multiplications per start
///   vector.
/// - `precision`: Convergence threshold on the iterate change.
///
/// # Returns
/// The last iterate with its eigenvalue estimate. Hitting `max_iterations` is
/// reported through [`Termination::MaxIterations`] and is not an error. A matrix
/// that maps every start vector to zero is reported as
/// [`Termination::Degenerate`].
///
/// # Errors
/// Fails if `a` is not square or empty.
pub fn first_eigenvector(
    a: &ArrayView2<f64>,
    max_iterations: usize,
    precision: f64,
) -> Result<Eigenpair> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(RsError::dimension_mismatch("eigenvector matrix", rows, cols));
    }
    if rows == 0 {
        return Err(RsError::numerical("eigenvector of an empty matrix"));
    }

    let largest_diagonal = (0..rows)
        .max_by(|&i, &j| compare(a[(i, i)].abs(), a[(j, j)].abs()))
        .unwrap_or(0);
    let starts = [
        start_vector(rows),
        ramp_vector(rows),
        basis_vector(rows, largest_diagonal),
    ];

    let mut total_iterations = 0;
    let mut best: Option<Eigenpair> = None;
    for start in starts {
        let run = power_iteration(a, start, max_iterations, precision)?;
        total_iterations += run.pair.iterations;
        let better = best
            .as_ref()
            .map_or(true, |b| run.pair.eigenvalue.abs() > b.eigenvalue.abs());
        let settled_at_start = run.settled_at_start;
        if better {
            best = Some(run.pair);
        }
        if !settled_at_start {
            break;
        }
        log::debug!("power iteration settled on its start vector, retrying from another start");
    }

    let Some(mut pair) = best else {
        return Err(RsError::numerical("power iteration did not run"));
    };
    pair.iterations = total_iterations;
    match pair.termination {
        Termination::MaxIterations => log::warn!(
            "power iteration stopped after {total_iterations} iterations without converging"
        ),
        Termination::Degenerate => {
            log::warn!("power iteration found no direction the matrix does not map to zero")
        }
        Termination::Converged => {}
    }
    Ok(pair)
}

/// Computes `a · v`, one output element per row in parallel.
///
/// # Errors
/// Fails if the number of columns of `a` differs from the length of `v`.
pub fn matrix_by_vector_product(a: &ArrayView2<f64>, v: &ArrayView1<f64>) -> Result<Array1<f64>> {
    if a.ncols() != v.len() {
        return Err(RsError::dimension_mismatch(
            "matrix-vector product",
            a.ncols(),
            v.len(),
        ));
    }
    let mut out = Array1::zeros(a.nrows());
    Zip::from(&mut out)
        .and(a.rows())
        .par_for_each(|o, row| *o = row.dot(v));
    Ok(out)
}

pub fn euclidean_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

pub fn scale_vector(v: &mut [f64], factor: f64) {
    v.iter_mut().for_each(|x| *x *= factor);
}

/// Element-wise `a - b`.
pub fn vector_sub(a: &[f64], b: &[f64]) -> Result<Vec<f64>> {
    if a.len() != b.len() {
        return Err(RsError::dimension_mismatch("vector difference", a.len(), b.len()));
    }
    Ok(a.iter().zip(b).map(|(x, y)| x - y).collect())
}

/// Exchanges the contents of two equally long vectors.
pub fn vector_swap(a: &mut [f64], b: &mut [f64]) -> Result<()> {
    if a.len() != b.len() {
        return Err(RsError::dimension_mismatch("vector swap", a.len(), b.len()));
    }
    a.swap_with_slice(b);
    Ok(())
}

/// Arithmetic mean, NaN for an empty vector.
pub fn vector_mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        return f64::NAN;
    }
    v.iter().sum::<f64>() / v.len() as f64
}

/// Applies an element-wise conversion to `a` in place.
///
/// For [`MatrixConversion::Scaled`] the global minimum maps to exactly `0.0` and
/// the global maximum to exactly `1.0`. A constant matrix has no range to scale
/// and becomes all zeros.
pub fn matrix_conversion(a: &mut Array2<f64>, mode: MatrixConversion) {
    match mode {
        MatrixConversion::Absolute => a.mapv_inplace(f64::abs),
        MatrixConversion::Positive => a.mapv_inplace(|v| if v < 0.0 { 0.0 } else { v }),
        MatrixConversion::Negative => a.mapv_inplace(|v| if v > 0.0 { 0.0 } else { v }),
        MatrixConversion::Scaled => {
            let min = a.iter().fold(f64::INFINITY, |m, &v| m.min(v));
            let max = a.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v));
            let range = max - min;
            if range > 0.0 && range.is_finite() {
                a.mapv_inplace(|v| if v == max { 1.0 } else { (v - min) / range });
            } else {
                a.fill(0.0);
            }
        }
    }
}

/// Arc length in millimeters covered by a rotation of `degrees` on a sphere of
/// the given radius.
pub fn deg_to_mm(radius: f64, degrees: f64) -> f64 {
    radius * degrees * PI / 180.0
}

/// Inverse error function, Giles' single precision polynomial approximation.
///
/// Returns `±inf` at `±1` and NaN outside `[-1, 1]`.
pub fn erfinv(x: f64) -> f64 {
    if x.is_nan() || x.abs() > 1.0 {
        return f64::NAN;
    }
    if x.abs() == 1.0 {
        return x * f64::INFINITY;
    }
    let mut w = -((1.0 - x) * (1.0 + x)).ln();
    let coefficients: [f64; 9] = if w < 5.0 {
        w -= 2.5;
        [
            2.81022636e-08,
            3.43273939e-07,
            -3.5233877e-06,
            -4.39150654e-06,
            0.00021858087,
            -0.00125372503,
            -0.00417768164,
            0.246640727,
            1.50140941,
        ]
    } else {
        w = w.sqrt() - 3.0;
        [
            -0.000200214257,
            0.000100950558,
            0.00134934322,
            -0.00367342844,
            0.00573950773,
            -0.0076224613,
            0.00943887047,
            1.00167406,
            2.83297682,
        ]
    };
    let p = coefficients[1..]
        .iter()
        .fold(coefficients[0], |p, c| c + p * w);
    p * x
}

/// Inverse error function, Winitzki's closed form approximation.
///
/// Cheaper than [`erfinv`], absolute error stays below `5e-3` for `|x| <= 0.99`.
pub fn erfinv_fast(x: f64) -> f64 {
    if x.is_nan() || x.abs() > 1.0 {
        return f64::NAN;
    }
    if x.abs() == 1.0 {
        return x * f64::INFINITY;
    }
    const A: f64 = 0.147;
    let ln = (1.0 - x * x).ln();
    let t = 2.0 / (PI * A) + ln / 2.0;
    ((t * t - ln / A).sqrt() - t).sqrt().copysign(x)
}

/// Indices of `values` in ascending value order. Equal values keep their
/// original relative order, NaN sorts last.
pub fn sort_order(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| compare(values[i], values[j]));
    order
}

fn compare(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Replaces the ranks of tied values with the mean of the ranks they occupy.
///
/// # Arguments
/// - `values`: The sample.
/// - `order`: Indices of `values` in ascending order, as returned by [`sort_order`].
/// - `ranks`: 1-based ranks indexed like `values`. Runs of equal values along
///   `order` are visited in original order and all receive the run's mean rank.
pub fn resolve_ties(values: &[f64], order: &[usize], ranks: &mut [f64]) {
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        if end - start > 1 {
            let mean = order[start..end].iter().map(|&i| ranks[i]).sum::<f64>()
                / (end - start) as f64;
            for &i in &order[start..end] {
                ranks[i] = mean;
            }
        }
        start = end;
    }
}

/// Fractional ranking: 1-based ranks where tied values share their mean rank.
///
/// # Examples
/// ```
/// use restingstate_tools::math_tools::rank_transform;
///
/// assert_eq!(rank_transform(&[3.0, 1.0, 3.0, 2.0]), vec![3.5, 1.0, 3.5, 2.0]);
/// ```
pub fn rank_transform(values: &[f64]) -> Vec<f64> {
    let order = sort_order(values);
    let mut ranks = vec![0.0; values.len()];
    for (rank, &i) in order.iter().enumerate() {
        ranks[i] = (rank + 1) as f64;
    }
    resolve_ties(values, &order, &mut ranks);
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn eigenvector_of_diagonal_matrix_is_basis_vector() {
        let a = Array2::from_diag(&array![1.0, 4.0, 2.0]);
        let precision = 1e-9;
        let result = first_eigenvector(&a.view(), 1000, precision).unwrap();
        assert_eq!(result.termination, Termination::Converged);
        assert_abs_diff_eq!(result.vector[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.vector[1], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.vector[2], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.eigenvalue, 4.0, epsilon = 1e-6);
    }

    #[test]
    fn eigenvector_reports_iteration_limit() {
        let a = Array2::from_diag(&array![1.0, 1.01]);
        let result = first_eigenvector(&a.view(), 2, 1e-15).unwrap();
        assert_eq!(result.termination, Termination::MaxIterations);
        assert_eq!(result.iterations, 2);
        assert_abs_diff_eq!(euclidean_norm(result.vector.as_slice().unwrap()), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn eigenvector_escapes_start_orthogonal_to_dominant_direction() {
        // dominant direction (2, -1) is orthogonal to the ramp start (1, 2)
        let u = array![2.0, -1.0] / 5.0f64.sqrt();
        let v = array![1.0, 2.0] / 5.0f64.sqrt();
        let outer = |x: &Array1<f64>| {
            Array2::from_shape_fn((2, 2), |(i, j)| x[i] * x[j])
        };
        let a = outer(&u) * 5.0 + outer(&v);
        let result = first_eigenvector(&a.view(), 1000, 1e-10).unwrap();
        assert_eq!(result.termination, Termination::Converged);
        assert_abs_diff_eq!(result.eigenvalue, 5.0, epsilon = 1e-8);
        assert_abs_diff_eq!(result.vector.dot(&u).abs(), 1.0, epsilon = 1e-8);

        // the same structure, built around the first start vector itself
        let w = start_vector(2);
        let w_perp = array![-w[1], w[0]];
        let a = outer(&w_perp) * 5.0 + outer(&w);
        let result = first_eigenvector(&a.view(), 1000, 1e-10).unwrap();
        assert_eq!(result.termination, Termination::Converged);
        assert_abs_diff_eq!(result.eigenvalue, 5.0, epsilon = 1e-8);
        assert_abs_diff_eq!(result.vector.dot(&w_perp).abs(), 1.0, epsilon = 1e-8);
    }

    #[test]
    fn zero_matrix_is_degenerate() {
        let a = Array2::<f64>::zeros((3, 3));
        let result = first_eigenvector(&a.view(), 100, 1e-10).unwrap();
        assert_eq!(result.termination, Termination::Degenerate);
        assert_eq!(result.eigenvalue, 0.0);
    }

    #[test]
    fn eigenvector_rejects_non_square() {
        let a = Array2::<f64>::zeros((2, 3));
        assert!(first_eigenvector(&a.view(), 10, 1e-6).is_err());
    }

    #[test]
    fn matrix_vector_product() {
        let a = array![[1.0, 2.0], [3.0, 4.0], [0.0, -1.0]];
        let v = array![1.0, 1.0];
        let out = matrix_by_vector_product(&a.view(), &v.view()).unwrap();
        assert_eq!(out, array![3.0, 7.0, -1.0]);
        assert!(matrix_by_vector_product(&a.view(), &array![1.0].view()).is_err());
    }

    #[test]
    fn vector_primitives() {
        assert_abs_diff_eq!(euclidean_norm(&[3.0, 4.0]), 5.0);
        let mut v = vec![1.0, -2.0];
        scale_vector(&mut v, 2.0);
        assert_eq!(v, vec![2.0, -4.0]);
        assert_eq!(vector_sub(&[3.0, 3.0], &[1.0, 2.0]).unwrap(), vec![2.0, 1.0]);
        assert!(vector_sub(&[1.0], &[1.0, 2.0]).is_err());
        let mut a = vec![1.0, 2.0];
        let mut b = vec![3.0, 4.0];
        vector_swap(&mut a, &mut b).unwrap();
        assert_eq!(a, vec![3.0, 4.0]);
        assert_eq!(b, vec![1.0, 2.0]);
        assert_abs_diff_eq!(vector_mean(&[1.0, 2.0, 6.0]), 3.0);
        assert!(vector_mean(&[]).is_nan());
    }

    #[test]
    fn matrix_conversion_modes() {
        let base = array![[-2.0, 1.0], [3.0, 0.5]];

        let mut a = base.clone();
        matrix_conversion(&mut a, MatrixConversion::Absolute);
        assert_eq!(a, array![[2.0, 1.0], [3.0, 0.5]]);

        let mut a = base.clone();
        matrix_conversion(&mut a, MatrixConversion::Positive);
        assert_eq!(a, array![[0.0, 1.0], [3.0, 0.5]]);

        let mut a = base.clone();
        matrix_conversion(&mut a, MatrixConversion::Negative);
        assert_eq!(a, array![[-2.0, 0.0], [0.0, 0.0]]);

        let mut a = base;
        matrix_conversion(&mut a, MatrixConversion::Scaled);
        assert_eq!(a[(0, 0)], 0.0);
        assert_eq!(a[(1, 0)], 1.0);
        assert_abs_diff_eq!(a[(0, 1)], 0.6);
    }

    #[test]
    fn scaled_conversion_of_constant_matrix_is_zero() {
        let mut a = Array2::from_elem((2, 2), 7.0);
        matrix_conversion(&mut a, MatrixConversion::Scaled);
        assert!(a.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn deg_to_mm_is_arc_length() {
        assert_abs_diff_eq!(deg_to_mm(50.0, 180.0), 50.0 * PI);
        assert_abs_diff_eq!(deg_to_mm(50.0, -1.0), -50.0 * PI / 180.0);
    }

    #[test]
    fn erfinv_known_values() {
        assert_eq!(erfinv(0.0), 0.0);
        assert_abs_diff_eq!(erfinv(0.5), 0.476_936_276_2, epsilon = 1e-6);
        assert_abs_diff_eq!(erfinv(-0.5), -0.476_936_276_2, epsilon = 1e-6);
        assert_abs_diff_eq!(erfinv(0.99), 1.821_386_367_6, epsilon = 1e-5);
        assert_eq!(erfinv(1.0), f64::INFINITY);
        assert!(erfinv(1.5).is_nan());
    }

    #[test]
    fn erfinv_fast_matches_erfinv() {
        for i in -99..=99 {
            let x = i as f64 / 100.0;
            assert_abs_diff_eq!(erfinv_fast(x), erfinv(x), epsilon = 5e-3);
        }
    }

    #[test]
    fn ranks_resolve_ties_to_mean_rank() {
        assert_eq!(rank_transform(&[10.0, 20.0, 30.0]), vec![1.0, 2.0, 3.0]);
        assert_eq!(
            rank_transform(&[2.0, 2.0, 1.0, 2.0]),
            vec![3.0, 3.0, 1.0, 3.0]
        );
        assert_eq!(sort_order(&[2.0, 1.0, 2.0]), vec![1, 0, 2]);
    }
}
