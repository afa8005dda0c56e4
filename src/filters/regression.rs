//! Ordinary least squares regression of nuisance signals.
//!
//! The fit has no implicit intercept. Callers that want one add a constant or
//! time regressor to the [`RegressorMatrix`].

use crate::data_container::{Mask, RegressorMatrix, VolumeSeries};
use crate::error::{Result, RsError};
use crate::filters::band_pass::{FilterSpec, Rolloff};
use frame_loops::WorkerPool;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

const SVD_EPSILON: f64 = 1e-12;

/// Outcome of a regression.
///
/// # Fields
/// - `betas`: One coefficient per regressor, standardized when z-scoring was
///   requested.
/// - `residuals`: `signal - fitted`, in the units the fit was computed in.
/// - `fitted`: `Σ beta_r · regressor_r`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionFit {
    pub betas: Vec<f64>,
    pub residuals: Vec<f64>,
    pub fitted: Vec<f64>,
}

fn standardize(values: &mut [f64], what: &str) -> Result<()> {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    if !(std > 0.0) {
        return Err(RsError::numerical(format!(
            "cannot standardize {what}: zero variance"
        )));
    }
    values.iter_mut().for_each(|v| *v = (*v - mean) / std);
    Ok(())
}

/// Fits `signal ≈ Σ beta_r · regressor_r` by least squares.
///
/// With `zscore` set, the signal and every regressor are standardized to zero
/// mean and unit population variance before fitting.
///
/// # Errors
/// - [`RsError::DimensionMismatch`] if the regressors do not have one value per
///   signal sample.
/// - [`RsError::Numerical`] if there are fewer samples than regressors, or a
///   series has zero variance while `zscore` is set.
pub fn linear_regression(
    signal: &[f64],
    regressors: &RegressorMatrix,
    zscore: bool,
) -> Result<RegressionFit> {
    let samples = signal.len();
    let count = regressors.n_regressors();
    if regressors.n_frames() != samples {
        return Err(RsError::dimension_mismatch(
            "regressor length",
            samples,
            regressors.n_frames(),
        ));
    }
    if samples < count {
        return Err(RsError::numerical(format!(
            "under-determined regression: {samples} samples for {count} regressors"
        )));
    }

    let mut y = signal.to_vec();
    let mut columns = regressors.to_vecs();
    if zscore {
        standardize(&mut y, "signal")?;
        for (r, column) in columns.iter_mut().enumerate() {
            standardize(column, &format!("regressor {r}"))?;
        }
    }

    let design = DMatrix::from_fn(samples, count, |t, r| columns[r][t]);
    let target = DVector::from_column_slice(&y);
    let betas = design
        .clone()
        .svd(true, true)
        .solve(&target, SVD_EPSILON)
        .map_err(|err| RsError::numerical(format!("least squares solve failed: {err}")))?;
    let fitted = &design * &betas;

    let residuals = y.iter().zip(fitted.iter()).map(|(s, f)| s - f).collect();
    Ok(RegressionFit {
        betas: betas.iter().copied().collect(),
        residuals,
        fitted: fitted.iter().copied().collect(),
    })
}

/// Band-passes every regressor with `spec`.
pub fn bandpass_regressors(regressors: &RegressorMatrix, spec: &FilterSpec) -> Result<RegressorMatrix> {
    let mut workspace = spec.workspace();
    let filtered = regressors
        .to_vecs()
        .into_iter()
        .map(|mut regressor| {
            spec.apply_with(&mut regressor, &mut workspace)?;
            Ok(regressor)
        })
        .collect::<Result<Vec<_>>>()?;
    RegressorMatrix::from_regressors(&filtered)
}

/// Band-passes every regressor to `[f1, f2]` with a sharp cutoff and without
/// its mean, as used by [`linear_regression_filter`].
pub fn filter_regressors(
    regressors: &RegressorMatrix,
    sampling_rate: f64,
    f1: f64,
    f2: f64,
) -> Result<RegressorMatrix> {
    let frames = regressors.n_frames();
    let spec = FilterSpec::new(frames, frames, sampling_rate, f1, f2, Rolloff::Sharp, false)?;
    log::debug!("filtering regressors to {:?} Hz", spec.band());
    bandpass_regressors(regressors, &spec)
}

/// Regression against band-passed regressors.
///
/// Each regressor is filtered to `[f1, f2]` with a sharp cutoff and without its
/// mean, so only nuisance variance inside the band is removed from `signal`.
pub fn linear_regression_filter(
    signal: &[f64],
    regressors: &RegressorMatrix,
    sampling_rate: f64,
    f1: f64,
    f2: f64,
) -> Result<RegressionFit> {
    if regressors.n_frames() != signal.len() {
        return Err(RsError::dimension_mismatch(
            "regressor length",
            signal.len(),
            regressors.n_frames(),
        ));
    }
    let filtered = filter_regressors(regressors, sampling_rate, f1, f2)?;
    linear_regression(signal, &filtered, false)
}

/// Replaces the timecourse of every mask voxel by its regression residuals.
///
/// Voxels are fitted in parallel on `pool`. Voxels outside the mask are zero in
/// the result. With `zscore`, constant voxels cannot be standardized. They are
/// left at zero and reported with a warning.
///
/// # Errors
/// Fails on a regressor length mismatch and on any regression failure other
/// than a constant voxel.
pub fn regress_series(
    series: &VolumeSeries,
    mask: &Mask,
    regressors: &RegressorMatrix,
    zscore: bool,
    pool: &WorkerPool,
) -> Result<VolumeSeries> {
    if regressors.n_frames() != series.frames() {
        return Err(RsError::dimension_mismatch(
            "regressor length",
            series.frames(),
            regressors.n_frames(),
        ));
    }
    let residuals: Vec<Option<Vec<f64>>> = pool.install(|| {
        mask.points()
            .par_iter()
            .map(|p| {
                let timecourse = series.timecourse(*p).to_vec();
                if zscore && is_constant(&timecourse) {
                    return Ok(None);
                }
                linear_regression(&timecourse, regressors, zscore).map(|fit| Some(fit.residuals))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let skipped = residuals.iter().filter(|r| r.is_none()).count();
    if skipped > 0 {
        log::warn!("{skipped} constant voxels cannot be standardized, their residuals are zero");
    }
    let mut output = series.clone_header_for_output(series.frames());
    for (p, residual) in mask.points().iter().zip(&residuals) {
        if let Some(residual) = residual {
            output.set_timecourse(*p, residual);
        }
    }
    Ok(output)
}

fn is_constant(values: &[f64]) -> bool {
    values.windows(2).all(|pair| pair[0] == pair[1])
}
