//! Timecourse extraction for single voxels and mask regions.

use crate::data_container::{Mask, Point3D, VolumeSeries};
use crate::error::{Result, RsError};
use crate::math_tools::{first_eigenvector, vector_mean, Termination};
use ndarray::{Array1, Array2, Axis};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// How the voxel timecourses of a region are combined into one timecourse.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Aggregation {
    /// Mean over all region voxels per frame.
    Mean,
    /// Population standard deviation over all region voxels per frame.
    StdDev,
    /// Projection onto the first eigenvector of the voxel-by-voxel covariance.
    SpatialPca,
    /// First eigenvector of the frame-by-frame covariance, scaled by the square
    /// root of its eigenvalue.
    TemporalPca,
}

impl Display for Aggregation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Aggregation::Mean => write!(f, "mean"),
            Aggregation::StdDev => write!(f, "stddev"),
            Aggregation::SpatialPca => write!(f, "spca"),
            Aggregation::TemporalPca => write!(f, "tpca"),
        }
    }
}

impl FromStr for Aggregation {
    type Err = RsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mean" => Ok(Aggregation::Mean),
            "stddev" => Ok(Aggregation::StdDev),
            "spca" => Ok(Aggregation::SpatialPca),
            "tpca" => Ok(Aggregation::TemporalPca),
            other => Err(RsError::configuration(
                "algorithm",
                format!("unknown aggregation '{other}', expected mean, stddev, spca or tpca"),
            )),
        }
    }
}

/// Settings of the PCA aggregations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcaOptions {
    /// Standardize every voxel timecourse before the decomposition.
    pub use_standard_scores: bool,
    pub max_iterations: usize,
    pub precision: f64,
}

impl Default for PcaOptions {
    fn default() -> Self {
        PcaOptions {
            use_standard_scores: false,
            max_iterations: 1000,
            precision: 1e-10,
        }
    }
}

/// An aggregated region timecourse.
///
/// The PCA aggregations also report the eigenvalue and the solver termination,
/// the spatial PCA additionally its voxel weights in mask order.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionTimecourse {
    pub values: Vec<f64>,
    pub eigenvalue: Option<f64>,
    pub spatial_map: Option<Vec<f64>>,
    pub termination: Option<Termination>,
}

impl RegionTimecourse {
    fn plain(values: Vec<f64>) -> Self {
        RegionTimecourse {
            values,
            eigenvalue: None,
            spatial_map: None,
            termination: None,
        }
    }
}

/// The timecourse of the voxel at `p`.
///
/// # Errors
/// Fails with a configuration error naming the axis if `p` lies outside the grid.
pub fn point_timecourse(series: &VolumeSeries, p: Point3D) -> Result<Vec<f64>> {
    let dims = series.dims();
    for (axis, value, size) in [("x", p.x, dims.x), ("y", p.y, dims.y), ("z", p.z, dims.z)] {
        if value >= size {
            return Err(RsError::configuration(
                axis,
                format!("{axis} index ({value}) out of range [0..{}]", size.saturating_sub(1)),
            ));
        }
    }
    Ok(series.timecourse(p).to_vec())
}

/// Aggregates the timecourses of all mask voxels.
///
/// # Errors
/// Fails for an empty mask, and in the PCA modes for voxels without variance
/// when standard scores are requested.
pub fn region_timecourse(
    series: &VolumeSeries,
    mask: &Mask,
    aggregation: Aggregation,
    options: &PcaOptions,
) -> Result<RegionTimecourse> {
    if mask.is_empty() {
        return Err(RsError::configuration("mask", "mask invalid: no voxels"));
    }
    let frames = series.frames();
    let points = mask.points();
    // voxels × frames
    let voxels = Array2::from_shape_fn((points.len(), frames), |(i, t)| {
        let p = points[i];
        series.data()[(t, p.x, p.y, p.z)]
    });

    match aggregation {
        Aggregation::Mean => {
            let values = voxels
                .axis_iter(Axis(1))
                .map(|frame| vector_mean(&frame.to_vec()))
                .collect();
            Ok(RegionTimecourse::plain(values))
        }
        Aggregation::StdDev => {
            let values = voxels.axis_iter(Axis(1)).map(|frame| frame.std(0.0)).collect();
            Ok(RegionTimecourse::plain(values))
        }
        Aggregation::SpatialPca => spatial_pca(voxels, options),
        Aggregation::TemporalPca => temporal_pca(voxels, options),
    }
}

/// Centers every row, or standardizes it when `standardize` is set.
fn prepare_rows(voxels: &mut Array2<f64>, standardize: bool) -> Result<()> {
    for (i, mut row) in voxels.axis_iter_mut(Axis(0)).enumerate() {
        let mean = row.mean().unwrap_or(0.0);
        row.mapv_inplace(|v| v - mean);
        if standardize {
            let std = row.std(0.0);
            if !(std > 0.0) {
                return Err(RsError::numerical(format!(
                    "cannot standardize timecourse of region voxel {i}: zero variance"
                )));
            }
            row.mapv_inplace(|v| v / std);
        }
    }
    Ok(())
}

/// Eigenvectors are defined up to sign. Returns the sign with a non-negative
/// projection onto `reference`.
fn oriented(vector: Array1<f64>, reference: &Array1<f64>) -> Array1<f64> {
    if vector.dot(reference) < 0.0 {
        -vector
    } else {
        vector
    }
}

fn spatial_pca(mut voxels: Array2<f64>, options: &PcaOptions) -> Result<RegionTimecourse> {
    prepare_rows(&mut voxels, options.use_standard_scores)?;
    let frames = voxels.ncols();
    let covariance = voxels.dot(&voxels.t()) / (frames.saturating_sub(1).max(1)) as f64;
    let pair = first_eigenvector(&covariance.view(), options.max_iterations, options.precision)?;
    let weights = oriented(pair.vector, &Array1::ones(voxels.nrows()));
    let values = weights.dot(&voxels);
    log::debug!(
        "spatial pca: eigenvalue {} after {} iterations",
        pair.eigenvalue,
        pair.iterations
    );
    Ok(RegionTimecourse {
        values: values.to_vec(),
        eigenvalue: Some(pair.eigenvalue),
        spatial_map: Some(weights.to_vec()),
        termination: Some(pair.termination),
    })
}

fn temporal_pca(mut voxels: Array2<f64>, options: &PcaOptions) -> Result<RegionTimecourse> {
    prepare_rows(&mut voxels, options.use_standard_scores)?;
    let count = voxels.nrows();
    let covariance = voxels.t().dot(&voxels) / (count.saturating_sub(1).max(1)) as f64;
    let pair = first_eigenvector(&covariance.view(), options.max_iterations, options.precision)?;
    let scale = pair.eigenvalue.max(0.0).sqrt();
    let region_mean = voxels.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(voxels.ncols()));
    let values = oriented(pair.vector, &region_mean) * scale;
    log::debug!(
        "temporal pca: eigenvalue {} after {} iterations",
        pair.eigenvalue,
        pair.iterations
    );
    Ok(RegionTimecourse {
        values: values.to_vec(),
        eigenvalue: Some(pair.eigenvalue),
        spatial_map: None,
        termination: Some(pair.termination),
    })
}
