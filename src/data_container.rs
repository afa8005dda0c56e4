//! This module defines the data structures shared by all processing stages: voxel
//! coordinates, single volumes, volume series, masks, regressor tables and frame
//! flags.
//!
//! Volumes and series own a single contiguous `ndarray` allocation. Stages hand
//! out owned grids or typed views, never nested pointer structures.

use crate::error::{Result, RsError};
use ndarray::{s, Array2, Array3, Array4, ArrayView1, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

/// Threshold above which a resampled mask voxel counts as part of the mask.
pub const MASK_THRESHOLD: f64 = 0.01;

/// An integer voxel coordinate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point3D {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Point3D {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Point3D { x, y, z }
    }
}

/// Spatial extent of a volume grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridDims {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl GridDims {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        GridDims { x, y, z }
    }

    pub fn voxel_count(&self) -> usize {
        self.x * self.y * self.z
    }

    /// Returns `true` if `p` lies within `[0,x) × [0,y) × [0,z)`.
    pub fn contains(&self, p: Point3D) -> bool {
        p.x < self.x && p.y < self.y && p.z < self.z
    }

    fn shape(&self) -> (usize, usize, usize) {
        (self.x, self.y, self.z)
    }
}

/// Geometry and storage metadata of a volume series.
///
/// # Fields
/// - `dims`: Spatial extent of every frame.
/// - `voxel_size`: Voxel edge lengths in millimeters.
/// - `repetition_time`: Time between two frames in seconds (0 if unknown).
/// - `slope`, `intercept`: Affine scale of the stored values. Series in memory are
///   always scale-applied, the values are kept to describe the source.
/// - `datatype`: Human-readable storage type of the source file.
/// - `nifti`: The header the series was read from, used as prototype when
///   writing derived series.
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesHeader {
    pub dims: GridDims,
    pub voxel_size: [f32; 3],
    pub repetition_time: f32,
    pub slope: f32,
    pub intercept: f32,
    pub datatype: String,
    pub nifti: Option<Box<nifti::NiftiHeader>>,
}

impl SeriesHeader {
    /// Creates a header for an in-memory series with unit voxels and no scaling.
    pub fn new(dims: GridDims) -> Self {
        SeriesHeader {
            dims,
            voxel_size: [1.0, 1.0, 1.0],
            repetition_time: 0.0,
            slope: 1.0,
            intercept: 0.0,
            datatype: "FLOAT64".to_string(),
            nifti: None,
        }
    }
}

/// A 3D scalar field indexed by `[x, y, z]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    data: Array3<f64>,
}

impl Volume {
    pub fn zeros(dims: GridDims) -> Self {
        Volume {
            data: Array3::zeros(dims.shape()),
        }
    }

    pub fn from_array(data: Array3<f64>) -> Self {
        Volume { data }
    }

    pub fn dims(&self) -> GridDims {
        let (x, y, z) = self.data.dim();
        GridDims { x, y, z }
    }

    /// Value at `p`. `p` must lie inside the grid.
    pub fn value(&self, p: Point3D) -> f64 {
        self.data[(p.x, p.y, p.z)]
    }

    pub fn set_value(&mut self, p: Point3D, value: f64) {
        self.data[(p.x, p.y, p.z)] = value;
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn into_array(self) -> Array3<f64> {
        self.data
    }
}

/// An ordered sequence of volumes that share one grid.
///
/// The frames are stored frame-major as `[t, x, y, z]`, so extracting a single
/// frame is a contiguous copy.
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeSeries {
    header: SeriesHeader,
    data: Array4<f64>,
}

impl VolumeSeries {
    /// Wraps frame-major data `[t, x, y, z]`.
    ///
    /// # Errors
    /// Fails if the spatial shape of `data` differs from `header.dims`.
    pub fn new(header: SeriesHeader, data: Array4<f64>) -> Result<Self> {
        let (_, x, y, z) = data.dim();
        let dims = header.dims;
        if (x, y, z) != dims.shape() {
            return Err(RsError::dimension_mismatch(
                "series grid",
                dims.voxel_count(),
                x * y * z,
            ));
        }
        Ok(VolumeSeries { header, data })
    }

    /// A series of `frames` zero-filled volumes.
    pub fn zeros(header: SeriesHeader, frames: usize) -> Self {
        let dims = header.dims;
        VolumeSeries {
            data: Array4::zeros((frames, dims.x, dims.y, dims.z)),
            header,
        }
    }

    /// Builds a series from individual frames, keeping their order.
    ///
    /// # Errors
    /// Fails if any frame's grid differs from `header.dims`.
    pub fn from_frames(header: SeriesHeader, frames: Vec<Volume>) -> Result<Self> {
        let mut series = VolumeSeries::zeros(header, frames.len());
        for (t, frame) in frames.into_iter().enumerate() {
            if frame.dims() != series.header.dims {
                return Err(RsError::dimension_mismatch(
                    format!("frame {t} grid"),
                    series.header.dims.voxel_count(),
                    frame.dims().voxel_count(),
                ));
            }
            series
                .data
                .index_axis_mut(Axis(0), t)
                .assign(&frame.into_array());
        }
        Ok(series)
    }

    /// An empty series with the same geometry and storage metadata as `self`,
    /// but room for `frame_count` frames.
    pub fn clone_header_for_output(&self, frame_count: usize) -> VolumeSeries {
        VolumeSeries::zeros(self.header.clone(), frame_count)
    }

    pub fn header(&self) -> &SeriesHeader {
        &self.header
    }

    pub fn dims(&self) -> GridDims {
        self.header.dims
    }

    /// Number of frames (`vDim`).
    pub fn frames(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    /// Owned copy of frame `t`.
    pub fn extract_volume(&self, t: usize) -> Volume {
        Volume::from_array(self.frame(t).to_owned())
    }

    /// Borrowed view of frame `t`.
    pub fn frame(&self, t: usize) -> ArrayView3<'_, f64> {
        self.data.index_axis(Axis(0), t)
    }

    /// The timecourse of voxel `p`.
    pub fn timecourse(&self, p: Point3D) -> ArrayView1<'_, f64> {
        self.data.slice(s![.., p.x, p.y, p.z])
    }

    pub fn set_timecourse(&mut self, p: Point3D, values: &[f64]) {
        for (dst, src) in self
            .data
            .slice_mut(s![.., p.x, p.y, p.z])
            .iter_mut()
            .zip(values)
        {
            *dst = *src;
        }
    }

    /// Frame-major data `[t, x, y, z]`.
    pub fn data(&self) -> &Array4<f64> {
        &self.data
    }
}

/// Nearest-neighbour resampling of `volume` onto a grid of size `target`.
///
/// The source index along every axis is `floor(old / new * index)`.
pub fn resample_volume(volume: &Volume, target: GridDims) -> Volume {
    let old = volume.dims();
    let ratio = |o: usize, n: usize| o as f64 / n as f64;
    let (rx, ry, rz) = (
        ratio(old.x, target.x),
        ratio(old.y, target.y),
        ratio(old.z, target.z),
    );
    let data = Array3::from_shape_fn(target.shape(), |(x, y, z)| {
        let ox = ((rx * x as f64) as usize).min(old.x.saturating_sub(1));
        let oy = ((ry * y as f64) as usize).min(old.y.saturating_sub(1));
        let oz = ((rz * z as f64) as usize).min(old.z.saturating_sub(1));
        volume.data[(ox, oy, oz)]
    });
    Volume::from_array(data)
}

/// A set of voxel coordinates on a fixed grid.
///
/// Points are ordered x-major, then y, then z. The order only matters for
/// reproducible iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    dims: GridDims,
    points: Vec<Point3D>,
}

impl Mask {
    /// Collects all voxels of `volume` whose value exceeds `threshold`.
    pub fn from_volume(volume: &Volume, threshold: f64) -> Self {
        let dims = volume.dims();
        let mut points = Vec::new();
        for x in 0..dims.x {
            for y in 0..dims.y {
                for z in 0..dims.z {
                    let p = Point3D::new(x, y, z);
                    if volume.value(p) > threshold {
                        points.push(p);
                    }
                }
            }
        }
        Mask { dims, points }
    }

    /// Resamples a mask volume to `target` and thresholds it at [`MASK_THRESHOLD`].
    ///
    /// Returns the mask together with the resampled grid.
    pub fn resampled(volume: &Volume, target: GridDims) -> (Self, Volume) {
        let resampled = resample_volume(volume, target);
        (Mask::from_volume(&resampled, MASK_THRESHOLD), resampled)
    }

    /// Creates a mask from explicit points.
    ///
    /// # Errors
    /// Fails if any point lies outside `dims`.
    pub fn from_points(dims: GridDims, points: Vec<Point3D>) -> Result<Self> {
        if let Some(p) = points.iter().find(|p| !dims.contains(**p)) {
            return Err(RsError::configuration(
                "mask",
                format!(
                    "point ({}, {}, {}) lies outside the {}x{}x{} grid",
                    p.x, p.y, p.z, dims.x, dims.y, dims.z
                ),
            ));
        }
        Ok(Mask { dims, points })
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn points(&self) -> &[Point3D] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// `R` regressors with `T` values each, stored as `[regressor, frame]`.
#[derive(Clone, Debug, PartialEq)]
pub struct RegressorMatrix {
    values: Array2<f64>,
}

impl RegressorMatrix {
    /// Builds the matrix from table rows, one row per frame and one column per
    /// regressor.
    ///
    /// # Errors
    /// Fails if rows have different widths.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let columns = rows.first().map_or(0, Vec::len);
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns) {
            return Err(RsError::dimension_mismatch(
                format!("regressor row {i}"),
                columns,
                row.len(),
            ));
        }
        let values = Array2::from_shape_fn((columns, rows.len()), |(r, t)| rows[t][r]);
        Ok(RegressorMatrix { values })
    }

    /// Builds the matrix from regressors, each holding one value per frame.
    ///
    /// # Errors
    /// Fails if regressors have different lengths.
    pub fn from_regressors(regressors: &[Vec<f64>]) -> Result<Self> {
        let frames = regressors.first().map_or(0, Vec::len);
        if let Some((i, r)) = regressors
            .iter()
            .enumerate()
            .find(|(_, r)| r.len() != frames)
        {
            return Err(RsError::dimension_mismatch(
                format!("regressor {i}"),
                frames,
                r.len(),
            ));
        }
        let values = Array2::from_shape_fn((regressors.len(), frames), |(r, t)| regressors[r][t]);
        Ok(RegressorMatrix { values })
    }

    pub fn n_regressors(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_frames(&self) -> usize {
        self.values.ncols()
    }

    /// All values of regressor `r`.
    pub fn regressor(&self, r: usize) -> ArrayView1<'_, f64> {
        self.values.row(r)
    }

    pub fn value(&self, r: usize, t: usize) -> f64 {
        self.values[(r, t)]
    }

    pub fn to_vecs(&self) -> Vec<Vec<f64>> {
        self.values.rows().into_iter().map(|r| r.to_vec()).collect()
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }
}

/// One flag per frame. Only the flagging policy sets flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameFlags {
    flags: Vec<bool>,
}

impl FrameFlags {
    pub fn new(frames: usize) -> Self {
        FrameFlags {
            flags: vec![false; frames],
        }
    }

    pub fn flag(&mut self, t: usize) {
        self.flags[t] = true;
    }

    pub fn is_flagged(&self, t: usize) -> bool {
        self.flags[t]
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.flags
    }

    /// Indices of flagged frames in ascending order.
    pub fn flagged(&self) -> Vec<usize> {
        (0..self.flags.len()).filter(|t| self.flags[*t]).collect()
    }

    /// Indices of frames that survive scrubbing, in ascending order.
    pub fn retained(&self) -> Vec<usize> {
        (0..self.flags.len()).filter(|t| !self.flags[*t]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_series(frames: usize) -> VolumeSeries {
        let dims = GridDims::new(2, 3, 2);
        let data = Array4::from_shape_fn((frames, 2, 3, 2), |(t, x, y, z)| {
            (t * 100 + x * 10 + y * 3 + z) as f64
        });
        VolumeSeries::new(SeriesHeader::new(dims), data).unwrap()
    }

    #[test]
    fn extract_volume_returns_frame() {
        let series = ramp_series(4);
        let vol = series.extract_volume(2);
        assert_eq!(vol.value(Point3D::new(1, 2, 1)), 200.0 + 10.0 + 6.0 + 1.0);
        assert_eq!(series.timecourse(Point3D::new(0, 0, 0)).to_vec(), vec![0.0, 100.0, 200.0, 300.0]);
    }

    #[test]
    fn series_rejects_wrong_grid() {
        let header = SeriesHeader::new(GridDims::new(2, 2, 2));
        assert!(VolumeSeries::new(header, Array4::zeros((3, 2, 2, 3))).is_err());
    }

    #[test]
    fn from_frames_keeps_order() {
        let series = ramp_series(3);
        let frames = vec![series.extract_volume(2), series.extract_volume(0)];
        let out = VolumeSeries::from_frames(series.header().clone(), frames).unwrap();
        assert_eq!(out.frames(), 2);
        assert_eq!(out.frame(0), series.frame(2));
        assert_eq!(out.frame(1), series.frame(0));
    }

    #[test]
    fn clone_header_for_output_keeps_geometry() {
        let series = ramp_series(5);
        let out = series.clone_header_for_output(2);
        assert_eq!(out.frames(), 2);
        assert_eq!(out.dims(), series.dims());
        assert_eq!(out.header(), series.header());
    }

    #[test]
    fn resampled_mask_thresholds_and_orders_points() {
        let mut vol = Volume::zeros(GridDims::new(2, 2, 1));
        vol.set_value(Point3D::new(1, 0, 0), 1.0);
        vol.set_value(Point3D::new(0, 1, 0), 0.005);
        let (mask, grid) = Mask::resampled(&vol, GridDims::new(4, 4, 1));
        assert_eq!(grid.dims(), GridDims::new(4, 4, 1));
        assert_eq!(
            mask.points(),
            &[
                Point3D::new(2, 0, 0),
                Point3D::new(2, 1, 0),
                Point3D::new(3, 0, 0),
                Point3D::new(3, 1, 0)
            ]
        );
    }

    #[test]
    fn mask_points_must_lie_in_grid() {
        let dims = GridDims::new(2, 2, 2);
        assert!(Mask::from_points(dims, vec![Point3D::new(1, 1, 1)]).is_ok());
        assert!(Mask::from_points(dims, vec![Point3D::new(2, 0, 0)]).is_err());
    }

    #[test]
    fn regressor_matrix_from_rows_is_transposed() {
        let rows = vec![vec![0.0, 1.0], vec![1.0, 2.0], vec![2.0, 3.0]];
        let m = RegressorMatrix::from_rows(&rows).unwrap();
        assert_eq!(m.n_regressors(), 2);
        assert_eq!(m.n_frames(), 3);
        assert_eq!(m.regressor(1).to_vec(), vec![1.0, 2.0, 3.0]);
        assert!(RegressorMatrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn frame_flags_split_flagged_and_retained() {
        let mut flags = FrameFlags::new(5);
        flags.flag(1);
        flags.flag(3);
        assert_eq!(flags.flagged(), vec![1, 3]);
        assert_eq!(flags.retained(), vec![0, 2, 4]);
    }
}
