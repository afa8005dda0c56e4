//! File access: volume series, masks, regressor tables and text outputs.
//!
//! Volume series are read and written through the [`SeriesStore`] trait.
//! [`NiftiStore`] handles NIfTI-1 files on disk, [`MemoryStore`] keeps series in
//! memory for tests and embedding.

use crate::data_container::{
    FrameFlags, GridDims, Mask, RegressorMatrix, SeriesHeader, Volume, VolumeSeries,
};
use crate::error::{Result, RsError};
use csv::{ReaderBuilder, WriterBuilder};
use ndarray::{Array4, ArrayD, Axis, Ix3, Ix4};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Read and write access to volume series.
pub trait SeriesStore: Send + Sync {
    /// Reads the series stored at `path` with scaling applied.
    fn open_series(&self, path: &Path) -> Result<VolumeSeries>;

    /// Writes `series` to `path`. A failed write leaves nothing at `path`.
    fn write_series(&self, path: &Path, series: &VolumeSeries) -> Result<()>;
}

/// NIfTI-1 files (`.nii` and `.nii.gz`).
#[derive(Debug, Default, Clone, Copy)]
pub struct NiftiStore;

fn datatype_name(header: &NiftiHeader) -> String {
    match header.data_type() {
        Ok(t) => format!("{t:?}").to_uppercase(),
        Err(_) => format!("UNKNOWN({})", header.datatype),
    }
}

/// Converts an `[x, y, z]` or `[x, y, z, t]` array into frame-major layout.
fn frame_major(path: &Path, array: ArrayD<f64>) -> Result<Array4<f64>> {
    let shape_error = |err: ndarray::ShapeError| {
        RsError::io(path, format!("unexpected volume shape: {err}"))
    };
    match array.ndim() {
        3 => {
            let volume = array.into_dimensionality::<Ix3>().map_err(shape_error)?;
            Ok(volume.insert_axis(Axis(0)).as_standard_layout().into_owned())
        }
        4 => {
            let series = array.into_dimensionality::<Ix4>().map_err(shape_error)?;
            Ok(series
                .permuted_axes([3, 0, 1, 2])
                .as_standard_layout()
                .into_owned())
        }
        n => Err(RsError::io(
            path,
            format!("unsupported dimensionality {n}, expected a 3D or 4D volume"),
        )),
    }
}

impl SeriesStore for NiftiStore {
    fn open_series(&self, path: &Path) -> Result<VolumeSeries> {
        let object = ReaderOptions::new()
            .read_file(path)
            .map_err(|err| RsError::volume_io(path, err))?;
        let nifti_header = object.header().clone();
        let array = object
            .into_volume()
            .into_ndarray::<f64>()
            .map_err(|err| RsError::volume_io(path, err))?;
        let data = frame_major(path, array)?;
        let (frames, x, y, z) = data.dim();

        let pixdim = nifti_header.pixdim;
        let header = SeriesHeader {
            dims: GridDims::new(x, y, z),
            voxel_size: [pixdim[1], pixdim[2], pixdim[3]],
            repetition_time: pixdim[4],
            slope: nifti_header.scl_slope,
            intercept: nifti_header.scl_inter,
            datatype: datatype_name(&nifti_header),
            nifti: Some(Box::new(nifti_header)),
        };
        log::debug!(
            "read {}: {}x{}x{} voxels, {} frames, {}",
            path.display(),
            x,
            y,
            z,
            frames,
            header.datatype
        );
        VolumeSeries::new(header, data)
    }

    fn write_series(&self, path: &Path, series: &VolumeSeries) -> Result<()> {
        let source = series.header();
        let mut header = source.nifti.as_deref().cloned().unwrap_or_default();
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        header.pixdim[1..4].copy_from_slice(&source.voxel_size);
        header.pixdim[4] = source.repetition_time;

        let directory = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let suffix = if path.to_string_lossy().ends_with(".gz") {
            ".nii.gz"
        } else {
            ".nii"
        };
        let temporary = tempfile::Builder::new()
            .prefix(".rstools-")
            .suffix(suffix)
            .tempfile_in(&directory)
            .map_err(|err| RsError::io(path, format!("could not create output file: {err}")))?;

        // nifti stores [x, y, z, t] with x varying fastest
        let data = series
            .data()
            .view()
            .permuted_axes([1, 2, 3, 0])
            .reversed_axes()
            .as_standard_layout()
            .into_owned()
            .reversed_axes();
        let writer = WriterOptions::new(temporary.path()).reference_header(&header);
        let written = if source.datatype == "FLOAT64" {
            writer.write_nifti(&data)
        } else {
            writer.write_nifti(&data.mapv(|v| v as f32))
        };
        written.map_err(|err| RsError::volume_io(path, err))?;

        temporary
            .persist(path)
            .map_err(|err| RsError::io(path, format!("could not move output into place: {err}")))?;
        log::debug!("wrote {} frames to {}", series.frames(), path.display());
        Ok(())
    }
}

/// Series kept in memory, keyed by path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: RwLock<HashMap<PathBuf, VolumeSeries>>,
    unwritable: RwLock<HashSet<PathBuf>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, series: VolumeSeries) {
        if let Ok(mut map) = self.series.write() {
            map.insert(path.into(), series);
        }
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<VolumeSeries> {
        self.series
            .read()
            .ok()
            .and_then(|map| map.get(path.as_ref()).cloned())
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.series
            .read()
            .map(|map| map.contains_key(path.as_ref()))
            .unwrap_or(false)
    }

    /// Makes every later write to `path` fail.
    pub fn mark_unwritable(&self, path: impl Into<PathBuf>) {
        if let Ok(mut set) = self.unwritable.write() {
            set.insert(path.into());
        }
    }
}

impl SeriesStore for MemoryStore {
    fn open_series(&self, path: &Path) -> Result<VolumeSeries> {
        self.get(path)
            .ok_or_else(|| RsError::io(path, "could not read volume series"))
    }

    fn write_series(&self, path: &Path, series: &VolumeSeries) -> Result<()> {
        let blocked = self
            .unwritable
            .read()
            .map(|set| set.contains(path))
            .unwrap_or(true);
        if blocked {
            return Err(RsError::io(path, "could not write volume series"));
        }
        let mut map = self
            .series
            .write()
            .map_err(|_| RsError::io(path, "series store is poisoned"))?;
        map.insert(path.to_path_buf(), series.clone());
        Ok(())
    }
}

/// Reads a mask on the grid of `reference`.
///
/// The first volume of the mask file is resampled to that grid and thresholded.
/// If `save_to` is given, the resampled grid is written there as a single-frame
/// series with the geometry of `reference`. A failure to write it is only logged.
///
/// # Errors
/// Fails if the mask cannot be read or no voxel survives the threshold.
pub fn load_mask(
    store: &dyn SeriesStore,
    path: &Path,
    reference: &VolumeSeries,
    save_to: Option<&Path>,
) -> Result<Mask> {
    let mask_series = store.open_series(path)?;
    if mask_series.frames() == 0 {
        return Err(RsError::configuration("mask", "mask invalid: file holds no volume"));
    }
    let (mask, resampled) = Mask::resampled(&mask_series.extract_volume(0), reference.dims());
    if mask.is_empty() {
        return Err(RsError::configuration(
            "mask",
            format!("mask invalid: no voxel of {} lies above threshold", path.display()),
        ));
    }
    log::info!("mask {} holds {} voxels", path.display(), mask.len());

    if let Some(destination) = save_to {
        let saved = VolumeSeries::from_frames(reference.header().clone(), vec![resampled])?;
        match store.write_series(destination, &saved) {
            Ok(()) => log::info!("wrote resampled mask to {}", destination.display()),
            Err(err) => log::warn!("resampled mask not saved: {err}"),
        }
    }
    Ok(mask)
}

/// Writes a single volume as a one-frame series with the geometry of `reference`.
pub fn write_volume(
    store: &dyn SeriesStore,
    path: &Path,
    reference: &VolumeSeries,
    volume: Volume,
) -> Result<()> {
    let series = VolumeSeries::from_frames(reference.header().clone(), vec![volume])?;
    store.write_series(path, &series)
}

/// Reads a whitespace-separated numeric table, one row per frame.
///
/// Fields may be separated by any mix of spaces and tabs. Blank lines and lines
/// starting with `#` are ignored. Every value is multiplied by `scale`.
///
/// # Errors
/// - [`RsError::Io`] if the file cannot be read.
/// - [`RsError::Parse`] for non-numeric fields and rows of differing width.
pub fn load_regressor_matrix(path: &Path, scale: f64) -> Result<RegressorMatrix> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_path(path)
        .map_err(|err| RsError::io(path, format!("could not open regressor file: {err}")))?;

    let mut rows: Vec<Vec<f64>> = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|err| RsError::io(path, format!("could not read regressor file: {err}")))?;
        let line = record.position().map_or(0, |p| p.line() as usize);
        let row = record
            .iter()
            .flat_map(|field| field.split('\t'))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| {
                value
                    .parse::<f64>()
                    .map(|v| v * scale)
                    .map_err(|err| RsError::parse(path, line, format!("'{value}': {err}")))
            })
            .collect::<Result<Vec<f64>>>()?;
        if row.is_empty() {
            continue;
        }
        if let Some(first) = rows.first() {
            if first.len() != row.len() {
                return Err(RsError::parse(
                    path,
                    line,
                    format!("expected {} columns, found {}", first.len(), row.len()),
                ));
            }
        }
        rows.push(row);
    }
    RegressorMatrix::from_rows(&rows)
}

/// Writes one value per line with 10 decimals.
pub fn save_double_vector(path: &Path, values: &[f64]) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|err| RsError::io(path, format!("could not create file: {err}")))?;
    for value in values {
        writer
            .write_record([format!("{value:.10}")])
            .map_err(|err| RsError::io(path, format!("could not write value: {err}")))?;
    }
    writer
        .flush()
        .map_err(|err| RsError::io(path, format!("could not write file: {err}")))
}

/// Writes the indices of flagged frames, one per line in ascending order.
pub fn save_index_vector(path: &Path, flags: &FrameFlags) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|err| RsError::io(path, format!("could not create file: {err}")))?;
    for index in flags.flagged() {
        writer
            .write_record([index.to_string()])
            .map_err(|err| RsError::io(path, format!("could not write index: {err}")))?;
    }
    writer
        .flush()
        .map_err(|err| RsError::io(path, format!("could not write file: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_container::Point3D;
    use std::fs;

    fn series(frames: usize, dims: GridDims) -> VolumeSeries {
        let data = Array4::from_shape_fn((frames, dims.x, dims.y, dims.z), |(t, x, y, z)| {
            (t * 1000 + x * 100 + y * 10 + z) as f64
        });
        VolumeSeries::new(SeriesHeader::new(dims), data).unwrap()
    }

    #[test]
    fn regressor_table_mixed_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rp.txt");
        fs::write(
            &path,
            "# realignment\n0 0.1\t0.2  0.3\n\n1\t0.4 0.5 0.6\n   \n",
        )
        .unwrap();
        let matrix = load_regressor_matrix(&path, 2.0).unwrap();
        assert_eq!(matrix.n_regressors(), 4);
        assert_eq!(matrix.n_frames(), 2);
        assert_eq!(matrix.regressor(0).to_vec(), vec![0.0, 2.0]);
        assert_eq!(matrix.regressor(3).to_vec(), vec![0.6, 1.2]);
    }

    #[test]
    fn regressor_table_ragged_rows_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rp.txt");
        fs::write(&path, "1 2 3\n4 5\n").unwrap();
        assert!(matches!(
            load_regressor_matrix(&path, 1.0),
            Err(RsError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn regressor_table_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rp.txt");
        fs::write(&path, "1 2\n3 abc\n").unwrap();
        assert!(matches!(
            load_regressor_matrix(&path, 1.0),
            Err(RsError::Parse { .. })
        ));
    }

    #[test]
    fn missing_regressor_file_names_path() {
        let err = load_regressor_matrix(Path::new("/nonexistent/rp.txt"), 1.0).unwrap_err();
        assert!(matches!(err, RsError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/rp.txt"));
    }

    #[test]
    fn text_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let values = dir.path().join("dvars.txt");
        save_double_vector(&values, &[0.0, 1.5, -0.25]).unwrap();
        assert_eq!(
            fs::read_to_string(&values).unwrap(),
            "0.0000000000\n1.5000000000\n-0.2500000000\n"
        );

        let indices = dir.path().join("flagged.txt");
        let mut flags = FrameFlags::new(6);
        flags.flag(4);
        flags.flag(1);
        save_index_vector(&indices, &flags).unwrap();
        assert_eq!(fs::read_to_string(&indices).unwrap(), "1\n4\n");
    }

    #[test]
    fn memory_store_round_trip_and_failures() {
        let store = MemoryStore::new();
        let s = series(3, GridDims::new(2, 2, 2));
        store.write_series(Path::new("a.nii"), &s).unwrap();
        assert_eq!(store.open_series(Path::new("a.nii")).unwrap(), s);
        assert!(store.open_series(Path::new("b.nii")).is_err());

        store.mark_unwritable("c.nii");
        assert!(store.write_series(Path::new("c.nii"), &s).is_err());
        assert!(!store.contains("c.nii"));
    }

    #[test]
    fn mask_is_resampled_and_saved() {
        let store = MemoryStore::new();
        let mut mask_volume = Volume::zeros(GridDims::new(1, 1, 1));
        mask_volume.set_value(Point3D::new(0, 0, 0), 1.0);
        let mask_series =
            VolumeSeries::from_frames(SeriesHeader::new(GridDims::new(1, 1, 1)), vec![mask_volume])
                .unwrap();
        store.insert("mask.nii", mask_series);

        let reference = series(2, GridDims::new(2, 1, 2));
        let mask = load_mask(
            &store,
            Path::new("mask.nii"),
            &reference,
            Some(Path::new("saved.nii")),
        )
        .unwrap();
        assert_eq!(mask.len(), 4);
        let saved = store.get("saved.nii").unwrap();
        assert_eq!(saved.frames(), 1);
        assert_eq!(saved.dims(), reference.dims());

        store.mark_unwritable("blocked.nii");
        let mask = load_mask(
            &store,
            Path::new("mask.nii"),
            &reference,
            Some(Path::new("blocked.nii")),
        )
        .unwrap();
        assert_eq!(mask.len(), 4);
    }

    #[test]
    fn empty_mask_is_invalid() {
        let store = MemoryStore::new();
        store.insert(
            "mask.nii",
            VolumeSeries::zeros(SeriesHeader::new(GridDims::new(2, 2, 2)), 1),
        );
        let reference = series(2, GridDims::new(2, 2, 2));
        assert!(matches!(
            load_mask(&store, Path::new("mask.nii"), &reference, None),
            Err(RsError::Configuration { .. })
        ));
    }

    #[test]
    fn nifti_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series.nii");
        let s = series(3, GridDims::new(2, 3, 4));
        NiftiStore.write_series(&path, &s).unwrap();
        let read = NiftiStore.open_series(&path).unwrap();
        assert_eq!(read.frames(), 3);
        assert_eq!(read.dims(), GridDims::new(2, 3, 4));
        assert_eq!(read.data(), s.data());
        assert_eq!(read.header().datatype, "FLOAT64");
    }

    #[test]
    fn nifti_write_to_missing_directory_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.nii");
        let s = series(1, GridDims::new(1, 1, 1));
        assert!(NiftiStore.write_series(&path, &s).is_err());
        assert!(!path.exists());
    }
}
