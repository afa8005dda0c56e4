//! Motion scrubbing: flags frames with excessive head motion or intensity change
//! and writes a series that only holds the remaining frames.
//!
//! The pipeline moves through the states of [`ScrubbingState`]:
//!
//! ```text
//! Initialized -> ParametersValidated -> Running -> Completed
//!      \________________\_________________\_____-> Failed
//! ```
//!
//! [`MotionScrubbing::init`] checks the parameters and loads every input,
//! [`MotionScrubbing::run`] computes the statistics, writes the optional text
//! outputs and the scrubbed series.

use crate::config::ScrubbingSettings;
use crate::data_container::{FrameFlags, Mask, VolumeSeries};
use crate::error::{Result, RsError};
use crate::io::{load_mask, load_regressor_matrix, save_double_vector, save_index_vector, SeriesStore};
use crate::math_tools::deg_to_mm;
use frame_loops::WorkerPool;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Paths and settings of a scrubbing run.
///
/// # Fields
/// - `input`, `output`, `mask`, `realignment`: Required.
/// - `dvars_output`, `fd_output`, `flagged_output`: Optional text outputs.
/// - `saved_mask`: Optional destination of the mask resampled to the input grid.
#[derive(Debug, Clone, Default)]
pub struct ScrubbingParameters {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub mask: Option<PathBuf>,
    pub realignment: Option<PathBuf>,
    pub dvars_output: Option<PathBuf>,
    pub fd_output: Option<PathBuf>,
    pub flagged_output: Option<PathBuf>,
    pub saved_mask: Option<PathBuf>,
    pub settings: ScrubbingSettings,
}

impl ScrubbingParameters {
    /// Checks that every required path is present. Touches no file.
    pub fn validate(&self) -> Result<()> {
        let required = [
            (&self.input, "input", "no input volume specified"),
            (&self.output, "output", "no output volume specified"),
            (&self.mask, "mask", "a binary mask must be specified"),
            (
                &self.realignment,
                "realignment",
                "a realignment parameter file must be specified",
            ),
        ];
        for (path, field, message) in required {
            if path.is_none() {
                return Err(RsError::configuration(field, message));
            }
        }
        self.settings.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubbingState {
    Initialized,
    ParametersValidated,
    Running,
    Completed,
    Failed,
}

/// Intensity range over the mask, used to normalize DVARS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn span(&self) -> f64 {
        (self.max - self.min).abs()
    }
}

/// Rigid-body realignment per frame: x, y, z translation in mm followed by
/// pitch, roll, yaw rotation in degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct RealignmentParameters {
    rows: Vec<[f64; 6]>,
}

impl RealignmentParameters {
    pub fn new(rows: Vec<[f64; 6]>) -> Self {
        RealignmentParameters { rows }
    }

    /// Reads a realignment table with one row per frame.
    ///
    /// Tables with seven columns start with the frame index, which is ignored.
    /// Tables with six columns hold the motion parameters only.
    ///
    /// # Errors
    /// Fails on unreadable files, other column counts, or a row count different
    /// from `frames`.
    pub fn load(path: &Path, frames: usize) -> Result<Self> {
        let table = load_regressor_matrix(path, 1.0)?;
        let offset = match table.n_regressors() {
            7 => 1,
            6 => 0,
            n => {
                return Err(RsError::parse(
                    path,
                    1,
                    format!("expected 6 or 7 columns of realignment parameters, found {n}"),
                ))
            }
        };
        if table.n_frames() != frames {
            return Err(RsError::dimension_mismatch(
                format!("realignment rows in {}", path.display()),
                frames,
                table.n_frames(),
            ));
        }
        let rows = (0..frames)
            .map(|t| std::array::from_fn(|c| table.value(c + offset, t)))
            .collect();
        Ok(RealignmentParameters { rows })
    }

    pub fn frames(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[[f64; 6]] {
        &self.rows
    }
}

/// Statistics and frame selection of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrubbingReport {
    pub value_range: ValueRange,
    pub fd: Vec<f64>,
    pub dvars: Vec<f64>,
    pub flags: FrameFlags,
    /// Original index of every frame in the output, in output order.
    pub frame_map: Vec<usize>,
}

/// Minimum and maximum intensity over the mask voxels of frames
/// `min(skip, frames - 1) ..`.
///
/// NaN intensities are skipped (a value is NaN exactly when it is not equal to
/// itself) and never become an extremum.
///
/// # Errors
/// Fails if no finite intensity is found.
pub fn compute_value_range(
    series: &VolumeSeries,
    mask: &Mask,
    skip: usize,
    pool: &WorkerPool,
) -> Result<ValueRange> {
    let frames = series.frames();
    let first = skip.min(frames.saturating_sub(1));
    let (min, max) = pool.map_reduce(
        first..frames,
        |t| {
            let frame = series.frame(t);
            mask.points()
                .iter()
                .map(|p| frame[(p.x, p.y, p.z)])
                .filter(|v| !v.is_nan())
                .fold(None, |range: Option<(f64, f64)>, v| match range {
                    None => Some((v, v)),
                    Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
                })
        },
        |a, b| (a.0.min(b.0), a.1.max(b.1)),
        (f64::INFINITY, f64::NEG_INFINITY),
    );
    if min > max {
        return Err(RsError::numerical(
            "value range is undefined: the mask holds no valid intensity",
        ));
    }
    Ok(ValueRange { min, max })
}

/// Framewise displacement per frame, `0` for the first frame.
///
/// Rotations are converted to arc lengths on a sphere of `radius` mm before the
/// absolute frame-to-frame differences of all six parameters are summed.
pub fn framewise_displacement(realignment: &RealignmentParameters, radius: f64) -> Vec<f64> {
    let rows = realignment.rows();
    let mut fd = vec![0.0; rows.len()];
    for t in 1..rows.len() {
        let (now, before) = (&rows[t], &rows[t - 1]);
        let translation: f64 = (0..3).map(|i| (now[i] - before[i]).abs()).sum();
        let rotation: f64 = (3..6)
            .map(|i| (deg_to_mm(radius, now[i]) - deg_to_mm(radius, before[i])).abs())
            .sum();
        fd[t] = translation + rotation;
    }
    fd
}

/// DVARS per frame, `0` for the first frame.
///
/// Intensities are normalized to `range` first. A degenerate range normalizes by
/// `1` instead.
pub fn compute_dvars(
    series: &VolumeSeries,
    mask: &Mask,
    range: ValueRange,
    pool: &WorkerPool,
) -> Vec<f64> {
    let frames = series.frames();
    if frames == 0 {
        return Vec::new();
    }
    let span = if range.span() > 0.0 {
        range.span()
    } else {
        log::warn!(
            "degenerate value range [{}; {}], DVARS is not normalized",
            range.min,
            range.max
        );
        1.0
    };
    let points = mask.points();
    let normalize = |v: f64| (v - range.min) / span;

    let mut dvars = vec![0.0; frames];
    pool.for_each_slot(&mut dvars[1..], |i, slot| {
        let t = i + 1;
        let now = series.frame(t);
        let before = series.frame(t - 1);
        let sum: f64 = points
            .iter()
            .map(|p| {
                let d = normalize(now[(p.x, p.y, p.z)]) - normalize(before[(p.x, p.y, p.z)]);
                d * d
            })
            .sum();
        *slot = (sum / points.len() as f64).sqrt();
    });
    dvars
}

/// Flags every frame `t >= 1` whose FD or DVARS exceeds its threshold, together
/// with its neighbours `t - 1` and `t + 1`.
pub fn flag_frames(fd: &[f64], dvars: &[f64], fd_threshold: f64, dvars_threshold: f64) -> FrameFlags {
    let frames = fd.len().min(dvars.len());
    let mut flags = FrameFlags::new(frames);
    for t in 1..frames {
        if fd[t] > fd_threshold || dvars[t] > dvars_threshold {
            flags.flag(t - 1);
            flags.flag(t);
            flags.flag((t + 1).min(frames - 1));
        }
    }
    flags
}

/// Builds a series from the unflagged frames of `series`, in original order.
///
/// Returns the series together with the original index of every output frame.
pub fn assemble_retained(
    series: &VolumeSeries,
    flags: &FrameFlags,
    pool: &WorkerPool,
) -> Result<(VolumeSeries, Vec<usize>)> {
    let frame_map = flags.retained();
    let frames = pool.map_frames(0..frame_map.len(), |i| series.extract_volume(frame_map[i]));
    let output = VolumeSeries::from_frames(series.header().clone(), frames)?;
    Ok((output, frame_map))
}

struct Prepared {
    input: VolumeSeries,
    mask: Mask,
    realignment: RealignmentParameters,
    pool: WorkerPool,
    output: PathBuf,
}

/// A motion scrubbing run over series provided by a [`SeriesStore`].
pub struct MotionScrubbing<'a> {
    params: ScrubbingParameters,
    store: &'a dyn SeriesStore,
    state: ScrubbingState,
    prepared: Option<Prepared>,
}

impl<'a> MotionScrubbing<'a> {
    pub fn new(params: ScrubbingParameters, store: &'a dyn SeriesStore) -> Self {
        MotionScrubbing {
            params,
            store,
            state: ScrubbingState::Initialized,
            prepared: None,
        }
    }

    pub fn state(&self) -> ScrubbingState {
        self.state
    }

    pub fn parameters(&self) -> &ScrubbingParameters {
        &self.params
    }

    /// Validates the parameters and loads input, realignment table and mask.
    ///
    /// Missing required parameters are reported before any file is opened. Any
    /// failure moves the pipeline to [`ScrubbingState::Failed`].
    pub fn init(&mut self) -> Result<()> {
        if self.state != ScrubbingState::Initialized {
            return Err(RsError::configuration(
                "state",
                format!("cannot initialize a pipeline in state {:?}", self.state),
            ));
        }
        match self.prepare() {
            Ok(prepared) => {
                self.prepared = Some(prepared);
                self.state = ScrubbingState::ParametersValidated;
                Ok(())
            }
            Err(err) => {
                self.state = ScrubbingState::Failed;
                Err(err)
            }
        }
    }

    fn prepare(&self) -> Result<Prepared> {
        let params = &self.params;
        params.validate()?;
        let (Some(input_path), Some(output), Some(mask_path), Some(realignment_path)) = (
            params.input.as_deref(),
            params.output.clone(),
            params.mask.as_deref(),
            params.realignment.as_deref(),
        ) else {
            return Err(RsError::configuration("input", "required path missing"));
        };
        let settings = &params.settings;
        let pool = WorkerPool::new(settings.threads)?;

        let input = self.store.open_series(input_path)?;
        let dims = input.dims();
        log::info!("input file:  {}", input_path.display());
        log::info!("mask file:   {}", mask_path.display());
        log::info!("output file: {}", output.display());
        log::info!("realignment parameters file: {}", realignment_path.display());
        log::info!("DVARS threshold: {:.4}", settings.dvars_threshold);
        log::info!("framewise displacement threshold: {:.4}", settings.fd_threshold);
        log::info!(
            "dim: {} {} {} ({} volumes)",
            dims.x,
            dims.y,
            dims.z,
            input.frames()
        );

        let realignment = RealignmentParameters::load(realignment_path, input.frames())?;
        let mask = load_mask(self.store, mask_path, &input, params.saved_mask.as_deref())?;

        Ok(Prepared {
            input,
            mask,
            realignment,
            pool,
            output,
        })
    }

    /// Computes the frame statistics, writes the requested text outputs and the
    /// scrubbed series.
    ///
    /// The text outputs are written before the series. A failure to write one of
    /// them is logged and does not stop the run.
    ///
    /// # Errors
    /// Fails if called before a successful [`MotionScrubbing::init`], if every
    /// frame is flagged, or if the scrubbed series cannot be written. Any failure
    /// moves the pipeline to [`ScrubbingState::Failed`].
    pub fn run(&mut self) -> Result<ScrubbingReport> {
        if self.state != ScrubbingState::ParametersValidated {
            return Err(RsError::configuration(
                "state",
                format!("run requires validated parameters, pipeline is {:?}", self.state),
            ));
        }
        let Some(prepared) = self.prepared.take() else {
            self.state = ScrubbingState::Failed;
            return Err(RsError::configuration("state", "pipeline holds no inputs"));
        };
        self.state = ScrubbingState::Running;
        match self.execute(prepared) {
            Ok(report) => {
                self.state = ScrubbingState::Completed;
                Ok(report)
            }
            Err(err) => {
                self.state = ScrubbingState::Failed;
                Err(err)
            }
        }
    }

    fn execute(&self, prepared: Prepared) -> Result<ScrubbingReport> {
        let settings = &self.params.settings;
        let Prepared {
            input,
            mask,
            realignment,
            pool,
            output,
        } = prepared;

        let start = Instant::now();
        let value_range =
            compute_value_range(&input, &mask, settings.equilibration_frames, &pool)?;
        log::info!("value range [{:.2};{:.2}]", value_range.min, value_range.max);

        let fd = framewise_displacement(&realignment, settings.rotation_radius);
        let dvars = compute_dvars(&input, &mask, value_range, &pool);
        log::debug!("frame statistics took {:?}", start.elapsed());

        write_side_output(self.params.dvars_output.as_deref(), |path| {
            save_double_vector(path, &dvars)
        });
        write_side_output(self.params.fd_output.as_deref(), |path| {
            save_double_vector(path, &fd)
        });

        let flags = flag_frames(&fd, &dvars, settings.fd_threshold, settings.dvars_threshold);
        write_side_output(self.params.flagged_output.as_deref(), |path| {
            save_index_vector(path, &flags)
        });
        log::info!(
            "flagged {} of {} frames: {:?}",
            flags.flagged().len(),
            flags.len(),
            flags.flagged()
        );

        if flags.retained().is_empty() {
            return Err(RsError::numerical(
                "every frame was flagged, the scrubbed series would be empty",
            ));
        }

        let start = Instant::now();
        let (scrubbed, frame_map) = assemble_retained(&input, &flags, &pool)?;
        drop(input);
        self.store.write_series(&output, &scrubbed)?;
        log::debug!(
            "wrote {} frames to {} in {:?}",
            scrubbed.frames(),
            output.display(),
            start.elapsed()
        );

        Ok(ScrubbingReport {
            value_range,
            fd,
            dvars,
            flags,
            frame_map,
        })
    }
}

fn write_side_output<F>(path: Option<&Path>, write: F)
where
    F: FnOnce(&Path) -> Result<()>,
{
    if let Some(path) = path {
        if let Err(err) = write(path) {
            log::error!("{err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_container::{GridDims, Point3D, SeriesHeader};
    use crate::io::MemoryStore;
    use approx::assert_abs_diff_eq;
    use ndarray::Array4;

    fn pool() -> WorkerPool {
        WorkerPool::new(2).unwrap()
    }

    fn series_from(values: &[f64]) -> VolumeSeries {
        let dims = GridDims::new(2, 1, 1);
        let data = Array4::from_shape_fn((values.len(), 2, 1, 1), |(t, x, _, _)| {
            values[t] * (x + 1) as f64
        });
        VolumeSeries::new(SeriesHeader::new(dims), data).unwrap()
    }

    fn full_mask() -> Mask {
        Mask::from_points(
            GridDims::new(2, 1, 1),
            vec![Point3D::new(0, 0, 0), Point3D::new(1, 0, 0)],
        )
        .unwrap()
    }

    #[test]
    fn missing_parameters_fail_before_io() {
        let store = MemoryStore::new();
        let mut params = ScrubbingParameters {
            input: Some("in.nii".into()),
            output: Some("out.nii".into()),
            realignment: Some("rp.txt".into()),
            ..Default::default()
        };
        let mut pipeline = MotionScrubbing::new(params.clone(), &store);
        match pipeline.init() {
            Err(RsError::Configuration { field, .. }) => assert_eq!(field, "mask"),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(pipeline.state(), ScrubbingState::Failed);

        // the input does not exist, but validation fails first
        params.mask = Some("mask.nii".into());
        params.output = None;
        let mut pipeline = MotionScrubbing::new(params, &store);
        assert!(matches!(pipeline.init(), Err(RsError::Configuration { .. })));
    }

    #[test]
    fn run_before_init_is_rejected() {
        let store = MemoryStore::new();
        let mut pipeline = MotionScrubbing::new(ScrubbingParameters::default(), &store);
        assert!(matches!(pipeline.run(), Err(RsError::Configuration { .. })));
        assert_eq!(pipeline.state(), ScrubbingState::Initialized);
    }

    #[test]
    fn unreadable_input_fails_init() {
        let store = MemoryStore::new();
        let params = ScrubbingParameters {
            input: Some("missing.nii".into()),
            output: Some("out.nii".into()),
            mask: Some("mask.nii".into()),
            realignment: Some("rp.txt".into()),
            ..Default::default()
        };
        let mut pipeline = MotionScrubbing::new(params, &store);
        let err = pipeline.init().unwrap_err();
        assert!(err.to_string().contains("missing.nii"));
        assert_eq!(pipeline.state(), ScrubbingState::Failed);
    }

    #[test]
    fn value_range_skips_equilibration_and_nan() {
        let series = series_from(&[100.0, 100.0, 100.0, 100.0, 100.0, 2.0, f64::NAN, 3.0]);
        let range = compute_value_range(&series, &full_mask(), 5, &pool()).unwrap();
        assert_eq!(range, ValueRange { min: 2.0, max: 6.0 });
    }

    #[test]
    fn value_range_of_short_series_uses_last_frame() {
        let series = series_from(&[100.0, 1.0, 2.0]);
        let range = compute_value_range(&series, &full_mask(), 5, &pool()).unwrap();
        assert_eq!(range, ValueRange { min: 2.0, max: 4.0 });
    }

    #[test]
    fn value_range_without_valid_values_fails() {
        let series = series_from(&[f64::NAN, f64::NAN]);
        assert!(compute_value_range(&series, &full_mask(), 5, &pool()).is_err());
    }

    #[test]
    fn framewise_displacement_sums_translation_and_arc_length() {
        let rp = RealignmentParameters::new(vec![
            [0.0; 6],
            [0.1, -0.2, 0.0, 0.0, 0.0, 0.0],
            [0.1, -0.2, 0.0, 1.0, 0.0, -1.0],
        ]);
        let fd = framewise_displacement(&rp, 50.0);
        assert_eq!(fd[0], 0.0);
        assert_abs_diff_eq!(fd[1], 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(fd[2], 2.0 * deg_to_mm(50.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn dvars_is_normalized_rms_difference() {
        let series = series_from(&[0.0, 1.0, 1.0, 3.0]);
        let range = ValueRange { min: 0.0, max: 6.0 };
        let dvars = compute_dvars(&series, &full_mask(), range, &pool());
        assert_eq!(dvars.len(), 4);
        assert_eq!(dvars[0], 0.0);
        // voxel differences 1 and 2, normalized by 6
        let expected = ((1.0f64 / 36.0 + 4.0 / 36.0) / 2.0).sqrt();
        assert_abs_diff_eq!(dvars[1], expected, epsilon = 1e-12);
        assert_eq!(dvars[2], 0.0);
        assert_abs_diff_eq!(dvars[3], 2.0 * expected, epsilon = 1e-12);
    }

    #[test]
    fn dvars_with_degenerate_range_does_not_divide_by_zero() {
        let series = series_from(&[1.0, 2.0]);
        let range = ValueRange { min: 4.0, max: 4.0 };
        let dvars = compute_dvars(&series, &full_mask(), range, &pool());
        assert!(dvars.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn flagging_marks_neighbours() {
        let mut fd = vec![0.0; 10];
        fd[5] = 1.0;
        let dvars = vec![0.0; 10];
        let flags = flag_frames(&fd, &dvars, 0.5, 0.5);
        assert_eq!(flags.flagged(), vec![4, 5, 6]);
    }

    #[test]
    fn flagging_clamps_at_series_end_and_ignores_frame_zero() {
        let mut dvars = vec![0.0; 5];
        dvars[0] = 10.0;
        dvars[4] = 1.0;
        let flags = flag_frames(&[0.0; 5], &dvars, 0.5, 0.5);
        assert_eq!(flags.flagged(), vec![3, 4]);

        let mut fd = vec![0.0; 5];
        fd[1] = 1.0;
        let flags = flag_frames(&fd, &[0.0; 5], 0.5, 0.5);
        assert_eq!(flags.flagged(), vec![0, 1, 2]);
    }

    #[test]
    fn assembly_keeps_original_order() {
        let series = series_from(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let mut flags = FrameFlags::new(5);
        flags.flag(1);
        flags.flag(2);
        let (out, map) = assemble_retained(&series, &flags, &pool()).unwrap();
        assert_eq!(map, vec![0, 3, 4]);
        assert_eq!(out.frames(), 3);
        assert_eq!(out.frame(1), series.frame(3));
        assert_eq!(out.frame(2), series.frame(4));
    }
}
