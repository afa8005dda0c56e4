//! Command-line front end of `rstools`.

use clap::{Args, Parser, Subcommand, ValueEnum};
use frame_loops::WorkerPool;
use restingstate_tools::config::{
    load_or_default, store, BandpassSettings, ScrubbingSettings, BANDPASS_PREFS_KEY,
    SCRUBBING_PREFS_KEY,
};
use restingstate_tools::data_container::{GridDims, Mask, Point3D, Volume, VolumeSeries};
use restingstate_tools::filters::band_pass::{filter_series, FftBackend};
use restingstate_tools::filters::regression::{filter_regressors, regress_series};
use restingstate_tools::io::{
    load_mask, load_regressor_matrix, save_double_vector, write_volume, NiftiStore, SeriesStore,
};
use restingstate_tools::scrubbing::{MotionScrubbing, ScrubbingParameters};
use restingstate_tools::timecourse::{point_timecourse, region_timecourse, Aggregation, PcaOptions};
use restingstate_tools::{Result, RsError};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "rstools",
    version,
    about = "Resting-state fMRI preprocessing: band-pass, regression, timecourses and motion scrubbing"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Flag frames with excessive motion and write the remaining frames
    Scrub(ScrubArgs),
    /// Band-pass every voxel timecourse
    Bandpass(BandpassArgs),
    /// Regress nuisance signals out of every voxel timecourse
    Regress(RegressArgs),
    /// Extract the timecourse of a voxel or a mask region
    Timecourse(TimecourseArgs),
}

#[derive(Args)]
pub struct ScrubArgs {
    /// Input 4D series
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Output series holding the retained frames
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Binary mask, resampled to the input grid
    #[arg(long)]
    pub mask: Option<PathBuf>,

    /// Realignment parameters, one row per frame
    #[arg(long)]
    pub realignment: Option<PathBuf>,

    /// Write the DVARS of every frame to this file
    #[arg(long)]
    pub dvars: Option<PathBuf>,

    /// Write the framewise displacement of every frame to this file
    #[arg(long)]
    pub fd: Option<PathBuf>,

    /// Write the indices of flagged frames to this file
    #[arg(long)]
    pub flagged: Option<PathBuf>,

    /// Write the resampled mask to this file
    #[arg(long)]
    pub savemask: Option<PathBuf>,

    /// Framewise displacement threshold in mm
    #[arg(long)]
    pub fd_threshold: Option<f64>,

    /// DVARS threshold
    #[arg(long)]
    pub dvars_threshold: Option<f64>,

    /// Head radius used to convert rotations to mm
    #[arg(long)]
    pub radius: Option<f64>,

    /// Number of worker threads
    #[arg(long)]
    pub threads: Option<usize>,

    /// Store the effective settings as new defaults
    #[arg(long, default_value_t = false)]
    pub save_defaults: bool,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum BackendArg {
    /// Half-spectrum real transform
    Real,
    /// Full complex transform
    Complex,
}

impl From<BackendArg> for FftBackend {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Real => FftBackend::RealFft,
            BackendArg::Complex => FftBackend::ComplexFft,
        }
    }
}

#[derive(Args)]
pub struct BandpassArgs {
    /// Input 4D series
    #[arg(long)]
    pub input: PathBuf,

    /// Output series
    #[arg(long)]
    pub output: PathBuf,

    /// Only filter voxels inside this mask, all others are zero
    #[arg(long)]
    pub mask: Option<PathBuf>,

    /// Write the resampled mask to this file
    #[arg(long)]
    pub savemask: Option<PathBuf>,

    /// Lower edge of the pass band in Hz
    #[arg(long)]
    pub f1: Option<f64>,

    /// Upper edge of the pass band in Hz
    #[arg(long)]
    pub f2: Option<f64>,

    /// Sampling rate in Hz
    #[arg(long, conflicts_with = "tr")]
    pub sampling_rate: Option<f64>,

    /// Repetition time in seconds, the sampling rate is 1/TR
    #[arg(long)]
    pub tr: Option<f64>,

    /// Attenuate with a sigmoid instead of a hard cutoff
    #[arg(long)]
    pub sigmoid_rolloff: Option<bool>,

    /// Width of the sigmoid rolloff in Hz
    #[arg(long)]
    pub rolloff_width: Option<f64>,

    /// Keep the mean of every timecourse
    #[arg(long)]
    pub keep_mean: Option<bool>,

    /// Zero-padded transform length
    #[arg(long)]
    pub padding: Option<usize>,

    /// FFT engine
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Number of worker threads
    #[arg(long)]
    pub threads: Option<usize>,

    /// Store the effective settings as new defaults
    #[arg(long, default_value_t = false)]
    pub save_defaults: bool,
}

#[derive(Args)]
pub struct RegressArgs {
    /// Input 4D series
    #[arg(long)]
    pub input: PathBuf,

    /// Output series holding the residuals
    #[arg(long)]
    pub output: PathBuf,

    /// Regressor table, one row per frame and one column per regressor
    #[arg(long)]
    pub regressors: PathBuf,

    /// Only regress voxels inside this mask, all others are zero
    #[arg(long)]
    pub mask: Option<PathBuf>,

    /// Multiply every regressor value by this factor
    #[arg(long, default_value_t = 1.0)]
    pub scale: f64,

    /// Standardize signal and regressors before fitting
    #[arg(long, default_value_t = false)]
    pub zscore: bool,

    /// Band-pass the regressors to F1 F2 (Hz) before fitting
    #[arg(long, num_args = 2, value_names = ["F1", "F2"])]
    pub filter_band: Option<Vec<f64>>,

    /// Sampling rate in Hz, used with --filter-band
    #[arg(long, conflicts_with = "tr")]
    pub sampling_rate: Option<f64>,

    /// Repetition time in seconds, used with --filter-band
    #[arg(long)]
    pub tr: Option<f64>,

    /// Number of worker threads
    #[arg(long, default_value_t = 1)]
    pub threads: usize,
}

#[derive(Args)]
pub struct TimecourseArgs {
    /// Input 4D series
    #[arg(long)]
    pub input: PathBuf,

    /// Region mask
    #[arg(long, conflicts_with = "point", required_unless_present = "point")]
    pub mask: Option<PathBuf>,

    /// Voxel coordinates
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"])]
    pub point: Option<Vec<usize>>,

    /// Region aggregation: mean, stddev, spca or tpca
    #[arg(long, default_value = "mean")]
    pub algorithm: String,

    /// Standardize voxel timecourses before a PCA
    #[arg(long, default_value_t = false)]
    pub standard_scores: bool,

    /// Write the spatial PCA weights as a volume to this file
    #[arg(long)]
    pub spatial_map: Option<PathBuf>,

    /// Write the PCA eigenvalue to this file
    #[arg(long)]
    pub eigenvalues: Option<PathBuf>,

    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

fn sampling_rate(sampling_rate: Option<f64>, tr: Option<f64>) -> Result<Option<f64>> {
    match (sampling_rate, tr) {
        (Some(rate), _) => Ok(Some(rate)),
        (None, Some(tr)) if tr > 0.0 => Ok(Some(1.0 / tr)),
        (None, Some(tr)) => Err(RsError::configuration(
            "tr",
            format!("repetition time must be positive, got {tr}"),
        )),
        (None, None) => Ok(None),
    }
}

fn full_mask(dims: GridDims) -> Result<Mask> {
    let points = (0..dims.x)
        .flat_map(|x| (0..dims.y).flat_map(move |y| (0..dims.z).map(move |z| Point3D::new(x, y, z))))
        .collect();
    Mask::from_points(dims, points)
}

fn mask_or_full(
    store: &dyn SeriesStore,
    mask: Option<&Path>,
    reference: &VolumeSeries,
    save_to: Option<&Path>,
) -> Result<Mask> {
    match mask {
        Some(path) => load_mask(store, path, reference, save_to),
        None => full_mask(reference.dims()),
    }
}

pub fn scrub(args: ScrubArgs) -> Result<()> {
    let mut settings: ScrubbingSettings = load_or_default(SCRUBBING_PREFS_KEY);
    if let Some(v) = args.fd_threshold {
        settings.fd_threshold = v;
    }
    if let Some(v) = args.dvars_threshold {
        settings.dvars_threshold = v;
    }
    if let Some(v) = args.radius {
        settings.rotation_radius = v;
    }
    if let Some(v) = args.threads {
        settings.threads = v;
    }
    if args.save_defaults {
        settings.validate()?;
        store(&settings, SCRUBBING_PREFS_KEY)?;
    }

    let params = ScrubbingParameters {
        input: args.input,
        output: args.output,
        mask: args.mask,
        realignment: args.realignment,
        dvars_output: args.dvars,
        fd_output: args.fd,
        flagged_output: args.flagged,
        saved_mask: args.savemask,
        settings,
    };
    let store = NiftiStore;
    let mut pipeline = MotionScrubbing::new(params, &store);
    pipeline.init()?;
    let report = pipeline.run()?;
    log::info!(
        "kept {} of {} frames",
        report.frame_map.len(),
        report.flags.len()
    );
    Ok(())
}

pub fn bandpass(args: BandpassArgs) -> Result<()> {
    let mut settings: BandpassSettings = load_or_default(BANDPASS_PREFS_KEY);
    if let Some(rate) = sampling_rate(args.sampling_rate, args.tr)? {
        settings.sampling_rate = rate;
    }
    if let Some(v) = args.f1 {
        settings.f1 = v;
    }
    if let Some(v) = args.f2 {
        settings.f2 = v;
    }
    if let Some(v) = args.sigmoid_rolloff {
        settings.sigmoid_rolloff = v;
    }
    if let Some(v) = args.rolloff_width {
        settings.rolloff_width = v;
    }
    if let Some(v) = args.keep_mean {
        settings.keep_mean = v;
    }
    if let Some(v) = args.padding {
        settings.padded_length = Some(v);
    }
    if let Some(v) = args.backend {
        settings.backend = v.into();
    }
    if let Some(v) = args.threads {
        settings.threads = v;
    }
    let pool = WorkerPool::new(settings.threads)?;
    if args.save_defaults {
        store(&settings, BANDPASS_PREFS_KEY)?;
    }

    let store = NiftiStore;
    let input = store.open_series(&args.input)?;
    let spec = settings.filter_spec(input.frames())?;
    let (lo, hi) = spec.band();
    log::info!(
        "band-pass {:.4} Hz to {:.4} Hz (bins {:?}) at {} Hz, {:?}",
        lo,
        hi,
        spec.band_bins(),
        spec.sampling_rate(),
        spec.rolloff()
    );
    let mask = mask_or_full(&store, args.mask.as_deref(), &input, args.savemask.as_deref())?;
    let output = filter_series(&input, &mask, &spec, &pool)?;
    store.write_series(&args.output, &output)
}

pub fn regress(args: RegressArgs) -> Result<()> {
    let pool = WorkerPool::new(args.threads)?;
    let store = NiftiStore;
    let input = store.open_series(&args.input)?;
    let mut regressors = load_regressor_matrix(&args.regressors, args.scale)?;
    log::info!(
        "{} regressors with {} values each",
        regressors.n_regressors(),
        regressors.n_frames()
    );

    if let Some(band) = args.filter_band.as_deref() {
        let rate = sampling_rate(args.sampling_rate, args.tr)?.ok_or_else(|| {
            RsError::configuration("sampling_rate", "--filter-band needs --sampling-rate or --tr")
        })?;
        let (f1, f2) = match band {
            [f1, f2] => (*f1, *f2),
            _ => return Err(RsError::configuration("filter_band", "expected two frequencies")),
        };
        log::info!("band-passing regressors to [{f1}, {f2}] Hz");
        regressors = filter_regressors(&regressors, rate, f1, f2)?;
    }

    let mask = mask_or_full(&store, args.mask.as_deref(), &input, None)?;
    let output = regress_series(&input, &mask, &regressors, args.zscore, &pool)?;
    store.write_series(&args.output, &output)
}

pub fn timecourse(args: TimecourseArgs) -> Result<()> {
    let store = NiftiStore;
    let input = store.open_series(&args.input)?;

    let values = match (args.point.as_deref(), args.mask.as_deref()) {
        (Some(&[x, y, z]), _) => point_timecourse(&input, Point3D::new(x, y, z))?,
        (Some(_), _) => {
            return Err(RsError::configuration("point", "expected three coordinates"));
        }
        (None, Some(mask_path)) => {
            let aggregation: Aggregation = args.algorithm.parse()?;
            let mask = load_mask(&store, mask_path, &input, None)?;
            let options = PcaOptions {
                use_standard_scores: args.standard_scores,
                ..Default::default()
            };
            let region = region_timecourse(&input, &mask, aggregation, &options)?;
            if let Some(eigenvalue) = region.eigenvalue {
                log::info!("{aggregation} eigenvalue: {eigenvalue}");
            }
            if let Some(path) = args.eigenvalues.as_deref() {
                match region.eigenvalue {
                    Some(eigenvalue) => save_double_vector(path, &[eigenvalue])?,
                    None => log::warn!("{aggregation} has no eigenvalue, {} not written", path.display()),
                }
            }
            if let (Some(path), Some(map)) = (args.spatial_map.as_deref(), &region.spatial_map) {
                let mut volume = Volume::zeros(input.dims());
                for (p, weight) in mask.points().iter().zip(map) {
                    volume.set_value(*p, *weight);
                }
                write_volume(&store, path, &input, volume)?;
            }
            region.values
        }
        (None, None) => {
            return Err(RsError::configuration("mask", "either a mask or a point is required"));
        }
    };

    match args.output.as_deref() {
        Some(path) => save_double_vector(path, &values),
        None => {
            for value in values {
                println!("{value:.10}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use restingstate_tools::data_container::SeriesHeader;
    use std::fs;

    fn region_files(dir: &Path) -> (PathBuf, PathBuf) {
        let dims = GridDims::new(2, 1, 1);
        let data = Array4::from_shape_fn((12, 2, 1, 1), |(t, x, _, _)| {
            let s = (t as f64 * 0.7).sin();
            if x == 0 {
                2.0 * s
            } else {
                -s
            }
        });
        let series = VolumeSeries::new(SeriesHeader::new(dims), data).unwrap();
        let mut inside = Volume::zeros(dims);
        inside.set_value(Point3D::new(0, 0, 0), 1.0);
        inside.set_value(Point3D::new(1, 0, 0), 1.0);
        let mask = VolumeSeries::from_frames(SeriesHeader::new(dims), vec![inside]).unwrap();

        let input = dir.join("input.nii");
        let mask_path = dir.join("mask.nii");
        NiftiStore.write_series(&input, &series).unwrap();
        NiftiStore.write_series(&mask_path, &mask).unwrap();
        (input, mask_path)
    }

    fn timecourse_args(dir: &Path, algorithm: &str) -> TimecourseArgs {
        let (input, mask) = region_files(dir);
        TimecourseArgs {
            input,
            mask: Some(mask),
            point: None,
            algorithm: algorithm.to_string(),
            standard_scores: false,
            spatial_map: None,
            eigenvalues: Some(dir.join("eigenvalues.txt")),
            output: Some(dir.join("timecourse.txt")),
        }
    }

    #[test]
    fn timecourse_writes_pca_eigenvalue() {
        let dir = tempfile::tempdir().unwrap();
        timecourse(timecourse_args(dir.path(), "spca")).unwrap();

        let written = fs::read_to_string(dir.path().join("eigenvalues.txt")).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].parse::<f64>().unwrap() > 0.0);
        assert_eq!(
            fs::read_to_string(dir.path().join("timecourse.txt")).unwrap().lines().count(),
            12
        );
    }

    #[test]
    fn timecourse_without_eigenvalue_skips_file() {
        let dir = tempfile::tempdir().unwrap();
        timecourse(timecourse_args(dir.path(), "mean")).unwrap();
        assert!(!dir.path().join("eigenvalues.txt").exists());
        assert!(dir.path().join("timecourse.txt").exists());
    }

    #[test]
    fn eigenvalues_flag_parses() {
        let cli = Cli::try_parse_from([
            "rstools",
            "timecourse",
            "--input",
            "in.nii",
            "--mask",
            "roi.nii",
            "--algorithm",
            "tpca",
            "--eigenvalues",
            "ev.txt",
        ])
        .unwrap();
        match cli.command {
            Command::Timecourse(args) => {
                assert_eq!(args.eigenvalues, Some(PathBuf::from("ev.txt")));
            }
            _ => panic!("expected the timecourse subcommand"),
        }
    }
}
