//! FFT band-pass filter for voxel timecourses.
//!
//! A [`FilterSpec`] is built once per series length. It precomputes the bin
//! attenuation curve and the FFT plans, and is then applied to any number of
//! timecourses, possibly from several workers at once. Per-call buffers live in a
//! [`FilterWorkspace`] that each worker owns.

use crate::data_container::{Mask, VolumeSeries};
use crate::error::{Result, RsError};
use frame_loops::WorkerPool;
use rayon::prelude::*;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// FFT engine used by a [`FilterSpec`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FftBackend {
    /// Half-spectrum real transform.
    #[default]
    RealFft,
    /// Full complex transform of the real signal.
    ComplexFft,
}

impl Display for FftBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FftBackend::RealFft => write!(f, "real"),
            FftBackend::ComplexFft => write!(f, "complex"),
        }
    }
}

/// How bins outside the passband are attenuated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Rolloff {
    /// Bins outside the passband are removed.
    Sharp,
    /// Bins outside the passband are scaled by `2 / (1 + exp(4 d / width))`,
    /// where `d` is the distance in Hz to the nearest passband edge.
    Sigmoid { width: f64 },
}

enum Plan {
    Real {
        forward: Arc<dyn RealToComplex<f64>>,
        inverse: Arc<dyn ComplexToReal<f64>>,
    },
    Complex {
        forward: Arc<dyn Fft<f64>>,
        inverse: Arc<dyn Fft<f64>>,
    },
}

impl Plan {
    fn new(backend: FftBackend, len: usize) -> Self {
        match backend {
            FftBackend::RealFft => {
                let mut planner = RealFftPlanner::<f64>::new();
                Plan::Real {
                    forward: planner.plan_fft_forward(len),
                    inverse: planner.plan_fft_inverse(len),
                }
            }
            FftBackend::ComplexFft => {
                let mut planner = FftPlanner::<f64>::new();
                Plan::Complex {
                    forward: planner.plan_fft_forward(len),
                    inverse: planner.plan_fft_inverse(len),
                }
            }
        }
    }
}

/// Immutable band-pass configuration with precomputed attenuation curve and FFT
/// plans.
///
/// Parameters cannot be changed after construction. A different configuration
/// needs a new `FilterSpec`.
pub struct FilterSpec {
    frames: usize,
    padded: usize,
    sampling_rate: f64,
    f1: f64,
    f2: f64,
    rolloff: Rolloff,
    keep_mean: bool,
    backend: FftBackend,
    band: (usize, usize),
    attenuation: Vec<f64>,
    plan: Plan,
}

impl Debug for FilterSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterSpec")
            .field("frames", &self.frames)
            .field("padded", &self.padded)
            .field("sampling_rate", &self.sampling_rate)
            .field("f1", &self.f1)
            .field("f2", &self.f2)
            .field("rolloff", &self.rolloff)
            .field("keep_mean", &self.keep_mean)
            .field("backend", &self.backend)
            .field("band", &self.band)
            .finish()
    }
}

impl FilterSpec {
    /// Creates a band-pass filter for timecourses of `frames` samples.
    ///
    /// # Arguments
    /// - `frames`: Number of samples per timecourse (`T`).
    /// - `padded`: Transform length (`paddedT`). Samples beyond `frames` are zero
    ///   on the forward transform and discarded after the inverse.
    /// - `sampling_rate`: Samples per second.
    /// - `f1`, `f2`: Passband edges in Hz, `0 <= f1 <= f2 <= sampling_rate / 2`.
    /// - `rolloff`: Attenuation outside the passband.
    /// - `keep_mean`: Keep the DC bin regardless of the passband.
    ///
    /// # Errors
    /// Returns a configuration error naming the offending parameter.
    pub fn new(
        frames: usize,
        padded: usize,
        sampling_rate: f64,
        f1: f64,
        f2: f64,
        rolloff: Rolloff,
        keep_mean: bool,
    ) -> Result<Self> {
        if frames == 0 {
            return Err(RsError::configuration("frames", "at least one sample is required"));
        }
        if padded < frames {
            return Err(RsError::configuration(
                "padding",
                format!("padded length {padded} is shorter than the {frames} samples"),
            ));
        }
        if !(sampling_rate > 0.0) || !sampling_rate.is_finite() {
            return Err(RsError::configuration(
                "sampling_rate",
                format!("must be positive, got {sampling_rate}"),
            ));
        }
        let nyquist = sampling_rate / 2.0;
        if !(f1 >= 0.0 && f1 <= f2 && f2 <= nyquist) {
            return Err(RsError::configuration(
                "frequencies",
                format!("expected 0 <= f1 <= f2 <= {nyquist}, got f1={f1} f2={f2}"),
            ));
        }
        if let Rolloff::Sigmoid { width } = rolloff {
            if !(width > 0.0) {
                return Err(RsError::configuration(
                    "rolloff_width",
                    format!("must be positive, got {width}"),
                ));
            }
        }

        let bin_frequency = |k: usize| k as f64 * sampling_rate / padded as f64;
        let last = padded / 2;
        // the bin at or just below f1 is kept, the first bin above f2 is kept
        let lower = (1..=last)
            .find(|&k| bin_frequency(k) > f1)
            .map_or(last, |k| k - 1);
        let upper = (1..=last)
            .find(|&k| bin_frequency(k) > f2)
            .unwrap_or(last);

        let (f_lower, f_upper) = (bin_frequency(lower), bin_frequency(upper));
        let attenuation = (0..=last)
            .map(|k| {
                if k == 0 {
                    return if keep_mean { 1.0 } else { 0.0 };
                }
                if (lower..=upper).contains(&k) {
                    return 1.0;
                }
                match rolloff {
                    Rolloff::Sharp => 0.0,
                    Rolloff::Sigmoid { width } => {
                        let f = bin_frequency(k);
                        let distance = if k < lower { f_lower - f } else { f - f_upper };
                        2.0 / (1.0 + (4.0 * distance / width).exp())
                    }
                }
            })
            .collect();

        Ok(FilterSpec {
            frames,
            padded,
            sampling_rate,
            f1,
            f2,
            rolloff,
            keep_mean,
            backend: FftBackend::RealFft,
            band: (lower, upper),
            attenuation,
            plan: Plan::new(FftBackend::RealFft, padded),
        })
    }

    /// Returns the same filter running on `backend`.
    pub fn with_backend(mut self, backend: FftBackend) -> Self {
        if backend != self.backend {
            self.plan = Plan::new(backend, self.padded);
            self.backend = backend;
        }
        self
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn padded_length(&self) -> usize {
        self.padded
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn backend(&self) -> FftBackend {
        self.backend
    }

    pub fn rolloff(&self) -> Rolloff {
        self.rolloff
    }

    pub fn keep_mean(&self) -> bool {
        self.keep_mean
    }

    /// Requested passband edges in Hz.
    pub fn requested_band(&self) -> (f64, f64) {
        (self.f1, self.f2)
    }

    /// First and last bin index of the passband.
    pub fn band_bins(&self) -> (usize, usize) {
        self.band
    }

    /// Frequencies in Hz of the first and last passband bin.
    pub fn band(&self) -> (f64, f64) {
        (self.bin_frequency(self.band.0), self.bin_frequency(self.band.1))
    }

    pub fn bin_frequency(&self, k: usize) -> f64 {
        k as f64 * self.sampling_rate / self.padded as f64
    }

    /// Attenuation factor of every spectral bin `0 ..= padded / 2`.
    pub fn attenuation(&self) -> &[f64] {
        &self.attenuation
    }

    /// Scratch buffers sized for this filter.
    pub fn workspace(&self) -> FilterWorkspace {
        FilterWorkspace::new(self)
    }

    /// Filters `data` in place with a temporary workspace.
    pub fn apply(&self, data: &mut [f64]) -> Result<()> {
        let mut workspace = self.workspace();
        self.apply_with(data, &mut workspace)
    }

    /// Filters `data` in place, reusing the buffers of `workspace`.
    ///
    /// # Errors
    /// Fails if `data` does not hold exactly `frames` samples or `workspace` was
    /// created for a filter of a different shape.
    pub fn apply_with(&self, data: &mut [f64], workspace: &mut FilterWorkspace) -> Result<()> {
        if data.len() != self.frames {
            return Err(RsError::dimension_mismatch(
                "band-pass input",
                self.frames,
                data.len(),
            ));
        }
        if workspace.padded != self.padded || workspace.backend != self.backend {
            *workspace = self.workspace();
        }
        let n = self.padded;
        let norm = 1.0 / n as f64;

        match &self.plan {
            Plan::Real { forward, inverse } => {
                let ws = &mut workspace.buffers;
                ws.real[..self.frames].copy_from_slice(data);
                ws.real[self.frames..].fill(0.0);
                forward
                    .process_with_scratch(&mut ws.real, &mut ws.spectrum, &mut ws.forward_scratch)
                    .map_err(|err| RsError::numerical(format!("forward FFT failed: {err}")))?;

                for (bin, a) in ws.spectrum.iter_mut().zip(&self.attenuation) {
                    *bin *= *a;
                }
                // DC and (for even lengths) Nyquist are purely real
                ws.spectrum[0].im = 0.0;
                if n % 2 == 0 {
                    ws.spectrum[n / 2].im = 0.0;
                }

                inverse
                    .process_with_scratch(&mut ws.spectrum, &mut ws.real, &mut ws.inverse_scratch)
                    .map_err(|err| RsError::numerical(format!("inverse FFT failed: {err}")))?;
                for (d, v) in data.iter_mut().zip(&ws.real) {
                    *d = v * norm;
                }
            }
            Plan::Complex { forward, inverse } => {
                let ws = &mut workspace.buffers;
                for (i, c) in ws.spectrum.iter_mut().enumerate() {
                    *c = Complex::new(data.get(i).copied().unwrap_or(0.0), 0.0);
                }
                forward.process_with_scratch(&mut ws.spectrum, &mut ws.forward_scratch);
                for (k, bin) in ws.spectrum.iter_mut().enumerate() {
                    *bin *= self.attenuation[k.min(n - k)];
                }
                inverse.process_with_scratch(&mut ws.spectrum, &mut ws.inverse_scratch);
                for (d, c) in data.iter_mut().zip(&ws.spectrum) {
                    *d = c.re * norm;
                }
            }
        }
        Ok(())
    }
}

struct Buffers {
    real: Vec<f64>,
    spectrum: Vec<Complex<f64>>,
    forward_scratch: Vec<Complex<f64>>,
    inverse_scratch: Vec<Complex<f64>>,
}

/// Per-worker buffers for [`FilterSpec::apply_with`]. Never shared between
/// workers.
pub struct FilterWorkspace {
    padded: usize,
    backend: FftBackend,
    buffers: Buffers,
}

impl FilterWorkspace {
    fn new(spec: &FilterSpec) -> Self {
        let buffers = match &spec.plan {
            Plan::Real { forward, inverse } => Buffers {
                real: forward.make_input_vec(),
                spectrum: forward.make_output_vec(),
                forward_scratch: forward.make_scratch_vec(),
                inverse_scratch: inverse.make_scratch_vec(),
            },
            Plan::Complex { forward, inverse } => Buffers {
                real: Vec::new(),
                spectrum: vec![Complex::new(0.0, 0.0); spec.padded],
                forward_scratch: vec![Complex::new(0.0, 0.0); forward.get_inplace_scratch_len()],
                inverse_scratch: vec![Complex::new(0.0, 0.0); inverse.get_inplace_scratch_len()],
            },
        };
        FilterWorkspace {
            padded: spec.padded,
            backend: spec.backend,
            buffers,
        }
    }
}

/// Band-passes the timecourse of every mask voxel.
///
/// Voxels are processed in parallel on `pool`, each worker reusing one
/// workspace. Voxels outside the mask are zero in the result.
///
/// # Errors
/// Fails if the filter was built for a different number of frames.
pub fn filter_series(
    series: &VolumeSeries,
    mask: &Mask,
    spec: &FilterSpec,
    pool: &WorkerPool,
) -> Result<VolumeSeries> {
    if spec.frames() != series.frames() {
        return Err(RsError::dimension_mismatch(
            "band-pass frames",
            spec.frames(),
            series.frames(),
        ));
    }
    let filtered: Vec<Vec<f64>> = pool.install(|| {
        mask.points()
            .par_iter()
            .map_init(
                || spec.workspace(),
                |workspace, p| -> Result<Vec<f64>> {
                    let mut timecourse = series.timecourse(*p).to_vec();
                    spec.apply_with(&mut timecourse, workspace)?;
                    Ok(timecourse)
                },
            )
            .collect::<Result<Vec<_>>>()
    })?;

    let mut output = series.clone_header_for_output(series.frames());
    for (p, timecourse) in mask.points().iter().zip(&filtered) {
        output.set_timecourse(*p, timecourse);
    }
    Ok(output)
}
