//! Temporal filters applied to voxel timecourses.
//!
//! # Filter Implementations
//!
//! Both filters work on single timecourses and provide a series-level helper
//! that processes every masked voxel of a series on a worker pool.

/// FFT band-pass filter with a hard cutoff or a sigmoid rolloff.
/// Supports zero padding and a choice of FFT engine.
pub mod band_pass;

/// Least squares removal of nuisance regressors.
/// Optionally band-passes the regressors first so only in-band nuisance is removed.
pub mod regression;
