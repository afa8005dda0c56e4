//! Persisted default settings.
//!
//! Settings are stored through the `preferences` crate between runs. Command-line
//! flags override the stored values, and `--save-defaults` writes the effective
//! values back.

use crate::error::{Result, RsError};
use crate::filters::band_pass::{FftBackend, FilterSpec, Rolloff};
use preferences::{AppInfo, Preferences};
use serde::{Deserialize, Serialize};

pub const APP_INFO: AppInfo = AppInfo {
    name: "restingstate-tools",
    author: "Linus Leo Stöckli",
};

pub const SCRUBBING_PREFS_KEY: &str = "config/scrubbing";
pub const BANDPASS_PREFS_KEY: &str = "config/bandpass";

/// Thresholds and constants of the motion scrubbing pipeline.
///
/// # Fields
/// - `fd_threshold`: Framewise displacement above which a frame is flagged (mm).
/// - `dvars_threshold`: DVARS above which a frame is flagged.
/// - `rotation_radius`: Head radius used to turn rotations into arc lengths (mm).
/// - `equilibration_frames`: Frames skipped at the start of the value range scan.
/// - `threads`: Number of workers. Must be at least 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrubbingSettings {
    pub fd_threshold: f64,
    pub dvars_threshold: f64,
    pub rotation_radius: f64,
    pub equilibration_frames: usize,
    pub threads: usize,
}

impl Default for ScrubbingSettings {
    fn default() -> Self {
        ScrubbingSettings {
            fd_threshold: 0.5,
            dvars_threshold: 0.5,
            rotation_radius: 50.0,
            equilibration_frames: 5,
            threads: 1,
        }
    }
}

impl ScrubbingSettings {
    /// Checks values that cannot be expressed by the type alone.
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(RsError::configuration(
                "threads",
                "at least one thread is required",
            ));
        }
        if !(self.rotation_radius > 0.0) {
            return Err(RsError::configuration(
                "rotation_radius",
                format!("must be positive, got {}", self.rotation_radius),
            ));
        }
        if self.fd_threshold.is_nan() || self.dvars_threshold.is_nan() {
            return Err(RsError::configuration("threshold", "thresholds must be numbers"));
        }
        Ok(())
    }
}

/// Band-pass filter defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandpassSettings {
    pub sampling_rate: f64,
    pub f1: f64,
    pub f2: f64,
    pub sigmoid_rolloff: bool,
    pub rolloff_width: f64,
    pub keep_mean: bool,
    /// Padded transform length. `None` uses the series length.
    pub padded_length: Option<usize>,
    pub backend: FftBackend,
    pub threads: usize,
}

impl Default for BandpassSettings {
    fn default() -> Self {
        BandpassSettings {
            sampling_rate: 0.5,
            f1: 0.01,
            f2: 0.08,
            sigmoid_rolloff: false,
            rolloff_width: 0.01,
            keep_mean: false,
            padded_length: None,
            backend: FftBackend::RealFft,
            threads: 1,
        }
    }
}

impl BandpassSettings {
    pub fn rolloff(&self) -> Rolloff {
        if self.sigmoid_rolloff {
            Rolloff::Sigmoid {
                width: self.rolloff_width,
            }
        } else {
            Rolloff::Sharp
        }
    }

    /// Builds a validated filter for series with `frames` frames.
    pub fn filter_spec(&self, frames: usize) -> Result<FilterSpec> {
        FilterSpec::new(
            frames,
            self.padded_length.unwrap_or(frames),
            self.sampling_rate,
            self.f1,
            self.f2,
            self.rolloff(),
            self.keep_mean,
        )
        .map(|spec| spec.with_backend(self.backend))
    }
}

/// Loads settings stored under `key`, falling back to the defaults if nothing
/// has been stored yet or the stored values cannot be read.
pub fn load_or_default<T>(key: &str) -> T
where
    T: Preferences + Default,
{
    match T::load(&APP_INFO, key) {
        Ok(settings) => settings,
        Err(err) => {
            log::debug!("no stored settings under {key}, using defaults: {err}");
            T::default()
        }
    }
}

/// Stores `settings` under `key`.
pub fn store<T: Preferences>(settings: &T, key: &str) -> Result<()> {
    settings
        .save(&APP_INFO, key)
        .map_err(|err| RsError::io(key, format!("could not save settings: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubbing_defaults() {
        let s = ScrubbingSettings::default();
        assert_eq!(s.fd_threshold, 0.5);
        assert_eq!(s.rotation_radius, 50.0);
        assert_eq!(s.equilibration_frames, 5);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn zero_threads_is_a_configuration_error() {
        let s = ScrubbingSettings {
            threads: 0,
            ..Default::default()
        };
        assert!(matches!(
            s.validate(),
            Err(RsError::Configuration { ref field, .. }) if field == "threads"
        ));
    }

    #[test]
    fn bandpass_settings_build_filter() {
        let s = BandpassSettings {
            sampling_rate: 1.0,
            f1: 0.1,
            f2: 0.3,
            ..Default::default()
        };
        let spec = s.filter_spec(20).unwrap();
        assert_eq!(spec.frames(), 20);
        assert_eq!(spec.padded_length(), 20);
        assert_eq!(s.rolloff(), Rolloff::Sharp);
    }
}
