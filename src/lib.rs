//! Signal processing for resting-state functional imaging series: band-pass
//! filtering, nuisance regression, timecourse extraction and motion scrubbing.

pub mod config;
pub mod correlation;
pub mod data_container;
pub mod error;
pub mod filters;
pub mod io;
pub mod math_tools;
pub mod scrubbing;
pub mod timecourse;

pub use error::{Result, RsError};
