//! Platform-agnostic types for cellular coverage sampling.
//!
//! This crate provides the value types shared by the store, the sampling
//! pipeline, and the service binary.
//!
//! # Features
//!
//! - Location fixes and their sources
//! - Raw signal-strength readings
//! - Per-install device context
//! - Joined samples as persisted in the `Base` table
//! - Great-circle distance between fixes
//!
//! # Example
//!
//! ```
//! use cellmap_types::{DeviceContext, LocationFix, LocationSource, Sample, SignalReading};
//!
//! let fix = LocationFix::new(LocationSource::Gps, 1_700_000_000_500, 52.52, 13.405)
//!     .with_accuracy(8.0);
//! let sample = Sample::join(&fix, SignalReading::gsm(17), 7, Some("E-Plus"), &DeviceContext::default());
//! assert_eq!(sample.time_sec, 1_700_000_000);
//! ```

pub mod error;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use types::{
    DeviceContext, EARTH_RADIUS_M, LocationFix, LocationSource, Sample, SignalReading,
    haversine_distance,
};
