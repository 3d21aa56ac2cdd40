//! Signal/location join pipeline for cellular coverage sampling.
//!
//! This crate sits between the platform collaborators (positioning sources
//! and the cellular radio) and the [`cellmap_store::Store`]. It turns two
//! independently arriving event streams into single joined samples.
//!
//! # Features
//!
//! - **Provider traits**: [`LocationProvider`] and [`Telephony`] abstract the host
//! - **Signal history**: bounded newest-first buffer of raw readings
//! - **Location arbitration**: pick the freshest, most accurate fix and
//!   filter fixes too close to the last accepted one
//! - **Sample joining**: pair each fix with the preceding signal reading,
//!   applying airplane-mode and clock-drift guards
//! - **Mocks**: programmable collaborators for tests
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use cellmap_core::mock::{MockLocationProvider, MockTelephony};
//! use cellmap_core::{JoinOptions, SampleJoiner, shared_store};
//! use cellmap_store::Store;
//! use cellmap_types::{DeviceContext, LocationFix, LocationSource, SignalReading};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let joiner = SampleJoiner::new(
//!         shared_store(Store::open_in_memory()?),
//!         Arc::new(MockLocationProvider::new()),
//!         Arc::new(MockTelephony::new()),
//!         DeviceContext::host(),
//!         JoinOptions::default(),
//!     );
//!
//!     let now = cellmap_core::util::now_millis();
//!     joiner.on_signal_at(SignalReading::gsm(17), now - 500);
//!     let fix = LocationFix::new(LocationSource::Gps, now, 52.52, 13.405);
//!     assert!(joiner.on_location(&fix).await.is_stored());
//!     Ok(())
//! }
//! ```

pub mod arbiter;
pub mod error;
pub mod joiner;
pub mod mock;
pub mod platform;
pub mod signal_history;
pub mod util;

pub use arbiter::{LocationArbiter, is_far_enough, select_best};
pub use error::{Error, Result};
pub use joiner::{
    AirplanePolicy, DEFAULT_ALLOWED_DRIFT, JoinOptions, JoinOutcome, JoinStats, JoinStatsSnapshot,
    RejectReason, SampleJoiner,
};
pub use platform::{LocationProvider, SharedStore, Telephony, UpdateRequest, shared_store};
pub use signal_history::{DEFAULT_HISTORY_LEN, SignalEntry, SignalHistory};

// Re-export types crate for convenience
pub use cellmap_types;
