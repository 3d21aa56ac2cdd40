//! Duty-cycled background sampler for cellular signal and location.
//!
//! This crate provides:
//! - Sampling preferences with change notification
//! - File configuration for storage, joining and the simulated providers
//! - The duty-cycle scheduler that alternates listening and sleeping phases
//! - Random-walk providers for hosts without a modem or positioning chip
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/cellmap/service.toml`:
//!
//! ```toml
//! [storage]
//! path = "~/.local/share/cellmap/CellMapper.db"
//!
//! [sampling]
//! update_duration = 30         # seconds spent listening per cycle
//! sleep_between_measures = 10  # seconds asleep between cycles
//! min_location_time = 60       # seconds between location updates
//! min_location_dist = 50       # meters between accepted fixes
//! use_gps = true
//! update_on_signal_change = true
//! sampling_policy = "event_driven" # or "burst", "passive"
//!
//! [join]
//! allowed_time_drift_ms = 30000
//! signal_history_len = 100
//! airplane_mode = "drop"
//! ```
//!
//! Sending `SIGHUP` to a running service reloads the file; a changed
//! `[sampling]` table restarts the schedule.

pub mod config;
pub mod preferences;
pub mod scheduler;
pub mod simulator;

pub use config::{
    Config, ConfigError, JoinConfig, SimulatorConfig, StorageConfig, ValidationError,
    default_config_path,
};
pub use preferences::{PreferenceStore, Preferences, SamplingPolicy, ScheduleConfig};
pub use scheduler::{Phase, Scheduler, SchedulerError, SchedulerHandle};
pub use simulator::{SimulatedLocation, SimulatedTelephony};
