//! Core types for location and signal sampling.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Mean earth radius in meters used for great-circle distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A positioning source that can deliver location fixes.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new sources
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum LocationSource {
    /// Satellite positioning.
    Gps,
    /// Cell tower and Wi-Fi based positioning.
    Network,
    /// Fixes requested by other consumers, delivered without own requests.
    Passive,
}

impl LocationSource {
    /// All known sources, in preference order for lookups.
    pub const ALL: [LocationSource; 3] = [
        LocationSource::Gps,
        LocationSource::Network,
        LocationSource::Passive,
    ];

    /// Lowercase name as used in configuration and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationSource::Gps => "gps",
            LocationSource::Network => "network",
            LocationSource::Passive => "passive",
        }
    }
}

impl fmt::Display for LocationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocationSource {
    type Err = ParseError;

    /// Parse a source name (case-insensitive).
    ///
    /// ```
    /// use cellmap_types::LocationSource;
    ///
    /// assert_eq!("GPS".parse::<LocationSource>(), Ok(LocationSource::Gps));
    /// assert!("wifi".parse::<LocationSource>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gps" => Ok(LocationSource::Gps),
            "network" => Ok(LocationSource::Network),
            "passive" => Ok(LocationSource::Passive),
            other => Err(ParseError::UnknownSource(other.to_string())),
        }
    }
}

/// A single location determination from a positioning source.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocationFix {
    /// Source that produced the fix.
    pub source: LocationSource,
    /// Fix time as unix milliseconds.
    pub time_ms: i64,
    /// Estimated horizontal accuracy in meters (smaller is better).
    pub accuracy: f32,
    /// Altitude in meters.
    pub altitude: f64,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Ground speed in meters per second.
    pub speed: f32,
}

impl LocationFix {
    /// Create a fix at a position with zeroed accuracy, altitude, and speed.
    pub fn new(source: LocationSource, time_ms: i64, latitude: f64, longitude: f64) -> Self {
        Self {
            source,
            time_ms,
            accuracy: 0.0,
            altitude: 0.0,
            latitude,
            longitude,
            speed: 0.0,
        }
    }

    /// Set the accuracy in meters.
    #[must_use]
    pub fn with_accuracy(mut self, accuracy: f32) -> Self {
        self.accuracy = accuracy;
        self
    }

    /// Set the altitude in meters.
    #[must_use]
    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = altitude;
        self
    }

    /// Set the speed in meters per second.
    #[must_use]
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    /// Age of the fix relative to `now_ms`, in milliseconds.
    ///
    /// Negative when the fix claims to be from the future.
    #[must_use]
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.time_ms
    }

    /// Great-circle distance to another fix in meters.
    #[must_use]
    pub fn distance_to(&self, other: &LocationFix) -> f64 {
        haversine_distance(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// Great-circle distance between two coordinates in meters.
///
/// ```
/// use cellmap_types::haversine_distance;
///
/// let d = haversine_distance(0.0, 0.0, 0.0, 1.0);
/// assert!((d - 111_195.0).abs() < 200.0);
/// ```
#[must_use]
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// A raw signal-strength reading from the cellular radio.
///
/// Only the GSM-style value survives into persisted samples; the legacy
/// CDMA/EVDO columns were dropped from the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SignalReading {
    /// GSM signal strength in ASU (0-31, 99 = unknown).
    pub gsm_signal_strength: i32,
}

impl SignalReading {
    /// ASU value reported when the strength is not known.
    pub const UNKNOWN_ASU: i32 = 99;

    /// Create a reading from a GSM ASU value.
    pub fn gsm(asu: i32) -> Self {
        Self {
            gsm_signal_strength: asu,
        }
    }

    /// Whether the radio reported an actual value.
    #[must_use]
    pub fn is_known(&self) -> bool {
        (0..=31).contains(&self.gsm_signal_strength)
    }

    /// Approximate dBm for a known GSM ASU value (`2 * asu - 113`).
    #[must_use]
    pub fn dbm(&self) -> Option<i32> {
        self.is_known().then(|| 2 * self.gsm_signal_strength - 113)
    }
}

/// Static per-install device description written with every sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DeviceContext {
    /// Platform release string (e.g. `2.3.7`).
    pub android_release: Option<String>,
    /// Device manufacturer.
    pub manufacturer: Option<String>,
    /// Device model.
    pub model: Option<String>,
    /// Device code name.
    pub device: Option<String>,
    /// Kernel or OS version string.
    pub os_version: Option<String>,
}

impl DeviceContext {
    /// Context describing the host this process runs on.
    pub fn host() -> Self {
        Self {
            android_release: None,
            manufacturer: None,
            model: Some(std::env::consts::ARCH.to_string()),
            device: Some(std::env::consts::OS.to_string()),
            os_version: Some(std::env::consts::FAMILY.to_string()),
        }
    }

    /// Fill unset fields from `fallback`.
    #[must_use]
    pub fn or(self, fallback: DeviceContext) -> Self {
        Self {
            android_release: self.android_release.or(fallback.android_release),
            manufacturer: self.manufacturer.or(fallback.manufacturer),
            model: self.model.or(fallback.model),
            device: self.device.or(fallback.device),
            os_version: self.os_version.or(fallback.os_version),
        }
    }
}

/// One joined measurement row: a location fix plus the signal reading that
/// preceded it.
///
/// Field names serialize in the column spelling of the `Base` table so that
/// exports line up with the database.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Sample {
    /// Unix seconds; unique key of the row.
    #[cfg_attr(feature = "serde", serde(rename = "time"))]
    pub time_sec: i64,
    /// Horizontal accuracy in meters.
    pub accuracy: f32,
    /// Altitude in meters.
    pub altitude: f64,
    /// Satellites used in the fix.
    pub satellites: u32,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Speed in meters per second.
    pub speed: f32,
    /// GSM signal strength (ASU).
    pub signal_strength: i32,
    /// Network operator name; empty when unknown.
    pub carrier: String,
    /// Platform release string.
    pub android_release: Option<String>,
    /// Device manufacturer.
    pub manufacturer: Option<String>,
    /// Device model.
    pub model: Option<String>,
    /// Device code name.
    pub device: Option<String>,
    /// Kernel or OS version string.
    pub os_version: Option<String>,
}

impl Sample {
    /// Join a fix with a signal reading and the context captured at join time.
    pub fn join(
        fix: &LocationFix,
        signal: SignalReading,
        satellites: u32,
        carrier: Option<&str>,
        context: &DeviceContext,
    ) -> Self {
        Self {
            time_sec: fix.time_ms.div_euclid(1000),
            accuracy: fix.accuracy,
            altitude: fix.altitude,
            satellites,
            latitude: fix.latitude,
            longitude: fix.longitude,
            speed: fix.speed,
            signal_strength: signal.gsm_signal_strength,
            carrier: carrier.unwrap_or_default().to_string(),
            android_release: context.android_release.clone(),
            manufacturer: context.manufacturer.clone(),
            model: context.model.clone(),
            device: context.device.clone(),
            os_version: context.os_version.clone(),
        }
    }

    /// Sample time as a UTC datetime, if representable.
    #[must_use]
    pub fn timestamp(&self) -> Option<time::OffsetDateTime> {
        time::OffsetDateTime::from_unix_timestamp(self.time_sec).ok()
    }
}
