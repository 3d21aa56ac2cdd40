//! Sampling preferences and the schedule derived from them.
//!
//! Preferences are a flat key/value map, as written by a settings screen or
//! the `[sampling]` table of the config file. Values may be native TOML
//! values or strings; anything that does not parse falls back to the
//! documented default with a warning, so a bad value never stops sampling.
//!
//! A [`PreferenceStore`] publishes every change over a `watch` channel. The
//! scheduler treats each change as a full stop, reload and restart.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use cellmap_types::LocationSource;

/// Preference keys.
pub mod keys {
    /// Length of a listening phase, in seconds.
    pub const UPDATE_DURATION: &str = "update_duration";
    /// Length of a sleep phase, in seconds.
    pub const SLEEP_BETWEEN_MEASURES: &str = "sleep_between_measures";
    /// Minimum time between location updates, in seconds.
    pub const MIN_LOCATION_TIME: &str = "min_location_time";
    /// Minimum distance between accepted locations, in meters.
    pub const MIN_LOCATION_DISTANCE: &str = "min_location_dist";
    pub const USE_GPS: &str = "use_gps";
    pub const UPDATE_ON_SIGNAL_CHANGE: &str = "update_on_signal_change";
    pub const SAMPLING_POLICY: &str = "sampling_policy";
}

pub const DEFAULT_UPDATE_DURATION_SECS: u64 = 30;
pub const DEFAULT_SLEEP_BETWEEN_MEASURES_SECS: u64 = 10;
pub const DEFAULT_MIN_LOCATION_TIME_SECS: u64 = 60;
pub const DEFAULT_MIN_LOCATION_DISTANCE: u64 = 50;

/// Floor for the location update interval.
pub const MIN_LOCATION_TIME: Duration = Duration::from_millis(250);

/// Default age above which a last-known fix is ignored by burst polling.
pub const DEFAULT_MAX_LOCATION_AGE: Duration = Duration::from_secs(30);

/// A flat preference map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Preferences(BTreeMap<String, toml::Value>);

impl Preferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Builder form of [`set`](Self::set).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&toml::Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<toml::Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read a non-negative integer, accepting numeric strings.
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        let parsed = match self.0.get(key) {
            None => return default,
            Some(toml::Value::Integer(i)) => u64::try_from(*i).ok(),
            Some(toml::Value::String(s)) => s.trim().parse::<u64>().ok(),
            Some(_) => None,
        };
        parsed.unwrap_or_else(|| {
            warn!(
                "Preference {} = {} is not a non-negative integer, using {}",
                key,
                self.display(key),
                default
            );
            default
        })
    }

    /// Read a finite number, accepting integers, floats and numeric strings.
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        let parsed = match self.0.get(key) {
            None => return default,
            Some(toml::Value::Integer(i)) => Some(*i as f64),
            Some(toml::Value::Float(f)) => Some(*f),
            Some(toml::Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(_) => None,
        };
        parsed.filter(|v| v.is_finite()).unwrap_or_else(|| {
            warn!(
                "Preference {} = {} is not a number, using {}",
                key,
                self.display(key),
                default
            );
            default
        })
    }

    /// Read a boolean, accepting `"true"`/`"false"` strings.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        let parsed = match self.0.get(key) {
            None => return default,
            Some(toml::Value::Boolean(b)) => Some(*b),
            Some(toml::Value::String(s)) => s.trim().to_ascii_lowercase().parse::<bool>().ok(),
            Some(_) => None,
        };
        parsed.unwrap_or_else(|| {
            warn!(
                "Preference {} = {} is not a boolean, using {}",
                key,
                self.display(key),
                default
            );
            default
        })
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(toml::Value::as_str)
    }

    fn display(&self, key: &str) -> String {
        self.0.get(key).map(ToString::to_string).unwrap_or_default()
    }
}

/// How the listening phase collects fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingPolicy {
    /// Subscribe to provider pushes for the whole phase.
    #[default]
    EventDriven,
    /// Ask for single fixes at a fixed interval and keep the best last-known one.
    Burst,
    /// Listen to fixes other clients requested, with no duty cycle.
    Passive,
}

impl SamplingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingPolicy::EventDriven => "event_driven",
            SamplingPolicy::Burst => "burst",
            SamplingPolicy::Passive => "passive",
        }
    }
}

impl fmt::Display for SamplingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SamplingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "event_driven" | "event" => Ok(SamplingPolicy::EventDriven),
            "burst" | "poll" => Ok(SamplingPolicy::Burst),
            "passive" => Ok(SamplingPolicy::Passive),
            other => Err(format!("unknown sampling policy '{other}'")),
        }
    }
}

/// Timing and subscription parameters for one run of the duty cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub update_duration: Duration,
    pub sleep_between_measures: Duration,
    /// Never below [`MIN_LOCATION_TIME`].
    pub min_location_time: Duration,
    /// Meters; 0 disables the distance filter. Never negative.
    pub min_location_distance: f64,
    pub use_gps: bool,
    pub update_on_signal_change: bool,
    pub policy: SamplingPolicy,
    pub max_location_age: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::from_preferences(&Preferences::default())
    }
}

impl ScheduleConfig {
    /// Derive a schedule, falling back to defaults for missing or bad values.
    pub fn from_preferences(prefs: &Preferences) -> Self {
        let secs = |key, default| Duration::from_secs(prefs.get_u64(key, default));

        let policy = match prefs.get(keys::SAMPLING_POLICY) {
            None => SamplingPolicy::default(),
            Some(value) => value
                .as_str()
                .ok_or_else(|| format!("expected a string, got {value}"))
                .and_then(str::parse)
                .unwrap_or_else(|e| {
                    warn!("Preference {}: {}, using default", keys::SAMPLING_POLICY, e);
                    SamplingPolicy::default()
                }),
        };

        let config = Self {
            update_duration: secs(keys::UPDATE_DURATION, DEFAULT_UPDATE_DURATION_SECS),
            sleep_between_measures: secs(
                keys::SLEEP_BETWEEN_MEASURES,
                DEFAULT_SLEEP_BETWEEN_MEASURES_SECS,
            ),
            min_location_time: secs(keys::MIN_LOCATION_TIME, DEFAULT_MIN_LOCATION_TIME_SECS)
                .max(MIN_LOCATION_TIME),
            min_location_distance: prefs
                .get_f64(
                    keys::MIN_LOCATION_DISTANCE,
                    DEFAULT_MIN_LOCATION_DISTANCE as f64,
                )
                .max(0.0),
            use_gps: prefs.get_bool(keys::USE_GPS, true),
            update_on_signal_change: prefs.get_bool(keys::UPDATE_ON_SIGNAL_CHANGE, true),
            policy,
            max_location_age: DEFAULT_MAX_LOCATION_AGE,
        };
        debug!("Loaded schedule {:?}", config);
        config
    }

    #[must_use]
    pub fn with_max_location_age(mut self, max_age: Duration) -> Self {
        self.max_location_age = max_age;
        self
    }

    /// Sources subscribed during a listening phase.
    pub fn sources(&self) -> Vec<LocationSource> {
        if self.use_gps {
            vec![LocationSource::Gps, LocationSource::Network]
        } else {
            vec![LocationSource::Network]
        }
    }

    /// Sources whose last-known fix burst polling compares.
    ///
    /// Passive is only read, never asked: it reports fixes other clients
    /// requested.
    pub fn poll_sources(&self) -> Vec<LocationSource> {
        let mut sources = self.sources();
        sources.push(LocationSource::Passive);
        sources
    }

    /// Source asked for a one-shot fix when the signal changes.
    pub fn trigger_source(&self) -> LocationSource {
        if self.use_gps {
            LocationSource::Gps
        } else {
            LocationSource::Network
        }
    }
}

/// Holds the current preferences and notifies subscribers on change.
#[derive(Debug)]
pub struct PreferenceStore {
    tx: watch::Sender<Preferences>,
}

impl Default for PreferenceStore {
    fn default() -> Self {
        Self::new(Preferences::default())
    }
}

impl PreferenceStore {
    pub fn new(prefs: Preferences) -> Self {
        let (tx, _) = watch::channel(prefs);
        Self { tx }
    }

    /// Snapshot of the current preferences.
    pub fn current(&self) -> Preferences {
        self.tx.borrow().clone()
    }

    /// Replace all preferences. Subscribers are only notified when something
    /// actually changed; returns whether it did.
    pub fn replace(&self, prefs: Preferences) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == prefs {
                return false;
            }
            *current = prefs;
            true
        })
    }

    /// Set a single preference.
    pub fn set(&self, key: impl Into<String>, value: impl Into<toml::Value>) -> bool {
        let key = key.into();
        let value = value.into();
        self.tx.send_if_modified(|current| {
            if current.get(&key) == Some(&value) {
                return false;
            }
            current.set(key, value);
            true
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Preferences> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_defaults() {
        let config = ScheduleConfig::default();
        assert_eq!(config.update_duration, Duration::from_secs(30));
        assert_eq!(config.sleep_between_measures, Duration::from_secs(10));
        assert_eq!(config.min_location_time, Duration::from_secs(60));
        assert_eq!(config.min_location_distance, 50.0);
        assert!(config.use_gps);
        assert!(config.update_on_signal_change);
        assert_eq!(config.policy, SamplingPolicy::EventDriven);
    }

    #[test]
    fn test_native_and_string_values() {
        let prefs = Preferences::new()
            .with(keys::UPDATE_DURATION, 45)
            .with(keys::SLEEP_BETWEEN_MEASURES, "120")
            .with(keys::USE_GPS, "false")
            .with(keys::UPDATE_ON_SIGNAL_CHANGE, false)
            .with(keys::SAMPLING_POLICY, "burst");

        let config = ScheduleConfig::from_preferences(&prefs);
        assert_eq!(config.update_duration, Duration::from_secs(45));
        assert_eq!(config.sleep_between_measures, Duration::from_secs(120));
        assert!(!config.use_gps);
        assert!(!config.update_on_signal_change);
        assert_eq!(config.policy, SamplingPolicy::Burst);
        assert_eq!(config.sources(), vec![LocationSource::Network]);
        assert_eq!(config.trigger_source(), LocationSource::Network);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let prefs = Preferences::new()
            .with(keys::UPDATE_DURATION, "half a minute")
            .with(keys::MIN_LOCATION_DISTANCE, "fifty")
            .with(keys::USE_GPS, "maybe")
            .with(keys::SAMPLING_POLICY, "sometimes");

        let config = ScheduleConfig::from_preferences(&prefs);
        assert_eq!(config.update_duration, Duration::from_secs(30));
        assert_eq!(config.min_location_distance, 50.0);
        assert!(config.use_gps);
        assert_eq!(config.policy, SamplingPolicy::EventDriven);
    }

    #[test]
    fn test_negative_distance_disables_filter() {
        for value in [toml::Value::from(-5_i64), toml::Value::from("-12.5")] {
            let prefs = Preferences::new().with(keys::MIN_LOCATION_DISTANCE, value);
            let config = ScheduleConfig::from_preferences(&prefs);
            assert_eq!(config.min_location_distance, 0.0);
        }

        let prefs = Preferences::new().with(keys::MIN_LOCATION_DISTANCE, 12.5_f64);
        assert_eq!(
            ScheduleConfig::from_preferences(&prefs).min_location_distance,
            12.5
        );
    }

    #[test]
    fn test_min_location_time_floor() {
        let prefs = Preferences::new().with(keys::MIN_LOCATION_TIME, 0);
        let config = ScheduleConfig::from_preferences(&prefs);
        assert_eq!(config.min_location_time, MIN_LOCATION_TIME);
    }

    #[test]
    fn test_sources_with_gps() {
        let config = ScheduleConfig::default();
        assert_eq!(
            config.sources(),
            vec![LocationSource::Gps, LocationSource::Network]
        );
        assert_eq!(config.trigger_source(), LocationSource::Gps);
        assert_eq!(
            config.poll_sources(),
            vec![
                LocationSource::Gps,
                LocationSource::Network,
                LocationSource::Passive
            ]
        );
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("Event-Driven".parse(), Ok(SamplingPolicy::EventDriven));
        assert_eq!("BURST".parse(), Ok(SamplingPolicy::Burst));
        assert_eq!("passive".parse(), Ok(SamplingPolicy::Passive));
        assert_eq!(SamplingPolicy::Passive.to_string(), "passive");
        assert!("other".parse::<SamplingPolicy>().is_err());
    }

    #[test]
    fn test_preferences_toml_roundtrip_shape() {
        let prefs: Preferences = toml::from_str(
            r#"
            update_duration = 20
            use_gps = "true"
            "#,
        )
        .unwrap();
        assert_eq!(prefs.get_u64(keys::UPDATE_DURATION, 0), 20);
        assert!(prefs.get_bool(keys::USE_GPS, false));
        assert_eq!(prefs.get_str(keys::USE_GPS), Some("true"));
    }

    #[tokio::test]
    async fn test_store_notifies_only_on_change() {
        let store = PreferenceStore::new(Preferences::new().with(keys::UPDATE_DURATION, 30));
        let mut rx = store.subscribe();

        assert!(!store.set(keys::UPDATE_DURATION, 30));
        assert!(!rx.has_changed().unwrap());

        assert!(store.set(keys::UPDATE_DURATION, 5));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().get_u64(keys::UPDATE_DURATION, 0), 5);

        assert!(store.replace(Preferences::new()));
        rx.changed().await.unwrap();
        assert!(store.current().is_empty());
    }
}
