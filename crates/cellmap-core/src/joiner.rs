//! Join location fixes with the preceding signal reading.
//!
//! Signal readings only ever go into the [`SignalHistory`]; a location fix
//! is what triggers a write. Each accepted fix is paired with the freshest
//! reading captured before it, the current satellite count, the operator
//! name, and the static [`DeviceContext`], then upserted into the store.
//!
//! A fix is rejected without a write when:
//!
//! 1. airplane mode is on and the policy is [`AirplanePolicy::Drop`]
//! 2. its timestamp is further from now than the allowed drift
//! 3. no reading had been captured before it
//!
//! Persistence failures are logged and counted; the store is left unchanged
//! and the pipeline keeps running.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use cellmap_store::ConflictPolicy;
use cellmap_types::{DeviceContext, LocationFix, Sample, SignalReading};

use crate::platform::{LocationProvider, SharedStore, Telephony};
use crate::signal_history::{DEFAULT_HISTORY_LEN, SignalHistory};
use crate::util::now_millis;

/// Default maximum distance between a fix timestamp and the clock.
pub const DEFAULT_ALLOWED_DRIFT: Duration = Duration::from_secs(30);

/// What to do with fixes that arrive while airplane mode is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AirplanePolicy {
    /// Reject them.
    #[default]
    Drop,
    /// Store them, but never overwrite a row already stored for that second.
    KeepFirst,
}

/// Joiner settings.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOptions {
    /// Largest accepted `|fix time - now|`.
    pub allowed_drift: Duration,
    /// Number of signal readings kept for lookups.
    pub history_len: usize,
    pub airplane: AirplanePolicy,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            allowed_drift: DEFAULT_ALLOWED_DRIFT,
            history_len: DEFAULT_HISTORY_LEN,
            airplane: AirplanePolicy::Drop,
        }
    }
}

/// Why a fix produced no sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AirplaneMode,
    ClockDrift,
    NoSignal,
    Persistence,
}

/// Result of offering a fix to the joiner.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// A row was written.
    Stored(Sample),
    /// The sample was valid but an existing row for that second was kept.
    Kept(Sample),
    Rejected(RejectReason),
}

impl JoinOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, JoinOutcome::Stored(_))
    }
}

/// Running counters for the joiner.
#[derive(Debug, Default)]
pub struct JoinStats {
    signals: AtomicU64,
    stored: AtomicU64,
    kept: AtomicU64,
    airplane: AtomicU64,
    drift: AtomicU64,
    no_signal: AtomicU64,
    persistence: AtomicU64,
}

/// Point-in-time copy of [`JoinStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinStatsSnapshot {
    pub signals: u64,
    pub stored: u64,
    pub kept: u64,
    pub rejected_airplane: u64,
    pub rejected_drift: u64,
    pub rejected_no_signal: u64,
    pub persistence_failures: u64,
}

impl JoinStats {
    fn reject(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::AirplaneMode => &self.airplane,
            RejectReason::ClockDrift => &self.drift,
            RejectReason::NoSignal => &self.no_signal,
            RejectReason::Persistence => &self.persistence,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> JoinStatsSnapshot {
        JoinStatsSnapshot {
            signals: self.signals.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            kept: self.kept.load(Ordering::Relaxed),
            rejected_airplane: self.airplane.load(Ordering::Relaxed),
            rejected_drift: self.drift.load(Ordering::Relaxed),
            rejected_no_signal: self.no_signal.load(Ordering::Relaxed),
            persistence_failures: self.persistence.load(Ordering::Relaxed),
        }
    }
}

/// Combines location fixes and signal readings into stored samples.
pub struct SampleJoiner {
    history: SignalHistory,
    store: SharedStore,
    location: Arc<dyn LocationProvider>,
    telephony: Arc<dyn Telephony>,
    context: DeviceContext,
    options: JoinOptions,
    stats: JoinStats,
}

impl std::fmt::Debug for SampleJoiner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleJoiner")
            .field("history_len", &self.history.len())
            .field("options", &self.options)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl SampleJoiner {
    pub fn new(
        store: SharedStore,
        location: Arc<dyn LocationProvider>,
        telephony: Arc<dyn Telephony>,
        context: DeviceContext,
        options: JoinOptions,
    ) -> Self {
        Self {
            history: SignalHistory::new(options.history_len),
            store,
            location,
            telephony,
            context,
            options,
            stats: JoinStats::default(),
        }
    }

    pub fn history(&self) -> &SignalHistory {
        &self.history
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn options(&self) -> &JoinOptions {
        &self.options
    }

    pub fn stats(&self) -> JoinStatsSnapshot {
        self.stats.snapshot()
    }

    /// Record a signal reading captured now.
    pub fn on_signal(&self, reading: SignalReading) {
        self.on_signal_at(reading, now_millis());
    }

    /// Record a signal reading captured at `captured_at_ms`.
    pub fn on_signal_at(&self, reading: SignalReading, captured_at_ms: i64) {
        self.stats.signals.fetch_add(1, Ordering::Relaxed);
        self.history.record(reading, captured_at_ms);
    }

    /// Offer a fix, judging drift against the current clock.
    pub async fn on_location(&self, fix: &LocationFix) -> JoinOutcome {
        self.on_location_at(fix, now_millis()).await
    }

    /// Offer a fix, judging drift against `now_ms`.
    pub async fn on_location_at(&self, fix: &LocationFix, now_ms: i64) -> JoinOutcome {
        let airplane = self.telephony.is_airplane_mode_on();
        if airplane && self.options.airplane == AirplanePolicy::Drop {
            return self.reject(RejectReason::AirplaneMode, fix);
        }

        let drift_ms = i64::try_from(self.options.allowed_drift.as_millis()).unwrap_or(i64::MAX);
        if fix.time_ms.abs_diff(now_ms) > drift_ms.unsigned_abs() {
            return self.reject(RejectReason::ClockDrift, fix);
        }

        let Some(signal) = self.history.find_most_recent_before(fix.time_ms) else {
            return self.reject(RejectReason::NoSignal, fix);
        };

        let carrier = self.telephony.network_operator_name();
        let sample = Sample::join(
            fix,
            signal,
            self.location.satellites_in_fix(),
            carrier.as_deref(),
            &self.context,
        );

        let policy = if airplane {
            ConflictPolicy::Ignore
        } else {
            ConflictPolicy::Replace
        };

        let written = {
            let mut store = self.store.lock().await;
            store.upsert_with(&sample, policy)
        };

        match written {
            Ok(0) => {
                debug!("Kept existing row for second {}", sample.time_sec);
                self.stats.kept.fetch_add(1, Ordering::Relaxed);
                JoinOutcome::Kept(sample)
            }
            Ok(_) => {
                self.stats.stored.fetch_add(1, Ordering::Relaxed);
                JoinOutcome::Stored(sample)
            }
            Err(e) => {
                error!("Failed to store sample at {}: {}", sample.time_sec, e);
                self.stats.reject(RejectReason::Persistence);
                JoinOutcome::Rejected(RejectReason::Persistence)
            }
        }
    }

    fn reject(&self, reason: RejectReason, fix: &LocationFix) -> JoinOutcome {
        debug!("Rejecting {} fix at {}: {:?}", fix.source, fix.time_ms, reason);
        self.stats.reject(reason);
        JoinOutcome::Rejected(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLocationProvider, MockTelephony};
    use crate::platform::shared_store;
    use cellmap_store::Store;
    use cellmap_types::LocationSource;

    const NOW: i64 = 1_700_000_000_000;

    struct Fixture {
        joiner: SampleJoiner,
        location: Arc<MockLocationProvider>,
        telephony: Arc<MockTelephony>,
    }

    fn fixture(options: JoinOptions) -> Fixture {
        let location = Arc::new(MockLocationProvider::new());
        let telephony = Arc::new(MockTelephony::new());
        telephony.set_carrier(Some("E-Plus"));
        location.set_satellites(6);

        let context = DeviceContext {
            model: Some("bravo".to_string()),
            ..Default::default()
        };
        let joiner = SampleJoiner::new(
            shared_store(Store::open_in_memory().unwrap()),
            location.clone(),
            telephony.clone(),
            context,
            options,
        );
        Fixture {
            joiner,
            location,
            telephony,
        }
    }

    fn fix_at(time_ms: i64) -> LocationFix {
        LocationFix::new(LocationSource::Gps, time_ms, 52.52, 13.405).with_accuracy(6.0)
    }

    async fn row_count(joiner: &SampleJoiner) -> u64 {
        joiner.store().lock().await.row_count().unwrap()
    }

    #[tokio::test]
    async fn test_join_stores_sample() {
        let f = fixture(JoinOptions::default());
        f.joiner.on_signal_at(SignalReading::gsm(17), NOW - 2_000);

        let outcome = f.joiner.on_location_at(&fix_at(NOW - 1_000), NOW).await;

        let JoinOutcome::Stored(sample) = outcome else {
            panic!("expected a stored sample, got {outcome:?}");
        };
        assert_eq!(sample.time_sec, (NOW - 1_000) / 1000);
        assert_eq!(sample.signal_strength, 17);
        assert_eq!(sample.satellites, 6);
        assert_eq!(sample.carrier, "E-Plus");
        assert_eq!(sample.model.as_deref(), Some("bravo"));

        let stored = f.joiner.store().lock().await.latest_sample().unwrap();
        assert_eq!(stored, Some(sample));
        assert_eq!(f.location.request_count(LocationSource::Gps), 0);
    }

    #[tokio::test]
    async fn test_drift_rejection() {
        let f = fixture(JoinOptions::default());
        f.joiner.on_signal_at(SignalReading::gsm(10), NOW - 200_000_000);

        // 11 s behind the clock is within 30 s
        let within = f.joiner.on_location_at(&fix_at(NOW - 11_000), NOW).await;
        assert!(within.is_stored());

        let behind = f.joiner.on_location_at(&fix_at(1_699_900_000_000), NOW).await;
        assert_eq!(behind, JoinOutcome::Rejected(RejectReason::ClockDrift));

        let ahead = f.joiner.on_location_at(&fix_at(NOW + 31_000), NOW).await;
        assert_eq!(ahead, JoinOutcome::Rejected(RejectReason::ClockDrift));

        assert_eq!(row_count(&f.joiner).await, 1);
        assert_eq!(f.joiner.stats().rejected_drift, 2);
    }

    #[tokio::test]
    async fn test_drift_bound_is_inclusive() {
        let f = fixture(JoinOptions::default());
        f.joiner.on_signal_at(SignalReading::gsm(10), NOW - 60_000);

        let edge = f.joiner.on_location_at(&fix_at(NOW - 30_000), NOW).await;
        assert!(edge.is_stored());
    }

    #[tokio::test]
    async fn test_no_signal_yet() {
        let f = fixture(JoinOptions::default());

        let outcome = f.joiner.on_location_at(&fix_at(NOW), NOW).await;

        assert_eq!(outcome, JoinOutcome::Rejected(RejectReason::NoSignal));
        assert_eq!(row_count(&f.joiner).await, 0);
    }

    #[tokio::test]
    async fn test_signal_after_fix_does_not_join() {
        let f = fixture(JoinOptions::default());
        f.joiner.on_signal_at(SignalReading::gsm(10), NOW);

        let outcome = f.joiner.on_location_at(&fix_at(NOW - 500), NOW).await;
        assert_eq!(outcome, JoinOutcome::Rejected(RejectReason::NoSignal));
    }

    #[tokio::test]
    async fn test_same_second_replaces() {
        let f = fixture(JoinOptions::default());
        f.joiner.on_signal_at(SignalReading::gsm(10), NOW - 5_000);
        f.joiner.on_location_at(&fix_at(NOW - 1_900), NOW).await;

        f.joiner.on_signal_at(SignalReading::gsm(20), NOW - 1_500);
        f.joiner.on_location_at(&fix_at(NOW - 1_100), NOW).await;

        let store = f.joiner.store().clone();
        let mut store = store.lock().await;
        assert_eq!(store.row_count().unwrap(), 1);
        assert_eq!(store.latest_sample().unwrap().unwrap().signal_strength, 20);
    }

    #[tokio::test]
    async fn test_airplane_mode_drop() {
        let f = fixture(JoinOptions::default());
        f.telephony.set_airplane_mode(true);
        f.joiner.on_signal_at(SignalReading::gsm(10), NOW - 5_000);

        let outcome = f.joiner.on_location_at(&fix_at(NOW), NOW).await;

        assert_eq!(outcome, JoinOutcome::Rejected(RejectReason::AirplaneMode));
        assert_eq!(row_count(&f.joiner).await, 0);
        assert_eq!(f.joiner.stats().rejected_airplane, 1);
    }

    #[tokio::test]
    async fn test_airplane_mode_keep_first() {
        let f = fixture(JoinOptions {
            airplane: AirplanePolicy::KeepFirst,
            ..Default::default()
        });
        f.joiner.on_signal_at(SignalReading::gsm(10), NOW - 5_000);
        assert!(f.joiner.on_location_at(&fix_at(NOW - 1_900), NOW).await.is_stored());

        f.telephony.set_airplane_mode(true);
        f.joiner.on_signal_at(SignalReading::gsm(99), NOW - 1_500);
        let outcome = f.joiner.on_location_at(&fix_at(NOW - 1_100), NOW).await;

        assert!(matches!(outcome, JoinOutcome::Kept(_)));
        let latest = f.joiner.store().lock().await.latest_sample().unwrap().unwrap();
        assert_eq!(latest.signal_strength, 10);
        assert_eq!(f.joiner.stats().kept, 1);
    }

    #[tokio::test]
    async fn test_missing_carrier_is_empty() {
        let f = fixture(JoinOptions::default());
        f.telephony.set_carrier(None);
        f.joiner.on_signal_at(SignalReading::gsm(10), NOW - 5_000);

        let JoinOutcome::Stored(sample) = f.joiner.on_location_at(&fix_at(NOW), NOW).await else {
            panic!("expected a stored sample");
        };
        assert_eq!(sample.carrier, "");
    }

    #[tokio::test]
    async fn test_persistence_failure_is_not_fatal() {
        let f = fixture(JoinOptions::default());

        // Point the store at a path that cannot be created
        let broken = shared_store(Store::new("/dev/null/cellmap/CellMapper.db"));
        let joiner = SampleJoiner::new(
            broken,
            f.location.clone(),
            f.telephony.clone(),
            DeviceContext::default(),
            JoinOptions::default(),
        );
        joiner.on_signal_at(SignalReading::gsm(10), NOW - 5_000);

        let outcome = joiner.on_location_at(&fix_at(NOW), NOW).await;
        assert_eq!(outcome, JoinOutcome::Rejected(RejectReason::Persistence));
        assert_eq!(joiner.stats().persistence_failures, 1);

        // The next fix is still processed
        let outcome = joiner.on_location_at(&fix_at(NOW + 1_000), NOW).await;
        assert_eq!(outcome, JoinOutcome::Rejected(RejectReason::Persistence));
    }

    #[tokio::test]
    async fn test_history_bound_from_options() {
        let f = fixture(JoinOptions {
            history_len: 3,
            ..Default::default()
        });
        for t in 0..10 {
            f.joiner.on_signal_at(SignalReading::gsm(t), NOW + t as i64);
        }
        assert_eq!(f.joiner.history().len(), 3);
        assert_eq!(f.joiner.stats().signals, 10);
    }
}
