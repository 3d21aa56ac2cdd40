//! Location source arbitration.
//!
//! Picks the most useful fix among several positioning sources and filters
//! out fixes that are too close to the last one that produced a sample.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use cellmap_types::{LocationFix, LocationSource};

use crate::platform::LocationProvider;

/// Pick the most accurate fix that is not older than `max_age`.
///
/// Fixes with an age above `max_age` relative to `now_ms` are dropped first.
/// Among the rest the lowest accuracy value wins; on a tie the earlier
/// candidate is kept.
pub fn select_best<I>(candidates: I, max_age: Duration, now_ms: i64) -> Option<LocationFix>
where
    I: IntoIterator<Item = LocationFix>,
{
    let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
    let mut best: Option<LocationFix> = None;

    for fix in candidates {
        let age = fix.age_ms(now_ms);
        if age > max_age_ms {
            debug!("Dropping stale {} fix ({} ms old)", fix.source, age);
            continue;
        }
        match &best {
            Some(current) if current.accuracy <= fix.accuracy => {}
            _ => best = Some(fix),
        }
    }

    best
}

/// Whether `candidate` is at least `min_distance` meters from `last`.
///
/// Always true when there is no previous fix or the filter is disabled
/// (`min_distance <= 0`).
pub fn is_far_enough(candidate: &LocationFix, last: Option<&LocationFix>, min_distance: f64) -> bool {
    if min_distance <= 0.0 {
        return true;
    }
    match last {
        Some(last) => candidate.distance_to(last) >= min_distance,
        None => true,
    }
}

/// Chooses between sources and remembers the last accepted fix.
#[derive(Debug, Default)]
pub struct LocationArbiter {
    last_accepted: Mutex<Option<LocationFix>>,
}

impl LocationArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query every source for its last fix and pick the best fresh one.
    ///
    /// A source whose query fails is logged and skipped.
    pub async fn best_available<P>(
        &self,
        provider: &P,
        sources: &[LocationSource],
        max_age: Duration,
        now_ms: i64,
    ) -> Option<LocationFix>
    where
        P: LocationProvider + ?Sized,
    {
        let mut candidates = Vec::with_capacity(sources.len());
        for &source in sources {
            match provider.last_known_fix(source).await {
                Ok(Some(fix)) => candidates.push(fix),
                Ok(None) => debug!("No last known {} fix", source),
                Err(e) => warn!("Treating {} as absent: {}", source, e),
            }
        }
        select_best(candidates, max_age, now_ms)
    }

    /// Whether `candidate` is far enough from the last accepted fix.
    ///
    /// Leaves the reference point alone; see [`mark_accepted`](Self::mark_accepted).
    pub fn is_far_from_last(&self, candidate: &LocationFix, min_distance: f64) -> bool {
        let last = self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let far = is_far_enough(candidate, last.as_ref(), min_distance);
        if !far {
            debug!(
                "Rejecting fix within {:.0} m of the last accepted one",
                min_distance
            );
        }
        far
    }

    /// Make `fix` the reference point for later distance checks.
    pub fn mark_accepted(&self, fix: LocationFix) {
        *self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(fix);
    }

    /// Accept `candidate` if it is far enough from the last accepted fix.
    ///
    /// On acceptance the candidate becomes the new reference point.
    pub fn accept_if_far_enough(&self, candidate: &LocationFix, min_distance: f64) -> bool {
        if !self.is_far_from_last(candidate, min_distance) {
            return false;
        }
        self.mark_accepted(candidate.clone());
        true
    }

    pub fn last_accepted(&self) -> Option<LocationFix> {
        self.last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the reference point so the next fix is always accepted.
    pub fn reset(&self) {
        *self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLocationProvider;
    use proptest::prelude::*;

    const NOW: i64 = 1_700_000_000_000;

    fn fix(source: LocationSource, age_ms: i64, accuracy: f32) -> LocationFix {
        LocationFix::new(source, NOW - age_ms, 52.52, 13.405).with_accuracy(accuracy)
    }

    // Roughly 1 m of latitude
    const METER_DEG: f64 = 1.0 / 111_195.0;

    fn north_of(base: &LocationFix, meters: f64) -> LocationFix {
        LocationFix::new(
            base.source,
            base.time_ms,
            base.latitude + meters * METER_DEG,
            base.longitude,
        )
    }

    #[test]
    fn test_select_best_prefers_lower_accuracy() {
        let gps = fix(LocationSource::Gps, 1_000, 5.0);
        let network = fix(LocationSource::Network, 1_000, 40.0);

        let best = select_best([network, gps.clone()], Duration::from_secs(30), NOW);
        assert_eq!(best, Some(gps));
    }

    #[test]
    fn test_select_best_drops_stale() {
        let stale_gps = fix(LocationSource::Gps, 60_000, 5.0);
        let network = fix(LocationSource::Network, 1_000, 40.0);

        let best = select_best([stale_gps, network.clone()], Duration::from_secs(30), NOW);
        assert_eq!(best, Some(network));
    }

    #[test]
    fn test_select_best_nothing_fresh() {
        let stale = fix(LocationSource::Gps, 31_000, 5.0);
        assert_eq!(select_best([stale], Duration::from_secs(30), NOW), None);
        assert_eq!(select_best(Vec::new(), Duration::from_secs(30), NOW), None);
    }

    #[test]
    fn test_select_best_tie_keeps_first() {
        let gps = fix(LocationSource::Gps, 0, 10.0);
        let network = fix(LocationSource::Network, 0, 10.0);
        let best = select_best([gps, network], Duration::from_secs(30), NOW).unwrap();
        assert_eq!(best.source, LocationSource::Gps);
    }

    #[test]
    fn test_distance_filter() {
        let arbiter = LocationArbiter::new();
        let first = fix(LocationSource::Gps, 0, 5.0);

        assert!(arbiter.accept_if_far_enough(&first, 50.0));
        assert!(!arbiter.accept_if_far_enough(&north_of(&first, 10.0), 50.0));
        assert!(arbiter.accept_if_far_enough(&north_of(&first, 60.0), 50.0));
    }

    #[test]
    fn test_rejected_fix_does_not_move_reference() {
        let arbiter = LocationArbiter::new();
        let first = fix(LocationSource::Gps, 0, 5.0);
        arbiter.accept_if_far_enough(&first, 50.0);

        // Creeping 30 m at a time never escapes the original reference
        assert!(!arbiter.accept_if_far_enough(&north_of(&first, 30.0), 50.0));
        assert!(!arbiter.accept_if_far_enough(&north_of(&first, 45.0), 50.0));
        assert_eq!(arbiter.last_accepted(), Some(first));
    }

    #[test]
    fn test_distance_filter_disabled() {
        let arbiter = LocationArbiter::new();
        let first = fix(LocationSource::Gps, 0, 5.0);
        arbiter.accept_if_far_enough(&first, 0.0);

        assert!(arbiter.accept_if_far_enough(&first, 0.0));
        assert!(arbiter.accept_if_far_enough(&first, -5.0));
    }

    #[test]
    fn test_check_does_not_move_reference() {
        let arbiter = LocationArbiter::new();
        let first = fix(LocationSource::Gps, 0, 5.0);

        // Checking alone never sets a reference
        assert!(arbiter.is_far_from_last(&first, 50.0));
        assert!(arbiter.is_far_from_last(&first, 50.0));
        assert_eq!(arbiter.last_accepted(), None);

        arbiter.mark_accepted(first.clone());
        assert!(!arbiter.is_far_from_last(&north_of(&first, 10.0), 50.0));
        assert!(arbiter.is_far_from_last(&north_of(&first, 60.0), 50.0));
    }

    #[test]
    fn test_reset_accepts_next() {
        let arbiter = LocationArbiter::new();
        let first = fix(LocationSource::Gps, 0, 5.0);
        arbiter.accept_if_far_enough(&first, 50.0);
        arbiter.reset();
        assert!(arbiter.accept_if_far_enough(&first, 50.0));
    }

    #[tokio::test]
    async fn test_best_available_skips_failing_source() {
        let provider = MockLocationProvider::new();
        provider.set_last_known(fix(LocationSource::Gps, 1_000, 5.0));
        provider.set_last_known(fix(LocationSource::Network, 1_000, 30.0));
        provider.fail_source(LocationSource::Gps, true);

        let arbiter = LocationArbiter::new();
        let best = arbiter
            .best_available(
                &provider,
                &[LocationSource::Gps, LocationSource::Network],
                Duration::from_secs(30),
                NOW,
            )
            .await
            .unwrap();

        assert_eq!(best.source, LocationSource::Network);
    }

    #[tokio::test]
    async fn test_best_available_all_absent() {
        let provider = MockLocationProvider::new();
        let arbiter = LocationArbiter::new();
        let best = arbiter
            .best_available(&provider, &LocationSource::ALL, Duration::from_secs(30), NOW)
            .await;
        assert!(best.is_none());
    }

    proptest! {
        #[test]
        fn test_first_fix_always_accepted(lat in -80.0f64..80.0, lon in -179.0f64..179.0, min in 0.0f64..10_000.0) {
            let arbiter = LocationArbiter::new();
            let candidate = LocationFix::new(LocationSource::Network, NOW, lat, lon);
            prop_assert!(arbiter.accept_if_far_enough(&candidate, min));
        }
    }
}
