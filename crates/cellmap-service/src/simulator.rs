//! Simulated location and telephony providers.
//!
//! A desktop has neither a positioning chip nor a modem, so the service
//! binary runs the pipeline against a random walk: the position drifts a few
//! meters per fix, accuracy depends on the source, and the GSM strength
//! wanders across the ASU range with the occasional unknown reading.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use cellmap_core::util::now_millis;
use cellmap_core::{LocationProvider, Result, Telephony, UpdateRequest};
use cellmap_types::{LocationFix, LocationSource, SignalReading};

/// Meters per degree of latitude.
const METERS_PER_DEGREE: f64 = 111_195.0;

/// Largest step of the random walk between two fixes, in meters.
const MAX_STEP_M: f64 = 40.0;

/// Fixes never arrive faster than this, whatever the request says.
const MIN_FIX_PERIOD: Duration = Duration::from_secs(1);

struct WalkState {
    latitude: f64,
    longitude: f64,
    last_fix: HashMap<LocationSource, LocationFix>,
}

/// Position shared by all update tasks.
struct Walk {
    state: Mutex<WalkState>,
    satellites: AtomicU32,
}

impl Walk {
    /// Advance the walk and produce a fix from `source`.
    fn next_fix(&self, source: LocationSource) -> LocationFix {
        let mut rng = rand::rng();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let north = rng.random_range(-MAX_STEP_M..=MAX_STEP_M);
        let east = rng.random_range(-MAX_STEP_M..=MAX_STEP_M);
        state.latitude = (state.latitude + north / METERS_PER_DEGREE).clamp(-89.0, 89.0);
        let lon_scale = METERS_PER_DEGREE * state.latitude.to_radians().cos();
        state.longitude += east / lon_scale;
        if state.longitude > 180.0 {
            state.longitude -= 360.0;
        } else if state.longitude < -180.0 {
            state.longitude += 360.0;
        }

        let (accuracy, altitude) = match source {
            LocationSource::Gps => {
                self.satellites
                    .store(rng.random_range(4..=12), Ordering::Relaxed);
                (rng.random_range(3.0..15.0), rng.random_range(30.0..60.0))
            }
            _ => (rng.random_range(20.0..80.0), 0.0),
        };

        let fix = LocationFix::new(source, now_millis(), state.latitude, state.longitude)
            .with_accuracy(accuracy)
            .with_altitude(altitude)
            .with_speed(rng.random_range(0.0..3.0));
        state.last_fix.insert(source, fix.clone());
        trace!(
            "Simulated {} fix {:.6},{:.6}",
            source, fix.latitude, fix.longitude
        );
        fix
    }
}

/// Random-walk location provider.
pub struct SimulatedLocation {
    walk: Arc<Walk>,
    subscriptions: Mutex<CancellationToken>,
}

impl std::fmt::Debug for SimulatedLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedLocation")
            .field("satellites", &self.satellites_in_fix())
            .finish()
    }
}

impl SimulatedLocation {
    /// Start the walk at the given coordinates.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            walk: Arc::new(Walk {
                state: Mutex::new(WalkState {
                    latitude,
                    longitude,
                    last_fix: HashMap::new(),
                }),
                satellites: AtomicU32::new(0),
            }),
            subscriptions: Mutex::new(CancellationToken::new()),
        }
    }

    /// Token cancelled by the next `remove_updates`.
    fn subscription_token(&self) -> CancellationToken {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token()
    }
}

#[async_trait]
impl LocationProvider for SimulatedLocation {
    async fn last_known_fix(&self, source: LocationSource) -> Result<Option<LocationFix>> {
        let state = self
            .walk
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let fix = match source {
            // Passive sees whatever was produced for anyone most recently
            LocationSource::Passive => state.last_fix.values().max_by_key(|f| f.time_ms).cloned(),
            _ => state.last_fix.get(&source).cloned(),
        };
        Ok(fix)
    }

    async fn request_updates(
        &self,
        source: LocationSource,
        request: UpdateRequest,
        sink: mpsc::Sender<LocationFix>,
    ) -> Result<()> {
        let token = self.subscription_token();
        let walk = Arc::clone(&self.walk);
        let period = request.min_time.max(MIN_FIX_PERIOD);
        debug!("Simulating {} updates every {:?}", source, period);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(period) => {
                        if sink.send(walk.next_fix(source)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            trace!("{} update task finished", source);
        });
        Ok(())
    }

    async fn request_single_update(
        &self,
        source: LocationSource,
        sink: mpsc::Sender<LocationFix>,
    ) -> Result<()> {
        let token = self.subscription_token();
        let walk = Arc::clone(&self.walk);
        let delay = Duration::from_millis(rand::rng().random_range(100..1_500));

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(delay) => {
                    let _ = sink.send(walk.next_fix(source)).await;
                }
            }
        });
        Ok(())
    }

    async fn remove_updates(&self) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscriptions.cancel();
        *subscriptions = CancellationToken::new();
    }

    fn satellites_in_fix(&self) -> u32 {
        self.walk.satellites.load(Ordering::Relaxed)
    }
}

/// Fluctuating GSM radio.
pub struct SimulatedTelephony {
    carrier: String,
    airplane: AtomicBool,
    listener: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for SimulatedTelephony {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedTelephony")
            .field("carrier", &self.carrier)
            .finish()
    }
}

impl SimulatedTelephony {
    pub fn new(carrier: impl Into<String>) -> Self {
        Self {
            carrier: carrier.into(),
            airplane: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }

    pub fn set_airplane_mode(&self, on: bool) {
        self.airplane.store(on, Ordering::Relaxed);
    }
}

/// Next ASU value: a small step from `current`, or unknown about 1 in 50.
fn next_asu(rng: &mut impl Rng, current: i32) -> i32 {
    if rng.random_ratio(1, 50) {
        return SignalReading::UNKNOWN_ASU;
    }
    let base = if (0..=31).contains(&current) { current } else { 15 };
    (base + rng.random_range(-3..=3)).clamp(0, 31)
}

#[async_trait]
impl Telephony for SimulatedTelephony {
    async fn listen_signal_strengths(&self, sink: mpsc::Sender<SignalReading>) -> Result<()> {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone())
        {
            previous.cancel();
        }

        tokio::spawn(async move {
            let mut asu = 15;
            loop {
                let delay = Duration::from_millis(rand::rng().random_range(2_000..8_000));
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(delay) => {
                        asu = next_asu(&mut rand::rng(), asu);
                        if sink.send(SignalReading::gsm(asu)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop_listening(&self) {
        if let Some(token) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }

    fn network_operator_name(&self) -> Option<String> {
        Some(self.carrier.clone())
    }

    fn is_airplane_mode_on(&self) -> bool {
        self.airplane.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_stays_close() {
        let location = SimulatedLocation::new(52.52, 13.405);
        let start = LocationFix::new(LocationSource::Gps, 0, 52.52, 13.405);

        let fix = location.walk.next_fix(LocationSource::Gps);
        // One step in each axis at most
        assert!(fix.distance_to(&start) <= MAX_STEP_M * 2.0_f64.sqrt() + 1.0);
        assert!((3.0..15.0).contains(&fix.accuracy));
        assert!((4..=12).contains(&location.satellites_in_fix()));
    }

    #[test]
    fn test_next_asu_stays_in_range() {
        let mut rng = rand::rng();
        let mut asu = 0;
        for _ in 0..1_000 {
            asu = next_asu(&mut rng, asu);
            assert!((0..=31).contains(&asu) || asu == SignalReading::UNKNOWN_ASU);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_stop_after_remove() {
        let location = SimulatedLocation::new(0.0, 0.0);
        let (tx, mut rx) = mpsc::channel(8);
        let request = UpdateRequest {
            min_time: Duration::from_secs(2),
            min_distance: 0.0,
        };
        location
            .request_updates(LocationSource::Network, request, tx)
            .await
            .unwrap();

        let fix = rx.recv().await.unwrap();
        assert_eq!(fix.source, LocationSource::Network);
        assert_eq!(
            location
                .last_known_fix(LocationSource::Passive)
                .await
                .unwrap(),
            Some(fix)
        );

        location.remove_updates().await;
        // Sender dropped by the cancelled task
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_telephony_emits_until_stopped() {
        let telephony = SimulatedTelephony::new("Simnet");
        let (tx, mut rx) = mpsc::channel(8);
        telephony.listen_signal_strengths(tx).await.unwrap();

        assert!(rx.recv().await.is_some());
        telephony.stop_listening().await;
        assert!(rx.recv().await.is_none());
        assert_eq!(telephony.network_operator_name().as_deref(), Some("Simnet"));
    }
}
