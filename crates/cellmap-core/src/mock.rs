//! Mock collaborators for testing.
//!
//! [`MockLocationProvider`] and [`MockTelephony`] implement the platform
//! traits without any hardware. Events are pushed by the test with
//! [`MockLocationProvider::emit_fix`] and [`MockTelephony::emit_signal`];
//! every subscription call is counted so tests can assert on the
//! subscribe/unsubscribe lifecycle.
//!
//! # Features
//!
//! - **Failure injection**: make individual sources or the radio fail
//! - **Call recording**: subscription counts and the last requested rates
//! - **Programmable state**: last-known fixes, satellites, operator, airplane mode

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use cellmap_types::{LocationFix, LocationSource, SignalReading};

use crate::error::{Error, Result};
use crate::platform::{LocationProvider, Telephony, UpdateRequest};

#[derive(Default)]
struct LocationInner {
    last_known: HashMap<LocationSource, LocationFix>,
    failing: BTreeSet<LocationSource>,
    subscriptions: HashMap<LocationSource, mpsc::Sender<LocationFix>>,
    pending_single: Vec<(LocationSource, mpsc::Sender<LocationFix>)>,
    request_counts: HashMap<LocationSource, u32>,
    single_counts: HashMap<LocationSource, u32>,
    last_request: HashMap<LocationSource, UpdateRequest>,
    single_replies: HashMap<LocationSource, LocationFix>,
    remove_count: u32,
}

/// A programmable location provider.
///
/// # Example
///
/// ```
/// use cellmap_core::mock::MockLocationProvider;
/// use cellmap_core::{LocationProvider, UpdateRequest};
/// use cellmap_types::{LocationFix, LocationSource};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let provider = MockLocationProvider::new();
///     let (tx, mut rx) = tokio::sync::mpsc::channel(8);
///     let request = UpdateRequest { min_time: Duration::from_secs(1), min_distance: 0.0 };
///     provider.request_updates(LocationSource::Gps, request, tx).await.unwrap();
///
///     provider.emit_fix(LocationFix::new(LocationSource::Gps, 0, 1.0, 2.0)).await;
///     assert!(rx.recv().await.is_some());
/// }
/// ```
#[derive(Default)]
pub struct MockLocationProvider {
    inner: Mutex<LocationInner>,
    satellites: AtomicU32,
}

impl std::fmt::Debug for MockLocationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLocationProvider")
            .field("active_sources", &self.active_sources())
            .field("remove_count", &self.remove_count())
            .finish()
    }
}

impl MockLocationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, LocationInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the fix returned by `last_known_fix` for the fix's source.
    pub fn set_last_known(&self, fix: LocationFix) {
        self.inner().last_known.insert(fix.source, fix);
    }

    /// Make every call for `source` fail (or succeed again).
    pub fn fail_source(&self, source: LocationSource, fail: bool) {
        let mut inner = self.inner();
        if fail {
            inner.failing.insert(source);
        } else {
            inner.failing.remove(&source);
        }
    }

    /// Answer every single-update request for the fix's source with `fix`.
    ///
    /// Until the first such request the source has no last known fix of its
    /// own, like a receiver that only produces positions when asked.
    pub fn reply_to_single_requests(&self, fix: LocationFix) {
        self.inner().single_replies.insert(fix.source, fix);
    }

    pub fn set_satellites(&self, count: u32) {
        self.satellites.store(count, Ordering::Relaxed);
    }

    /// Deliver `fix` to the subscription for its source and to any pending
    /// single-update requests for that source.
    ///
    /// Also becomes the source's last known fix. Returns how many sinks
    /// received it.
    pub async fn emit_fix(&self, fix: LocationFix) -> usize {
        let sinks: Vec<mpsc::Sender<LocationFix>> = {
            let mut inner = self.inner();
            inner.last_known.insert(fix.source, fix.clone());

            let mut sinks: Vec<_> = inner.subscriptions.get(&fix.source).cloned().into_iter().collect();
            let (matching, rest): (Vec<_>, Vec<_>) = inner
                .pending_single
                .drain(..)
                .partition(|(source, _)| *source == fix.source);
            inner.pending_single = rest;
            sinks.extend(matching.into_iter().map(|(_, sink)| sink));
            sinks
        };

        let mut delivered = 0;
        for sink in sinks {
            if sink.send(fix.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of `request_updates` calls that succeeded for `source`.
    pub fn request_count(&self, source: LocationSource) -> u32 {
        self.inner().request_counts.get(&source).copied().unwrap_or(0)
    }

    /// Number of `request_single_update` calls that succeeded for `source`.
    pub fn single_request_count(&self, source: LocationSource) -> u32 {
        self.inner().single_counts.get(&source).copied().unwrap_or(0)
    }

    /// Parameters of the most recent subscription for `source`.
    pub fn last_request(&self, source: LocationSource) -> Option<UpdateRequest> {
        self.inner().last_request.get(&source).copied()
    }

    /// Number of `remove_updates` calls.
    pub fn remove_count(&self) -> u32 {
        self.inner().remove_count
    }

    /// Sources with a live subscription.
    pub fn active_sources(&self) -> Vec<LocationSource> {
        let inner = self.inner();
        let mut sources: Vec<_> = inner.subscriptions.keys().copied().collect();
        sources.sort();
        sources
    }

    pub fn is_subscribed(&self) -> bool {
        !self.inner().subscriptions.is_empty()
    }

    fn check(&self, source: LocationSource) -> Result<()> {
        if self.inner().failing.contains(&source) {
            return Err(Error::provider(source, "mock provider failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl LocationProvider for MockLocationProvider {
    async fn last_known_fix(&self, source: LocationSource) -> Result<Option<LocationFix>> {
        self.check(source)?;
        Ok(self.inner().last_known.get(&source).cloned())
    }

    async fn request_updates(
        &self,
        source: LocationSource,
        request: UpdateRequest,
        sink: mpsc::Sender<LocationFix>,
    ) -> Result<()> {
        self.check(source)?;
        let mut inner = self.inner();
        inner.subscriptions.insert(source, sink);
        inner.last_request.insert(source, request);
        *inner.request_counts.entry(source).or_default() += 1;
        Ok(())
    }

    async fn request_single_update(
        &self,
        source: LocationSource,
        sink: mpsc::Sender<LocationFix>,
    ) -> Result<()> {
        self.check(source)?;
        let reply = {
            let mut inner = self.inner();
            *inner.single_counts.entry(source).or_default() += 1;
            match inner.single_replies.get(&source).cloned() {
                Some(reply) => {
                    inner.last_known.insert(source, reply.clone());
                    Some(reply)
                }
                None => {
                    inner.pending_single.push((source, sink.clone()));
                    None
                }
            }
        };

        if let Some(reply) = reply {
            let _ = sink.send(reply).await;
        }
        Ok(())
    }

    async fn remove_updates(&self) {
        let mut inner = self.inner();
        inner.subscriptions.clear();
        inner.pending_single.clear();
        inner.remove_count += 1;
    }

    fn satellites_in_fix(&self) -> u32 {
        self.satellites.load(Ordering::Relaxed)
    }
}

/// A programmable cellular radio.
#[derive(Default)]
pub struct MockTelephony {
    sink: Mutex<Option<mpsc::Sender<SignalReading>>>,
    carrier: Mutex<Option<String>>,
    airplane: AtomicBool,
    should_fail: AtomicBool,
    listen_count: AtomicU32,
    stop_count: AtomicU32,
}

impl std::fmt::Debug for MockTelephony {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTelephony")
            .field("listening", &self.is_listening())
            .field("airplane", &self.airplane.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockTelephony {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_carrier(&self, carrier: Option<&str>) {
        *self.carrier.lock().unwrap_or_else(PoisonError::into_inner) = carrier.map(str::to_string);
    }

    pub fn set_airplane_mode(&self, on: bool) {
        self.airplane.store(on, Ordering::Relaxed);
    }

    /// Make `listen_signal_strengths` fail.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Deliver a reading to the current listener. Returns whether anyone
    /// was listening.
    pub async fn emit_signal(&self, reading: SignalReading) -> bool {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match sink {
            Some(sink) => sink.send(reading).await.is_ok(),
            None => false,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn listen_count(&self) -> u32 {
        self.listen_count.load(Ordering::Relaxed)
    }

    pub fn stop_count(&self) -> u32 {
        self.stop_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Telephony for MockTelephony {
    async fn listen_signal_strengths(&self, sink: mpsc::Sender<SignalReading>) -> Result<()> {
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::Telephony("mock telephony failure".to_string()));
        }
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        self.listen_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn stop_listening(&self) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.stop_count.fetch_add(1, Ordering::Relaxed);
    }

    fn network_operator_name(&self) -> Option<String> {
        self.carrier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_airplane_mode_on(&self) -> bool {
        self.airplane.load(Ordering::Relaxed)
    }
}
