//! Collaborator interfaces for location and telephony.
//!
//! The sampling pipeline never talks to a positioning chip or a modem
//! directly. Whatever the host offers is wrapped in a [`LocationProvider`]
//! and a [`Telephony`] implementation; events are pushed into `mpsc` senders
//! handed over at subscription time, so the handlers are plain channel
//! consumers rather than listener objects.
//!
//! [`crate::mock`] has programmable implementations for tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use cellmap_store::Store;
use cellmap_types::{LocationFix, LocationSource, SignalReading};

use crate::error::Result;

/// Store handle shared between the joiner and read-side consumers.
pub type SharedStore = Arc<Mutex<Store>>;

/// Wrap a store for sharing.
pub fn shared_store(store: Store) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Rate limits for a continuous location subscription.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateRequest {
    /// Minimum time between fixes.
    pub min_time: Duration,
    /// Minimum distance in meters between fixes.
    pub min_distance: f32,
}

/// Source of location fixes.
///
/// All methods may fail; callers treat a failing source as absent for the
/// current cycle.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Last fix the source has produced, if any.
    async fn last_known_fix(&self, source: LocationSource) -> Result<Option<LocationFix>>;

    /// Start delivering fixes from `source` into `sink`.
    async fn request_updates(
        &self,
        source: LocationSource,
        request: UpdateRequest,
        sink: mpsc::Sender<LocationFix>,
    ) -> Result<()>;

    /// Deliver at most one fresh fix from `source` into `sink`.
    async fn request_single_update(
        &self,
        source: LocationSource,
        sink: mpsc::Sender<LocationFix>,
    ) -> Result<()>;

    /// Drop every subscription made through this provider.
    async fn remove_updates(&self);

    /// Number of satellites used in the most recent satellite fix.
    fn satellites_in_fix(&self) -> u32;
}

/// Cellular radio state.
#[async_trait]
pub trait Telephony: Send + Sync {
    /// Start delivering signal-strength changes into `sink`.
    async fn listen_signal_strengths(&self, sink: mpsc::Sender<SignalReading>) -> Result<()>;

    /// Stop delivering signal-strength changes.
    async fn stop_listening(&self);

    /// Name of the registered network operator.
    fn network_operator_name(&self) -> Option<String>;

    /// Whether airplane mode is on.
    fn is_airplane_mode_on(&self) -> bool;
}
