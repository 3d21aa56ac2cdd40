//! Duty-cycle scheduler.
//!
//! Alternates between a listening phase (location subscriptions live, fixes
//! joined into samples) and a sleeping phase (location subscriptions
//! dropped, idle timer running). Signal readings are recorded for the whole
//! run so a fix early in a listening phase still finds a preceding reading.
//!
//! ```text
//!            start                update_duration
//! Stopped ──────────▶ Listening ─────────────────▶ Sleeping
//!    ▲                    ▲                           │
//!    │ stop / shutdown    └───────────────────────────┘
//!    └──── (any state)        sleep_between_measures
//! ```
//!
//! A supervisor task owns at most one running cycle. Stopping cancels the
//! cycle's [`CancellationToken`], which interrupts whichever timer it is
//! waiting on, waits for the task to finish, and then unsubscribes every
//! provider. A preference change while running is handled as stop, reload,
//! start; partial reconfiguration never happens.
//!
//! Each listening phase starts with a fresh distance reference, and only a
//! fix that produced a row moves it. Fixes requested because the signal
//! changed skip the distance filter. The passive policy has no duty cycle:
//! it stays in the listening phase until stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cellmap_core::util::now_millis;
use cellmap_core::{
    JoinOutcome, JoinStatsSnapshot, LocationArbiter, LocationProvider, SampleJoiner, Telephony,
    UpdateRequest,
};
use cellmap_types::{LocationFix, LocationSource, SignalReading};

use crate::preferences::{
    DEFAULT_MAX_LOCATION_AGE, PreferenceStore, Preferences, SamplingPolicy, ScheduleConfig,
};

const COMMAND_CHANNEL_CAPACITY: usize = 8;
const FIX_CHANNEL_CAPACITY: usize = 32;
const SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stopped,
    Listening,
    Sleeping,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Stopped => "stopped",
            Phase::Listening => "listening",
            Phase::Sleeping => "sleeping",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Reconfigure,
    Shutdown,
}

/// Errors returned by [`SchedulerHandle`].
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler task has exited")]
    Closed,
}

/// Builder for the duty-cycle scheduler.
pub struct Scheduler {
    joiner: Arc<SampleJoiner>,
    arbiter: Arc<LocationArbiter>,
    location: Arc<dyn LocationProvider>,
    telephony: Arc<dyn Telephony>,
    prefs: watch::Receiver<Preferences>,
    max_location_age: Duration,
}

impl Scheduler {
    pub fn new(
        joiner: Arc<SampleJoiner>,
        location: Arc<dyn LocationProvider>,
        telephony: Arc<dyn Telephony>,
        prefs: &PreferenceStore,
    ) -> Self {
        Self {
            joiner,
            arbiter: Arc::new(LocationArbiter::new()),
            location,
            telephony,
            prefs: prefs.subscribe(),
            max_location_age: DEFAULT_MAX_LOCATION_AGE,
        }
    }

    /// Age above which burst polling ignores a last-known fix.
    #[must_use]
    pub fn with_max_location_age(mut self, max_age: Duration) -> Self {
        self.max_location_age = max_age;
        self
    }

    /// Spawn the supervisor task. The scheduler starts out stopped.
    pub fn spawn(self) -> SchedulerHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (phase_tx, phase_rx) = watch::channel(Phase::Stopped);
        let listening_phases = Arc::new(AtomicU64::new(0));
        let joiner = Arc::clone(&self.joiner);

        let supervisor = Supervisor {
            scheduler: self,
            phase: Arc::new(phase_tx),
            listening_phases: Arc::clone(&listening_phases),
            running: None,
        };
        let task = tokio::spawn(supervisor.run(command_rx));

        SchedulerHandle {
            commands: command_tx,
            phase: phase_rx,
            listening_phases,
            joiner,
            task,
        }
    }
}

/// Control handle for a spawned scheduler.
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    phase: watch::Receiver<Phase>,
    listening_phases: Arc<AtomicU64>,
    joiner: Arc<SampleJoiner>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Enter the listening phase. No-op when already running.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.send(Command::Start).await
    }

    /// Stop the duty cycle and unsubscribe every provider.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.send(Command::Stop).await
    }

    /// Stop, reload the current preferences, and start again.
    pub async fn reconfigure(&self) -> Result<(), SchedulerError> {
        self.send(Command::Reconfigure).await
    }

    /// Stop and wait for the supervisor to exit.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            error!("Scheduler task failed: {}", e);
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver for phase changes.
    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    /// Number of listening phases entered so far.
    pub fn listening_phases(&self) -> u64 {
        self.listening_phases.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> JoinStatsSnapshot {
        self.joiner.stats()
    }

    async fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SchedulerError::Closed)
    }
}

/// A running duty cycle.
struct Cycle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Supervisor {
    scheduler: Scheduler,
    phase: Arc<watch::Sender<Phase>>,
    listening_phases: Arc<AtomicU64>,
    running: Option<Cycle>,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut prefs = self.scheduler.prefs.clone();
        let mut prefs_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start) => {
                        if self.running.is_none() {
                            self.launch(&prefs.borrow_and_update());
                        }
                    }
                    Some(Command::Stop) => self.halt().await,
                    Some(Command::Reconfigure) => self.restart(&mut prefs).await,
                    Some(Command::Shutdown) | None => {
                        self.halt().await;
                        break;
                    }
                },
                changed = prefs.changed(), if prefs_open => {
                    if changed.is_err() {
                        debug!("Preference source closed");
                        prefs_open = false;
                    } else if self.running.is_some() {
                        info!("Preferences changed, restarting duty cycle");
                        self.restart(&mut prefs).await;
                    }
                }
            }
        }

        debug!("Scheduler supervisor exiting");
    }

    async fn restart(&mut self, prefs: &mut watch::Receiver<Preferences>) {
        self.halt().await;
        self.launch(&prefs.borrow_and_update());
    }

    fn launch(&mut self, prefs: &Preferences) {
        let config = ScheduleConfig::from_preferences(prefs)
            .with_max_location_age(self.scheduler.max_location_age);
        info!(
            "Starting duty cycle: listen {:?}, sleep {:?}, min time {:?}, min distance {} m, policy {}",
            config.update_duration,
            config.sleep_between_measures,
            config.min_location_time,
            config.min_location_distance,
            config.policy
        );

        let cancel = CancellationToken::new();
        let worker = CycleWorker {
            joiner: Arc::clone(&self.scheduler.joiner),
            arbiter: Arc::clone(&self.scheduler.arbiter),
            location: Arc::clone(&self.scheduler.location),
            telephony: Arc::clone(&self.scheduler.telephony),
            phase: Arc::clone(&self.phase),
            listening_phases: Arc::clone(&self.listening_phases),
            config,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());
        self.running = Some(Cycle { cancel, task });
    }

    async fn halt(&mut self) {
        let Some(cycle) = self.running.take() else {
            return;
        };
        debug!("Stopping duty cycle");
        cycle.cancel.cancel();
        if let Err(e) = cycle.task.await {
            error!("Duty cycle task failed: {}", e);
        }

        self.scheduler.location.remove_updates().await;
        self.scheduler.telephony.stop_listening().await;
        self.phase.send_replace(Phase::Stopped);
        info!("Duty cycle stopped");
    }
}

/// State owned by one cycle task.
struct CycleWorker {
    joiner: Arc<SampleJoiner>,
    arbiter: Arc<LocationArbiter>,
    location: Arc<dyn LocationProvider>,
    telephony: Arc<dyn Telephony>,
    phase: Arc<watch::Sender<Phase>>,
    listening_phases: Arc<AtomicU64>,
    config: ScheduleConfig,
    cancel: CancellationToken,
}

impl CycleWorker {
    async fn run(self) {
        let (signal_tx, mut signals) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        if let Err(e) = self.telephony.listen_signal_strengths(signal_tx).await {
            warn!("Could not listen to signal strengths: {}", e);
        }

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.arbiter.reset();
            self.phase.send_replace(Phase::Listening);
            self.listening_phases.fetch_add(1, Ordering::SeqCst);

            match self.config.policy {
                SamplingPolicy::EventDriven => self.listen_event_driven(&mut signals).await,
                SamplingPolicy::Burst => self.listen_burst(&mut signals).await,
                SamplingPolicy::Passive => {
                    self.listen_passive(&mut signals).await;
                    self.location.remove_updates().await;
                    break;
                }
            }
            self.location.remove_updates().await;

            // Checked at the boundary so a stop during listening never sleeps
            if self.cancel.is_cancelled() {
                break;
            }
            self.phase.send_replace(Phase::Sleeping);
            debug!("Sleeping for {:?}", self.config.sleep_between_measures);
            if !self.sleep_phase(&mut signals).await {
                break;
            }
        }
    }

    async fn listen_event_driven(&self, signals: &mut mpsc::Receiver<SignalReading>) {
        let (fix_tx, mut fixes) = mpsc::channel(FIX_CHANNEL_CAPACITY);
        let (trigger_tx, mut triggered) = mpsc::channel(FIX_CHANNEL_CAPACITY);
        let request = UpdateRequest {
            min_time: self.config.min_location_time,
            min_distance: self.config.min_location_distance as f32,
        };
        for source in self.config.sources() {
            match self
                .location
                .request_updates(source, request, fix_tx.clone())
                .await
            {
                Ok(()) => debug!("Subscribed to {} updates", source),
                Err(e) => warn!("Could not subscribe to {}: {}", source, e),
            }
        }

        let deadline = sleep(self.config.update_duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = &mut deadline => break,
                Some(fix) = fixes.recv() => self.handle_fix(fix).await,
                Some(fix) = triggered.recv() => self.join_fix(fix).await,
                Some(reading) = signals.recv() => {
                    self.joiner.on_signal(reading);
                    if self.config.update_on_signal_change {
                        self.trigger_single_update(&trigger_tx).await;
                    }
                }
            }
        }
    }

    async fn listen_burst(&self, signals: &mut mpsc::Receiver<SignalReading>) {
        let requested = self.config.sources();
        let polled = self.config.poll_sources();
        let (answer_tx, mut answers) = mpsc::channel(FIX_CHANNEL_CAPACITY);
        let deadline = sleep(self.config.update_duration);
        tokio::pin!(deadline);
        let mut ticker = interval(self.config.min_location_time);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = &mut deadline => break,
                Some(reading) = signals.recv() => self.joiner.on_signal(reading),
                // Answers also land in the last-known cache the poll reads
                Some(_) = answers.recv() => self.poll_best(&polled).await,
                _ = ticker.tick() => {
                    for &source in &requested {
                        if let Err(e) = self
                            .location
                            .request_single_update(source, answer_tx.clone())
                            .await
                        {
                            warn!("Could not request a {} fix: {}", source, e);
                        }
                    }
                    self.poll_best(&polled).await;
                }
            }
        }
    }

    async fn listen_passive(&self, signals: &mut mpsc::Receiver<SignalReading>) {
        let (fix_tx, mut fixes) = mpsc::channel(FIX_CHANNEL_CAPACITY);
        let request = UpdateRequest {
            min_time: Duration::ZERO,
            min_distance: 0.0,
        };
        if let Err(e) = self
            .location
            .request_updates(LocationSource::Passive, request, fix_tx)
            .await
        {
            warn!("Could not subscribe to passive updates: {}", e);
        }

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(fix) = fixes.recv() => self.join_fix(fix).await,
                Some(reading) = signals.recv() => self.joiner.on_signal(reading),
            }
        }
    }

    async fn poll_best(&self, sources: &[LocationSource]) {
        let best = self
            .arbiter
            .best_available(
                self.location.as_ref(),
                sources,
                self.config.max_location_age,
                now_millis(),
            )
            .await;
        match best {
            Some(fix) => self.handle_fix(fix).await,
            None => debug!("No fresh location available"),
        }
    }

    /// Returns false when the sleep was cut short by a stop.
    async fn sleep_phase(&self, signals: &mut mpsc::Receiver<SignalReading>) -> bool {
        let wake = sleep(self.config.sleep_between_measures);
        tokio::pin!(wake);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = &mut wake => return !self.cancel.is_cancelled(),
                Some(reading) = signals.recv() => self.joiner.on_signal(reading),
            }
        }
    }

    /// Join `fix` unless it is too close to the last one that produced a row.
    async fn handle_fix(&self, fix: LocationFix) {
        if !self
            .arbiter
            .is_far_from_last(&fix, self.config.min_location_distance)
        {
            return;
        }
        self.join_fix(fix).await;
    }

    async fn join_fix(&self, fix: LocationFix) {
        // The same fix can reach us through a subscription and a one-shot request
        if self.arbiter.last_accepted().as_ref() == Some(&fix) {
            return;
        }
        let outcome = self.joiner.on_location(&fix).await;
        debug!("{} fix at {}: {:?}", fix.source, fix.time_ms, outcome);
        if matches!(outcome, JoinOutcome::Stored(_) | JoinOutcome::Kept(_)) {
            self.arbiter.mark_accepted(fix);
        }
    }

    async fn trigger_single_update(&self, sink: &mpsc::Sender<LocationFix>) {
        let source = self.config.trigger_source();
        if let Err(e) = self
            .location
            .request_single_update(source, sink.clone())
            .await
        {
            warn!("Could not request a {} fix: {}", source, e);
        }
    }
}
