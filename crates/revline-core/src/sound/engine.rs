//! Sound engine
//!
//! Owns the active profile and master volume and runs the fixed-cadence
//! modulation tick. The tick reads the latest conditioned signal without
//! waiting on the adapter; it is the only writer of modulation output.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{EngineSoundProfile, ModulationEngine, ModulationOutput, PlaybackBackend, ProfileError};
use crate::config::ModulationConfig;
use crate::signal::ConditionedSignal;

/// Profile selection, master volume and the modulation tick
pub struct SoundEngine {
    modulation: ModulationEngine,
    /// Replaced wholesale on selection; readers clone the `Arc`
    profile: RwLock<Arc<EngineSoundProfile>>,
    /// `f64` bits
    master_volume: AtomicU64,
    tick_interval: Duration,
    backend: Arc<dyn PlaybackBackend>,
    output: watch::Sender<ModulationOutput>,
}

impl SoundEngine {
    pub fn new(
        config: &ModulationConfig,
        profile: EngineSoundProfile,
        backend: Arc<dyn PlaybackBackend>,
    ) -> Self {
        let (output, _) = watch::channel(ModulationOutput::default());
        Self {
            modulation: ModulationEngine::new(config),
            profile: RwLock::new(Arc::new(profile)),
            master_volume: AtomicU64::new(config.master_volume.clamp(0.0, 1.0).to_bits()),
            tick_interval: config.tick_interval(),
            backend,
            output,
        }
    }

    /// The active profile
    pub fn active_profile(&self) -> Arc<EngineSoundProfile> {
        self.profile
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Validate and swap in a new profile
    pub fn select_profile(&self, profile: EngineSoundProfile) -> Result<(), ProfileError> {
        profile.validate()?;
        info!("Selected engine sound profile '{}'", profile.name);
        *self.profile.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(profile);
        Ok(())
    }

    /// Select a built-in profile by name
    pub fn select_builtin(&self, name: &str) -> Result<(), ProfileError> {
        let profile =
            EngineSoundProfile::builtin(name).ok_or_else(|| ProfileError::Unknown(name.to_string()))?;
        self.select_profile(profile)
    }

    pub fn master_volume(&self) -> f64 {
        f64::from_bits(self.master_volume.load(Ordering::Relaxed))
    }

    pub fn set_master_volume(&self, volume: f64) {
        let volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 0.0 };
        self.master_volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    /// Compute and push one set of levels for the given signal
    pub fn tick(&self, signal: ConditionedSignal) -> ModulationOutput {
        let profile = self.active_profile();
        let rpm = signal.rpm.clamp(0.0, profile.hard_limiter_rpm);
        let output = self
            .modulation
            .modulate(rpm, signal.throttle, &profile)
            .with_master_volume(self.master_volume());

        self.backend.apply(&output);
        self.output.send_replace(output);
        output
    }

    /// Subscribe to modulation results
    pub fn subscribe(&self) -> watch::Receiver<ModulationOutput> {
        self.output.subscribe()
    }

    /// Most recent modulation result
    pub fn latest(&self) -> ModulationOutput {
        *self.output.borrow()
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Tick at the configured cadence until cancelled
    pub async fn run(self: Arc<Self>, signal: watch::Receiver<ConditionedSignal>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("Modulation loop started ({}ms)", self.tick_interval.as_millis());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let latest = *signal.borrow();
                    self.tick(latest);
                }
            }
        }

        debug!("Modulation loop stopped");
    }

    /// Spawn [`SoundEngine::run`] on the current runtime
    pub fn spawn(
        self: &Arc<Self>,
        signal: watch::Receiver<ConditionedSignal>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(signal, cancel))
    }
}
