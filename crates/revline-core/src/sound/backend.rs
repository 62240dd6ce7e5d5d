//! Playback backend interface
//!
//! The audio graph (sample buffers, players, pitch units) lives outside the
//! core. The modulation tick only pushes levels through this trait, so
//! implementations must not block.

use std::sync::Mutex;

use super::{LayerKey, ModulationOutput};

/// Sink for per-layer levels
pub trait PlaybackBackend: Send + Sync {
    /// Set a layer's gain (0..=1)
    fn set_gain(&self, layer: LayerKey, gain: f64);

    /// Set a layer's pitch offset in cents
    fn set_pitch_offset(&self, layer: LayerKey, cents: f64);

    /// Set the master volume (0..=1)
    fn set_master_volume(&self, volume: f64);

    /// Push a whole modulation result
    fn apply(&self, output: &ModulationOutput) {
        for key in LayerKey::ALL {
            let layer = output.layer(key);
            self.set_gain(key, layer.gain);
            self.set_pitch_offset(key, layer.pitch_cents);
        }
        self.set_master_volume(output.master_volume);
    }
}

/// Backend that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl PlaybackBackend for NullBackend {
    fn set_gain(&self, _layer: LayerKey, _gain: f64) {}

    fn set_pitch_offset(&self, _layer: LayerKey, _cents: f64) {}

    fn set_master_volume(&self, _volume: f64) {}
}

/// Backend that keeps the most recent levels, for meters and tests
#[derive(Debug, Default)]
pub struct LevelsBackend {
    levels: Mutex<ModulationOutput>,
    updates: Mutex<u64>,
}

impl LevelsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent levels
    pub fn levels(&self) -> ModulationOutput {
        *self.levels.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of master-volume updates, i.e. completed `apply` calls
    pub fn update_count(&self) -> u64 {
        *self.updates.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl PlaybackBackend for LevelsBackend {
    fn set_gain(&self, layer: LayerKey, gain: f64) {
        let mut levels = self.levels.lock().unwrap_or_else(|p| p.into_inner());
        levels.layers[layer.index()].gain = gain;
    }

    fn set_pitch_offset(&self, layer: LayerKey, cents: f64) {
        let mut levels = self.levels.lock().unwrap_or_else(|p| p.into_inner());
        levels.layers[layer.index()].pitch_cents = cents;
    }

    fn set_master_volume(&self, volume: f64) {
        self.levels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .master_volume = volume;
        *self.updates.lock().unwrap_or_else(|p| p.into_inner()) += 1;
    }
}
