//! Sound modulation
//!
//! Maps engine speed and throttle to a gain and pitch offset per layer:
//! - low/high layers crossfade across an RPM band
//! - on/off (load/overrun) layers crossfade on throttle
//! - the limiter layer fades in approaching the redline and never shifts pitch

use serde::{Deserialize, Serialize};

use super::crossfade::{equal_power, equal_power_band, ratio};
use super::{EngineSoundProfile, LayerKey};
use crate::config::ModulationConfig;

/// Gain and pitch for one layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerOutput {
    /// 0..=1
    pub gain: f64,
    /// Pitch offset in cents
    pub pitch_cents: f64,
}

/// Result of one modulation tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModulationOutput {
    /// Indexed by [`LayerKey::index`]
    pub layers: [LayerOutput; LayerKey::COUNT],
    /// Applied by the backend after all layer gains
    pub master_volume: f64,
}

impl Default for ModulationOutput {
    fn default() -> Self {
        Self {
            layers: [LayerOutput::default(); LayerKey::COUNT],
            master_volume: 1.0,
        }
    }
}

impl ModulationOutput {
    pub fn layer(&self, key: LayerKey) -> &LayerOutput {
        &self.layers[key.index()]
    }

    pub fn gain(&self, key: LayerKey) -> f64 {
        self.layer(key).gain
    }

    pub fn pitch_cents(&self, key: LayerKey) -> f64 {
        self.layer(key).pitch_cents
    }

    pub fn with_master_volume(mut self, volume: f64) -> Self {
        self.master_volume = volume.clamp(0.0, 1.0);
        self
    }
}

/// Stateless mapping from (rpm, throttle, profile) to layer levels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModulationEngine {
    band_start_rpm: f64,
    band_end_rpm: f64,
    limiter_soft_ratio: f64,
}

impl Default for ModulationEngine {
    fn default() -> Self {
        Self::new(&ModulationConfig::default())
    }
}

impl ModulationEngine {
    pub fn new(config: &ModulationConfig) -> Self {
        Self {
            band_start_rpm: config.band_start_rpm,
            band_end_rpm: config.band_end_rpm,
            limiter_soft_ratio: config.limiter_soft_ratio,
        }
    }

    /// Limiter layer gain: rises from 0 at `soft * ratio` to 1 at the hard limiter
    pub fn limiter_gain(&self, rpm: f64, profile: &EngineSoundProfile) -> f64 {
        ratio(
            rpm,
            profile.soft_limiter_rpm * self.limiter_soft_ratio,
            profile.hard_limiter_rpm,
        )
    }

    /// Compute layer levels. `rpm` is expected to be clamped to the hard
    /// limiter already; master volume is left at 1.0 for the caller to set.
    pub fn modulate(&self, rpm: f64, throttle: f64, profile: &EngineSoundProfile) -> ModulationOutput {
        let (low, high) = equal_power_band(rpm, self.band_start_rpm, self.band_end_rpm);
        let (off, on) = equal_power(throttle);

        let mut output = ModulationOutput::default();
        for key in LayerKey::ALL {
            let Some(settings) = profile.layer(key) else {
                continue;
            };

            let layer = match key {
                // Base volume does not apply; the limiter follows proximity alone
                LayerKey::Limiter => LayerOutput {
                    gain: self.limiter_gain(rpm, profile),
                    pitch_cents: 0.0,
                },
                _ => {
                    let load = if matches!(key, LayerKey::OnLow | LayerKey::OnHigh) { on } else { off };
                    let band = if matches!(key, LayerKey::OnLow | LayerKey::OffLow) { low } else { high };
                    LayerOutput {
                        gain: (load * band * settings.base_volume).clamp(0.0, 1.0),
                        pitch_cents: (rpm - settings.reference_rpm) * profile.pitch_factor,
                    }
                }
            };
            output.layers[key.index()] = layer;
        }

        output
    }
}
