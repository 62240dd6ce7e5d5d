//! Engine sound profiles
//!
//! A profile describes one recorded engine: its rev limits, how strongly
//! samples are pitch-shifted away from their recording RPM, and the
//! reference RPM and level of each of the five layers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors when building or loading a profile
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Profile '{profile}' is missing layer '{layer}'")]
    MissingLayer { profile: String, layer: LayerKey },

    #[error("Invalid profile '{profile}': {reason}")]
    Invalid { profile: String, reason: String },

    #[error("Unknown profile: {0}")]
    Unknown(String),
}

/// The audio layers every profile provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerKey {
    /// Low-RPM recording under load
    OnLow,
    /// Low-RPM recording on overrun
    OffLow,
    /// High-RPM recording under load
    OnHigh,
    /// High-RPM recording on overrun
    OffHigh,
    /// Rev-limiter bounce
    Limiter,
}

impl LayerKey {
    pub const COUNT: usize = 5;

    pub const ALL: [LayerKey; LayerKey::COUNT] = [
        LayerKey::OnLow,
        LayerKey::OffLow,
        LayerKey::OnHigh,
        LayerKey::OffHigh,
        LayerKey::Limiter,
    ];

    /// Position in [`LayerKey::ALL`]
    pub fn index(self) -> usize {
        match self {
            LayerKey::OnLow => 0,
            LayerKey::OffLow => 1,
            LayerKey::OnHigh => 2,
            LayerKey::OffHigh => 3,
            LayerKey::Limiter => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LayerKey::OnLow => "on-low",
            LayerKey::OffLow => "off-low",
            LayerKey::OnHigh => "on-high",
            LayerKey::OffHigh => "off-high",
            LayerKey::Limiter => "limiter",
        }
    }
}

impl fmt::Display for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-layer sample settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerSettings {
    /// Engine speed the sample was recorded at
    pub reference_rpm: f64,
    /// Level applied on top of the crossfade gains
    pub base_volume: f64,
}

impl LayerSettings {
    pub const fn new(reference_rpm: f64, base_volume: f64) -> Self {
        Self {
            reference_rpm,
            base_volume,
        }
    }
}

/// An immutable engine sound profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSoundProfile {
    pub name: String,
    pub hard_limiter_rpm: f64,
    pub soft_limiter_rpm: f64,
    /// Cents of pitch shift per RPM away from a layer's reference
    pub pitch_factor: f64,
    pub layers: BTreeMap<LayerKey, LayerSettings>,
}

/// Names accepted by [`EngineSoundProfile::builtin`]
pub const BUILTIN_PROFILES: &[&str] = &["inline4", "flat6", "v8", "v12"];

impl EngineSoundProfile {
    /// Build a profile from low/high reference points; the limiter layer
    /// is recorded at the soft limiter
    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        name: &str,
        hard_limiter_rpm: f64,
        soft_limiter_rpm: f64,
        pitch_factor: f64,
        low_rpm: f64,
        high_rpm: f64,
        off_volume: f64,
        limiter_volume: f64,
    ) -> Self {
        let layers = BTreeMap::from([
            (LayerKey::OnLow, LayerSettings::new(low_rpm, 1.0)),
            (LayerKey::OffLow, LayerSettings::new(low_rpm, off_volume)),
            (LayerKey::OnHigh, LayerSettings::new(high_rpm, 1.0)),
            (LayerKey::OffHigh, LayerSettings::new(high_rpm, off_volume)),
            (
                LayerKey::Limiter,
                LayerSettings::new(soft_limiter_rpm, limiter_volume),
            ),
        ]);
        Self {
            name: name.to_string(),
            hard_limiter_rpm,
            soft_limiter_rpm,
            pitch_factor,
            layers,
        }
    }

    /// Look up a built-in profile by name (case-insensitive)
    pub fn builtin(name: &str) -> Option<Self> {
        let profile = match name.to_ascii_lowercase().as_str() {
            "inline4" => Self::from_parts("inline4", 7000.0, 6900.0, 0.25, 2500.0, 6000.0, 0.8, 0.7),
            "flat6" => Self::from_parts("flat6", 9000.0, 8950.0, 0.2, 3000.0, 7500.0, 0.75, 0.8),
            "v8" => Self::from_parts("v8", 7200.0, 7000.0, 0.2, 2000.0, 5500.0, 0.85, 0.9),
            "v12" => Self::from_parts("v12", 9500.0, 9300.0, 0.18, 3500.0, 8000.0, 0.7, 0.75),
            _ => return None,
        };
        Some(profile)
    }

    /// Parse and validate a profile from JSON
    pub fn from_json(json: &str) -> Result<Self, ProfileError> {
        let profile: EngineSoundProfile = serde_json::from_str(json)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn to_json(&self) -> Result<String, ProfileError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check that every layer is present and the limits make sense
    pub fn validate(&self) -> Result<(), ProfileError> {
        for key in LayerKey::ALL {
            if !self.layers.contains_key(&key) {
                return Err(ProfileError::MissingLayer {
                    profile: self.name.clone(),
                    layer: key,
                });
            }
        }

        let invalid = |reason: &str| ProfileError::Invalid {
            profile: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.hard_limiter_rpm <= 0.0 || self.soft_limiter_rpm <= 0.0 {
            return Err(invalid("limiter RPMs must be positive"));
        }
        if self.soft_limiter_rpm > self.hard_limiter_rpm {
            return Err(invalid("soft limiter exceeds hard limiter"));
        }
        if !self.pitch_factor.is_finite() {
            return Err(invalid("pitch factor must be finite"));
        }
        if self
            .layers
            .values()
            .any(|l| l.reference_rpm < 0.0 || !(0.0..=1.0).contains(&l.base_volume))
        {
            return Err(invalid("layer reference RPM must be >= 0 and volume within [0, 1]"));
        }
        Ok(())
    }

    /// Settings for a layer. Validated profiles always have all five.
    pub fn layer(&self, key: LayerKey) -> Option<&LayerSettings> {
        self.layers.get(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_valid() {
        for name in BUILTIN_PROFILES {
            let profile = EngineSoundProfile::builtin(name).unwrap();
            profile.validate().unwrap();
            assert_eq!(profile.layers.len(), LayerKey::COUNT);
        }
        assert!(EngineSoundProfile::builtin("V8").is_some());
        assert!(EngineSoundProfile::builtin("rotary").is_none());
    }

    #[test]
    fn test_layer_keys_serialize_kebab_case() {
        let json = serde_json::to_string(&LayerKey::OffHigh).unwrap();
        assert_eq!(json, "\"off-high\"");
        for key in LayerKey::ALL {
            assert_eq!(LayerKey::ALL[key.index()], key);
        }
    }

    #[test]
    fn test_json_round_trip_keeps_layers() {
        let profile = EngineSoundProfile::builtin("flat6").unwrap();
        let json = profile.to_json().unwrap();
        assert!(json.contains("\"on-low\""));
        assert_eq!(EngineSoundProfile::from_json(&json).unwrap(), profile);
    }

    #[test]
    fn test_missing_layer_is_rejected() {
        let mut profile = EngineSoundProfile::builtin("v8").unwrap();
        profile.layers.remove(&LayerKey::Limiter);
        let json = serde_json::to_string(&profile).unwrap();
        match EngineSoundProfile::from_json(&json) {
            Err(ProfileError::MissingLayer { layer, .. }) => assert_eq!(layer, LayerKey::Limiter),
            other => panic!("expected MissingLayer, got {:?}", other),
        }
    }

    #[test]
    fn test_inverted_limiters_are_rejected() {
        let mut profile = EngineSoundProfile::builtin("v12").unwrap();
        profile.soft_limiter_rpm = profile.hard_limiter_rpm + 100.0;
        assert!(matches!(profile.validate(), Err(ProfileError::Invalid { .. })));
    }
}
