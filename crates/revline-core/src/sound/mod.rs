//! Engine sound synthesis control
//!
//! Turns the conditioned RPM/throttle signal into per-layer gain and pitch
//! for an external playback backend.

pub mod crossfade;
mod backend;
mod engine;
mod modulation;
mod profile;

pub use backend::{LevelsBackend, NullBackend, PlaybackBackend};
pub use engine::SoundEngine;
pub use modulation::{LayerOutput, ModulationEngine, ModulationOutput};
pub use profile::{EngineSoundProfile, LayerKey, LayerSettings, ProfileError, BUILTIN_PROFILES};
