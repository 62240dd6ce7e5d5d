//! # Revline Core Library
//!
//! Engine sound synthesis driven by live OBD-II motor speed.
//!
//! This library provides:
//! - The ELM327 adapter protocol: response framing, a single-flight command
//!   channel, the connection state machine and PID decoding
//! - Signal conditioning (smoothing and a throttle estimate)
//! - Sound modulation: per-layer gain and pitch for an engine sound profile
//! - Serial and simulated adapter transports
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use revline_core::prelude::*;
//!
//! let config = RevlineConfig::default();
//! let (events_tx, events_rx) = event_channel();
//! let transport = Arc::new(SerialTransport::new(config.adapter.baud_rate, events_tx));
//!
//! let session = AdapterSession::new(config.adapter.clone(), &config.signal, transport, None);
//! session.attach(events_rx);
//! session.connect("/dev/rfcomm0")?;
//!
//! let profile = EngineSoundProfile::builtin(&config.profile).unwrap();
//! let engine = Arc::new(SoundEngine::new(&config.modulation, profile, Arc::new(NullBackend)));
//! engine.spawn(session.signal(), CancellationToken::new());
//! ```

pub mod config;
pub mod demo;
pub mod protocol;
pub mod signal;
pub mod sound;
pub mod store;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{AdapterConfig, ModulationConfig, RevlineConfig, SignalConfig};
    pub use crate::demo::{DemoAdapter, RpmSimulator, DEMO_DEVICE_ID};
    pub use crate::protocol::{
        event_channel, AdapterSession, ByteTransport, ConnectionState, DeviceInfo, ProtocolError,
        SerialTransport, SessionSnapshot, TransportEvent,
    };
    pub use crate::signal::{ConditionedSignal, SignalConditioner};
    pub use crate::sound::{
        EngineSoundProfile, LayerKey, ModulationOutput, NullBackend, PlaybackBackend, SoundEngine,
    };
    pub use crate::store::{DeviceMemory, JsonFileStore, KeyValueStore, MemoryStore};
    pub use tokio_util::sync::CancellationToken;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
