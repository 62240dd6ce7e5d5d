//! Byte transport abstraction
//!
//! The link to the adapter (BLE, RFCOMM, USB serial, or the demo simulator)
//! is owned by a transport implementation. The core only writes bytes to it
//! and consumes the [`TransportEvent`]s it emits.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::ProtocolError;

/// A device found during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable identifier used to connect (BLE address/UUID or port name)
    pub id: String,
    /// Advertised or product name, if any
    pub name: Option<String>,
    /// Signal strength in dBm (BLE only)
    pub rssi: Option<i16>,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Everything a transport reports back to the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A scan found a device
    DeviceDiscovered(DeviceInfo),
    /// The link to the requested device is up and writable
    Connected { device_id: String },
    /// An inbound chunk of bytes
    Data(Vec<u8>),
    /// The link went away (requested or not)
    Disconnected { reason: Option<String> },
}

/// Sender half handed to transports for reporting events
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half consumed by the session event pump
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create a transport event channel
pub fn event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

/// Abstraction for the link to the adapter
///
/// All methods are non-blocking. Results of `start_scan` and `connect`
/// arrive later as events.
pub trait ByteTransport: Send + Sync {
    /// Queue bytes for transmission. Fails with [`ProtocolError::NotConnected`]
    /// when there is no active link.
    fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError>;

    /// Begin discovering devices
    fn start_scan(&self) -> Result<(), ProtocolError>;

    /// Stop an active scan
    fn stop_scan(&self) {}

    /// Request a link to the given device
    fn connect(&self, device_id: &str) -> Result<(), ProtocolError>;

    /// Tear down the link. Must emit `Disconnected` if a link was up.
    fn disconnect(&self);

    /// Whether a link is currently up
    fn is_connected(&self) -> bool;
}
