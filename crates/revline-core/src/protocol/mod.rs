//! Adapter protocol
//!
//! Talks the ELM327 text protocol over a byte transport: frames responses
//! on the `>` prompt, keeps exactly one command in flight, drives the
//! connection lifecycle and decodes rotational-speed PIDs.

mod channel;
pub mod commands;
pub mod decoder;
mod error;
mod framer;
pub mod gatt;
pub mod serial;
mod session;
mod state;
mod transport;

pub use channel::{ChannelStats, CommandChannel, PendingCommand};
pub use commands::{contains_error_marker, init_sequence, AdapterCommand, RpmPid, ERROR_MARKERS};
pub use decoder::{
    decode, decode_pid, decode_rpm, identify_response, normalize_response, EV_SPEED_OFFSET,
};
pub use error::ProtocolError;
pub use framer::ResponseFramer;
pub use serial::{list_ports, PortInfo, SerialTransport};
pub use session::{AdapterSession, SessionSnapshot};
pub use state::{AdapterAction, AdapterEvent, AdapterStateMachine, ConnectionState};
pub use transport::{
    event_channel, ByteTransport, DeviceInfo, TransportEvent, TransportEventReceiver,
    TransportEventSender,
};

/// Default baud rate for serial adapters
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Appended to every command
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// Prompt the adapter prints when it is ready for the next command
pub const RESPONSE_TERMINATOR: u8 = b'>';

/// A response buffer larger than this is discarded as garbage
pub const MAX_RESPONSE_SIZE: usize = 4096;

/// Default per-command timeout in milliseconds
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 1000;

/// Default pause between polling ticks in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Consecutive polling misses before the adapter is re-initialized
pub const MIN_MISS_THRESHOLD: u32 = 3;
pub const MAX_MISS_THRESHOLD: u32 = 5;
