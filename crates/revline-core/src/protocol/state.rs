//! Adapter connection state machine
//!
//! Pure transition logic: no I/O, no timers. The session feeds it events
//! and carries out the actions it returns.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{MAX_MISS_THRESHOLD, MIN_MISS_THRESHOLD};

/// Connection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Looking for adapters
    Scanning,
    /// Link requested, waiting for the transport
    Connecting,
    /// Running the adapter initialization sequence
    Initializing,
    /// Initialized and polling
    Connected,
    /// Connection failed; carries a display reason
    Error(String),
}

impl ConnectionState {
    /// Whether a link attempt or session is underway
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Scanning
                | ConnectionState::Connecting
                | ConnectionState::Initializing
                | ConnectionState::Connected
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("Disconnected"),
            ConnectionState::Scanning => f.write_str("Scanning"),
            ConnectionState::Connecting => f.write_str("Connecting"),
            ConnectionState::Initializing => f.write_str("Initializing"),
            ConnectionState::Connected => f.write_str("Connected"),
            ConnectionState::Error(reason) => write!(f, "Error: {}", reason),
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    StartScan,
    DeviceChosen(String),
    ConnectFailed(String),
    TransportConnected,
    InitSucceeded,
    InitFailed(String),
    PollSucceeded,
    PollMissed,
    TransportLost(Option<String>),
    DisconnectRequested,
}

/// Work the session must carry out after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterAction {
    /// Ask the transport to scan
    Scan,
    /// Ask the transport to connect to a device
    Connect(String),
    /// Run the initialization sequence
    Initialize,
    /// Start the polling loop
    StartPolling,
    /// Stop polling and re-run the initialization sequence
    Reinitialize,
    /// Stop polling, cancel the in-flight command and drop the link
    Teardown {
        /// Start a new scan afterwards
        rescan: bool,
    },
    /// Connection failed; rescan if configured
    Failed { rescan: bool },
}

/// Connection lifecycle plus the consecutive-miss counter
#[derive(Debug, Clone)]
pub struct AdapterStateMachine {
    state: ConnectionState,
    consecutive_misses: u32,
    miss_threshold: u32,
    auto_reconnect: bool,
}

impl AdapterStateMachine {
    pub fn new(miss_threshold: u32, auto_reconnect: bool) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            consecutive_misses: 0,
            miss_threshold: miss_threshold.clamp(MIN_MISS_THRESHOLD, MAX_MISS_THRESHOLD),
            auto_reconnect,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    pub fn miss_threshold(&self) -> u32 {
        self.miss_threshold
    }

    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        self.auto_reconnect = enabled;
    }

    /// Apply an event. Events that make no sense in the current state are
    /// ignored and leave it unchanged.
    pub fn handle(&mut self, event: AdapterEvent) -> Option<AdapterAction> {
        use AdapterEvent as E;
        use ConnectionState as S;

        let (next, action) = match (&self.state, event) {
            (S::Disconnected | S::Error(_), E::StartScan) => (S::Scanning, Some(AdapterAction::Scan)),

            (S::Scanning, E::DeviceChosen(id)) => (S::Connecting, Some(AdapterAction::Connect(id))),

            (S::Connecting, E::TransportConnected) => {
                (S::Initializing, Some(AdapterAction::Initialize))
            }
            (S::Scanning | S::Connecting, E::ConnectFailed(reason)) => (
                S::Error(reason),
                Some(AdapterAction::Failed {
                    rescan: self.auto_reconnect,
                }),
            ),

            (S::Initializing, E::InitSucceeded) => {
                self.consecutive_misses = 0;
                (S::Connected, Some(AdapterAction::StartPolling))
            }
            (S::Initializing, E::InitFailed(reason)) => (
                S::Error(reason),
                Some(AdapterAction::Failed {
                    rescan: self.auto_reconnect,
                }),
            ),

            (S::Connected, E::PollSucceeded) => {
                self.consecutive_misses = 0;
                (S::Connected, None)
            }
            (S::Connected, E::PollMissed) => {
                self.consecutive_misses += 1;
                if self.consecutive_misses >= self.miss_threshold {
                    warn!(
                        "{} consecutive polling misses, re-initializing adapter",
                        self.consecutive_misses
                    );
                    self.consecutive_misses = 0;
                    (S::Initializing, Some(AdapterAction::Reinitialize))
                } else {
                    (S::Connected, None)
                }
            }

            (state, E::TransportLost(reason)) if state.is_active() => {
                info!(
                    "Transport lost: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                (
                    S::Disconnected,
                    Some(AdapterAction::Teardown {
                        rescan: self.auto_reconnect,
                    }),
                )
            }

            // Echo of a teardown the session already performed
            (S::Disconnected, E::TransportLost(_)) => (S::Disconnected, None),
            (S::Error(reason), E::TransportLost(_)) => (S::Error(reason.clone()), None),

            (S::Disconnected, E::DisconnectRequested) => (S::Disconnected, None),
            (_, E::DisconnectRequested) => {
                (S::Disconnected, Some(AdapterAction::Teardown { rescan: false }))
            }

            (state, event) => {
                warn!("Ignoring {:?} in state {}", event, state);
                return None;
            }
        };

        if next != self.state {
            info!("Adapter state: {} -> {}", self.state, next);
            if !next.is_connected() {
                self.consecutive_misses = 0;
            }
            self.state = next;
        }

        action
    }
}

impl Default for AdapterStateMachine {
    fn default() -> Self {
        Self::new(MIN_MISS_THRESHOLD, true)
    }
}
