//! Adapter commands
//!
//! Defines the ELM327-class text commands used to initialize the adapter
//! and poll motor speed.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{identify_response, COMMAND_TERMINATOR};

/// Substrings that mark an adapter response as an error
pub const ERROR_MARKERS: &[&str] = &[
    "NO DATA",
    "UNABLE TO CONNECT",
    "ERROR",
    "?",
    "STOPPED",
    "BUS INIT",
];

/// Check a response for any known error marker (case-insensitive)
pub fn contains_error_marker(response: &str) -> bool {
    let upper = response.to_ascii_uppercase();
    ERROR_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// Parameter IDs that carry rotational speed, in polling order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpmPid {
    /// Mode 22 BMS block 0101 (current EV platforms), motor speed at offset 53
    ElectricPrimary,
    /// Mode 21 block 01 (older EV platforms), same layout
    ElectricLegacy,
    /// SAE J1979 mode 01 PID 0C, engine speed in quarter RPM
    Standard,
}

impl RpmPid {
    /// All PIDs in the order they are tried
    pub const ALL: [RpmPid; 3] = [
        RpmPid::ElectricPrimary,
        RpmPid::ElectricLegacy,
        RpmPid::Standard,
    ];

    /// Command text sent to the adapter (without terminator)
    pub fn command_text(&self) -> &'static str {
        match self {
            RpmPid::ElectricPrimary => "220101",
            RpmPid::ElectricLegacy => "2101",
            RpmPid::Standard => "010C",
        }
    }
}

impl fmt::Display for RpmPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_text())
    }
}

/// Commands understood by the adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterCommand {
    /// Full adapter reset (`ATZ`)
    Reset,
    /// Disable command echo (`ATE0`)
    EchoOff,
    /// Disable linefeeds after carriage returns (`ATL0`)
    LinefeedOff,
    /// Select the bus protocol (`ATSP<n>`)
    SetProtocol(String),
    /// Set the request header / target ECU address (`ATSH<addr>`)
    SetHeader(String),
    /// Request a rotational-speed PID
    Poll(RpmPid),
    /// Arbitrary text supplied by a collaborator
    Raw(String),
}

impl AdapterCommand {
    /// Command text without the terminator
    pub fn text(&self) -> String {
        match self {
            AdapterCommand::Reset => "ATZ".to_string(),
            AdapterCommand::EchoOff => "ATE0".to_string(),
            AdapterCommand::LinefeedOff => "ATL0".to_string(),
            AdapterCommand::SetProtocol(p) => format!("ATSP{}", p),
            AdapterCommand::SetHeader(h) => format!("ATSH{}", h),
            AdapterCommand::Poll(pid) => pid.command_text().to_string(),
            AdapterCommand::Raw(s) => s.trim().to_string(),
        }
    }

    /// Bytes written to the transport, carriage-return terminated
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.text().into_bytes();
        bytes.push(COMMAND_TERMINATOR);
        bytes
    }

    /// Reset responses carry the adapter banner and are never checked for errors
    pub fn is_reset(&self) -> bool {
        matches!(self, AdapterCommand::Reset)
    }

    /// Whether a response is recognizably the reply to this command.
    ///
    /// Only speed polls (by response header) and the reset (by banner) can
    /// be told apart; `OK`, `NO DATA` and the like are claimed by nothing.
    pub fn claims(&self, response: &str) -> bool {
        match self {
            AdapterCommand::Poll(pid) => identify_response(response) == Some(*pid),
            AdapterCommand::Reset => response.to_ascii_uppercase().contains("ELM"),
            _ => false,
        }
    }
}

impl fmt::Display for AdapterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// The ordered initialization sequence for the given bus protocol and header
pub fn init_sequence(protocol: &str, header: &str) -> Vec<AdapterCommand> {
    vec![
        AdapterCommand::Reset,
        AdapterCommand::EchoOff,
        AdapterCommand::LinefeedOff,
        AdapterCommand::SetProtocol(protocol.to_string()),
        AdapterCommand::SetHeader(header.to_string()),
    ]
}
