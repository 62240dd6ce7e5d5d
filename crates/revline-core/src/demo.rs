//! Demo Mode - simulated ELM327 adapter
//!
//! Answers the adapter command set the way a BLE ELM327 clone on an EV
//! does, so the whole pipeline can run without hardware. The motor idles
//! and gets random throttle blips; lifting off regenerates, which reads
//! negative.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::{
    ByteTransport, DeviceInfo, ProtocolError, RpmPid, TransportEvent, TransportEventSender,
    EV_SPEED_OFFSET,
};

/// Id the demo adapter advertises
pub const DEMO_DEVICE_ID: &str = "demo-elm327";

const IDLE_RPM: f64 = 850.0;
const RAMP_UP_MS: u64 = 600;
const HOLD_MS: u64 = 400;
const RAMP_DOWN_MS: u64 = 1200;

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlipState {
    /// Motor idling
    Idle,
    /// Accelerating
    RampUp { start_ms: u64 },
    /// At peak speed
    Hold { start_ms: u64 },
    /// Lifted off, regenerating
    RampDown { start_ms: u64 },
}

/// Motor speed generator: idle with random throttle blips
pub struct RpmSimulator {
    last_update_ms: Option<u64>,
    next_blip_at_ms: u64,
    blip_state: BlipState,
    current_rpm: f64,
    blip_target_rpm: f64,
    rng: StdRng,
}

impl Default for RpmSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl RpmSimulator {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Deterministic simulator
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(mut rng: StdRng) -> Self {
        let first_blip = rng.gen_range(2000..4000);
        Self {
            last_update_ms: None,
            next_blip_at_ms: first_blip,
            blip_state: BlipState::Idle,
            current_rpm: IDLE_RPM,
            blip_target_rpm: IDLE_RPM,
            rng,
        }
    }

    /// Advance to `elapsed_ms` and return the signed motor speed
    pub fn update(&mut self, elapsed_ms: u64) -> f64 {
        let delta_ms = self
            .last_update_ms
            .map_or(0, |last| elapsed_ms.saturating_sub(last));
        self.last_update_ms = Some(elapsed_ms);

        self.update_blip_state(elapsed_ms);
        let target_rpm = self.target_rpm(elapsed_ms);

        let rpm_rate = if target_rpm > self.current_rpm { 9000.0 } else { 5000.0 }; // RPM/sec
        let max_change = rpm_rate * (delta_ms as f64 / 1000.0);
        self.current_rpm += (target_rpm - self.current_rpm).clamp(-max_change, max_change);

        let t = elapsed_ms as f64 / 1000.0;
        match self.blip_state {
            BlipState::Idle => self.current_rpm + 20.0 * (t * 2.5).sin() + 10.0 * (t * 7.3).sin(),
            BlipState::RampDown { .. } => -self.current_rpm,
            _ => self.current_rpm,
        }
    }

    fn update_blip_state(&mut self, now_ms: u64) {
        match self.blip_state {
            BlipState::Idle => {
                if now_ms >= self.next_blip_at_ms {
                    // Some blips run into the limiter
                    self.blip_target_rpm = self.rng.gen_range(3000.0..9000.0);
                    self.blip_state = BlipState::RampUp { start_ms: now_ms };
                }
            }
            BlipState::RampUp { start_ms } => {
                if now_ms >= start_ms + RAMP_UP_MS {
                    self.blip_state = BlipState::Hold { start_ms: now_ms };
                }
            }
            BlipState::Hold { start_ms } => {
                if now_ms >= start_ms + HOLD_MS {
                    self.blip_state = BlipState::RampDown { start_ms: now_ms };
                }
            }
            BlipState::RampDown { start_ms } => {
                if now_ms >= start_ms + RAMP_DOWN_MS {
                    self.blip_state = BlipState::Idle;
                    self.next_blip_at_ms = now_ms + self.rng.gen_range(2000..5000);
                }
            }
        }
    }

    fn target_rpm(&self, now_ms: u64) -> f64 {
        match self.blip_state {
            BlipState::Idle => IDLE_RPM,
            BlipState::RampUp { start_ms } => {
                let progress = (now_ms.saturating_sub(start_ms) as f64 / RAMP_UP_MS as f64).min(1.0);
                IDLE_RPM + (self.blip_target_rpm - IDLE_RPM) * progress
            }
            BlipState::Hold { .. } => self.blip_target_rpm,
            BlipState::RampDown { start_ms } => {
                let progress =
                    (now_ms.saturating_sub(start_ms) as f64 / RAMP_DOWN_MS as f64).min(1.0);
                self.blip_target_rpm + (IDLE_RPM - self.blip_target_rpm) * progress
            }
        }
    }
}

/// Multi-frame `22 01 01` reply (headers off) carrying `rpm` at the
/// speed offset
pub fn ev_speed_response(rpm: i16) -> String {
    const PAYLOAD_LEN: usize = 0x3E;

    let mut payload = vec![0u8; PAYLOAD_LEN];
    payload[..3].copy_from_slice(&[0x62, 0x01, 0x01]);
    for (i, byte) in payload.iter_mut().enumerate().skip(3) {
        *byte = (i as u8).wrapping_mul(7);
    }
    let [hi, lo] = rpm.to_be_bytes();
    payload[EV_SPEED_OFFSET] = hi;
    payload[EV_SPEED_OFFSET + 1] = lo;

    let hex = |bytes: &[u8]| {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    };

    let mut lines = vec![format!("{:03X}", PAYLOAD_LEN)];
    lines.push(format!("0: {}", hex(&payload[..6])));
    for (i, frame) in payload[6..].chunks(7).enumerate() {
        lines.push(format!("{:X}: {}", (i + 1) % 16, hex(frame)));
    }
    lines.join("\r")
}

struct DemoState {
    connected: bool,
    echo: bool,
    silent: bool,
    simulator: RpmSimulator,
}

/// Simulated ELM327 implementing [`ByteTransport`]
///
/// Replies are delivered after a short latency, split into small chunks.
pub struct DemoAdapter {
    events: TransportEventSender,
    state: Mutex<DemoState>,
    started: Instant,
    latency: Duration,
    chunk_size: usize,
}

impl DemoAdapter {
    pub fn new(events: TransportEventSender) -> Self {
        Self::with_simulator(events, RpmSimulator::new())
    }

    pub fn with_simulator(events: TransportEventSender, simulator: RpmSimulator) -> Self {
        Self {
            events,
            state: Mutex::new(DemoState {
                connected: false,
                echo: true,
                silent: false,
                simulator,
            }),
            started: Instant::now(),
            latency: Duration::from_millis(15),
            chunk_size: 20,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Stop answering anything (simulates a wedged adapter)
    pub fn set_silent(&self, silent: bool) {
        self.lock_state().silent = silent;
    }

    /// Simulate the radio link dropping
    pub fn drop_link(&self, reason: &str) {
        let mut state = self.lock_state();
        if state.connected {
            state.connected = false;
            let _ = self.events.send(TransportEvent::Disconnected {
                reason: Some(reason.to_string()),
            });
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, DemoState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn reply(&self, state: &mut DemoState, command: &str) -> String {
        let body = match command {
            "ATZ" => {
                state.echo = true;
                "\rELM327 v1.5".to_string()
            }
            "ATE0" => {
                state.echo = false;
                "OK".to_string()
            }
            c if c.starts_with("AT") => "OK".to_string(),
            c if c == RpmPid::ElectricPrimary.command_text() => {
                let elapsed_ms = self.started.elapsed().as_millis() as u64;
                let rpm = state.simulator.update(elapsed_ms);
                ev_speed_response(rpm.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16)
            }
            c if c == RpmPid::ElectricLegacy.command_text()
                || c == RpmPid::Standard.command_text() =>
            {
                "NO DATA".to_string()
            }
            _ => "?".to_string(),
        };

        if state.echo && command != "ATE0" {
            format!("{}\r{}\r\r>", command, body)
        } else {
            format!("{}\r\r>", body)
        }
    }

    fn deliver(&self, reply: String) -> Result<(), ProtocolError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        let events = self.events.clone();
        let latency = self.latency;
        let chunk_size = self.chunk_size;

        runtime.spawn(async move {
            tokio::time::sleep(latency).await;
            for chunk in reply.as_bytes().chunks(chunk_size) {
                if events.send(TransportEvent::Data(chunk.to_vec())).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }
}

impl ByteTransport for DemoAdapter {
    fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let mut state = self.lock_state();
        if !state.connected {
            return Err(ProtocolError::NotConnected);
        }

        let command = String::from_utf8_lossy(bytes)
            .trim()
            .to_ascii_uppercase()
            .replace(' ', "");
        if state.silent {
            debug!("Demo adapter ignoring {}", command);
            return Ok(());
        }

        let reply = self.reply(&mut state, &command);
        drop(state);
        self.deliver(reply)
    }

    fn start_scan(&self) -> Result<(), ProtocolError> {
        let device = DeviceInfo {
            rssi: Some(-48),
            ..DeviceInfo::new(DEMO_DEVICE_ID).with_name("OBDII (demo)")
        };
        let _ = self.events.send(TransportEvent::DeviceDiscovered(device));
        Ok(())
    }

    fn connect(&self, device_id: &str) -> Result<(), ProtocolError> {
        if device_id != DEMO_DEVICE_ID {
            return Err(ProtocolError::PortNotFound(device_id.to_string()));
        }
        let mut state = self.lock_state();
        state.connected = true;
        state.echo = true;
        let _ = self.events.send(TransportEvent::Connected {
            device_id: device_id.to_string(),
        });
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.lock_state();
        if state.connected {
            state.connected = false;
            let _ = self.events.send(TransportEvent::Disconnected { reason: None });
        }
    }

    fn is_connected(&self) -> bool {
        self.lock_state().connected
    }
}
