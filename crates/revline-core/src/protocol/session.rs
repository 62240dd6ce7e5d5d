//! Adapter session
//!
//! Carries out what the state machine decides: asks the transport to scan
//! and connect, runs the initialization sequence, runs the polling loop,
//! tears down on disconnect and schedules automatic reconnects.
//!
//! The polling loop is the only writer of raw samples and of the miss
//! counter. Everything collaborators need is published as a
//! [`SessionSnapshot`] on a watch channel.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    contains_error_marker, decode_pid, init_sequence, AdapterAction, AdapterCommand, AdapterEvent,
    AdapterStateMachine, ByteTransport, ChannelStats, CommandChannel, ConnectionState, DeviceInfo,
    ProtocolError, RpmPid, TransportEvent, TransportEventReceiver,
};
use crate::config::{AdapterConfig, SignalConfig};
use crate::signal::{ConditionedSignal, RpmSample, SignalConditioner};
use crate::store::DeviceMemory;

/// State published to collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    /// Device being connected to, or last connected
    pub device_id: Option<String>,
    /// Devices reported by the current scan
    pub devices: Vec<DeviceInfo>,
    /// Last decoded reading (magnitude)
    pub raw_rpm: Option<u32>,
    /// Smoothed RPM
    pub rpm: f64,
    /// Throttle estimate, 0..=1
    pub throttle: f64,
    /// PID the polling loop has locked onto
    pub active_pid: Option<RpmPid>,
    pub consecutive_misses: u32,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            device_id: None,
            devices: Vec::new(),
            raw_rpm: None,
            rpm: 0.0,
            throttle: 0.0,
            active_pid: None,
            consecutive_misses: 0,
        }
    }
}

struct Worker {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Connection lifecycle, initialization and polling over one transport
pub struct AdapterSession {
    config: AdapterConfig,
    channel: Arc<CommandChannel>,
    machine: Mutex<AdapterStateMachine>,
    conditioner: Mutex<SignalConditioner>,
    memory: Option<DeviceMemory>,
    snapshot: watch::Sender<SessionSnapshot>,
    signal: watch::Sender<ConditionedSignal>,
    worker: Mutex<Option<Worker>>,
    /// Set while a reconnect is waiting to run
    reconnect: Mutex<Option<CancellationToken>>,
    epoch: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AdapterSession {
    pub fn new(
        config: AdapterConfig,
        signal: &SignalConfig,
        transport: Arc<dyn ByteTransport>,
        memory: Option<DeviceMemory>,
    ) -> Arc<Self> {
        let machine = AdapterStateMachine::new(config.miss_threshold, config.auto_reconnect);
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let (signal_tx, _) = watch::channel(ConditionedSignal::default());

        Arc::new(Self {
            config,
            channel: Arc::new(CommandChannel::new(transport)),
            machine: Mutex::new(machine),
            conditioner: Mutex::new(SignalConditioner::new(signal)),
            memory,
            snapshot,
            signal: signal_tx,
            worker: Mutex::new(None),
            reconnect: Mutex::new(None),
            epoch: Instant::now(),
        })
    }

    /// Start consuming transport events. The pump ends when the transport
    /// drops its sender or the session is dropped.
    pub fn attach(self: &Arc<Self>, mut events: TransportEventReceiver) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.on_transport_event(event);
            }
            debug!("Transport event pump stopped");
        })
    }

    fn transport(&self) -> &Arc<dyn ByteTransport> {
        self.channel.transport()
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.machine).state().clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to state, reading and device-list changes
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Conditioned signal, for the modulation tick
    pub fn signal(&self) -> watch::Receiver<ConditionedSignal> {
        self.signal.subscribe()
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        lock(&self.machine).set_auto_reconnect(enabled);
    }

    /// Apply an event and publish the resulting state
    fn dispatch(&self, event: AdapterEvent) -> Option<AdapterAction> {
        let mut machine = lock(&self.machine);
        let action = machine.handle(event);
        self.publish_machine(&machine);
        action
    }

    fn publish_machine(&self, machine: &AdapterStateMachine) {
        let state = machine.state();
        let misses = machine.consecutive_misses();
        self.snapshot.send_if_modified(|s| {
            let changed = s.state != *state || s.consecutive_misses != misses;
            if changed {
                s.state = state.clone();
                s.consecutive_misses = misses;
            }
            changed
        });
    }

    // Control entry points

    /// Begin discovering adapters
    pub fn start_scan(self: &Arc<Self>) -> Result<(), ProtocolError> {
        match self.dispatch(AdapterEvent::StartScan) {
            Some(action) => self.perform(action),
            None => Err(ProtocolError::InvalidState(self.state())),
        }
    }

    /// Connect to a device, scanning or not.
    ///
    /// Rejected with [`ProtocolError::AlreadyConnecting`] while another
    /// attempt is underway.
    pub fn connect(self: &Arc<Self>, device_id: &str) -> Result<(), ProtocolError> {
        let action = {
            let mut machine = lock(&self.machine);
            match machine.state().clone() {
                ConnectionState::Connecting | ConnectionState::Initializing => {
                    return Err(ProtocolError::AlreadyConnecting);
                }
                state @ ConnectionState::Connected => {
                    return Err(ProtocolError::InvalidState(state));
                }
                ConnectionState::Scanning => {}
                ConnectionState::Disconnected | ConnectionState::Error(_) => {
                    // Direct connect skips the transport scan
                    machine.handle(AdapterEvent::StartScan);
                }
            }
            let action = machine.handle(AdapterEvent::DeviceChosen(device_id.to_string()));
            self.publish_machine(&machine);
            action
        };

        match action {
            Some(action) => self.perform(action),
            None => Err(ProtocolError::InvalidState(self.state())),
        }
    }

    /// Reconnect to the remembered device, if there is one.
    ///
    /// Returns the device id an attempt was started for.
    pub fn resume(self: &Arc<Self>) -> Result<Option<String>, ProtocolError> {
        let Some(device_id) = self.memory.as_ref().and_then(DeviceMemory::last_device) else {
            debug!("No remembered adapter to resume");
            return Ok(None);
        };
        info!("Resuming connection to {}", device_id);
        self.connect(&device_id)?;
        Ok(Some(device_id))
    }

    /// Connect to the current or remembered device, or scan if there is none
    pub fn reconnect(self: &Arc<Self>) -> Result<(), ProtocolError> {
        let target = self
            .snapshot
            .borrow()
            .device_id
            .clone()
            .or_else(|| self.memory.as_ref().and_then(DeviceMemory::last_device));
        match target {
            Some(device_id) => self.connect(&device_id),
            None => self.start_scan(),
        }
    }

    /// Stop polling, cancel the in-flight command and drop the link.
    /// Also cancels a scheduled reconnect. Safe to call repeatedly.
    pub fn disconnect(self: &Arc<Self>) {
        if let Some(token) = lock(&self.reconnect).take() {
            token.cancel();
        }
        if let Some(action) = self.dispatch(AdapterEvent::DisconnectRequested) {
            let _ = self.perform(action);
        }
    }

    /// Send an arbitrary command and return its framed response.
    ///
    /// Queued behind any in-flight poll.
    pub async fn send_raw(&self, text: &str) -> Result<String, ProtocolError> {
        let state = self.state();
        if !state.is_connected() {
            return Err(ProtocolError::InvalidState(state));
        }
        self.channel
            .submit(&AdapterCommand::Raw(text.to_string()), self.config.command_timeout())
            .await
    }

    // Transport events

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Data(bytes) => self.channel.on_bytes(&bytes),
            TransportEvent::DeviceDiscovered(device) => {
                debug!("Discovered {} ({:?})", device.id, device.name);
                self.snapshot.send_modify(|s| {
                    match s.devices.iter_mut().find(|d| d.id == device.id) {
                        Some(existing) => *existing = device,
                        None => s.devices.push(device),
                    }
                });
            }
            TransportEvent::Connected { device_id } => {
                info!("Transport connected to {}", device_id);
                if let Some(action) = self.dispatch(AdapterEvent::TransportConnected) {
                    let _ = self.perform(action);
                }
            }
            TransportEvent::Disconnected { reason } => {
                if let Some(action) = self.dispatch(AdapterEvent::TransportLost(reason)) {
                    let _ = self.perform(action);
                }
            }
        }
    }

    // Actions

    fn perform(self: &Arc<Self>, action: AdapterAction) -> Result<(), ProtocolError> {
        match action {
            AdapterAction::Scan => {
                self.snapshot.send_modify(|s| s.devices.clear());
                if let Err(e) = self.transport().start_scan() {
                    return self.link_failed(e);
                }
                Ok(())
            }
            AdapterAction::Connect(device_id) => {
                self.transport().stop_scan();
                self.snapshot
                    .send_modify(|s| s.device_id = Some(device_id.clone()));
                info!("Connecting to {}", device_id);
                if let Err(e) = self.transport().connect(&device_id) {
                    return self.link_failed(e);
                }
                Ok(())
            }
            AdapterAction::Initialize | AdapterAction::Reinitialize => {
                self.start_worker();
                Ok(())
            }
            // The worker moves on to polling by itself
            AdapterAction::StartPolling => Ok(()),
            AdapterAction::Teardown { rescan } | AdapterAction::Failed { rescan } => {
                self.teardown();
                if rescan {
                    self.schedule_reconnect();
                }
                Ok(())
            }
        }
    }

    fn link_failed(self: &Arc<Self>, error: ProtocolError) -> Result<(), ProtocolError> {
        warn!("Link request failed: {}", error);
        if let Some(action) = self.dispatch(AdapterEvent::ConnectFailed(error.to_string())) {
            self.perform(action)?;
        }
        Err(error)
    }

    fn teardown(&self) {
        let transport = self.transport();
        transport.stop_scan();
        self.stop_worker();
        self.channel.cancel_pending();
        if transport.is_connected() {
            transport.disconnect();
        }
        // Consumers fall back to idle rather than holding the last reading
        lock(&self.conditioner).reset();
        self.signal.send_replace(ConditionedSignal::default());
        self.snapshot.send_modify(|s| {
            s.raw_rpm = None;
            s.active_pid = None;
            s.rpm = 0.0;
            s.throttle = 0.0;
        });
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let token = {
            let mut slot = lock(&self.reconnect);
            if slot.is_some() {
                debug!("Reconnect already scheduled");
                return;
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };

        let delay = self.config.reconnect_delay();
        info!("Reconnecting in {}ms", delay.as_millis());
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(session) = weak.upgrade() else {
                return;
            };
            lock(&session.reconnect).take();
            if let Err(e) = session.reconnect() {
                warn!("Reconnect attempt failed: {}", e);
            }
        });
    }

    // Worker: initialization then polling

    fn start_worker(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => debug!("Adapter worker cancelled"),
                _ = Self::drive(weak) => {}
            }
        });

        let previous = lock(&self.worker).replace(Worker {
            cancel,
            _handle: handle,
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    fn stop_worker(&self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.cancel.cancel();
        }
    }

    /// The session is only upgraded per step, never across the poll sleep,
    /// so dropping the last handle ends the worker.
    async fn drive(weak: Weak<Self>) {
        loop {
            let Some(session) = weak.upgrade() else {
                return;
            };
            if !session.bring_up().await {
                return;
            }
            drop(session);

            loop {
                let Some(session) = weak.upgrade() else {
                    debug!("Adapter session dropped, worker exiting");
                    return;
                };
                if session.poll_tick().await {
                    break;
                }
                let interval = session.config.poll_interval();
                drop(session);
                tokio::time::sleep(interval).await;
            }
        }
    }

    /// Initialize and hand over to polling; false when the worker should stop
    async fn bring_up(self: &Arc<Self>) -> bool {
        if let Err(e) = self.initialize().await {
            if matches!(e, ProtocolError::Cancelled) {
                return false;
            }
            error!("Adapter initialization failed: {}", e);
            if let Some(action) = self.dispatch(AdapterEvent::InitFailed(e.to_string())) {
                let _ = self.perform(action);
            }
            return false;
        }

        if self.dispatch(AdapterEvent::InitSucceeded) != Some(AdapterAction::StartPolling) {
            return false;
        }
        self.remember_device();
        true
    }

    async fn initialize(&self) -> Result<(), ProtocolError> {
        self.snapshot.send_modify(|s| s.active_pid = None);
        lock(&self.conditioner).reset();

        for command in init_sequence(&self.config.protocol, &self.config.header) {
            if command.is_reset() {
                match self.channel.submit(&command, self.config.reset_timeout()).await {
                    Ok(banner) => debug!("Adapter reset: {:?}", banner),
                    Err(ProtocolError::Timeout { .. }) => {
                        warn!("No reply to {}, continuing after settle delay", command)
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(self.config.reset_settle()).await;
                continue;
            }

            let response = match self.channel.submit(&command, self.config.command_timeout()).await {
                Ok(response) => response,
                Err(ProtocolError::Timeout { command }) => {
                    return Err(ProtocolError::InitializationFailed {
                        command,
                        response: "no response".to_string(),
                    });
                }
                Err(e) => return Err(e),
            };

            if contains_error_marker(&response) {
                return Err(ProtocolError::InitializationFailed {
                    command: command.text(),
                    response,
                });
            }
            debug!("{} -> {:?}", command, response);
        }

        info!("Adapter initialized");
        Ok(())
    }

    fn remember_device(&self) {
        let Some(memory) = &self.memory else {
            return;
        };
        let device_id = self.snapshot.borrow().device_id.clone();
        if let Some(device_id) = device_id {
            if let Err(e) = memory.remember(&device_id) {
                warn!("Could not persist last device: {}", e);
            }
        }
    }

    /// One polling tick; true when the miss threshold asks for re-initialization
    async fn poll_tick(&self) -> bool {
        match self.poll_once().await {
            Ok(rpm) => {
                self.record_sample(rpm);
                self.dispatch(AdapterEvent::PollSucceeded);
                false
            }
            Err(e) if e.is_recoverable_miss() => {
                debug!("Polling miss: {}", e);
                self.dispatch(AdapterEvent::PollMissed) == Some(AdapterAction::Reinitialize)
            }
            // Link trouble is reported by the transport; skip the tick
            Err(e) => {
                debug!("Poll skipped: {}", e);
                false
            }
        }
    }

    /// One polling tick: the locked PID, or each candidate in turn
    async fn poll_once(&self) -> Result<u32, ProtocolError> {
        let locked = self.snapshot.borrow().active_pid;
        let candidates = match locked {
            Some(pid) => vec![pid],
            None => RpmPid::ALL.to_vec(),
        };

        let mut last_miss = None;
        for pid in candidates {
            let response = match self
                .channel
                .submit(&AdapterCommand::Poll(pid), self.config.command_timeout())
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_recoverable_miss() => {
                    last_miss = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Only a reply in the layout of the PID just sent may lock it
            match decode_pid(&response, Some(pid)) {
                Some((decoded, value)) if decoded == pid => {
                    if locked.is_none() {
                        info!("Polling PID {}", pid);
                        self.snapshot.send_modify(|s| s.active_pid = Some(pid));
                    }
                    return Ok(value.unsigned_abs());
                }
                Some((decoded, _)) => {
                    debug!("Reply to {} is a {} response: {:?}", pid, decoded, response);
                    last_miss = Some(ProtocolError::UnrecognizedResponse(response));
                }
                None => last_miss = Some(ProtocolError::UnrecognizedResponse(response)),
            }
        }

        Err(last_miss.unwrap_or_else(|| ProtocolError::UnrecognizedResponse(String::new())))
    }

    fn record_sample(&self, rpm: u32) {
        let sample = RpmSample::new(f64::from(rpm), self.epoch.elapsed());
        let conditioned = lock(&self.conditioner).push(sample);
        self.signal.send_replace(conditioned);
        self.snapshot.send_modify(|s| {
            s.raw_rpm = Some(rpm);
            s.rpm = conditioned.rpm;
            s.throttle = conditioned.throttle;
        });
    }
}

impl Drop for AdapterSession {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.cancel.cancel();
        }
        if let Some(token) = lock(&self.reconnect).take() {
            token.cancel();
        }
    }
}
