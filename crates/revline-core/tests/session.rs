//! Adapter session behavior against a scripted ELM327

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use revline_core::config::{AdapterConfig, SignalConfig};
use revline_core::demo::ev_speed_response;
use revline_core::protocol::{
    event_channel, AdapterSession, ByteTransport, ConnectionState, ProtocolError, RpmPid,
    SessionSnapshot, TransportEvent, TransportEventSender,
};
use revline_core::signal::ConditionedSignal;
use revline_core::store::{DeviceMemory, MemoryStore};

#[derive(Clone)]
enum Reply {
    Text(String),
    Delayed(String, Duration),
    Silent,
}

/// Adapter that records every command and answers from a script.
/// Unscripted AT commands answer OK, anything else NO DATA.
struct ScriptedAdapter {
    events: TransportEventSender,
    writes: Mutex<Vec<String>>,
    script: Mutex<HashMap<String, Reply>>,
    once: Mutex<HashMap<String, Reply>>,
    connected: AtomicBool,
    answer_connect: AtomicBool,
    connects: AtomicUsize,
}

impl ScriptedAdapter {
    fn new(events: TransportEventSender) -> Arc<Self> {
        Arc::new(Self {
            events,
            writes: Mutex::new(Vec::new()),
            script: Mutex::new(HashMap::new()),
            once: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            answer_connect: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
        })
    }

    fn reply(&self, command: &str, reply: Reply) {
        self.script.lock().unwrap().insert(command.to_string(), reply);
    }

    /// Answer the next `command` only; the script applies afterwards
    fn reply_once(&self, command: &str, reply: Reply) {
        self.once.lock().unwrap().insert(command.to_string(), reply);
    }

    fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Disconnected {
            reason: Some("link supervision timeout".into()),
        });
    }
}

impl ByteTransport for ScriptedAdapter {
    fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        let command = String::from_utf8_lossy(bytes).trim().to_string();
        self.writes.lock().unwrap().push(command.clone());

        let once = self.once.lock().unwrap().remove(&command);
        let reply = once.or_else(|| self.script.lock().unwrap().get(&command).cloned());
        let reply = reply.unwrap_or_else(|| {
            if command.starts_with("AT") {
                Reply::Text("OK".into())
            } else {
                Reply::Text("NO DATA".into())
            }
        });
        match reply {
            Reply::Text(text) => notify(&self.events, &text),
            Reply::Delayed(text, delay) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    notify(&events, &text);
                });
            }
            Reply::Silent => {}
        }
        Ok(())
    }

    fn start_scan(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn connect(&self, device_id: &str) -> Result<(), ProtocolError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.answer_connect.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::Connected {
                device_id: device_id.to_string(),
            });
        }
        Ok(())
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected { reason: None });
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Split across two chunks like a BLE notification would
fn notify(events: &TransportEventSender, text: &str) {
    let framed = format!("{}\r\r>", text);
    let (head, tail) = framed.as_bytes().split_at(framed.len() / 2);
    let _ = events.send(TransportEvent::Data(head.to_vec()));
    let _ = events.send(TransportEvent::Data(tail.to_vec()));
}

const INIT: [&str; 5] = ["ATZ", "ATE0", "ATL0", "ATSP6", "ATSH7E4"];

fn manual_config() -> AdapterConfig {
    AdapterConfig {
        auto_reconnect: false,
        ..AdapterConfig::default()
    }
}

fn setup(
    config: AdapterConfig,
    memory: Option<DeviceMemory>,
) -> (Arc<AdapterSession>, Arc<ScriptedAdapter>) {
    let (tx, rx) = event_channel();
    let adapter = ScriptedAdapter::new(tx);
    let session = AdapterSession::new(config, &SignalConfig::default(), adapter.clone(), memory);
    session.attach(rx);
    (session, adapter)
}

async fn wait_until<F>(session: &AdapterSession, pred: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    let mut rx = session.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(pred))
        .await
        .expect("timed out waiting for session state")
        .expect("session dropped")
        .clone();
    snapshot
}

async fn wait_for_writes<F>(adapter: &ScriptedAdapter, pred: F) -> Vec<String>
where
    F: Fn(&[String]) -> bool,
{
    for _ in 0..6000 {
        let writes = adapter.writes();
        if pred(&writes) {
            return writes;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for writes: {:?}", adapter.writes());
}

fn count(writes: &[String], command: &str) -> usize {
    writes.iter().filter(|w| *w == command).count()
}

#[tokio::test(start_paused = true)]
async fn test_connect_initializes_then_polls_ev_pid() {
    let memory = DeviceMemory::new(Arc::new(MemoryStore::new()));
    let (session, adapter) = setup(manual_config(), Some(memory.clone()));
    adapter.reply("220101", Reply::Text(ev_speed_response(-200)));

    session.connect("OBDII").unwrap();
    let snapshot = wait_until(&session, |s| s.raw_rpm.is_some()).await;

    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.raw_rpm, Some(200));
    assert_eq!(snapshot.rpm, 200.0);
    assert_eq!(snapshot.active_pid, Some(RpmPid::ElectricPrimary));
    assert_eq!(snapshot.device_id.as_deref(), Some("OBDII"));

    let writes = adapter.writes();
    assert_eq!(&writes[..5], &INIT);
    assert_eq!(writes[5], "220101");
    assert_eq!(memory.last_device().as_deref(), Some("OBDII"));
    assert!(memory.last_connected_at().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_to_standard_pid() {
    let (session, adapter) = setup(manual_config(), None);
    adapter.reply("010C", Reply::Text("41 0C 1A F8".into()));

    session.connect("OBDII").unwrap();
    let snapshot = wait_until(&session, |s| s.raw_rpm.is_some()).await;
    assert_eq!(snapshot.raw_rpm, Some(1726));
    assert_eq!(snapshot.active_pid, Some(RpmPid::Standard));

    // Locked in: later ticks skip the EV PIDs
    let writes = wait_for_writes(&adapter, |w| count(w, "010C") >= 3).await;
    assert_eq!(count(&writes, "220101"), 1);
    assert_eq!(count(&writes, "2101"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_three_missed_ticks_replay_init_sequence() {
    let (session, adapter) = setup(manual_config(), None);

    session.connect("OBDII").unwrap();
    let writes = wait_for_writes(&adapter, |w| count(w, "ATZ") >= 2).await;

    // Three ticks of all three PIDs, then the full sequence again
    let polls: Vec<&str> = writes[5..14].iter().map(String::as_str).collect();
    assert_eq!(
        polls,
        vec!["220101", "2101", "010C", "220101", "2101", "010C", "220101", "2101", "010C"]
    );
    assert_eq!(writes[14], "ATZ");

    let writes = wait_for_writes(&adapter, |w| w.len() >= 19).await;
    assert_eq!(&writes[14..19], &INIT);
    wait_until(&session, |s| s.state == ConnectionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_on_locked_pid_trigger_reinitialization() {
    let (session, adapter) = setup(manual_config(), None);
    adapter.reply("220101", Reply::Text(ev_speed_response(1500)));

    session.connect("OBDII").unwrap();
    wait_until(&session, |s| s.raw_rpm == Some(1500)).await;
    adapter.reply("220101", Reply::Silent);

    let writes = wait_for_writes(&adapter, |w| count(w, "ATZ") >= 2).await;
    let second_reset = writes.iter().rposition(|w| w == "ATZ").unwrap();
    assert!(writes[second_reset - 3..second_reset]
        .iter()
        .all(|w| w == "220101"));
    assert!(session.channel_stats().timeouts >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_error_marker_aborts_initialization() {
    let (session, adapter) = setup(manual_config(), None);
    adapter.reply("ATSP6", Reply::Text("?".into()));

    session.connect("OBDII").unwrap();
    let snapshot = wait_until(&session, |s| matches!(s.state, ConnectionState::Error(_))).await;

    assert_eq!(
        snapshot.state.to_string(),
        "Error: Initialization failed at 'ATSP6': ?"
    );
    assert_eq!(adapter.writes(), vec!["ATZ", "ATE0", "ATL0", "ATSP6"]);
    assert!(!adapter.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_reset_banner_is_not_checked_for_errors() {
    let (session, adapter) = setup(manual_config(), None);
    adapter.reply("ATZ", Reply::Text("?ELM327 v2.1 ERROR".into()));

    session.connect("OBDII").unwrap();
    let snapshot = wait_until(&session, |s| {
        !matches!(s.state, ConnectionState::Connecting | ConnectionState::Initializing)
    })
    .await;
    assert_eq!(snapshot.state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_silent_reset_waits_for_timeout_and_settles() {
    let (session, adapter) = setup(manual_config(), None);
    adapter.reply("ATZ", Reply::Silent);

    let started = tokio::time::Instant::now();
    session.connect("OBDII").unwrap();
    wait_for_writes(&adapter, |w| w.len() >= 2).await;

    // 2500 ms reset timeout plus 1000 ms settle before ATE0 goes out
    assert!(started.elapsed() >= Duration::from_millis(3500));
    wait_until(&session, |s| s.state == ConnectionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_releases_in_flight_command() {
    let (session, adapter) = setup(manual_config(), None);
    adapter.reply("ATE0", Reply::Silent);

    session.connect("OBDII").unwrap();
    wait_for_writes(&adapter, |w| w.contains(&"ATE0".to_string())).await;

    session.disconnect();
    session.disconnect();
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!adapter.is_connected());

    // Nothing is left waiting on the old command; a new session comes up
    adapter.reply("ATE0", Reply::Text("OK".into()));
    session.connect("OBDII").unwrap();
    let snapshot = wait_until(&session, |s| s.state == ConnectionState::Connected).await;
    assert_eq!(snapshot.device_id.as_deref(), Some("OBDII"));
}

#[tokio::test(start_paused = true)]
async fn test_second_connect_is_rejected_while_connecting() {
    let (session, adapter) = setup(manual_config(), None);
    adapter.answer_connect.store(false, Ordering::SeqCst);

    session.connect("OBDII").unwrap();
    assert_eq!(session.state(), ConnectionState::Connecting);
    assert!(matches!(
        session.connect("OBDII"),
        Err(ProtocolError::AlreadyConnecting)
    ));
    assert_eq!(adapter.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_reconnects_when_enabled() {
    let config = AdapterConfig {
        auto_reconnect: true,
        reconnect_delay_ms: 2000,
        ..AdapterConfig::default()
    };
    let (session, adapter) = setup(config, None);
    adapter.reply("220101", Reply::Text(ev_speed_response(900)));

    session.connect("OBDII").unwrap();
    wait_until(&session, |s| s.raw_rpm.is_some()).await;

    adapter.drop_link();
    let snapshot = wait_until(&session, |s| s.state == ConnectionState::Disconnected).await;
    assert_eq!(snapshot.raw_rpm, None);

    wait_until(&session, |s| s.raw_rpm.is_some()).await;
    assert_eq!(adapter.connects.load(Ordering::SeqCst), 2);
    assert_eq!(count(&adapter.writes(), "ATZ"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_ev_reply_does_not_lock_legacy_pid() {
    let (session, adapter) = setup(manual_config(), None);
    adapter.reply("220101", Reply::Text(ev_speed_response(1200)));
    // First 220101 answer lands after its timeout, while 2101 is in flight
    adapter.reply_once(
        "220101",
        Reply::Delayed(ev_speed_response(3000), Duration::from_millis(1100)),
    );
    adapter.reply(
        "2101",
        Reply::Delayed("NO DATA".into(), Duration::from_millis(300)),
    );

    session.connect("OBDII").unwrap();
    let snapshot = wait_until(&session, |s| s.raw_rpm.is_some()).await;
    assert_eq!(snapshot.active_pid, Some(RpmPid::ElectricPrimary));
    assert_eq!(snapshot.raw_rpm, Some(1200));
    assert_eq!(session.channel_stats().stray_responses, 1);
    assert_eq!(count(&adapter.writes(), "ATZ"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_resets_signal_to_idle() {
    let (session, adapter) = setup(manual_config(), None);
    adapter.reply("220101", Reply::Text(ev_speed_response(2500)));

    session.connect("OBDII").unwrap();
    let snapshot = wait_until(&session, |s| s.raw_rpm.is_some()).await;
    assert!(snapshot.rpm > 0.0);
    assert!(session.signal().borrow().rpm > 0.0);

    adapter.drop_link();
    let snapshot = wait_until(&session, |s| s.state == ConnectionState::Disconnected).await;
    assert_eq!(snapshot.rpm, 0.0);
    assert_eq!(snapshot.throttle, 0.0);
    assert_eq!(*session.signal().borrow(), ConditionedSignal::default());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_session_stops_polling() {
    let (session, adapter) = setup(manual_config(), None);
    adapter.reply("220101", Reply::Text(ev_speed_response(900)));

    session.connect("OBDII").unwrap();
    wait_until(&session, |s| s.raw_rpm.is_some()).await;
    drop(session);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let settled = adapter.writes().len();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(adapter.writes().len(), settled);
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_does_not_reconnect() {
    let (session, adapter) = setup(AdapterConfig::default(), None);

    session.connect("OBDII").unwrap();
    wait_until(&session, |s| s.state == ConnectionState::Connected).await;
    session.disconnect();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(adapter.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_raw_shares_the_channel() {
    let (session, adapter) = setup(manual_config(), None);
    adapter.reply("ATRV", Reply::Text("12.6V".into()));

    assert!(matches!(
        session.send_raw("ATRV").await,
        Err(ProtocolError::InvalidState(ConnectionState::Disconnected))
    ));

    session.connect("OBDII").unwrap();
    wait_until(&session, |s| s.state == ConnectionState::Connected).await;
    assert_eq!(session.send_raw("ATRV").await.unwrap(), "12.6V");
}

#[tokio::test(start_paused = true)]
async fn test_resume_uses_remembered_device() {
    let memory = DeviceMemory::new(Arc::new(MemoryStore::new()));
    memory.remember("AA:BB:CC:DD").unwrap();
    let (session, adapter) = setup(manual_config(), Some(memory));

    assert_eq!(session.resume().unwrap().as_deref(), Some("AA:BB:CC:DD"));
    wait_until(&session, |s| s.state == ConnectionState::Connected).await;
    assert_eq!(adapter.connects.load(Ordering::SeqCst), 1);

    let (session, _adapter) = setup(manual_config(), None);
    assert_eq!(session.resume().unwrap(), None);
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_scan_collects_devices() {
    let (session, adapter) = setup(manual_config(), None);
    session.start_scan().unwrap();
    assert_eq!(session.state(), ConnectionState::Scanning);

    use revline_core::protocol::DeviceInfo;
    for id in ["A", "B", "A"] {
        let _ = adapter
            .events
            .send(TransportEvent::DeviceDiscovered(DeviceInfo::new(id)));
    }
    let snapshot = wait_until(&session, |s| s.devices.len() == 2).await;
    let ids: Vec<&str> = snapshot.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B"]);

    session.connect("B").unwrap();
    wait_until(&session, |s| s.state == ConnectionState::Connected).await;
}
