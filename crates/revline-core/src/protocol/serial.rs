//! Serial port transport
//!
//! USB and Bluetooth-classic (RFCOMM) ELM327 adapters show up as serial
//! ports. Scanning lists ports; connecting opens one and runs a reader task
//! that forwards inbound chunks and a writer task fed from a queue.

use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serialport::{SerialPortInfo, SerialPortType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ByteTransport, DeviceInfo, ProtocolError, TransportEvent, TransportEventSender,
    DEFAULT_BAUD_RATE,
};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "/dev/rfcomm0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }

    fn to_device(&self) -> DeviceInfo {
        let device = DeviceInfo::new(&self.name);
        match (&self.manufacturer, &self.product) {
            (_, Some(product)) => device.with_name(product),
            (Some(manufacturer), None) => device.with_name(manufacturer),
            (None, None) => device,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
            ),
            _ => (None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
        }
    }
}

/// Sort key: ttyACM*, then ttyUSB*, then rfcomm* (each numerically), then
/// everything else by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in [(0, "ttyACM"), (1, "ttyUSB"), (2, "rfcomm")] {
        if let Some(rest) = basename.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank, num, basename.to_string());
        }
    }
    (3, 0, basename.to_string())
}

/// List available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Bound RFCOMM devices are often missing from enumeration
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if ["ttyACM", "ttyUSB", "rfcomm"]
                    .iter()
                    .any(|prefix| fname.starts_with(prefix))
                {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

struct SerialLink {
    port: String,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// [`ByteTransport`] over a serial port (8N1, no flow control)
pub struct SerialTransport {
    baud_rate: u32,
    events: TransportEventSender,
    link: Mutex<Option<SerialLink>>,
}

impl SerialTransport {
    pub fn new(baud_rate: u32, events: TransportEventSender) -> Self {
        Self {
            baud_rate: if baud_rate == 0 { DEFAULT_BAUD_RATE } else { baud_rate },
            events,
            link: Mutex::new(None),
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Name of the open port
    pub fn port(&self) -> Option<String> {
        self.lock_link().as_ref().map(|l| l.port.clone())
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<SerialLink>> {
        self.link.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl ByteTransport for SerialTransport {
    fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let link = self.lock_link();
        match link.as_ref() {
            Some(link) if link.alive.load(Ordering::SeqCst) => link
                .writer
                .send(bytes.to_vec())
                .map_err(|_| ProtocolError::NotConnected),
            _ => Err(ProtocolError::NotConnected),
        }
    }

    fn start_scan(&self) -> Result<(), ProtocolError> {
        let ports = list_ports();
        debug!("Found {} serial ports", ports.len());
        for port in &ports {
            let _ = self
                .events
                .send(TransportEvent::DeviceDiscovered(port.to_device()));
        }
        Ok(())
    }

    fn connect(&self, device_id: &str) -> Result<(), ProtocolError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;

        self.disconnect();

        let stream = tokio_serial::new(device_id, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| match e.kind {
                tokio_serial::ErrorKind::NoDevice => ProtocolError::PortNotFound(device_id.to_string()),
                _ => ProtocolError::Transport(e.to_string()),
            })?;
        info!("Opened {} at {} baud", device_id, self.baud_rate);

        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let events = self.events.clone();
        let reader_alive = alive.clone();
        let reader_cancel = cancel.clone();
        runtime.spawn(async move {
            let mut buf = [0u8; 512];
            let reason = loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break None,
                    read = reader.read(&mut buf) => match read {
                        Ok(0) => break Some("port closed".to_string()),
                        Ok(n) => {
                            let _ = events.send(TransportEvent::Data(buf[..n].to_vec()));
                        }
                        Err(e) => break Some(e.to_string()),
                    }
                }
            };
            reader_alive.store(false, Ordering::SeqCst);
            let _ = events.send(TransportEvent::Disconnected { reason });
        });

        let writer_cancel = cancel.clone();
        runtime.spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!("Serial write failed: {}", e);
                    writer_cancel.cancel();
                    break;
                }
            }
        });

        *self.lock_link() = Some(SerialLink {
            port: device_id.to_string(),
            writer: tx,
            alive,
            cancel,
        });

        let _ = self.events.send(TransportEvent::Connected {
            device_id: device_id.to_string(),
        });
        Ok(())
    }

    fn disconnect(&self) {
        if let Some(link) = self.lock_link().take() {
            debug!("Closing {}", link.port);
            // Reader task reports Disconnected on its way out
            link.cancel.cancel();
        }
    }

    fn is_connected(&self) -> bool {
        self.lock_link()
            .as_ref()
            .is_some_and(|l| l.alive.load(Ordering::SeqCst))
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::event_channel;

    #[test]
    fn test_list_ports() {
        // Only checks enumeration does not panic on this host
        let _ = list_ports();
    }

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyUSB1",
            "/dev/rfcomm0",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        let mut ports: Vec<PortInfo> = names
            .into_iter()
            .map(|n| PortInfo::bare(n.to_string()))
            .collect();
        ports.sort_by_key(|p| port_sort_key(&p.name));
        let sorted: Vec<&str> = ports.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            sorted,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/rfcomm0",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_device_name_prefers_product() {
        let mut port = PortInfo::bare("/dev/ttyUSB0".into());
        assert_eq!(port.to_device().name, None);
        port.manufacturer = Some("FTDI".into());
        assert_eq!(port.to_device().name.as_deref(), Some("FTDI"));
        port.product = Some("OBDLink SX".into());
        assert_eq!(port.to_device().name.as_deref(), Some("OBDLink SX"));
    }

    #[test]
    fn test_write_without_link() {
        let (tx, _rx) = event_channel();
        let transport = SerialTransport::new(38400, tx);
        assert!(!transport.is_connected());
        assert!(matches!(transport.write(b"ATZ\r"), Err(ProtocolError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_to_missing_port_fails() {
        let (tx, mut rx) = event_channel();
        let transport = SerialTransport::new(0, tx);
        assert_eq!(transport.baud_rate(), DEFAULT_BAUD_RATE);
        assert!(transport.connect("/dev/revline-no-such-port").is_err());
        assert!(!transport.is_connected());
        assert!(rx.try_recv().is_err());
    }
}
