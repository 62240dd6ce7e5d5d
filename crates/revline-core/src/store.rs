//! Small persistent key-value state
//!
//! The only thing persisted across launches is the last adapter the user
//! connected to, so the next launch can reconnect silently.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// String key-value store injected into the session
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> io::Result<()>;

    fn remove(&self, key: &str) -> io::Result<()>;
}

/// In-memory store, for tests and the demo
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object on disk
///
/// The whole map is rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// `<data dir>/revline/state.json`
    pub fn default_path() -> io::Result<PathBuf> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "Could not find app data directory")
            })?;
        Ok(base.join("revline").join("state.json"))
    }

    /// Open the store, creating the parent directory if needed.
    /// A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let values = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        } else {
            BTreeMap::new()
        };

        debug!("Opened state store {} ({} keys)", path.display(), values.len());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, values: &BTreeMap<String, String>) -> io::Result<()> {
        let content = serde_json::to_string_pretty(values)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&self.path, content)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        if values.remove(key).is_some() {
            self.save(&values)?;
        }
        Ok(())
    }
}

const LAST_DEVICE_KEY: &str = "last_device_id";
const LAST_CONNECTED_KEY: &str = "last_connected_at";

/// Remembers the last successfully initialized adapter
#[derive(Clone)]
pub struct DeviceMemory {
    store: Arc<dyn KeyValueStore>,
}

impl DeviceMemory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Record a successful connection to `device_id`
    pub fn remember(&self, device_id: &str) -> io::Result<()> {
        self.store.set(LAST_DEVICE_KEY, device_id)?;
        self.store
            .set(LAST_CONNECTED_KEY, &Utc::now().to_rfc3339())
    }

    /// The device to try on the next launch
    pub fn last_device(&self) -> Option<String> {
        self.store
            .get(LAST_DEVICE_KEY)
            .filter(|id| !id.trim().is_empty())
    }

    /// When the last device was last initialized
    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.store.get(LAST_CONNECTED_KEY)?;
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(t) => Some(t.with_timezone(&Utc)),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", LAST_CONNECTED_KEY, e);
                None
            }
        }
    }

    pub fn forget(&self) -> io::Result<()> {
        self.store.remove(LAST_DEVICE_KEY)?;
        self.store.remove(LAST_CONNECTED_KEY)
    }
}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("last_device", &self.last_device())
            .finish()
    }
}
