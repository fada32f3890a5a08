use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::{
    error::PersistError,
    vp::{fit_text, VpAddress, VpKind, VpValue, VP_TABLE},
};

/// Non-volatile backing for the VP store, one entry per address.
pub trait Persistence: Send {
    fn load(&mut self, key: &str, kind: VpKind) -> Result<Option<VpValue>, PersistError>;
    fn save(&mut self, key: &str, value: &VpValue) -> Result<(), PersistError>;
}

#[derive(Debug, Clone)]
struct VpEntry {
    address: VpAddress,
    value: VpValue,
}

/// The in-memory VP table. It does no locking of its own; share it through [`SharedStore`].
pub struct VpStore {
    entries: Vec<VpEntry>,
    hostname_default: String,
    persistence: Box<dyn Persistence>,
}

impl VpStore {
    pub fn new(persistence: Box<dyn Persistence>, hostname_default: String) -> Self {
        let entries = VP_TABLE
            .iter()
            .map(|item| VpEntry {
                address: item.address,
                value: default_value(item.address, &hostname_default),
            })
            .collect();

        Self {
            entries,
            hostname_default,
            persistence,
        }
    }

    /// Loads every entry, substituting defaults for missing or unreadable values.
    /// Returns how many entries came from storage.
    pub fn load_all(&mut self) -> usize {
        let mut loaded = 0;
        for entry in &mut self.entries {
            let key = entry.address.storage_key();
            let kind = entry.address.kind();
            let value = match self.persistence.load(&key, kind) {
                Ok(Some(value)) if value.matches(kind) => {
                    loaded += 1;
                    normalize(value, kind)
                }
                Ok(Some(_)) => {
                    warn!("stored value for {key} has the wrong kind, using default");
                    default_value(entry.address, &self.hostname_default)
                }
                Ok(None) => default_value(entry.address, &self.hostname_default),
                Err(err) => {
                    warn!("failed to load {key}: {err}");
                    default_value(entry.address, &self.hostname_default)
                }
            };
            entry.value = value;
        }
        loaded
    }

    /// Writes every entry. Returns false if any write failed.
    pub fn save_all(&mut self) -> bool {
        let mut ok = true;
        for entry in &self.entries {
            let key = entry.address.storage_key();
            if let Err(err) = self.persistence.save(&key, &entry.value) {
                warn!("failed to save {key}: {err}");
                ok = false;
            }
        }
        ok
    }

    pub fn save_one(&mut self, address: VpAddress) -> bool {
        let key = address.storage_key();
        let Some(entry) = self.entries.get(address as usize) else {
            return false;
        };
        match self.persistence.save(&key, &entry.value) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to save {key}: {err}");
                false
            }
        }
    }

    pub fn get(&self, address: VpAddress) -> &VpValue {
        &self.entries[address as usize].value
    }

    /// Returns 0 for text addresses.
    pub fn get_uint(&self, address: VpAddress) -> u8 {
        match self.get(address) {
            VpValue::Uint(value) => *value,
            VpValue::Text(_) => 0,
        }
    }

    /// In-memory write; persist with [`VpStore::save_one`]. False for text addresses.
    pub fn set_uint(&mut self, address: VpAddress, value: u8) -> bool {
        let entry = &mut self.entries[address as usize];
        match entry.value {
            VpValue::Uint(ref mut current) => {
                *current = value;
                true
            }
            VpValue::Text(_) => false,
        }
    }

    /// Returns an empty string for numeric addresses.
    pub fn get_string(&self, address: VpAddress) -> &str {
        match self.get(address) {
            VpValue::Text(value) => value,
            VpValue::Uint(_) => "",
        }
    }

    /// In-memory write, truncated to the field capacity. False for numeric addresses.
    pub fn set_string(&mut self, address: VpAddress, value: &str) -> bool {
        let VpKind::Text { capacity } = address.kind() else {
            return false;
        };
        self.entries[address as usize].value = VpValue::Text(fit_text(value, capacity));
        true
    }

    /// The event-driven write path. Compares against the current value; only a real change
    /// updates memory and persists that single entry. Returns whether anything changed.
    pub fn sync(&mut self, address: VpAddress, value: VpValue) -> bool {
        let kind = address.kind();
        if !value.matches(kind) {
            debug!("sync for {} ignored: kind mismatch", address.as_str());
            return false;
        }

        let incoming = normalize(value, kind);
        let entry = &mut self.entries[address as usize];
        if entry.value == incoming {
            return false;
        }

        entry.value = incoming;
        let key = address.storage_key();
        if let Err(err) = self.persistence.save(&key, &entry.value) {
            warn!("failed to persist {key} after change: {err}");
        }
        true
    }

    pub fn entries(&self) -> impl Iterator<Item = (VpAddress, &VpValue)> {
        self.entries.iter().map(|entry| (entry.address, &entry.value))
    }
}

fn normalize(value: VpValue, kind: VpKind) -> VpValue {
    match (value, kind) {
        (VpValue::Text(text), VpKind::Text { capacity }) => VpValue::Text(fit_text(&text, capacity)),
        (value, _) => value,
    }
}

fn default_value(address: VpAddress, hostname_default: &str) -> VpValue {
    match address.kind() {
        VpKind::Text { capacity } if address == VpAddress::Hostname => {
            VpValue::Text(fit_text(hostname_default, capacity))
        }
        kind => VpValue::default_for(kind),
    }
}

/// The single cross-task handle to the VP store.
///
/// Every method takes the lock for exactly one operation. Use [`SharedStore::with`] for a
/// read-modify-write sequence; never perform device or network I/O inside it.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<VpStore>>,
}

impl SharedStore {
    pub fn new(store: VpStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut VpStore) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    pub fn get(&self, address: VpAddress) -> VpValue {
        self.lock().get(address).clone()
    }

    pub fn get_uint(&self, address: VpAddress) -> u8 {
        self.lock().get_uint(address)
    }

    pub fn get_string(&self, address: VpAddress) -> String {
        self.lock().get_string(address).to_string()
    }

    pub fn sync(&self, address: VpAddress, value: VpValue) -> bool {
        self.lock().sync(address, value)
    }

    pub fn snapshot(&self) -> Vec<(VpAddress, VpValue)> {
        self.lock()
            .entries()
            .map(|(address, value)| (address, value.clone()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, VpStore> {
        // A panicked holder cannot leave an entry half-written, so the data stays usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
