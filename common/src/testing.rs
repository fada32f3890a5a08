use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    error::{DisplayError, OutputError, PersistError},
    hmi::{DisplayDriver, RelayOutputs},
    store::{Persistence, SharedStore, VpStore},
    vp::{VpKind, VpValue},
};

#[derive(Default)]
struct MemoryInner {
    values: HashMap<String, VpValue>,
    saves: usize,
    fail_saves: bool,
}

/// Clonable in-memory backend; clones share state so tests can inspect what was written.
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryPersistence {
    pub fn insert(&self, key: &str, value: VpValue) {
        self.inner.lock().unwrap().values.insert(key.to_string(), value);
    }

    pub fn stored(&self, key: &str) -> Option<VpValue> {
        self.inner.lock().unwrap().values.get(key).cloned()
    }

    pub fn save_count(&self) -> usize {
        self.inner.lock().unwrap().saves
    }

    pub fn fail_saves(&self, fail: bool) {
        self.inner.lock().unwrap().fail_saves = fail;
    }
}

impl Persistence for MemoryPersistence {
    fn load(&mut self, key: &str, _kind: VpKind) -> Result<Option<VpValue>, PersistError> {
        Ok(self.inner.lock().unwrap().values.get(key).cloned())
    }

    fn save(&mut self, key: &str, value: &VpValue) -> Result<(), PersistError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_saves {
            return Err(PersistError::Backend("flash unavailable".to_string()));
        }
        inner.saves += 1;
        inner.values.insert(key.to_string(), value.clone());
        Ok(())
    }
}

pub fn shared_store() -> (SharedStore, MemoryPersistence) {
    let persistence = MemoryPersistence::default();
    let store = VpStore::new(Box::new(persistence.clone()), "GB0001".to_string());
    (SharedStore::new(store), persistence)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelWrite {
    Value(u16, u8),
    Text(u16, String),
}

#[derive(Clone, Default)]
pub struct RecordingDisplay {
    pub writes: Arc<Mutex<Vec<PanelWrite>>>,
    pub fail: bool,
}

impl RecordingDisplay {
    pub fn take(&self) -> Vec<PanelWrite> {
        std::mem::take(&mut *self.writes.lock().unwrap())
    }
}

impl DisplayDriver for RecordingDisplay {
    fn set_value(&mut self, address: u16, value: u8) -> Result<(), DisplayError> {
        if self.fail {
            return Err(DisplayError::Write {
                address,
                reason: "uart busy".to_string(),
            });
        }
        self.writes
            .lock()
            .unwrap()
            .push(PanelWrite::Value(address, value));
        Ok(())
    }

    fn set_text(&mut self, address: u16, text: &str) -> Result<(), DisplayError> {
        if self.fail {
            return Err(DisplayError::Write {
                address,
                reason: "uart busy".to_string(),
            });
        }
        self.writes
            .lock()
            .unwrap()
            .push(PanelWrite::Text(address, text.to_string()));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingRelays {
    pub writes: Arc<Mutex<Vec<(u8, bool)>>>,
}

impl RecordingRelays {
    pub fn take(&self) -> Vec<(u8, bool)> {
        std::mem::take(&mut *self.writes.lock().unwrap())
    }
}

impl RelayOutputs for RecordingRelays {
    fn write(&mut self, pin: u8, on: bool) -> Result<(), OutputError> {
        self.writes.lock().unwrap().push((pin, on));
        Ok(())
    }
}
