//! State store port.
//!
//! Uses `anyhow::Result` because storage errors are adapter-specific; the
//! orchestrator turns any failure into `stateStoreFailed`. Saving is not
//! atomic with the snapshot copy, so a snapshot may exist without a record.

use crate::naming::MachineId;
use crate::record::SyncRecord;
use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::Mutex;

pub trait StateStore: Send + Sync {
    fn load(&self, machine: &MachineId) -> anyhow::Result<Option<SyncRecord>>;

    /// Insert or replace the record for `record.machine_id`
    fn save(&self, record: &SyncRecord) -> anyhow::Result<()>;
}

/// Process-local store, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<MachineId, SyncRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, machine: &MachineId) -> anyhow::Result<Option<SyncRecord>> {
        let records = self.records.lock().map_err(|_| anyhow!("state store lock poisoned"))?;
        Ok(records.get(machine).cloned())
    }

    fn save(&self, record: &SyncRecord) -> anyhow::Result<()> {
        let mut records = self.records.lock().map_err(|_| anyhow!("state store lock poisoned"))?;
        records.insert(record.machine_id.clone(), record.clone());
        Ok(())
    }
}
