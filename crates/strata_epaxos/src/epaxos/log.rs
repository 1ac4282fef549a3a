//! Durable instance records.
//!
//! The engine has two durability points: an instance must be persisted
//! before any message referencing it leaves the node, and a commit must be
//! persisted before the commit event fires. Implementations only need
//! last-record-wins semantics per instance id.

use std::collections::HashMap;
use std::sync::Mutex;

use super::instance::InstanceSnapshot;
use super::types::InstanceId;

/// What gets persisted per instance. Deadlines are runtime-only state and
/// are deliberately not part of the record.
pub type InstanceRecord = InstanceSnapshot;

pub trait InstanceLog: Send + Sync + 'static {
    fn save_instance(&self, record: &InstanceRecord) -> anyhow::Result<()>;

    fn load_instances(&self) -> anyhow::Result<Vec<InstanceRecord>>;
}

/// In-memory log for tests and single-process embeddings.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Mutex<HashMap<InstanceId, InstanceRecord>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InstanceLog for MemoryLog {
    fn save_instance(&self, record: &InstanceRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .expect("log lock poisoned")
            .insert(record.id, record.clone());
        Ok(())
    }

    fn load_instances(&self) -> anyhow::Result<Vec<InstanceRecord>> {
        Ok(self
            .records
            .lock()
            .expect("log lock poisoned")
            .values()
            .cloned()
            .collect())
    }
}
