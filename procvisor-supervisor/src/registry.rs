use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use procvisor_core::{Error, ProcessId, ProcessInfo, ProcessRecord, Result};
use std::sync::Arc;

/// Concurrent map from process id to record.
///
/// Entries are sharded, so lifecycle work on one id never waits on another.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    records: Arc<DashMap<ProcessId, Arc<ProcessRecord>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: Arc<ProcessRecord>) -> Result<()> {
        match self.records.entry(record.id().clone()) {
            Entry::Occupied(entry) => Err(Error::DuplicateId(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &ProcessId) -> Option<Arc<ProcessRecord>> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &ProcessId) -> bool {
        self.records.contains_key(id)
    }

    pub fn remove(&self, id: &ProcessId) -> Option<Arc<ProcessRecord>> {
        self.records.remove(id).map(|(_, record)| record)
    }

    /// Live records at this instant. Later mutation of the map does not
    /// affect the returned vector.
    pub fn records(&self) -> Vec<Arc<ProcessRecord>> {
        self.records
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Point-in-time copies of every record.
    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        self.records()
            .iter()
            .map(|record| record.snapshot())
            .collect()
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<Arc<ProcessRecord>> {
        self.records
            .iter()
            .find(|entry| entry.value().pid() == pid)
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
