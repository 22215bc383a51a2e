//! table.rs — chain membership table
//!
//! Station-side map of the devices a discovery ping found, keyed by UID
//! and listed by position in chain. Owns no I/O; only the owning Reader
//! mutates it, and only after a successful exchange.

use std::collections::HashMap;

use chain_types::DeviceRecord;

#[derive(Debug, Default)]
pub struct ChainTable {
    devices: HashMap<String, DeviceRecord>,
}

impl ChainTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn upsert(&mut self, record: DeviceRecord) {
        self.devices.insert(record.uid.clone(), record);
    }

    pub fn remove(&mut self, uid: &str) -> Option<DeviceRecord> {
        self.devices.remove(uid)
    }

    pub fn get(&self, uid: &str) -> Option<&DeviceRecord> {
        self.devices.get(uid)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// All known devices, ordered by position in chain.
    pub fn list(&self) -> Vec<DeviceRecord> {
        let mut out: Vec<DeviceRecord> = self.devices.values().cloned().collect();
        out.sort_by_key(|d| d.pic);
        out
    }

    /// A consistent table holds pic values `{1..N}` with no gaps or
    /// duplicates.
    pub fn is_consistent(&self) -> bool {
        let mut pics: Vec<u8> = self.devices.values().map(|d| d.pic).collect();
        pics.sort_unstable();
        pics.iter()
            .enumerate()
            .all(|(i, &pic)| pic as usize == i + 1)
    }
}
