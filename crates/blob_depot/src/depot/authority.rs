//! In-memory collaborators: durable table, blocks and barrier authorities.
//!
//! These back tests and embedded deployments. All of them are cheap to clone
//! and share state between clones.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use super::types::{
    BarrierAuthority, BlocksAuthority, DurableTable, Generation, LogoBlobId, Status, TabletId,
};

type Partitions = BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// `DurableTable` kept entirely in memory.
#[derive(Clone, Debug, Default)]
pub struct MemTable {
    partitions: Arc<RwLock<Partitions>>,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, partition: &str) -> usize {
        self.partitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(partition)
            .map_or(0, BTreeMap::len)
    }
}

impl DurableTable for MemTable {
    fn upsert(&self, partition: &str, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let mut guard = self
            .partitions
            .write()
            .map_err(|_| anyhow::anyhow!("mem table lock poisoned"))?;
        guard
            .entry(partition.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, partition: &str, key: &[u8]) -> anyhow::Result<()> {
        let mut guard = self
            .partitions
            .write()
            .map_err(|_| anyhow::anyhow!("mem table lock poisoned"))?;
        if let Some(rows) = guard.get_mut(partition) {
            rows.remove(key);
        }
        Ok(())
    }

    fn scan(&self, partition: &str) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let guard = self
            .partitions
            .read()
            .map_err(|_| anyhow::anyhow!("mem table lock poisoned"))?;
        Ok(guard
            .get(partition)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct BlocksState {
    blocked: HashMap<TabletId, Generation>,
    /// Remaining `Unknown` answers per tablet.
    unknown: HashMap<TabletId, u32>,
}

/// Tablet block authority: a generation at or below the blocked one may no
/// longer write.
#[derive(Clone, Debug, Default)]
pub struct BlocksTable {
    state: Arc<RwLock<BlocksState>>,
}

impl BlocksTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fence off every generation up to `generation`. Never lowers an
    /// existing block.
    pub fn block(&self, tablet_id: TabletId, generation: Generation) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        let entry = state.blocked.entry(tablet_id).or_insert(generation);
        *entry = (*entry).max(generation);
    }

    /// Answer `Unknown` for the next `times` checks of `tablet_id`.
    pub fn set_unknown(&self, tablet_id: TabletId, times: u32) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        if times == 0 {
            state.unknown.remove(&tablet_id);
        } else {
            state.unknown.insert(tablet_id, times);
        }
    }
}

impl BlocksAuthority for BlocksTable {
    fn check(&self, tablet_id: TabletId, generation: Generation) -> Status {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        if let Some(left) = state.unknown.get_mut(&tablet_id) {
            *left -= 1;
            if *left == 0 {
                state.unknown.remove(&tablet_id);
            }
            return Status::Unknown;
        }
        match state.blocked.get(&tablet_id) {
            Some(&blocked) if generation <= blocked => Status::Blocked,
            _ => Status::Ok,
        }
    }
}

/// GC barrier per (tablet, channel): keys at or below `(generation, step)`
/// are collectable and may not be committed.
#[derive(Clone, Debug, Default)]
pub struct BarrierTable {
    barriers: Arc<RwLock<HashMap<(TabletId, u8), (Generation, u32)>>>,
}

impl BarrierTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_barrier(&self, tablet_id: TabletId, channel: u8, generation: Generation, step: u32) {
        let mut barriers = self.barriers.write().unwrap_or_else(|p| p.into_inner());
        let entry = barriers
            .entry((tablet_id, channel))
            .or_insert((generation, step));
        *entry = (*entry).max((generation, step));
    }
}

impl BarrierAuthority for BarrierTable {
    fn is_behind_barrier(&self, key: &[u8]) -> bool {
        let Some(id) = LogoBlobId::from_key(key) else {
            return false;
        };
        let barriers = self.barriers.read().unwrap_or_else(|p| p.into_inner());
        barriers
            .get(&(id.tablet_id, id.channel))
            .is_some_and(|&barrier| (id.generation, id.step) <= barrier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_fence_generations_at_or_below() {
        let blocks = BlocksTable::new();
        blocks.block(100, 3);
        blocks.block(100, 2);
        assert_eq!(blocks.check(100, 3), Status::Blocked);
        assert_eq!(blocks.check(100, 4), Status::Ok);
        assert_eq!(blocks.check(101, 1), Status::Ok);

        blocks.set_unknown(101, 2);
        assert_eq!(blocks.check(101, 1), Status::Unknown);
        assert_eq!(blocks.check(101, 1), Status::Unknown);
        assert_eq!(blocks.check(101, 1), Status::Ok);
    }

    #[test]
    fn barrier_applies_per_tablet_and_channel() {
        let barriers = BarrierTable::new();
        barriers.set_barrier(100, 0, 2, 5);
        let behind = LogoBlobId::new(100, 2, 5, 0, 0, 10).to_key();
        let ahead = LogoBlobId::new(100, 2, 6, 0, 0, 10).to_key();
        let other_channel = LogoBlobId::new(100, 1, 1, 1, 0, 10).to_key();
        assert!(barriers.is_behind_barrier(&behind));
        assert!(!barriers.is_behind_barrier(&ahead));
        assert!(!barriers.is_behind_barrier(&other_channel));
        assert!(!barriers.is_behind_barrier(b"opaque"));
    }

    #[test]
    fn mem_table_clones_share_rows() {
        let table = MemTable::new();
        let clone = table.clone();
        table.upsert("data", b"a", b"1").unwrap();
        table.upsert("data", b"b", b"2").unwrap();
        clone.delete("data", b"a").unwrap();
        assert_eq!(clone.scan("data").unwrap(), vec![(b"b".to_vec(), b"2".to_vec())]);
        assert!(table.scan("config").unwrap().is_empty());
        assert_eq!(table.len("data"), 1);
    }
}
