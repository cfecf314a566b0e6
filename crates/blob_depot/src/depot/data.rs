//! Committed-value index.
//!
//! Every mutation writes through to the durable table before touching the
//! in-memory map, so a coordinator restart rebuilds exactly what was
//! acknowledged. Values are serialized with `serde_json`.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use super::types::{
    BlobSeqId, CommittedValue, DurableTable, Key, ResolveContinuation, ResolveItem,
    ResolveResult, ResolveTarget, ResolvedKey, Status, TabletId,
};

/// Partition holding `key → CommittedValue`.
pub const DATA_PARTITION: &str = "data";
/// Partition holding the depot config and assimilation progress.
pub const CONFIG_PARTITION: &str = "config";
const LAST_ASSIMILATED_KEY: &[u8] = b"last_assimilated";

pub struct Data {
    table: Arc<dyn DurableTable>,
    values: BTreeMap<Key, CommittedValue>,
    uncertain_keys: BTreeSet<Key>,
    /// Highest legacy key already absorbed by decommission.
    last_assimilated: Option<Key>,
}

impl Data {
    pub fn load(table: Arc<dyn DurableTable>) -> anyhow::Result<Self> {
        let mut values = BTreeMap::new();
        let mut uncertain_keys = BTreeSet::new();
        for (key, raw) in table.scan(DATA_PARTITION).context("scan data partition")? {
            let value: CommittedValue =
                serde_json::from_slice(&raw).context("decode committed value")?;
            if value.uncertain {
                uncertain_keys.insert(key.clone());
            }
            values.insert(key, value);
        }

        let last_assimilated = table
            .scan(CONFIG_PARTITION)
            .context("scan config partition")?
            .into_iter()
            .find(|(key, _)| key.as_slice() == LAST_ASSIMILATED_KEY)
            .map(|(_, value)| value);

        Ok(Self {
            table,
            values,
            uncertain_keys,
            last_assimilated,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&CommittedValue> {
        self.values.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &CommittedValue)> {
        self.values.iter()
    }

    pub fn uncertain_keys(&self) -> impl Iterator<Item = &Key> {
        self.uncertain_keys.iter()
    }

    pub fn upsert(&mut self, key: Key, value: CommittedValue) -> anyhow::Result<()> {
        let raw = serde_json::to_vec(&value).context("encode committed value")?;
        self.table
            .upsert(DATA_PARTITION, &key, &raw)
            .context("persist committed value")?;
        if value.uncertain {
            self.uncertain_keys.insert(key.clone());
        } else {
            self.uncertain_keys.remove(&key);
        }
        self.values.insert(key, value);
        Ok(())
    }

    /// Clear the uncertain flag of `key`. Returns whether anything changed.
    pub fn finalize(&mut self, key: &[u8]) -> anyhow::Result<bool> {
        let Some(mut value) = self.values.get(key).cloned() else {
            return Ok(false);
        };
        if !value.uncertain {
            return Ok(false);
        }
        value.uncertain = false;
        self.upsert(key.to_vec(), value)?;
        Ok(true)
    }

    /// Remove every uncertain entry whose value chain was written under
    /// `seq`. Certain entries are never touched.
    pub fn drop_uncertain(
        &mut self,
        seq: BlobSeqId,
        depot_tablet_id: TabletId,
    ) -> anyhow::Result<Vec<Key>> {
        let doomed: Vec<Key> = self
            .uncertain_keys
            .iter()
            .filter(|key| {
                self.values.get(*key).is_some_and(|value| {
                    value
                        .value_chain
                        .iter()
                        .any(|l| l.blob_seq_id(depot_tablet_id) == Some(seq))
                })
            })
            .cloned()
            .collect();

        for key in &doomed {
            self.table
                .delete(DATA_PARTITION, key)
                .context("delete uncertain value")?;
            self.values.remove(key);
            self.uncertain_keys.remove(key);
            debug!(%seq, "dropped uncertain index entry");
        }
        Ok(doomed)
    }

    pub fn last_assimilated(&self) -> Option<&Key> {
        self.last_assimilated.as_ref()
    }

    /// Advance the assimilation marker; it never moves backwards.
    pub fn set_last_assimilated(&mut self, key: Key) -> anyhow::Result<()> {
        if self.last_assimilated.as_ref().is_some_and(|cur| *cur >= key) {
            return Ok(());
        }
        self.table
            .upsert(CONFIG_PARTITION, LAST_ASSIMILATED_KEY, &key)
            .context("persist assimilation marker")?;
        self.last_assimilated = Some(key);
        Ok(())
    }

    /// Whether the legacy contents up to and including `key` are absorbed.
    pub fn is_assimilated(&self, key: &[u8]) -> bool {
        self.last_assimilated
            .as_ref()
            .is_some_and(|marker| key <= marker.as_slice())
    }

    /// Resolve `items` in order, returning at most `page_size` range keys.
    ///
    /// When the page fills up the reply is `OVERRUN` and the continuation
    /// names the item and the last key returned for it; re-issuing the items
    /// from that index with the continuation yields the remainder.
    pub fn resolve(&self, items: &[ResolveItem], page_size: usize) -> ResolveResult {
        let mut out = Vec::new();
        let mut budget = page_size.max(1);

        for (item_index, item) in items.iter().enumerate() {
            match &item.target {
                ResolveTarget::Exact(key) => {
                    if let Some(value) = self.values.get(key) {
                        out.push(ResolvedKey {
                            key: key.clone(),
                            value: Ok(value.into()),
                        });
                    }
                }
                ResolveTarget::Range { begin, end } => {
                    if begin > end {
                        continue;
                    }
                    let lower = match &item.continuation {
                        Some(after) if after >= end => continue,
                        Some(after) if after >= begin => Bound::Excluded(after.clone()),
                        _ => Bound::Included(begin.clone()),
                    };

                    let mut last: Option<&Key> = None;
                    for (key, value) in self
                        .values
                        .range::<Key, _>((lower, Bound::Included(end.clone())))
                    {
                        if budget == 0 {
                            let after = last.cloned().or_else(|| item.continuation.clone());
                            return ResolveResult {
                                status: Status::Overrun,
                                items: out,
                                continuation: Some(ResolveContinuation { item_index, after }),
                                error: None,
                            };
                        }
                        out.push(ResolvedKey {
                            key: key.clone(),
                            value: Ok(value.into()),
                        });
                        budget -= 1;
                        last = Some(key);
                    }
                }
            }
        }

        ResolveResult {
            status: Status::Ok,
            items: out,
            continuation: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depot::authority::MemTable;
    use crate::depot::types::{BlobKind, BlobLocator};

    fn value(seq_index: u32, uncertain: bool) -> CommittedValue {
        let seq = BlobSeqId {
            channel: 2,
            generation: 1,
            step: 1,
            index: seq_index,
        };
        CommittedValue {
            value_chain: vec![BlobLocator {
                group_id: 7,
                blob_id: seq.to_blob_id(72, BlobKind::Composite, 0, 30),
                data_len: 4,
            }],
            uncertain,
            ..CommittedValue::default()
        }
    }

    fn keys(result: &ResolveResult) -> Vec<Key> {
        result.items.iter().map(|item| item.key.clone()).collect()
    }

    fn filled(table: Arc<MemTable>, count: u8) -> Data {
        let mut data = Data::load(table).unwrap();
        for idx in 0..count {
            data.upsert(vec![b'k', idx], value(u32::from(idx), false))
                .unwrap();
        }
        data
    }

    #[test]
    fn overrun_continuation_enumerates_the_full_range() {
        let data = filled(Arc::new(MemTable::new()), 7);
        let full = data.resolve(&[ResolveItem::range(vec![b'k', 1], vec![b'k', 5])], 100);
        assert_eq!(full.status, Status::Ok);
        assert_eq!(full.items.len(), 5);

        let mut item = ResolveItem::range(vec![b'k', 1], vec![b'k', 5]);
        let mut collected = Vec::new();
        loop {
            let page = data.resolve(std::slice::from_ref(&item), 2);
            assert!(page.items.len() <= 2);
            collected.extend(keys(&page));
            match page.status {
                Status::Ok => break,
                Status::Overrun => {
                    let cont = page.continuation.expect("overrun carries continuation");
                    assert_eq!(cont.item_index, 0);
                    item.continuation = cont.after;
                }
                other => panic!("unexpected status {other}"),
            }
        }
        assert_eq!(collected, keys(&full));
    }

    #[test]
    fn inverted_range_and_missing_exact_key_are_empty() {
        let data = filled(Arc::new(MemTable::new()), 3);
        let result = data.resolve(
            &[
                ResolveItem::range(vec![b'k', 2], vec![b'k', 0]),
                ResolveItem::exact(b"missing".to_vec()),
                ResolveItem::exact(vec![b'k', 1]),
            ],
            10,
        );
        assert_eq!(result.status, Status::Ok);
        assert_eq!(keys(&result), vec![vec![b'k', 1]]);
    }

    #[test]
    fn reload_restores_values_and_marker() {
        let table = Arc::new(MemTable::new());
        let mut data = filled(table.clone(), 3);
        data.upsert(b"u".to_vec(), value(9, true)).unwrap();
        data.set_last_assimilated(vec![b'k', 1]).unwrap();
        data.set_last_assimilated(vec![b'k', 0]).unwrap();

        let reloaded = Data::load(table).unwrap();
        assert_eq!(reloaded.len(), 4);
        assert_eq!(reloaded.uncertain_keys().count(), 1);
        assert_eq!(reloaded.last_assimilated(), Some(&vec![b'k', 1]));
        assert!(reloaded.is_assimilated(&[b'k', 0]));
        assert!(!reloaded.is_assimilated(&[b'k', 2]));
    }

    #[test]
    fn drop_uncertain_only_removes_matching_uncertain_entries() {
        let table = Arc::new(MemTable::new());
        let mut data = filled(table.clone(), 2);
        data.upsert(b"u".to_vec(), value(9, true)).unwrap();
        data.upsert(b"c".to_vec(), value(9, false)).unwrap();

        let seq = BlobSeqId {
            channel: 2,
            generation: 1,
            step: 1,
            index: 9,
        };
        let dropped = data.drop_uncertain(seq, 72).unwrap();
        assert_eq!(dropped, vec![b"u".to_vec()]);
        assert!(data.get(b"u").is_none());
        assert!(data.get(b"c").is_some());
        assert!(Data::load(table).unwrap().get(b"u").is_none());
    }

    #[test]
    fn finalize_clears_uncertain_flag() {
        let mut data = Data::load(Arc::new(MemTable::new())).unwrap();
        data.upsert(b"u".to_vec(), value(1, true)).unwrap();
        assert!(data.finalize(b"u").unwrap());
        assert!(!data.finalize(b"u").unwrap());
        assert!(!data.get(b"u").unwrap().uncertain);
        assert_eq!(data.uncertain_keys().count(), 0);
    }
}
