//! fjall-backed durable table.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use blob_depot::depot::{DurableTable, Generation, CONFIG_PARTITION, DATA_PARTITION};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

const GENERATION_KEY: &[u8] = b"node_generation";

pub struct FjallTable {
    keyspace: Keyspace,
    partitions: HashMap<&'static str, PartitionHandle>,
}

impl FjallTable {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path)
            .open()
            .with_context(|| format!("open fjall keyspace at {}", path.display()))?;
        let mut partitions = HashMap::new();
        for name in [DATA_PARTITION, CONFIG_PARTITION] {
            let partition = keyspace
                .open_partition(name, PartitionCreateOptions::default())
                .with_context(|| format!("open partition {name}"))?;
            partitions.insert(name, partition);
        }
        Ok(Self {
            keyspace,
            partitions,
        })
    }

    /// Bump and persist the stored generation counter; every start of the
    /// node runs under a fresh generation.
    pub fn next_generation(&self) -> anyhow::Result<Generation> {
        let config = self.partition(CONFIG_PARTITION)?;
        let current = match config.get(GENERATION_KEY)? {
            Some(raw) => {
                let bytes: [u8; 4] = raw
                    .as_ref()
                    .try_into()
                    .context("stored generation has the wrong length")?;
                Generation::from_be_bytes(bytes)
            }
            None => 0,
        };
        let next = current
            .checked_add(1)
            .context("generation counter exhausted")?;
        config.insert(GENERATION_KEY, &next.to_be_bytes()[..])?;
        self.persist()?;
        Ok(next)
    }

    fn partition(&self, name: &str) -> anyhow::Result<&PartitionHandle> {
        self.partitions
            .get(name)
            .with_context(|| format!("unknown partition {name}"))
    }
}

impl DurableTable for FjallTable {
    fn upsert(&self, partition: &str, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.partition(partition)?.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, partition: &str, key: &[u8]) -> anyhow::Result<()> {
        self.partition(partition)?.remove(key)?;
        Ok(())
    }

    fn scan(&self, partition: &str) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut rows = Vec::new();
        for item in self.partition(partition)?.iter() {
            let (key, value) = item?;
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    fn persist(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist fjall keyspace")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_and_generation_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table = FjallTable::open(dir.path()).unwrap();
            assert_eq!(table.next_generation().unwrap(), 1);
            table.upsert(DATA_PARTITION, b"a", b"1").unwrap();
            table.upsert(DATA_PARTITION, b"b", b"2").unwrap();
            table.delete(DATA_PARTITION, b"a").unwrap();
            table.persist().unwrap();
        }

        let table = FjallTable::open(dir.path()).unwrap();
        assert_eq!(table.next_generation().unwrap(), 2);
        assert_eq!(
            table.scan(DATA_PARTITION).unwrap(),
            vec![(b"b".to_vec(), b"2".to_vec())]
        );
        assert!(table.upsert("missing", b"k", b"v").is_err());
    }
}
