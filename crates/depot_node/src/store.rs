//! In-process blob store.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use blob_depot::depot::{
    BlobPut, BlobRead, BlobStore, GroupId, HandleClass, LogoBlobId, RangeBlob, RangeScan, Status,
    StoreGetResult, StorePutResult, StoreRangeResult,
};
use bytes::{Bytes, BytesMut};

/// Blobs keyed by group and id. Reads of missing blobs answer `NoData`.
#[derive(Debug, Default)]
pub struct MemBlobStore {
    blobs: RwLock<BTreeMap<(GroupId, LogoBlobId), Bytes>>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget a blob, as if the group lost it.
    pub fn lose(&self, group_id: GroupId, blob_id: &LogoBlobId) -> bool {
        self.blobs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(group_id, *blob_id))
            .is_some()
    }

    /// Insert a blob directly, bypassing the depot.
    pub fn insert(&self, group_id: GroupId, blob_id: LogoBlobId, data: Bytes) {
        self.blobs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert((group_id, blob_id), data);
    }

    pub fn ids(&self) -> Vec<(GroupId, LogoBlobId)> {
        self.blobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .collect()
    }
}

#[async_trait]
impl BlobStore for MemBlobStore {
    async fn put(&self, put: BlobPut) -> StorePutResult {
        if put.data.len() != put.blob_id.blob_size as usize {
            return StorePutResult {
                status: Status::Error,
                error: Some(format!(
                    "blob {} declares {} bytes, got {}",
                    put.blob_id,
                    put.blob_id.blob_size,
                    put.data.len()
                )),
            };
        }
        self.insert(put.group_id, put.blob_id, put.data);
        StorePutResult {
            status: Status::Ok,
            error: None,
        }
    }

    async fn get(&self, reads: Vec<BlobRead>, _handle_class: HandleClass) -> StoreGetResult {
        let blobs = self.blobs.read().unwrap_or_else(|p| p.into_inner());
        let mut out = BytesMut::new();
        for read in &reads {
            let Some(blob) = blobs.get(&(read.group_id, read.blob_id)) else {
                return StoreGetResult {
                    status: Status::NoData,
                    data: None,
                    error: Some(format!("blob {} not found", read.blob_id)),
                };
            };
            let start = read.offset as usize;
            let end = start + read.size as usize;
            if end > blob.len() {
                return StoreGetResult {
                    status: Status::Error,
                    data: None,
                    error: Some(format!("read past the end of blob {}", read.blob_id)),
                };
            }
            out.extend_from_slice(&blob[start..end]);
        }
        StoreGetResult {
            status: Status::Ok,
            data: Some(out.freeze()),
            error: None,
        }
    }

    async fn range(&self, scan: RangeScan) -> StoreRangeResult {
        let blobs = self.blobs.read().unwrap_or_else(|p| p.into_inner());
        let found = blobs
            .range((scan.group_id, scan.from)..=(scan.group_id, scan.to))
            .filter(|((_, id), _)| id.tablet_id == scan.tablet_id)
            .map(|((_, id), data)| RangeBlob {
                id: *id,
                data: (!scan.index_only).then(|| data.clone()),
            })
            .collect();
        StoreRangeResult {
            status: Status::Ok,
            blobs: found,
            error: None,
        }
    }
}
