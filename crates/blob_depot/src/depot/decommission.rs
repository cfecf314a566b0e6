//! Decommission migration driver.
//!
//! While a legacy group is being absorbed, a resolve that touches keys the
//! index has not assimilated yet first scans the legacy group for them. In
//! index-only mode the legacy blobs are indexed in place; when the caller
//! asks for `must_restore_first` the payloads are fetched and re-put into
//! depot channels. The driver itself performs no IO: it hands actions to the
//! coordinator and is fed the results.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

use super::types::{
    BlobLocator, BlobRead, CommitItem, ConnectionId, GroupId, LogoBlobId, RangeBlob,
    RangeScan, RequestId, ResolveItem, ResolveTarget, Status,
};

pub const DECOMMIT_MAX_FETCHES_IN_FLIGHT: usize = 10;
pub const DECOMMIT_MAX_BYTES_IN_FLIGHT: u64 = 10 << 20;
pub const DECOMMIT_COMMIT_BATCH: usize = 10_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum DecommitAction {
    Scan { scan: RangeScan },
    Fetch { id: LogoBlobId, read: BlobRead },
    Write { id: LogoBlobId, data: Bytes },
}

pub(super) struct DecommitDriver {
    pub(super) connection: ConnectionId,
    pub(super) request_id: RequestId,
    pub(super) items: Vec<ResolveItem>,
    group_id: GroupId,
    scans_in_flight: usize,
    fetch_queue: VecDeque<LogoBlobId>,
    fetches_in_flight: usize,
    bytes_in_flight: u64,
    writes_in_flight: usize,
    discovered: BTreeMap<LogoBlobId, BlobLocator>,
    failure: Option<String>,
}

impl DecommitDriver {
    pub(super) fn new(
        connection: ConnectionId,
        request_id: RequestId,
        items: Vec<ResolveItem>,
        group_id: GroupId,
    ) -> Self {
        Self {
            connection,
            request_id,
            items,
            group_id,
            scans_in_flight: 0,
            fetch_queue: VecDeque::new(),
            fetches_in_flight: 0,
            bytes_in_flight: 0,
            writes_in_flight: 0,
            discovered: BTreeMap::new(),
            failure: None,
        }
    }

    /// One metadata scan per item that names an owning tablet.
    pub(super) fn start(&mut self) -> Vec<DecommitAction> {
        let mut actions = Vec::new();
        for item in &self.items {
            let Some(tablet_id) = item.tablet_id else {
                continue;
            };
            let (from, to) = match &item.target {
                ResolveTarget::Range { begin, end } => (
                    LogoBlobId::from_key(begin)
                        .unwrap_or_else(|| LogoBlobId::first_of_tablet(tablet_id)),
                    LogoBlobId::from_key(end)
                        .unwrap_or_else(|| LogoBlobId::last_of_tablet(tablet_id)),
                ),
                ResolveTarget::Exact(key) => match LogoBlobId::from_key(key) {
                    Some(id) => (id, id),
                    None => continue,
                },
            };
            if from > to {
                continue;
            }
            actions.push(DecommitAction::Scan {
                scan: RangeScan {
                    group_id: self.group_id,
                    tablet_id,
                    from,
                    to,
                    index_only: true,
                    must_restore_first: item.must_restore_first,
                },
            });
        }
        self.scans_in_flight = actions.len();
        actions
    }

    /// Absorb one scan reply. Blobs the index already knows are skipped.
    pub(super) fn on_scan(
        &mut self,
        status: Status,
        blobs: Vec<RangeBlob>,
        must_restore: bool,
        known: impl Fn(&LogoBlobId) -> bool,
    ) -> Vec<DecommitAction> {
        self.scans_in_flight = self.scans_in_flight.saturating_sub(1);
        if !status.is_ok() {
            self.fail(format!("legacy range scan returned {status}"));
            return Vec::new();
        }
        for blob in blobs {
            if known(&blob.id) || self.discovered.contains_key(&blob.id) {
                continue;
            }
            if must_restore {
                self.fetch_queue.push_back(blob.id);
            } else {
                self.discovered.insert(blob.id, self.legacy_locator(&blob.id));
            }
        }
        self.pump()
    }

    pub(super) fn on_fetch(
        &mut self,
        id: LogoBlobId,
        status: Status,
        data: Option<Bytes>,
    ) -> Vec<DecommitAction> {
        self.fetches_in_flight = self.fetches_in_flight.saturating_sub(1);
        self.bytes_in_flight = self
            .bytes_in_flight
            .saturating_sub(u64::from(id.blob_size));
        let mut actions = Vec::new();
        match (status, data) {
            (Status::Ok, Some(data)) => {
                self.writes_in_flight += 1;
                actions.push(DecommitAction::Write { id, data });
            }
            // Collected between scan and fetch; nothing left to restore.
            (Status::NoData, _) => {}
            (status, _) => self.fail(format!("legacy fetch of {id} returned {status}")),
        }
        actions.extend(self.pump());
        actions
    }

    pub(super) fn on_written(&mut self, id: LogoBlobId, result: Result<BlobLocator, String>) {
        self.writes_in_flight = self.writes_in_flight.saturating_sub(1);
        match result {
            Ok(locator) => {
                self.discovered.insert(id, locator);
            }
            Err(err) => self.fail(format!("re-put of {id} failed: {err}")),
        }
    }

    pub(super) fn is_done(&self) -> bool {
        self.scans_in_flight == 0
            && self.fetch_queue.is_empty()
            && self.fetches_in_flight == 0
            && self.writes_in_flight == 0
    }

    pub(super) fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Commit items for everything discovered, at most `DECOMMIT_COMMIT_BATCH`
    /// per batch.
    pub(super) fn commit_batches(&self) -> Vec<Vec<CommitItem>> {
        let items: Vec<CommitItem> = self
            .discovered
            .iter()
            .map(|(id, locator)| CommitItem::new(id.to_key(), vec![*locator]))
            .collect();
        items
            .chunks(DECOMMIT_COMMIT_BATCH)
            .map(<[CommitItem]>::to_vec)
            .collect()
    }

    fn legacy_locator(&self, id: &LogoBlobId) -> BlobLocator {
        BlobLocator {
            group_id: self.group_id,
            blob_id: *id,
            data_len: id.blob_size,
        }
    }

    fn fail(&mut self, reason: String) {
        tracing::warn!(reason = %reason, "decommission driver failed");
        if self.failure.is_none() {
            self.failure = Some(reason);
        }
        self.fetch_queue.clear();
    }

    fn pump(&mut self) -> Vec<DecommitAction> {
        let mut actions = Vec::new();
        while self.fetches_in_flight < DECOMMIT_MAX_FETCHES_IN_FLIGHT {
            let Some(&id) = self.fetch_queue.front() else {
                break;
            };
            let size = u64::from(id.blob_size);
            if self.fetches_in_flight > 0
                && self.bytes_in_flight + size > DECOMMIT_MAX_BYTES_IN_FLIGHT
            {
                break;
            }
            self.fetch_queue.pop_front();
            self.fetches_in_flight += 1;
            self.bytes_in_flight += size;
            actions.push(DecommitAction::Fetch {
                id,
                read: self.legacy_locator(&id).read(),
            });
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY: GroupId = 50;

    fn blob(step: u32, size: u32) -> RangeBlob {
        RangeBlob {
            id: LogoBlobId::new(100, 1, step, 0, 0, size),
            data: None,
        }
    }

    fn driver(must_restore: bool) -> DecommitDriver {
        let mut item = ResolveItem::range(
            LogoBlobId::first_of_tablet(100).to_key(),
            LogoBlobId::last_of_tablet(100).to_key(),
        );
        item.tablet_id = Some(100);
        item.must_restore_first = must_restore;
        DecommitDriver::new(1, 9, vec![item, ResolveItem::exact(b"no-tablet".to_vec())], LEGACY)
    }

    #[test]
    fn index_only_scan_indexes_legacy_locators() {
        let mut driver = driver(false);
        let actions = driver.start();
        assert_eq!(actions.len(), 1);
        let DecommitAction::Scan { scan } = &actions[0] else {
            panic!("expected scan");
        };
        assert_eq!(scan.group_id, LEGACY);
        assert!(scan.index_only);

        let known = LogoBlobId::new(100, 1, 2, 0, 0, 8);
        let actions = driver.on_scan(Status::Ok, vec![blob(1, 8), blob(2, 8)], false, |id| {
            *id == known
        });
        assert!(actions.is_empty());
        assert!(driver.is_done());

        let batches = driver.commit_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        let locator = batches[0][0].value_chain[0];
        assert_eq!(locator.group_id, LEGACY);
        assert_eq!(locator.data_len, 8);
    }

    #[test]
    fn restore_bounds_fetches_in_flight() {
        let mut driver = driver(true);
        driver.start();
        let blobs: Vec<RangeBlob> = (1..=15).map(|step| blob(step, 100)).collect();
        let actions = driver.on_scan(Status::Ok, blobs, true, |_| false);
        assert_eq!(actions.len(), DECOMMIT_MAX_FETCHES_IN_FLIGHT);
        assert!(!driver.is_done());

        let DecommitAction::Fetch { id, .. } = actions[0].clone() else {
            panic!("expected fetch");
        };
        let next = driver.on_fetch(id, Status::Ok, Some(Bytes::from_static(b"payload")));
        assert!(matches!(next[0], DecommitAction::Write { .. }));
        assert!(matches!(next[1], DecommitAction::Fetch { .. }));
        assert_eq!(next.len(), 2);
    }

    #[test]
    fn byte_budget_limits_large_fetches() {
        let mut driver = driver(true);
        driver.start();
        let big = (DECOMMIT_MAX_BYTES_IN_FLIGHT / 2) as u32 + 1;
        let actions = driver.on_scan(
            Status::Ok,
            vec![blob(1, big), blob(2, big), blob(3, 10)],
            true,
            |_| false,
        );
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn vanished_blob_is_skipped_and_failure_is_sticky() {
        let mut driver = driver(true);
        driver.start();
        driver.on_scan(Status::Ok, vec![blob(1, 4), blob(2, 4)], true, |_| false);
        let gone = LogoBlobId::new(100, 1, 1, 0, 0, 4);
        assert!(driver.on_fetch(gone, Status::NoData, None).is_empty());
        assert!(driver.failure().is_none());

        let broken = LogoBlobId::new(100, 1, 2, 0, 0, 4);
        driver.on_fetch(broken, Status::Error, None);
        assert!(driver.failure().is_some());
        assert!(driver.is_done());
    }
}
