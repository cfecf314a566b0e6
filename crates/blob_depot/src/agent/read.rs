//! Range and point reads.
//!
//! Keys are resolved through the coordinator (paging on `OVERRUN`), the value
//! chains are fetched from the store with a bounded number of reads in
//! flight, and the results are returned in key order. A chain the store no
//! longer has gets exactly one point re-resolve before the read fails.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use bytes::Bytes;

use crate::depot::{
    AgentRequest, BlobLocator, HandleClass, Key, LogoBlobId, RequestId, ResolveItem,
    ResolveResult, ResolvedValue, Status, StoreGetResult, StoreRequest, TabletId,
};
use crate::DepotError;

use super::requests::{KeyResolvedEvent, QueryId, Response};
use super::session::{AgentCore, QueryOutcome, Step};

/// Inclusive range of logical blob ids of one tablet. `from > to` reads the
/// range in descending order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeRequest {
    pub tablet_id: TabletId,
    pub from: LogoBlobId,
    pub to: LogoBlobId,
    pub must_restore_first: bool,
    pub handle_class: HandleClass,
}

impl RangeRequest {
    pub fn new(tablet_id: TabletId, from: LogoBlobId, to: LogoBlobId) -> Self {
        Self {
            tablet_id,
            from,
            to,
            must_restore_first: false,
            handle_class: HandleClass::FastRead,
        }
    }

    /// Every blob of `tablet_id`.
    pub fn whole_tablet(tablet_id: TabletId) -> Self {
        Self::new(
            tablet_id,
            LogoBlobId::first_of_tablet(tablet_id),
            LogoBlobId::last_of_tablet(tablet_id),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetRequest {
    pub keys: Vec<LogoBlobId>,
    pub must_restore_first: bool,
    pub handle_class: HandleClass,
}

impl GetRequest {
    pub fn new(keys: Vec<LogoBlobId>) -> Self {
        Self {
            keys,
            must_restore_first: false,
            handle_class: HandleClass::FastRead,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadItem {
    pub id: LogoBlobId,
    pub data: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadState {
    Resolving,
    ReadingBlobs,
    Finished,
}

pub(super) struct ReadQuery {
    id: QueryId,
    /// Items of the resolve currently in flight; continuations index into it.
    items: Vec<ResolveItem>,
    reverse: bool,
    handle_class: HandleClass,
    state: ReadState,
    resolve: Option<RequestId>,
    fetch_queue: VecDeque<(Key, ResolvedValue)>,
    fetches: HashMap<RequestId, (Key, u64)>,
    point_resolves: HashSet<Key>,
    re_resolved: HashSet<Key>,
    results: BTreeMap<Key, Bytes>,
}

impl ReadQuery {
    pub(super) fn range(id: QueryId, request: RangeRequest) -> Self {
        let reverse = request.from > request.to;
        let (from, to) = if reverse {
            (request.to, request.from)
        } else {
            (request.from, request.to)
        };
        let mut item = ResolveItem::range(from.to_key(), to.to_key());
        item.tablet_id = Some(request.tablet_id);
        item.must_restore_first = request.must_restore_first;
        Self::with_items(id, vec![item], reverse, request.handle_class)
    }

    pub(super) fn get(id: QueryId, request: GetRequest) -> Self {
        let items = request
            .keys
            .iter()
            .map(|key| {
                let mut item = ResolveItem::exact(key.to_key());
                item.tablet_id = Some(key.tablet_id);
                item.must_restore_first = request.must_restore_first;
                item
            })
            .collect();
        Self::with_items(id, items, false, request.handle_class)
    }

    fn with_items(id: QueryId, items: Vec<ResolveItem>, reverse: bool, handle_class: HandleClass) -> Self {
        Self {
            id,
            items,
            reverse,
            handle_class,
            state: ReadState::Resolving,
            resolve: None,
            fetch_queue: VecDeque::new(),
            fetches: HashMap::new(),
            point_resolves: HashSet::new(),
            re_resolved: HashSet::new(),
            results: BTreeMap::new(),
        }
    }

    pub(super) fn state(&self) -> ReadState {
        self.state
    }

    pub(super) fn start(&mut self, core: &mut AgentCore) -> Step {
        if self.items.is_empty() {
            return self.finish();
        }
        self.issue_resolve(core);
        Step::Pending
    }

    pub(super) fn on_response(
        &mut self,
        core: &mut AgentCore,
        request_id: RequestId,
        response: Response,
    ) -> Step {
        match response {
            Response::Disconnected => self.fail(DepotError::CoordinatorDisconnected),
            Response::Resolved(result) if self.resolve == Some(request_id) => {
                self.on_resolved(core, result)
            }
            Response::Get(result) => self.on_fetched(core, request_id, result),
            Response::KeyResolved(event) => self.on_key_resolved(core, event),
            other => {
                tracing::warn!(query = self.id, ?other, "unexpected response for read");
                Step::Pending
            }
        }
    }

    fn fail(&mut self, err: DepotError) -> Step {
        tracing::debug!(query = self.id, state = ?self.state, error = %err, "read failed");
        self.state = ReadState::Finished;
        Step::Done(QueryOutcome::Read(Err(err)))
    }

    fn issue_resolve(&mut self, core: &mut AgentCore) {
        self.state = ReadState::Resolving;
        let request = AgentRequest::Resolve {
            items: self.items.clone(),
        };
        self.resolve = Some(core.send_coordinator(self.id, request));
    }

    fn on_resolved(&mut self, core: &mut AgentCore, result: ResolveResult) -> Step {
        self.resolve = None;
        if !matches!(result.status, Status::Ok | Status::Overrun) {
            return self.fail(DepotError::Resolve {
                status: result.status,
                error: result.error.unwrap_or_default(),
            });
        }

        for resolved in result.items {
            match resolved.value {
                Ok(value) => self.enqueue(resolved.key, value),
                Err(error) => {
                    return self.fail(DepotError::Resolve {
                        status: Status::Error,
                        error,
                    })
                }
            }
        }

        if result.status == Status::Overrun {
            let Some(continuation) = result.continuation else {
                return self.fail(DepotError::Resolve {
                    status: Status::Overrun,
                    error: "overrun without continuation".into(),
                });
            };
            if continuation.item_index >= self.items.len() {
                return self.fail(DepotError::Resolve {
                    status: Status::Overrun,
                    error: format!("continuation item {} out of range", continuation.item_index),
                });
            }
            self.items.drain(..continuation.item_index);
            self.items[0].continuation = continuation.after;
            self.issue_resolve(core);
        }

        self.pump_fetches(core);
        self.check_done()
    }

    fn enqueue(&mut self, key: Key, value: ResolvedValue) {
        if value.value_chain.is_empty() {
            self.results.insert(key, Bytes::new());
        } else {
            self.fetch_queue.push_back((key, value));
        }
    }

    fn pump_fetches(&mut self, core: &mut AgentCore) {
        while self.fetches.len() < core.config.max_reads_in_flight.max(1) {
            let Some((key, value)) = self.fetch_queue.pop_front() else {
                break;
            };
            let expected = value
                .value_chain
                .iter()
                .map(|locator| u64::from(locator.data_len))
                .sum();
            let reads = value.value_chain.iter().map(BlobLocator::read).collect();
            let id = core.send_store(
                self.id,
                StoreRequest::Get {
                    reads,
                    handle_class: self.handle_class,
                },
            );
            self.fetches.insert(id, (key, expected));
            if self.resolve.is_none() {
                self.state = ReadState::ReadingBlobs;
            }
        }
    }

    fn on_fetched(&mut self, core: &mut AgentCore, request_id: RequestId, result: StoreGetResult) -> Step {
        let Some((key, expected)) = self.fetches.remove(&request_id) else {
            return Step::Pending;
        };

        match (result.status, result.data) {
            (Status::Ok, Some(data)) if data.len() as u64 == expected => {
                self.results.insert(key, data);
            }
            (Status::Ok, data) => {
                return self.fail(DepotError::Store {
                    status: Status::Error,
                    error: format!(
                        "expected {expected} bytes, store returned {}",
                        data.map_or(0, |d| d.len())
                    ),
                });
            }
            (Status::NoData, _) => {
                if !self.re_resolved.insert(key.clone()) {
                    return self.fail(DepotError::NoData(format!(
                        "value of {} is gone from the store",
                        describe_key(&key)
                    )));
                }
                tracing::debug!(query = self.id, key = %describe_key(&key), "store has no data, re-resolving key");
                self.point_resolves.insert(key.clone());
                core.resolve_key(self.id, key);
            }
            (status, _) => {
                return self.fail(DepotError::Store {
                    status,
                    error: result.error.unwrap_or_default(),
                });
            }
        }

        self.pump_fetches(core);
        self.check_done()
    }

    fn on_key_resolved(&mut self, core: &mut AgentCore, event: KeyResolvedEvent) -> Step {
        if !self.point_resolves.remove(&event.key) {
            return Step::Pending;
        }
        match event.result {
            Ok(Some(value)) => self.enqueue(event.key, value),
            // Deleted since the first resolve.
            Ok(None) => {}
            Err(err) => return self.fail(err),
        }
        self.pump_fetches(core);
        self.check_done()
    }

    fn check_done(&mut self) -> Step {
        if self.resolve.is_some()
            || !self.fetches.is_empty()
            || !self.fetch_queue.is_empty()
            || !self.point_resolves.is_empty()
        {
            return Step::Pending;
        }
        self.finish()
    }

    fn finish(&mut self) -> Step {
        self.state = ReadState::Finished;
        let mut items: Vec<ReadItem> = std::mem::take(&mut self.results)
            .into_iter()
            .filter_map(|(key, data)| {
                let id = LogoBlobId::from_key(&key)?;
                Some(ReadItem { id, data })
            })
            .collect();
        if self.reverse {
            items.reverse();
        }
        Step::Done(QueryOutcome::Read(Ok(items)))
    }
}

fn describe_key(key: &[u8]) -> String {
    match LogoBlobId::from_key(key) {
        Some(id) => id.to_string(),
        None => format!("{key:02x?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descending_range_is_normalized() {
        let from = LogoBlobId::new(5, 1, 9, 0, 0, 4);
        let to = LogoBlobId::new(5, 1, 1, 0, 0, 4);
        let query = ReadQuery::range(1, RangeRequest::new(5, from, to));
        assert!(query.reverse);
        assert_eq!(query.items.len(), 1);
        assert_eq!(query.items[0].target, crate::depot::ResolveTarget::Range {
            begin: to.to_key(),
            end: from.to_key(),
        });
        assert_eq!(query.items[0].tablet_id, Some(5));
    }

    #[test]
    fn point_read_resolves_each_key_exactly() {
        let a = LogoBlobId::new(5, 1, 1, 0, 0, 4);
        let b = LogoBlobId::new(6, 1, 1, 0, 0, 4);
        let query = ReadQuery::get(1, GetRequest::new(vec![a, b]));
        assert!(!query.reverse);
        let tablets: Vec<_> = query.items.iter().map(|item| item.tablet_id).collect();
        assert_eq!(tablets, vec![Some(5), Some(6)]);
        assert_eq!(
            query.items[1].target,
            crate::depot::ResolveTarget::Exact(b.to_key())
        );
    }
}
