//! Outstanding-request bookkeeping for one agent.
//!
//! The table only remembers who owns a request and where it went; the owning
//! query keeps whatever context it needs to interpret the answer.

use std::collections::HashMap;
use std::fmt;

use crate::depot::{
    AllocateResult, BlocksResult, ChannelKind, CommitResult, CoordinatorResponse, Key,
    RegisterResult, RequestId, ResolveResult, ResolvedValue, StoreGetResult, StorePutResult,
    StoreRangeResult, StoreResponse,
};
use crate::DepotError;

/// Arena index of a running query.
pub type QueryId = u64;

/// Invoked with the request id when a request is cancelled before its answer
/// arrives.
pub type CancelHook = Box<dyn FnOnce(RequestId) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestTarget {
    Coordinator,
    Store,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOwner {
    Query(QueryId),
    Registration,
    IdAllocation(ChannelKind),
    /// Shared point resolve; answers fan out to every waiting query.
    KeyResolve(Key),
}

/// Outcome of a shared point resolve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyResolvedEvent {
    pub key: Key,
    pub result: Result<Option<ResolvedValue>, DepotError>,
}

/// Everything a query can be handed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// The coordinator session dropped before the answer arrived.
    Disconnected,
    KeyResolved(KeyResolvedEvent),
    Registered(RegisterResult),
    Allocated(AllocateResult),
    BlocksQueried(BlocksResult),
    Committed(CommitResult),
    Resolved(ResolveResult),
    Put(StorePutResult),
    Get(StoreGetResult),
    Range(StoreRangeResult),
}

impl From<CoordinatorResponse> for Response {
    fn from(response: CoordinatorResponse) -> Self {
        match response {
            CoordinatorResponse::Registered(r) => Response::Registered(r),
            CoordinatorResponse::Allocated(r) => Response::Allocated(r),
            CoordinatorResponse::BlocksQueried(r) => Response::BlocksQueried(r),
            CoordinatorResponse::Committed(r) => Response::Committed(r),
            CoordinatorResponse::Resolved(r) => Response::Resolved(r),
        }
    }
}

impl From<StoreResponse> for Response {
    fn from(response: StoreResponse) -> Self {
        match response {
            StoreResponse::Put(r) => Response::Put(r),
            StoreResponse::Get(r) => Response::Get(r),
            StoreResponse::Range(r) => Response::Range(r),
        }
    }
}

struct RequestEntry {
    owner: RequestOwner,
    target: RequestTarget,
    on_cancel: Option<CancelHook>,
}

impl fmt::Debug for RequestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEntry")
            .field("owner", &self.owner)
            .field("target", &self.target)
            .field("on_cancel", &self.on_cancel.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct RequestTable {
    next_id: RequestId,
    entries: HashMap<RequestId, RequestEntry>,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Id for a fire-and-forget message that expects no answer.
    pub fn allocate_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn register(
        &mut self,
        owner: RequestOwner,
        target: RequestTarget,
        on_cancel: Option<CancelHook>,
    ) -> RequestId {
        let id = self.allocate_id();
        self.entries.insert(
            id,
            RequestEntry {
                owner,
                target,
                on_cancel,
            },
        );
        id
    }

    /// The answer arrived; forget the request and return its owner.
    pub fn complete(&mut self, id: RequestId) -> Option<RequestOwner> {
        self.entries.remove(&id).map(|entry| entry.owner)
    }

    /// Remove every coordinator-targeted request, oldest first, running
    /// their cancellation hooks. Store requests stay.
    pub fn fail_coordinator_requests(&mut self) -> Vec<(RequestId, RequestOwner)> {
        let mut ids: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.target == RequestTarget::Coordinator)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        let mut failed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.entries.remove(&id) {
                if let Some(hook) = entry.on_cancel {
                    hook(id);
                }
                failed.push((id, entry.owner));
            }
        }
        failed
    }

    /// Drop every request owned by `query`, running cancellation hooks.
    pub fn cancel_owned_by(&mut self, query: QueryId) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.owner == RequestOwner::Query(query))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        for id in &ids {
            if let Some(entry) = self.entries.remove(id) {
                if let Some(hook) = entry.on_cancel {
                    hook(*id);
                }
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn disconnect_fails_only_coordinator_requests() {
        let mut table = RequestTable::new();
        let commit = table.register(RequestOwner::Query(1), RequestTarget::Coordinator, None);
        let put = table.register(RequestOwner::Query(1), RequestTarget::Store, None);
        let alloc = table.register(
            RequestOwner::IdAllocation(ChannelKind::Data),
            RequestTarget::Coordinator,
            None,
        );

        let failed = table.fail_coordinator_requests();
        assert_eq!(
            failed,
            vec![
                (commit, RequestOwner::Query(1)),
                (alloc, RequestOwner::IdAllocation(ChannelKind::Data)),
            ]
        );
        assert!(table.contains(put));
        assert_eq!(table.len(), 1);
        assert_eq!(table.complete(put), Some(RequestOwner::Query(1)));
        assert!(table.complete(put).is_none());
    }

    #[test]
    fn cancel_runs_hooks_of_owned_requests_only() {
        let cancelled = Arc::new(Mutex::new(Vec::new()));
        let hook = |sink: Arc<Mutex<Vec<RequestId>>>| -> CancelHook {
            Box::new(move |id| sink.lock().unwrap().push(id))
        };

        let mut table = RequestTable::new();
        let a = table.register(
            RequestOwner::Query(7),
            RequestTarget::Store,
            Some(hook(cancelled.clone())),
        );
        let b = table.register(RequestOwner::Query(7), RequestTarget::Coordinator, None);
        let other = table.register(
            RequestOwner::Query(8),
            RequestTarget::Store,
            Some(hook(cancelled.clone())),
        );

        assert_eq!(table.cancel_owned_by(7), vec![a, b]);
        assert_eq!(*cancelled.lock().unwrap(), vec![a]);
        assert!(table.contains(other));
    }

    #[test]
    fn disconnect_runs_hooks_of_coordinator_requests() {
        let cancelled = Arc::new(Mutex::new(Vec::new()));
        let sink = cancelled.clone();
        let hook: CancelHook = Box::new(move |id| sink.lock().unwrap().push(id));
        let sink = cancelled.clone();
        let store_hook: CancelHook = Box::new(move |id| sink.lock().unwrap().push(id));

        let mut table = RequestTable::new();
        let resolve = table.register(RequestOwner::Query(3), RequestTarget::Coordinator, Some(hook));
        let get = table.register(RequestOwner::Query(3), RequestTarget::Store, Some(store_hook));

        assert_eq!(
            table.fail_coordinator_requests(),
            vec![(resolve, RequestOwner::Query(3))]
        );
        assert_eq!(*cancelled.lock().unwrap(), vec![resolve]);
        assert!(table.contains(get));
    }

    #[test]
    fn responses_convert_into_the_closed_sum() {
        let put = StorePutResult {
            status: crate::depot::Status::Ok,
            error: None,
        };
        assert_eq!(
            Response::from(StoreResponse::Put(put.clone())),
            Response::Put(put)
        );
    }
}
