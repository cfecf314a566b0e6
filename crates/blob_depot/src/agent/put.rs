//! Write path for one blob.
//!
//! `CheckingBlocks → AllocatingId → Writing → Committing → Finished`. The
//! uncertain commit is issued together with the physical writes; the final
//! commit goes out once both have been acknowledged and the coordinator
//! generation has not moved. A lease that never reaches a successful final
//! commit is discarded on teardown.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use bytes::Bytes;

use crate::depot::{
    plan_blob_writes, AgentRequest, BlobLocator, BlobPut, BlobSeqId, BlocksResult, ChannelKind,
    CommitItem, CommitResult, Generation, HandleClass, KeepState, LogoBlobId, RequestId, Status,
    StorePutResult, StoreRequest, TabletId,
};
use crate::DepotError;

use super::requests::{QueryId, Response};
use super::session::{AgentConfig, AgentCore, QueryOutcome, Step};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutRequest {
    pub key: LogoBlobId,
    pub data: Bytes,
    /// Further (tablet, generation) pairs that must not be blocked.
    pub extra_block_checks: Vec<(TabletId, Generation)>,
    pub deadline: Option<Instant>,
    pub handle_class: HandleClass,
    pub keep_state: KeepState,
}

impl PutRequest {
    pub fn new(key: LogoBlobId, data: Bytes) -> Self {
        Self {
            key,
            data,
            extra_block_checks: Vec::new(),
            deadline: None,
            handle_class: HandleClass::UserData,
            keep_state: KeepState::Default,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutState {
    CheckingBlocks,
    AllocatingId,
    Writing,
    Committing,
    Finished,
}

#[derive(Clone, Copy, Debug)]
struct BlockCheck {
    tablet_id: TabletId,
    generation: Generation,
    attempts: u32,
}

#[derive(Clone, Copy, Debug)]
struct Lease {
    seq: BlobSeqId,
    locator: BlobLocator,
}

pub(super) struct PutQuery {
    id: QueryId,
    request: PutRequest,
    state: PutState,
    block_checks: HashMap<RequestId, BlockCheck>,
    lease: Option<Lease>,
    writes: HashSet<RequestId>,
    uncertain_commit: Option<RequestId>,
    uncertain_acked: bool,
    final_commit: Option<RequestId>,
    committed: bool,
}

impl PutQuery {
    /// Synchronous rejection of requests that can never succeed.
    pub(super) fn validate(request: &PutRequest, config: &AgentConfig) -> Result<(), DepotError> {
        if request.key.is_zero() {
            return Err(DepotError::Malformed("zero blob id".into()));
        }
        if request.data.is_empty() {
            return Err(DepotError::Malformed("empty payload".into()));
        }
        if request.key.blob_size as usize != request.data.len() {
            return Err(DepotError::Malformed(format!(
                "blob id declares {} bytes, payload has {}",
                request.key.blob_size,
                request.data.len()
            )));
        }
        if request.data.len() > config.max_put_size as usize {
            return Err(DepotError::Malformed(format!(
                "payload of {} bytes exceeds the {} byte limit",
                request.data.len(),
                config.max_put_size
            )));
        }
        Ok(())
    }

    pub(super) fn new(id: QueryId, request: PutRequest) -> Self {
        Self {
            id,
            request,
            state: PutState::CheckingBlocks,
            block_checks: HashMap::new(),
            lease: None,
            writes: HashSet::new(),
            uncertain_commit: None,
            uncertain_acked: false,
            final_commit: None,
            committed: false,
        }
    }

    pub(super) fn state(&self) -> PutState {
        self.state
    }

    pub(super) fn start(&mut self, core: &mut AgentCore) -> Step {
        let mut checks = vec![(self.request.key.tablet_id, self.request.key.generation)];
        checks.extend(self.request.extra_block_checks.iter().copied());
        checks.sort_unstable();
        checks.dedup();
        for (tablet_id, generation) in checks {
            self.query_blocks(
                core,
                BlockCheck {
                    tablet_id,
                    generation,
                    attempts: 0,
                },
            );
        }
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
            Response::BlocksQueried(result) => self.on_blocks(core, request_id, result),
            Response::Put(result) => self.on_written(core, request_id, result),
            Response::Committed(result) => self.on_committed(core, request_id, result),
            other => {
                tracing::warn!(query = self.id, ?other, "unexpected response for put");
                Step::Pending
            }
        }
    }

    /// Called when the id cache was refilled while parked.
    pub(super) fn resume(&mut self, core: &mut AgentCore) -> Step {
        if self.state == PutState::AllocatingId {
            self.try_lease(core)
        } else {
            Step::Pending
        }
    }

    pub(super) fn teardown(&mut self, core: &mut AgentCore) {
        core.unpark(ChannelKind::Data, self.id);
        if let Some(lease) = self.lease.take() {
            if self.committed {
                core.release_write(lease.seq);
            } else {
                tracing::debug!(query = self.id, seq = %lease.seq, "discarding unfinished write");
                core.discard(lease.seq);
            }
        }
    }

    fn fail(&mut self, err: DepotError) -> Step {
        tracing::debug!(query = self.id, state = ?self.state, error = %err, "put failed");
        self.state = PutState::Finished;
        Step::Done(QueryOutcome::Put(Err(err)))
    }

    fn query_blocks(&mut self, core: &mut AgentCore, check: BlockCheck) {
        let id = core.send_coordinator(
            self.id,
            AgentRequest::QueryBlocks {
                tablet_id: check.tablet_id,
                generation: check.generation,
            },
        );
        self.block_checks.insert(id, check);
    }

    fn on_blocks(&mut self, core: &mut AgentCore, request_id: RequestId, result: BlocksResult) -> Step {
        let Some(mut check) = self.block_checks.remove(&request_id) else {
            return Step::Pending;
        };
        match result.status {
            Status::Ok => {}
            Status::Unknown => {
                check.attempts += 1;
                if check.attempts > core.config.block_check_retries {
                    return self.fail(DepotError::BlockCheckUnknown {
                        tablet_id: check.tablet_id,
                        generation: check.generation,
                    });
                }
                tracing::debug!(
                    query = self.id,
                    tablet_id = check.tablet_id,
                    attempt = check.attempts,
                    "block state unknown, retrying"
                );
                self.query_blocks(core, check);
                return Step::Pending;
            }
            status => {
                return self.fail(DepotError::Race(format!(
                    "tablet {} generation {} is {status}",
                    check.tablet_id, check.generation
                )));
            }
        }

        if self.block_checks.is_empty() {
            self.state = PutState::AllocatingId;
            return self.try_lease(core);
        }
        Step::Pending
    }

    fn try_lease(&mut self, core: &mut AgentCore) -> Step {
        let Some((seq, group_id)) = core.lease(ChannelKind::Data) else {
            core.park(ChannelKind::Data, self.id);
            return Step::Pending;
        };

        let (locator, writes) = plan_blob_writes(
            seq,
            core.depot_tablet_id,
            group_id,
            &self.request.key,
            &self.request.data,
            core.config.max_blob_size,
        );
        self.lease = Some(Lease { seq, locator });
        self.state = PutState::Writing;

        for write in writes {
            let id = core.send_store(
                self.id,
                StoreRequest::Put(BlobPut {
                    group_id,
                    blob_id: write.blob_id,
                    data: write.data,
                    deadline: self.request.deadline,
                    handle_class: self.request.handle_class,
                }),
            );
            self.writes.insert(id);
        }

        let mut item = self.commit_item(locator);
        item.uncertain = true;
        self.uncertain_commit =
            Some(core.send_coordinator(self.id, AgentRequest::Commit { items: vec![item] }));
        Step::Pending
    }

    fn on_written(&mut self, core: &mut AgentCore, request_id: RequestId, result: StorePutResult) -> Step {
        if !self.writes.remove(&request_id) {
            return Step::Pending;
        }
        if !result.status.is_ok() {
            return self.fail(DepotError::Store {
                status: result.status,
                error: result.error.unwrap_or_default(),
            });
        }
        self.maybe_final_commit(core)
    }

    fn on_committed(&mut self, core: &mut AgentCore, request_id: RequestId, result: CommitResult) -> Step {
        let (status, error) = result
            .items
            .into_iter()
            .next()
            .map(|item| (item.status, item.error.unwrap_or_default()))
            .unwrap_or((Status::Error, "empty commit reply".to_string()));

        if self.uncertain_commit == Some(request_id) {
            self.uncertain_commit = None;
            // RACE: another value already won the key and this attempt's id
            // is retired. The final commit answers RACE again.
            if !matches!(status, Status::Ok | Status::Race) {
                return self.fail(DepotError::Commit(status, error));
            }
            self.uncertain_acked = true;
            return self.maybe_final_commit(core);
        }

        if self.final_commit == Some(request_id) {
            self.final_commit = None;
            if !matches!(status, Status::Ok | Status::Race) {
                return self.fail(DepotError::Commit(status, error));
            }
            self.committed = true;
            self.state = PutState::Finished;
            return Step::Done(QueryOutcome::Put(Ok(())));
        }
        Step::Pending
    }

    fn maybe_final_commit(&mut self, core: &mut AgentCore) -> Step {
        if !self.writes.is_empty() || !self.uncertain_acked || self.final_commit.is_some() {
            return Step::Pending;
        }
        let Some(lease) = self.lease else {
            return Step::Pending;
        };
        if core.generation != Some(lease.seq.generation) {
            return self.fail(DepotError::GenerationMismatch {
                expected: lease.seq.generation,
                actual: core.generation.unwrap_or_default(),
            });
        }

        let mut item = self.commit_item(lease.locator);
        item.commit_notify = true;
        self.state = PutState::Committing;
        self.final_commit =
            Some(core.send_coordinator(self.id, AgentRequest::Commit { items: vec![item] }));
        Step::Pending
    }

    fn commit_item(&self, locator: BlobLocator) -> CommitItem {
        let mut item = CommitItem::new(self.request.key.to_key(), vec![locator]);
        item.keep_state = self.request.keep_state;
        item
    }
}
