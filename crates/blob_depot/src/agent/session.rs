//! Agent session: registration with the coordinator, id caches, request
//! routing and the query arena.
//!
//! `Agent` is driven the same way as the coordinator: the runtime feeds it
//! client submissions, coordinator messages, store completions and ticks,
//! then drains the outbox. Queries live in an arena keyed by `QueryId`;
//! every answer is routed through the request table to its owner.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::depot::{
    AgentMessage, AgentRequest, AllocateResult, BlobSeqId, ChannelKind, CoordinatorMessage,
    Generation, GroupId, Key, LogoBlobId, NodeId, RegisterResult, RequestId, ResolveItem,
    ResolveResult, ResolvedValue, Status, StoreRequest, StoreResponse, TabletId,
    AGENT_EXPIRATION,
};
use crate::DepotError;

use super::kinds::KindCache;
use super::pending::PendingEventQueue;
use super::put::{PutQuery, PutRequest};
use super::read::{GetRequest, RangeRequest, ReadItem, ReadQuery};
use super::requests::{
    CancelHook, KeyResolvedEvent, QueryId, RequestOwner, RequestTable, RequestTarget, Response,
};

const DEFAULT_MAX_BLOB_SIZE: u32 = 10 << 20;
const DEFAULT_ID_BATCH_SIZE: u32 = 100;
const DEFAULT_ID_REFILL_THRESHOLD: u32 = 10;
const DEFAULT_MAX_READS_IN_FLIGHT: usize = 16;
const DEFAULT_BLOCK_CHECK_RETRIES: u32 = 3;
const DEFAULT_PENDING_EXPIRATION_MS: u64 = 5_000;
const DEFAULT_WATCHDOG_THRESHOLD_MS: u64 = 10_000;
/// Accounted size of a queued request that carries no payload.
const PENDING_REQUEST_OVERHEAD: usize = 128;

/// Called by the agent to abort a store request it no longer needs.
pub type StoreCancelHook = Arc<dyn Fn(RequestId) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub node_id: NodeId,
    /// Changes every process start; the coordinator resets leases of a node
    /// that comes back with a new instance.
    pub instance_id: u64,
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size: u32,
    #[serde(default = "default_max_blob_size")]
    pub max_put_size: u32,
    #[serde(default = "default_id_batch_size")]
    pub id_batch_size: u32,
    #[serde(default = "default_id_refill_threshold")]
    pub id_refill_threshold: u32,
    #[serde(default = "default_max_reads_in_flight")]
    pub max_reads_in_flight: usize,
    #[serde(default = "default_block_check_retries")]
    pub block_check_retries: u32,
    #[serde(default = "default_pending_queue_bytes")]
    pub pending_queue_bytes: usize,
    #[serde(default = "default_pending_expiration_ms")]
    pub pending_expiration_ms: u64,
    #[serde(default = "default_watchdog_threshold_ms")]
    pub watchdog_threshold_ms: u64,
}

fn default_max_blob_size() -> u32 {
    DEFAULT_MAX_BLOB_SIZE
}

fn default_id_batch_size() -> u32 {
    DEFAULT_ID_BATCH_SIZE
}

fn default_id_refill_threshold() -> u32 {
    DEFAULT_ID_REFILL_THRESHOLD
}

fn default_max_reads_in_flight() -> usize {
    DEFAULT_MAX_READS_IN_FLIGHT
}

fn default_block_check_retries() -> u32 {
    DEFAULT_BLOCK_CHECK_RETRIES
}

fn default_pending_queue_bytes() -> usize {
    super::pending::PENDING_QUEUE_MAX_BYTES
}

fn default_pending_expiration_ms() -> u64 {
    DEFAULT_PENDING_EXPIRATION_MS
}

fn default_watchdog_threshold_ms() -> u64 {
    DEFAULT_WATCHDOG_THRESHOLD_MS
}

impl AgentConfig {
    pub fn new(node_id: NodeId, instance_id: u64) -> Self {
        Self {
            node_id,
            instance_id,
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            max_put_size: DEFAULT_MAX_BLOB_SIZE,
            id_batch_size: DEFAULT_ID_BATCH_SIZE,
            id_refill_threshold: DEFAULT_ID_REFILL_THRESHOLD,
            max_reads_in_flight: DEFAULT_MAX_READS_IN_FLIGHT,
            block_check_retries: DEFAULT_BLOCK_CHECK_RETRIES,
            pending_queue_bytes: default_pending_queue_bytes(),
            pending_expiration_ms: DEFAULT_PENDING_EXPIRATION_MS,
            watchdog_threshold_ms: DEFAULT_WATCHDOG_THRESHOLD_MS,
        }
    }

    /// Reject settings under which the agent could never make progress.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.id_batch_size > 0, "agent {} has a zero id batch", self.node_id);
        anyhow::ensure!(
            self.max_reads_in_flight > 0,
            "agent {} allows no reads in flight",
            self.node_id
        );
        anyhow::ensure!(
            self.max_blob_size > 0 && self.max_put_size > 0,
            "agent {} has a zero size limit",
            self.node_id
        );
        Ok(())
    }

    pub fn pending_expiration(&self) -> Duration {
        Duration::from_millis(self.pending_expiration_ms)
    }

    pub fn watchdog_threshold(&self) -> Duration {
        Duration::from_millis(self.watchdog_threshold_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientRequest {
    Put(PutRequest),
    Range(RangeRequest),
    Get(GetRequest),
}

impl ClientRequest {
    fn accounted_size(&self) -> usize {
        match self {
            ClientRequest::Put(put) => put.data.len() + PENDING_REQUEST_OVERHEAD,
            ClientRequest::Range(_) => PENDING_REQUEST_OVERHEAD,
            ClientRequest::Get(get) => {
                PENDING_REQUEST_OVERHEAD + get.keys.len() * std::mem::size_of::<LogoBlobId>()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryOutcome {
    Put(Result<(), DepotError>),
    Read(Result<Vec<ReadItem>, DepotError>),
}

impl QueryOutcome {
    pub fn error(&self) -> Option<&DepotError> {
        match self {
            QueryOutcome::Put(Err(err)) | QueryOutcome::Read(Err(err)) => Some(err),
            _ => None,
        }
    }

    fn failed(request: &ClientRequest, err: DepotError) -> Self {
        match request {
            ClientRequest::Put(_) => QueryOutcome::Put(Err(err)),
            ClientRequest::Range(_) | ClientRequest::Get(_) => QueryOutcome::Read(Err(err)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentOutput {
    ToCoordinator(AgentMessage),
    ToStore { id: RequestId, request: StoreRequest },
    Completed { query: QueryId, outcome: QueryOutcome },
}

pub(super) enum Step {
    Pending,
    Done(QueryOutcome),
}

enum Delivery {
    Response {
        query: QueryId,
        request_id: RequestId,
        response: Response,
    },
    /// The id cache a parked query waits on was refilled.
    Resume(QueryId),
}

/// Session state shared by all queries.
pub(super) struct AgentCore {
    pub(super) config: AgentConfig,
    pub(super) requests: RequestTable,
    connected: bool,
    registered: bool,
    disconnected_at: Option<Instant>,
    pub(super) generation: Option<Generation>,
    pub(super) depot_tablet_id: TabletId,
    decommission_group: Option<GroupId>,
    kinds: BTreeMap<ChannelKind, KindCache>,
    key_resolves: HashMap<Key, Vec<QueryId>>,
    pending_discards: Vec<BlobSeqId>,
    store_cancel: Option<StoreCancelHook>,
    deliveries: VecDeque<Delivery>,
    outbox: Vec<AgentOutput>,
}

impl AgentCore {
    fn new(config: AgentConfig) -> Self {
        Self {
            config,
            requests: RequestTable::new(),
            connected: false,
            registered: false,
            disconnected_at: None,
            generation: None,
            depot_tablet_id: 0,
            decommission_group: None,
            kinds: BTreeMap::new(),
            key_resolves: HashMap::new(),
            pending_discards: Vec::new(),
            store_cancel: None,
            deliveries: VecDeque::new(),
            outbox: Vec::new(),
        }
    }

    /// Send a coordinator request on behalf of `query`. Without a session the
    /// request fails right away with `Response::Disconnected`.
    pub(super) fn send_coordinator(&mut self, query: QueryId, request: AgentRequest) -> RequestId {
        self.send_owned(RequestOwner::Query(query), request)
    }

    pub(super) fn send_store(&mut self, query: QueryId, request: StoreRequest) -> RequestId {
        let on_cancel = self.store_cancel.clone().map(|hook| -> CancelHook {
            Box::new(move |id| hook(id))
        });
        let id = self
            .requests
            .register(RequestOwner::Query(query), RequestTarget::Store, on_cancel);
        self.outbox.push(AgentOutput::ToStore { id, request });
        id
    }

    /// Take a cached id of `kind`, asking for more when the cache runs low.
    pub(super) fn lease(&mut self, kind: ChannelKind) -> Option<(BlobSeqId, GroupId)> {
        let generation = self.generation?;
        let leased = self.kinds.get_mut(&kind)?.take(generation);
        self.maybe_refill(kind);
        leased
    }

    pub(super) fn park(&mut self, kind: ChannelKind, query: QueryId) {
        let cache = self.kinds.entry(kind).or_default();
        if !cache.waiters.contains(&query) {
            cache.waiters.push_back(query);
        }
        self.maybe_refill(kind);
    }

    pub(super) fn unpark(&mut self, kind: ChannelKind, query: QueryId) {
        if let Some(cache) = self.kinds.get_mut(&kind) {
            cache.waiters.retain(|waiter| *waiter != query);
        }
    }

    pub(super) fn release_write(&mut self, seq: BlobSeqId) {
        for cache in self.kinds.values_mut() {
            cache.writes_in_flight.remove(&seq);
        }
    }

    /// Tell the coordinator `seq` will never carry live data. Kept until the
    /// next registration when there is no session.
    pub(super) fn discard(&mut self, seq: BlobSeqId) {
        self.release_write(seq);
        if self.registered {
            self.send_oneway(AgentRequest::DiscardSpoiledBlobSeq { ids: vec![seq] });
        } else {
            self.pending_discards.push(seq);
        }
    }

    /// Point resolve shared by every query that asks for `key` while one is
    /// in flight; answers arrive as `Response::KeyResolved`.
    pub(super) fn resolve_key(&mut self, query: QueryId, key: Key) {
        if let Some(waiters) = self.key_resolves.get_mut(&key) {
            if !waiters.contains(&query) {
                waiters.push(query);
            }
            return;
        }
        self.key_resolves.insert(key.clone(), vec![query]);
        let mut item = ResolveItem::exact(key.clone());
        item.tablet_id = LogoBlobId::from_key(&key).map(|id| id.tablet_id);
        self.send_owned(
            RequestOwner::KeyResolve(key),
            AgentRequest::Resolve { items: vec![item] },
        );
    }

    fn send_owned(&mut self, owner: RequestOwner, request: AgentRequest) -> RequestId {
        let request_id = self
            .requests
            .register(owner.clone(), RequestTarget::Coordinator, None);
        if self.connected {
            self.outbox
                .push(AgentOutput::ToCoordinator(AgentMessage { request_id, request }));
        } else {
            self.requests.complete(request_id);
            self.fail_request(request_id, owner);
        }
        request_id
    }

    fn send_oneway(&mut self, request: AgentRequest) {
        if !self.connected {
            return;
        }
        let request_id = self.requests.allocate_id();
        self.outbox
            .push(AgentOutput::ToCoordinator(AgentMessage { request_id, request }));
    }

    fn fail_request(&mut self, request_id: RequestId, owner: RequestOwner) {
        match owner {
            RequestOwner::Query(query) => self.deliveries.push_back(Delivery::Response {
                query,
                request_id,
                response: Response::Disconnected,
            }),
            RequestOwner::Registration => {}
            RequestOwner::IdAllocation(kind) => {
                if let Some(cache) = self.kinds.get_mut(&kind) {
                    cache.alloc_in_flight = false;
                }
            }
            RequestOwner::KeyResolve(key) => self.finish_key_resolve(
                key,
                request_id,
                Err(DepotError::CoordinatorDisconnected),
            ),
        }
    }

    fn finish_key_resolve(
        &mut self,
        key: Key,
        request_id: RequestId,
        result: Result<Option<ResolvedValue>, DepotError>,
    ) {
        let waiters = self.key_resolves.remove(&key).unwrap_or_default();
        for query in waiters {
            self.deliveries.push_back(Delivery::Response {
                query,
                request_id,
                response: Response::KeyResolved(KeyResolvedEvent {
                    key: key.clone(),
                    result: result.clone(),
                }),
            });
        }
    }

    fn on_key_resolved(&mut self, key: Key, request_id: RequestId, result: ResolveResult) {
        let outcome = match result.status {
            Status::Ok => result
                .items
                .into_iter()
                .find(|item| item.key == key)
                .map(|item| item.value)
                .transpose()
                .map_err(|error| DepotError::Resolve {
                    status: Status::Error,
                    error,
                }),
            status => Err(DepotError::Resolve {
                status,
                error: result.error.unwrap_or_default(),
            }),
        };
        self.finish_key_resolve(key, request_id, outcome);
    }

    fn maybe_refill(&mut self, kind: ChannelKind) {
        if !self.registered {
            return;
        }
        let threshold = self.config.id_refill_threshold;
        let batch = self.config.id_batch_size;
        let Some(cache) = self.kinds.get_mut(&kind) else {
            return;
        };
        if !cache.needs_refill(threshold) {
            return;
        }
        cache.alloc_in_flight = true;
        let count = batch.saturating_add(cache.waiters.len() as u32);
        self.send_owned(
            RequestOwner::IdAllocation(kind),
            AgentRequest::AllocateIds { kind, count },
        );
    }

    fn on_allocated(&mut self, kind: ChannelKind, result: AllocateResult) {
        let current = self.generation;
        let Some(cache) = self.kinds.get_mut(&kind) else {
            return;
        };
        cache.alloc_in_flight = false;
        if current != Some(result.generation) {
            tracing::debug!(?kind, generation = result.generation, "dropping ids of a stale generation");
            return;
        }
        cache.add_ranges(&result.ranges);

        let mut budget = cache.available();
        while budget > 0 {
            let Some(query) = cache.waiters.pop_front() else {
                break;
            };
            self.deliveries.push_back(Delivery::Resume(query));
            budget -= 1;
        }
        if result.ranges.is_empty() {
            tracing::warn!(?kind, "coordinator returned no ids");
        } else {
            self.maybe_refill(kind);
        }
    }

    fn apply_registration(&mut self, result: RegisterResult, now: Instant) {
        let stale_leases = self.generation != Some(result.generation)
            || self
                .disconnected_at
                .is_some_and(|at| now.saturating_duration_since(at) >= AGENT_EXPIRATION / 2);
        if stale_leases && self.generation.is_some() {
            tracing::info!(
                node_id = self.config.node_id,
                generation = result.generation,
                "dropping cached ids after session change"
            );
        }

        self.generation = Some(result.generation);
        self.depot_tablet_id = result.tablet_id;
        self.decommission_group = result.decommission_group;
        self.registered = true;
        self.disconnected_at = None;

        for layout in result.kinds {
            let cache = self.kinds.entry(layout.kind).or_default();
            if stale_leases {
                cache.reset(layout.channels);
            } else {
                cache.channels = layout.channels;
            }
        }

        let discards = std::mem::take(&mut self.pending_discards);
        if !discards.is_empty() {
            self.send_oneway(AgentRequest::DiscardSpoiledBlobSeq { ids: discards });
        }
        let kinds: Vec<ChannelKind> = self.kinds.keys().copied().collect();
        for kind in kinds {
            self.maybe_refill(kind);
        }
    }

    fn on_push_notify(&mut self, correlation_id: u64, invalidate: Vec<(u8, u64)>) {
        let mut writes_in_flight = Vec::new();
        for (channel, below) in invalidate {
            for cache in self.kinds.values_mut() {
                if cache.channels.iter().any(|c| c.channel == channel) {
                    writes_in_flight.extend(cache.invalidate(channel, below));
                }
            }
        }
        writes_in_flight.sort_unstable();
        writes_in_flight.dedup();
        tracing::debug!(correlation_id, in_flight = writes_in_flight.len(), "answering push notify");
        self.send_oneway(AgentRequest::PushNotifyResult {
            correlation_id,
            writes_in_flight,
        });
    }
}

enum Query {
    Put(PutQuery),
    Read(ReadQuery),
}

impl Query {
    fn start(&mut self, core: &mut AgentCore) -> Step {
        match self {
            Query::Put(put) => put.start(core),
            Query::Read(read) => read.start(core),
        }
    }

    fn on_response(&mut self, core: &mut AgentCore, request_id: RequestId, response: Response) -> Step {
        match self {
            Query::Put(put) => put.on_response(core, request_id, response),
            Query::Read(read) => read.on_response(core, request_id, response),
        }
    }

    fn resume(&mut self, core: &mut AgentCore) -> Step {
        match self {
            Query::Put(put) => put.resume(core),
            Query::Read(_) => Step::Pending,
        }
    }

    fn teardown(&mut self, core: &mut AgentCore) {
        if let Query::Put(put) = self {
            put.teardown(core);
        }
    }

    fn describe(&self) -> String {
        match self {
            Query::Put(put) => format!("put {:?}", put.state()),
            Query::Read(read) => format!("read {:?}", read.state()),
        }
    }
}

struct QueryEntry {
    query: Query,
    started_at: Instant,
    reported_slow: bool,
}

pub struct Agent {
    core: AgentCore,
    queries: HashMap<QueryId, QueryEntry>,
    pending: PendingEventQueue<(QueryId, ClientRequest)>,
    next_query: QueryId,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let pending = PendingEventQueue::new(config.pending_queue_bytes, config.pending_expiration());
        Self {
            core: AgentCore::new(config),
            queries: HashMap::new(),
            pending,
            next_query: 1,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.core.config
    }

    pub fn is_registered(&self) -> bool {
        self.core.registered
    }

    pub fn generation(&self) -> Option<Generation> {
        self.core.generation
    }

    pub fn depot_tablet_id(&self) -> TabletId {
        self.core.depot_tablet_id
    }

    pub fn decommission_group(&self) -> Option<GroupId> {
        self.core.decommission_group
    }

    pub fn running_queries(&self) -> usize {
        self.queries.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_requests(&self) -> usize {
        self.core.requests.len()
    }

    /// Ids of `kind` currently cached and not yet handed to a write.
    pub fn cached_ids(&self, kind: ChannelKind) -> u64 {
        self.core.kinds.get(&kind).map_or(0, KindCache::available)
    }

    pub fn set_store_cancel_hook(&mut self, hook: StoreCancelHook) {
        self.core.store_cancel = Some(hook);
    }

    /// A coordinator session is up; start registration.
    pub fn connected(&mut self) {
        self.core.connected = true;
        self.core.registered = false;
        let node_id = self.core.config.node_id;
        let instance_id = self.core.config.instance_id;
        tracing::debug!(node_id, instance_id, "registering with coordinator");
        self.core.send_owned(
            RequestOwner::Registration,
            AgentRequest::Register {
                node_id,
                instance_id,
            },
        );
    }

    /// The coordinator session dropped. Every outstanding coordinator request
    /// fails; store requests keep running.
    pub fn coordinator_disconnected(&mut self, now: Instant) {
        if !self.core.connected {
            return;
        }
        tracing::info!(node_id = self.core.config.node_id, "coordinator session lost");
        self.core.connected = false;
        self.core.registered = false;
        self.core.disconnected_at = Some(now);
        for (request_id, owner) in self.core.requests.fail_coordinator_requests() {
            self.core.fail_request(request_id, owner);
        }
        self.pump();
    }

    pub fn submit(&mut self, request: ClientRequest, now: Instant) -> QueryId {
        let query = self.next_query;
        self.next_query += 1;

        if let ClientRequest::Put(put) = &request {
            if let Err(err) = PutQuery::validate(put, &self.core.config) {
                tracing::debug!(query, error = %err, "rejecting put");
                self.complete(query, QueryOutcome::Put(Err(err)));
                return query;
            }
        }

        if !self.core.registered {
            let size = request.accounted_size();
            if let Err((_, request)) = self.pending.push((query, request), size, now) {
                tracing::warn!(query, "pending queue full, rejecting request");
                self.complete(query, QueryOutcome::failed(&request, DepotError::QueueFull));
            }
            return query;
        }

        self.start(query, request, now);
        query
    }

    /// Abandon `query`; its requests are cancelled and it completes with
    /// `Cancelled`.
    pub fn cancel(&mut self, query: QueryId) {
        if let Some((_, request)) = self.pending.remove_first(|(id, _)| *id == query) {
            self.complete(query, QueryOutcome::failed(&request, DepotError::Cancelled));
            return;
        }
        let outcome = match self.queries.get(&query).map(|entry| &entry.query) {
            Some(Query::Put(_)) => QueryOutcome::Put(Err(DepotError::Cancelled)),
            Some(Query::Read(_)) => QueryOutcome::Read(Err(DepotError::Cancelled)),
            None => return,
        };
        self.settle(query, Step::Done(outcome));
        self.pump();
    }

    pub fn handle_coordinator(&mut self, message: CoordinatorMessage, now: Instant) {
        match message {
            CoordinatorMessage::PushNotify {
                correlation_id,
                invalidate,
            } => self.core.on_push_notify(correlation_id, invalidate),
            CoordinatorMessage::Reply {
                request_id,
                response,
            } => match self.core.requests.complete(request_id) {
                Some(RequestOwner::Query(query)) => self.deliver(query, request_id, response.into()),
                Some(RequestOwner::Registration) => match Response::from(response) {
                    Response::Registered(result) => self.on_registered(result, now),
                    other => tracing::warn!(?other, "unexpected registration reply"),
                },
                Some(RequestOwner::IdAllocation(kind)) => match Response::from(response) {
                    Response::Allocated(result) => self.core.on_allocated(kind, result),
                    other => {
                        tracing::warn!(?kind, ?other, "unexpected allocation reply");
                        if let Some(cache) = self.core.kinds.get_mut(&kind) {
                            cache.alloc_in_flight = false;
                        }
                    }
                },
                Some(RequestOwner::KeyResolve(key)) => match Response::from(response) {
                    Response::Resolved(result) => self.core.on_key_resolved(key, request_id, result),
                    other => {
                        tracing::warn!(?other, "unexpected point resolve reply");
                        self.core.finish_key_resolve(
                            key,
                            request_id,
                            Err(DepotError::Resolve {
                                status: Status::Error,
                                error: "unexpected reply".into(),
                            }),
                        );
                    }
                },
                None => tracing::trace!(request_id, "reply for a forgotten request"),
            },
        }
        self.pump();
    }

    pub fn handle_store(&mut self, id: RequestId, response: StoreResponse) {
        match self.core.requests.complete(id) {
            Some(RequestOwner::Query(query)) => self.deliver(query, id, response.into()),
            Some(owner) => tracing::warn!(?owner, "store reply for a non-query request"),
            None => tracing::trace!(id, "store reply for a finished request"),
        }
        self.pump();
    }

    /// Expire queued requests, report slow queries and retry refills for
    /// parked queries.
    pub fn tick(&mut self, now: Instant) {
        for (query, request) in self.pending.expire(now) {
            tracing::debug!(query, "pending request expired");
            self.complete(query, QueryOutcome::failed(&request, DepotError::Expired));
        }

        let threshold = self.core.config.watchdog_threshold();
        for (query, entry) in &mut self.queries {
            let elapsed = now.saturating_duration_since(entry.started_at);
            if !entry.reported_slow && elapsed >= threshold {
                entry.reported_slow = true;
                tracing::warn!(
                    query,
                    state = %entry.query.describe(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "query is taking too long"
                );
            }
        }

        let waiting: Vec<ChannelKind> = self
            .core
            .kinds
            .iter()
            .filter(|(_, cache)| !cache.waiters.is_empty())
            .map(|(kind, _)| *kind)
            .collect();
        for kind in waiting {
            self.core.maybe_refill(kind);
        }
        self.pump();
    }

    pub fn drain_outbox(&mut self) -> Vec<AgentOutput> {
        std::mem::take(&mut self.core.outbox)
    }

    fn on_registered(&mut self, result: RegisterResult, now: Instant) {
        tracing::info!(
            node_id = self.core.config.node_id,
            generation = result.generation,
            depot_tablet_id = result.tablet_id,
            "registered with coordinator"
        );
        self.core.apply_registration(result, now);
        for (query, request) in self.pending.drain() {
            self.start(query, request, now);
        }
    }

    fn start(&mut self, query: QueryId, request: ClientRequest, now: Instant) {
        let mut running = match request {
            ClientRequest::Put(put) => Query::Put(PutQuery::new(query, put)),
            ClientRequest::Range(range) => Query::Read(ReadQuery::range(query, range)),
            ClientRequest::Get(get) => Query::Read(ReadQuery::get(query, get)),
        };
        let step = running.start(&mut self.core);
        self.queries.insert(
            query,
            QueryEntry {
                query: running,
                started_at: now,
                reported_slow: false,
            },
        );
        self.settle(query, step);
        self.pump();
    }

    fn deliver(&mut self, query: QueryId, request_id: RequestId, response: Response) {
        let Some(entry) = self.queries.get_mut(&query) else {
            tracing::trace!(query, request_id, "response for a finished query");
            return;
        };
        let step = entry.query.on_response(&mut self.core, request_id, response);
        self.settle(query, step);
    }

    fn pump(&mut self) {
        while let Some(delivery) = self.core.deliveries.pop_front() {
            match delivery {
                Delivery::Response {
                    query,
                    request_id,
                    response,
                } => self.deliver(query, request_id, response),
                Delivery::Resume(query) => {
                    let Some(entry) = self.queries.get_mut(&query) else {
                        continue;
                    };
                    let step = entry.query.resume(&mut self.core);
                    self.settle(query, step);
                }
            }
        }
    }

    fn settle(&mut self, query: QueryId, step: Step) {
        let Step::Done(outcome) = step else {
            return;
        };
        if let Some(mut entry) = self.queries.remove(&query) {
            self.core.requests.cancel_owned_by(query);
            entry.query.teardown(&mut self.core);
        }
        self.complete(query, outcome);
    }

    fn complete(&mut self, query: QueryId, outcome: QueryOutcome) {
        self.core
            .outbox
            .push(AgentOutput::Completed { query, outcome });
    }
}

#[cfg(test)]
impl Agent {
    fn put_state(&self, query: QueryId) -> Option<super::put::PutState> {
        match &self.queries.get(&query)?.query {
            Query::Put(put) => Some(put.state()),
            Query::Read(_) => None,
        }
    }
}
