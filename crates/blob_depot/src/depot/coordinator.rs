//! Coordinator state machine.
//!
//! The coordinator leases sequence ranges to agents, validates and persists
//! commits, resolves keys and drives decommission migration. It is a plain
//! synchronous state machine: the runtime feeds it connection events, agent
//! messages, store completions and timer ticks, then drains `outbox` and
//! performs the sends and store requests on its behalf.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::channels::{Channel, ChannelRegistry};
use super::config::{DepotConfig, OperationMode};
use super::data::{Data, CONFIG_PARTITION};
use super::decommission::{DecommitAction, DecommitDriver};
use super::footer::plan_blob_writes;
use super::given_id_range::GivenIdRange;
use super::types::{
    AgentMessage, AgentRequest, AllocateResult, BarrierAuthority, BlobLocator, BlobPut, BlobSeqId,
    BlocksAuthority, BlocksResult, ChannelKind, CommitItem, CommitResult, CommittedValue,
    ConnectionId, CoordinatorMessage, CoordinatorResponse, DurableTable, Generation, GroupId,
    HandleClass, ItemResult, Key, LogoBlobId, NodeId, RegisterResult, RequestId, ResolveItem,
    ResolveResult, ResolveTarget, Status, StoreRequest, StoreResponse, TabletId,
};

/// How long a disconnected agent keeps its leases before being reset.
pub const AGENT_EXPIRATION: Duration = Duration::from_secs(60);
const MAX_IDS_PER_REQUEST: u32 = 1 << 16;
const DEFAULT_PAGE_SIZE: usize = 10_000;
const CONFIG_KEY: &[u8] = b"depot_config";
const DECOMMIT_STATE_KEY: &[u8] = b"decommit_state";

/// External services the coordinator consults.
#[derive(Clone)]
pub struct Collaborators {
    pub table: Arc<dyn DurableTable>,
    pub blocks: Arc<dyn BlocksAuthority>,
    pub barriers: Arc<dyn BarrierAuthority>,
}

/// Progress of absorbing the decommissioned group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecommitState {
    #[default]
    None,
    /// Legacy blocks are still being copied; registrations wait.
    Blocks,
    BlocksFinished,
    Done,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinatorOutput {
    Send {
        connection: ConnectionId,
        message: CoordinatorMessage,
    },
    Store {
        id: u64,
        request: StoreRequest,
    },
}

/// Counters snapshot for debugging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DebugStats {
    pub generation: Generation,
    pub agents: usize,
    pub connected_agents: usize,
    pub queued_registrations: usize,
    pub committed_keys: usize,
    pub uncertain_keys: usize,
    pub leased_ids: u64,
    pub decommit_drivers: usize,
    pub pending_pushes: usize,
}

#[derive(Debug, Default)]
struct AgentRecord {
    connection: Option<ConnectionId>,
    instance_id: Option<u64>,
    expiration: Option<Instant>,
    given: BTreeMap<u8, GivenIdRange>,
}

#[derive(Debug, Default)]
struct ConnectionState {
    node_id: Option<NodeId>,
}

#[derive(Clone, Copy, Debug)]
struct QueuedRegistration {
    request_id: RequestId,
    node_id: NodeId,
    instance_id: u64,
}

#[derive(Clone, Copy, Debug)]
struct PendingPush {
    node_id: NodeId,
    channel: u8,
    below: u64,
}

#[derive(Clone, Copy, Debug)]
enum StoreContext {
    DecommitScan { driver: u64, must_restore: bool },
    DecommitFetch { driver: u64, id: LogoBlobId },
    DecommitWrite { write: u64 },
}

/// Re-put of one legacy blob into a depot channel.
#[derive(Debug)]
struct InternalWrite {
    driver: u64,
    key: LogoBlobId,
    seq: BlobSeqId,
    locator: BlobLocator,
    remaining: usize,
    error: Option<String>,
}

pub struct Coordinator {
    generation: Generation,
    config: Option<DepotConfig>,
    channels: ChannelRegistry,
    agents: HashMap<NodeId, AgentRecord>,
    connections: HashMap<ConnectionId, ConnectionState>,
    queued: BTreeMap<ConnectionId, QueuedRegistration>,
    data: Data,
    table: Arc<dyn DurableTable>,
    blocks: Arc<dyn BlocksAuthority>,
    barriers: Arc<dyn BarrierAuthority>,
    decommit: DecommitState,
    drivers: HashMap<u64, DecommitDriver>,
    store_contexts: HashMap<u64, StoreContext>,
    internal_writes: HashMap<u64, InternalWrite>,
    /// Ids leased for decommission re-puts, per channel.
    internal_given: BTreeMap<u8, GivenIdRange>,
    pending_pushes: HashMap<u64, PendingPush>,
    least_expected: BTreeMap<u8, BlobSeqId>,
    next_id: u64,
    rng: StdRng,
    outbox: Vec<CoordinatorOutput>,
}

impl Coordinator {
    /// Load configuration and the index from `collaborators.table` and start
    /// a new generation. Leases of older generations are void.
    pub fn open(
        generation: Generation,
        collaborators: Collaborators,
        seed: u64,
    ) -> anyhow::Result<Self> {
        let Collaborators {
            table,
            blocks,
            barriers,
        } = collaborators;

        let mut config = None;
        let mut decommit = DecommitState::None;
        for (key, value) in table.scan(CONFIG_PARTITION).context("scan config partition")? {
            if key == CONFIG_KEY {
                config = Some(DepotConfig::decode(&value).context("decode stored depot config")?);
            } else if key == DECOMMIT_STATE_KEY {
                decommit =
                    serde_json::from_slice(&value).context("decode stored decommission state")?;
            }
        }
        let data = Data::load(table.clone())?;

        let mut channels = ChannelRegistry::new(generation);
        if let Some(cfg) = &config {
            channels.initialize(&cfg.channels);
        }
        tracing::info!(
            generation,
            keys = data.len(),
            uncertain = data.uncertain_keys().count(),
            configured = config.is_some(),
            ?decommit,
            "coordinator opened"
        );

        let mut coordinator = Self {
            generation,
            config,
            channels,
            agents: HashMap::new(),
            connections: HashMap::new(),
            queued: BTreeMap::new(),
            data,
            table,
            blocks,
            barriers,
            decommit,
            drivers: HashMap::new(),
            store_contexts: HashMap::new(),
            internal_writes: HashMap::new(),
            internal_given: BTreeMap::new(),
            pending_pushes: HashMap::new(),
            least_expected: BTreeMap::new(),
            next_id: 1,
            rng: StdRng::seed_from_u64(seed),
            outbox: Vec::new(),
        };
        coordinator.refresh_least_expected();
        Ok(coordinator)
    }

    /// Persist `config`. The first application with channels initializes the
    /// channel registry; later layout changes are ignored.
    pub fn apply_config(&mut self, config: DepotConfig) -> anyhow::Result<()> {
        config.validate()?;
        if let Some(current) = &self.config {
            anyhow::ensure!(
                current.tablet_id == config.tablet_id,
                "depot tablet id cannot change from {} to {}",
                current.tablet_id,
                config.tablet_id
            );
        }

        self.table
            .upsert(CONFIG_PARTITION, CONFIG_KEY, &config.encode()?)
            .context("persist depot config")?;
        if config.decommission_group.is_some() && self.decommit == DecommitState::None {
            self.set_decommit_state(DecommitState::Blocks)?;
        }
        self.table.persist().context("persist depot config")?;

        let created = self.channels.initialize(&config.channels);
        tracing::info!(
            tablet_id = config.tablet_id,
            channels = created,
            decommission_group = ?config.decommission_group,
            "depot config applied"
        );
        self.config = Some(config);
        self.refresh_least_expected();
        self.replay_registrations();
        Ok(())
    }

    /// Legacy blocks are copied; queued registrations may proceed.
    pub fn finish_decommission_blocks(&mut self) -> anyhow::Result<()> {
        if self.decommit == DecommitState::Blocks {
            self.set_decommit_state(DecommitState::BlocksFinished)?;
            self.table.persist()?;
            tracing::info!("decommission blocks finished");
            self.replay_registrations();
        }
        Ok(())
    }

    /// The legacy group is fully assimilated; resolves no longer scan it.
    pub fn complete_decommission(&mut self) -> anyhow::Result<()> {
        if self.decommit != DecommitState::Done {
            self.set_decommit_state(DecommitState::Done)?;
            self.table.persist()?;
            tracing::info!("decommission complete");
            self.replay_registrations();
        }
        Ok(())
    }

    pub fn set_last_assimilated(&mut self, key: Key) -> anyhow::Result<()> {
        self.data.set_last_assimilated(key)?;
        self.table.persist()
    }

    pub fn connect(&mut self, connection: ConnectionId) {
        self.connections.entry(connection).or_default();
        tracing::debug!(connection, "connection opened");
    }

    /// Drop per-connection state. The agent keeps its leases until
    /// `AGENT_EXPIRATION` passes without a re-registration.
    pub fn disconnect(&mut self, connection: ConnectionId, now: Instant) {
        self.queued.remove(&connection);
        let Some(state) = self.connections.remove(&connection) else {
            return;
        };
        let Some(node_id) = state.node_id else {
            return;
        };
        self.pending_pushes.retain(|_, push| push.node_id != node_id);
        if let Some(agent) = self.agents.get_mut(&node_id) {
            if agent.connection == Some(connection) {
                agent.connection = None;
                agent.expiration = Some(now + AGENT_EXPIRATION);
            }
        }
        tracing::info!(node_id, connection, "agent disconnected");
    }

    /// Reset every disconnected agent whose expiration has passed.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<NodeId> {
        let mut expired: Vec<NodeId> = self
            .agents
            .iter()
            .filter(|(_, agent)| {
                agent.connection.is_none() && agent.expiration.is_some_and(|at| at <= now)
            })
            .map(|(node_id, _)| *node_id)
            .collect();
        expired.sort_unstable();
        for node_id in &expired {
            tracing::info!(node_id, "agent expired");
            self.reset_agent(*node_id);
            self.agents.remove(node_id);
        }
        expired
    }

    /// Handle one agent message. An error means the connection broke the
    /// protocol and should be closed.
    pub fn handle(&mut self, connection: ConnectionId, message: AgentMessage) -> anyhow::Result<()> {
        let AgentMessage {
            request_id,
            request,
        } = message;
        anyhow::ensure!(
            self.connections.contains_key(&connection),
            "message on unknown connection {connection}"
        );

        match request {
            AgentRequest::Register {
                node_id,
                instance_id,
            } => self.register(connection, request_id, node_id, instance_id),
            AgentRequest::AllocateIds { kind, count } => {
                let node_id = self.bound_node(connection)?;
                self.allocate(connection, request_id, node_id, kind, count)
            }
            AgentRequest::QueryBlocks {
                tablet_id,
                generation,
            } => {
                self.bound_node(connection)?;
                let status = self.blocks.check(tablet_id, generation);
                self.reply(
                    connection,
                    request_id,
                    CoordinatorResponse::BlocksQueried(BlocksResult { tablet_id, status }),
                );
                Ok(())
            }
            AgentRequest::Commit { items } => {
                let node_id = self.bound_node(connection)?;
                self.commit(connection, request_id, node_id, items)
            }
            AgentRequest::Resolve { items } => {
                self.bound_node(connection)?;
                self.resolve(connection, request_id, items)
            }
            AgentRequest::DiscardSpoiledBlobSeq { ids } => {
                let node_id = self.bound_node(connection)?;
                self.discard(node_id, ids)
            }
            AgentRequest::PushNotifyResult {
                correlation_id,
                writes_in_flight,
            } => {
                let node_id = self.bound_node(connection)?;
                self.push_notify_result(node_id, correlation_id, writes_in_flight)
            }
        }
    }

    /// Ask every connected agent holding ids below `below` on `channel` to
    /// give them back. Returns the number of agents notified.
    pub fn invalidate_below(&mut self, channel: u8, below: u64) -> usize {
        let mut targets: Vec<(NodeId, ConnectionId)> = self
            .agents
            .iter()
            .filter_map(|(node_id, agent)| {
                let connection = agent.connection?;
                let first = agent.given.get(&channel)?.first()?;
                (first < below).then_some((*node_id, connection))
            })
            .collect();
        targets.sort_unstable();

        for &(node_id, connection) in &targets {
            let correlation_id = self.allocate_id();
            self.pending_pushes.insert(
                correlation_id,
                PendingPush {
                    node_id,
                    channel,
                    below,
                },
            );
            self.outbox.push(CoordinatorOutput::Send {
                connection,
                message: CoordinatorMessage::PushNotify {
                    correlation_id,
                    invalidate: vec![(channel, below)],
                },
            });
        }
        targets.len()
    }

    /// Completion of a store request issued through `outbox`.
    pub fn handle_store_response(&mut self, id: u64, response: StoreResponse) -> anyhow::Result<()> {
        let Some(context) = self.store_contexts.remove(&id) else {
            tracing::warn!(id, "store response for unknown request");
            return Ok(());
        };

        match (context, response) {
            (StoreContext::DecommitScan { driver, must_restore }, StoreResponse::Range(result)) => {
                let data = &self.data;
                let actions = match self.drivers.get_mut(&driver) {
                    Some(d) => d.on_scan(result.status, result.blobs, must_restore, |blob| {
                        data.get(&blob.to_key()).is_some()
                    }),
                    None => Vec::new(),
                };
                self.run_decommit_actions(driver, actions);
                self.finish_decommit_if_done(driver)
            }
            (StoreContext::DecommitFetch { driver, id }, StoreResponse::Get(result)) => {
                let actions = match self.drivers.get_mut(&driver) {
                    Some(d) => d.on_fetch(id, result.status, result.data),
                    None => Vec::new(),
                };
                self.run_decommit_actions(driver, actions);
                self.finish_decommit_if_done(driver)
            }
            (StoreContext::DecommitWrite { write }, StoreResponse::Put(result)) => {
                let Some(entry) = self.internal_writes.get_mut(&write) else {
                    return Ok(());
                };
                entry.remaining = entry.remaining.saturating_sub(1);
                if !result.status.is_ok() && entry.error.is_none() {
                    entry.error = Some(format!(
                        "store put returned {}: {}",
                        result.status,
                        result.error.unwrap_or_default()
                    ));
                }
                if entry.remaining > 0 {
                    return Ok(());
                }
                let Some(entry) = self.internal_writes.remove(&write) else {
                    return Ok(());
                };

                let value = entry.seq.to_sequential();
                if let Some(range) = self.internal_given.get_mut(&entry.seq.channel) {
                    range.remove_point(value);
                }
                if let Some(channel) = self.channels.channel_mut(entry.seq.channel) {
                    channel.given_id_range.remove_point(value);
                }
                let outcome = match entry.error {
                    None => Ok(entry.locator),
                    Some(err) => Err(err),
                };
                if let Some(d) = self.drivers.get_mut(&entry.driver) {
                    d.on_written(entry.key, outcome);
                }
                self.finish_decommit_if_done(entry.driver)
            }
            (context, response) => {
                tracing::error!(?context, ?response, "store response does not match request");
                Ok(())
            }
        }
    }

    pub fn drain_outbox(&mut self) -> Vec<CoordinatorOutput> {
        std::mem::take(&mut self.outbox)
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn config(&self) -> Option<&DepotConfig> {
        self.config.as_ref()
    }

    pub fn decommit_state(&self) -> DecommitState {
        self.decommit
    }

    pub fn channel(&self, index: u8) -> Option<&Channel> {
        self.channels.channel(index)
    }

    /// Ids of `channel` currently leased to `node_id`.
    pub fn agent_range(&self, node_id: NodeId, channel: u8) -> Option<&GivenIdRange> {
        self.agents.get(&node_id)?.given.get(&channel)
    }

    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.agents
            .get(&node_id)
            .is_some_and(|agent| agent.connection.is_some())
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    /// Lowest sequence id on `channel` that may still become live data, as of
    /// the last recovery pass. Blobs below it are safe to collect.
    pub fn least_expected_seq(&self, channel: u8) -> Option<BlobSeqId> {
        self.least_expected.get(&channel).copied()
    }

    pub fn debug_stats(&self) -> DebugStats {
        DebugStats {
            generation: self.generation,
            agents: self.agents.len(),
            connected_agents: self
                .agents
                .values()
                .filter(|a| a.connection.is_some())
                .count(),
            queued_registrations: self.queued.len(),
            committed_keys: self.data.len(),
            uncertain_keys: self.data.uncertain_keys().count(),
            leased_ids: self
                .channels
                .channels()
                .map(|c| c.given_id_range.num_points())
                .sum(),
            decommit_drivers: self.drivers.len(),
            pending_pushes: self.pending_pushes.len(),
        }
    }

    fn is_ready(&self) -> bool {
        self.config.is_some() && self.decommit != DecommitState::Blocks
    }

    fn tablet_id(&self) -> TabletId {
        self.config.as_ref().map_or(0, |c| c.tablet_id)
    }

    fn page_size(&self) -> usize {
        self.config
            .as_ref()
            .map_or(DEFAULT_PAGE_SIZE, |c| c.resolve_page_size)
    }

    fn active_decommission_group(&self) -> Option<GroupId> {
        match self.decommit {
            DecommitState::Blocks | DecommitState::BlocksFinished => {
                self.config.as_ref()?.decommission_group
            }
            DecommitState::None | DecommitState::Done => None,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn bound_node(&self, connection: ConnectionId) -> anyhow::Result<NodeId> {
        self.connections
            .get(&connection)
            .and_then(|state| state.node_id)
            .ok_or_else(|| anyhow::anyhow!("connection {connection} sent a request before registering"))
    }

    fn reply(&mut self, connection: ConnectionId, request_id: RequestId, response: CoordinatorResponse) {
        self.outbox.push(CoordinatorOutput::Send {
            connection,
            message: CoordinatorMessage::Reply {
                request_id,
                response,
            },
        });
    }

    fn set_decommit_state(&mut self, state: DecommitState) -> anyhow::Result<()> {
        let raw = serde_json::to_vec(&state).context("encode decommission state")?;
        self.table
            .upsert(CONFIG_PARTITION, DECOMMIT_STATE_KEY, &raw)
            .context("persist decommission state")?;
        self.decommit = state;
        Ok(())
    }

    fn register(
        &mut self,
        connection: ConnectionId,
        request_id: RequestId,
        node_id: NodeId,
        instance_id: u64,
    ) -> anyhow::Result<()> {
        if let Some(bound) = self.connections.get(&connection).and_then(|s| s.node_id) {
            anyhow::ensure!(
                bound == node_id,
                "connection {connection} bound to node {bound} tried to register as {node_id}"
            );
        }

        if !self.is_ready() {
            anyhow::ensure!(
                !self.queued.contains_key(&connection),
                "connection {connection} queued a second registration"
            );
            tracing::debug!(node_id, connection, "registration queued until coordinator is ready");
            self.queued.insert(
                connection,
                QueuedRegistration {
                    request_id,
                    node_id,
                    instance_id,
                },
            );
            return Ok(());
        }

        self.complete_registration(connection, request_id, node_id, instance_id);
        Ok(())
    }

    fn complete_registration(
        &mut self,
        connection: ConnectionId,
        request_id: RequestId,
        node_id: NodeId,
        instance_id: u64,
    ) {
        let changed = self
            .agents
            .get(&node_id)
            .and_then(|agent| agent.instance_id)
            .is_some_and(|previous| previous != instance_id);
        if changed {
            tracing::info!(node_id, instance_id, "agent instance changed, releasing its leases");
            self.reset_agent(node_id);
        }

        let agent = self.agents.entry(node_id).or_default();
        let previous = agent.connection.replace(connection);
        agent.instance_id = Some(instance_id);
        agent.expiration = None;
        if let Some(previous) = previous.filter(|prev| *prev != connection) {
            if let Some(state) = self.connections.get_mut(&previous) {
                state.node_id = None;
            }
            self.pending_pushes.retain(|_, push| push.node_id != node_id);
        }
        if let Some(state) = self.connections.get_mut(&connection) {
            state.node_id = Some(node_id);
        }

        let (tablet_id, decommission_group) = self
            .config
            .as_ref()
            .map(|c| (c.tablet_id, c.decommission_group))
            .unwrap_or_default();
        tracing::info!(node_id, instance_id, connection, "agent registered");
        self.reply(
            connection,
            request_id,
            CoordinatorResponse::Registered(RegisterResult {
                generation: self.generation,
                tablet_id,
                kinds: self.channels.kind_layouts(),
                decommission_group,
            }),
        );
    }

    fn replay_registrations(&mut self) {
        if !self.is_ready() {
            return;
        }
        let queued = std::mem::take(&mut self.queued);
        for (connection, entry) in queued {
            if !self.connections.contains_key(&connection) {
                continue;
            }
            self.complete_registration(connection, entry.request_id, entry.node_id, entry.instance_id);
        }
    }

    /// Release every lease of `node_id` and run the recovery pass.
    fn reset_agent(&mut self, node_id: NodeId) {
        let Some(agent) = self.agents.get_mut(&node_id) else {
            return;
        };
        let given = std::mem::take(&mut agent.given);
        let mut released = 0;
        for (index, range) in &given {
            if let Some(channel) = self.channels.channel_mut(*index) {
                channel.given_id_range.subtract(range);
                released += range.num_points();
            }
        }
        self.pending_pushes.retain(|_, push| push.node_id != node_id);
        tracing::info!(node_id, released, "agent leases released");
        self.recover_index();
    }

    /// Reclaim leases no live agent or internal write holds, then refresh the
    /// per-channel collection hints.
    fn recover_index(&mut self) {
        let indexes: Vec<u8> = self.channels.channels().map(|c| c.index).collect();
        for index in indexes {
            let Some(channel) = self.channels.channel(index) else {
                continue;
            };
            let mut orphans = channel.given_id_range.clone();
            for agent in self.agents.values() {
                if let Some(range) = agent.given.get(&index) {
                    orphans.subtract(range);
                }
            }
            if let Some(range) = self.internal_given.get(&index) {
                orphans.subtract(range);
            }
            if orphans.is_empty() {
                continue;
            }
            if let Some(channel) = self.channels.channel_mut(index) {
                channel.given_id_range.subtract(&orphans);
            }
            tracing::info!(channel = index, reclaimed = orphans.num_points(), "orphaned leases reclaimed");
        }
        self.refresh_least_expected();
    }

    fn refresh_least_expected(&mut self) {
        let tablet_id = self.tablet_id();
        let mut hints = BTreeMap::new();
        for channel in self.channels.channels() {
            let Some(live) = BlobSeqId::from_sequential(
                channel.index,
                self.generation,
                channel.least_expected_seq(),
            ) else {
                continue;
            };
            let uncertain = self
                .data
                .uncertain_keys()
                .filter_map(|key| self.data.get(key))
                .flat_map(|value| value.value_chain.iter())
                .filter_map(|locator| locator.blob_seq_id(tablet_id))
                .filter(|seq| seq.channel == channel.index)
                .min();
            hints.insert(channel.index, uncertain.map_or(live, |u| u.min(live)));
        }
        self.least_expected = hints;
    }

    fn allocate(
        &mut self,
        connection: ConnectionId,
        request_id: RequestId,
        node_id: NodeId,
        kind: ChannelKind,
        count: u32,
    ) -> anyhow::Result<()> {
        let count = count.min(MAX_IDS_PER_REQUEST);
        let ranges = self.channels.allocate(kind, count, &mut self.rng);
        let agent = self
            .agents
            .get_mut(&node_id)
            .context("registered node has no agent record")?;
        for run in &ranges {
            agent
                .given
                .entry(run.channel)
                .or_default()
                .issue_new_range(run.begin, run.end)
                .context("issue range on agent tracker")?;
        }
        if ranges.is_empty() {
            tracing::debug!(node_id, ?kind, "no channels available for allocation");
        } else {
            tracing::trace!(node_id, ?kind, count, runs = ranges.len(), "ids allocated");
        }
        self.reply(
            connection,
            request_id,
            CoordinatorResponse::Allocated(AllocateResult {
                kind,
                generation: self.generation,
                ranges,
            }),
        );
        Ok(())
    }

    fn commit(
        &mut self,
        connection: ConnectionId,
        request_id: RequestId,
        node_id: NodeId,
        items: Vec<CommitItem>,
    ) -> anyhow::Result<()> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let result = self.commit_item(node_id, item).unwrap_or_else(|err| {
                tracing::error!(error = ?err, node_id, "commit item failed");
                ItemResult::failed(Status::Error, format!("{err:#}"))
            });
            results.push(result);
        }
        if let Err(err) = self.table.persist() {
            tracing::error!(error = ?err, node_id, "persisting committed values failed");
            for result in results.iter_mut().filter(|r| r.status == Status::Ok) {
                *result = ItemResult::failed(Status::Error, format!("{err:#}"));
            }
        }
        self.reply(
            connection,
            request_id,
            CoordinatorResponse::Committed(CommitResult { items: results }),
        );
        Ok(())
    }

    fn commit_item(&mut self, node_id: NodeId, item: CommitItem) -> anyhow::Result<ItemResult> {
        let tablet_id = self.tablet_id();
        let seqs: Vec<BlobSeqId> = item
            .value_chain
            .iter()
            .filter_map(|locator| locator.blob_seq_id(tablet_id))
            .collect();

        if let Some(existing) = self.data.get(&item.key) {
            if existing.value_chain == item.value_chain {
                if !item.uncertain {
                    self.data.finalize(&item.key)?;
                }
                return Ok(ItemResult::ok());
            }
            // A different value already won the key; the loser's ids are spent.
            self.retire_leased(node_id, &seqs);
            tracing::debug!(node_id, "commit lost the race for its key");
            return Ok(ItemResult::failed(
                Status::Race,
                "key already holds a different value",
            ));
        }

        let agent = self
            .agents
            .get_mut(&node_id)
            .context("registered node has no agent record")?;
        for seq in &seqs {
            let leased = seq.generation == self.generation
                && agent
                    .given
                    .get(&seq.channel)
                    .is_some_and(|range| range.contains(seq.to_sequential()));
            if !leased {
                tracing::error!(node_id, %seq, "commit of a blob seq id not leased to this agent");
                return Ok(ItemResult::failed(
                    Status::Error,
                    format!("blob seq id {seq} is not leased to node {node_id}"),
                ));
            }
        }
        for seq in &seqs {
            let value = seq.to_sequential();
            if let Some(range) = agent.given.get_mut(&seq.channel) {
                range.remove_point(value);
            }
            if let Some(channel) = self.channels.channel_mut(seq.channel) {
                channel.given_id_range.remove_point(value);
            }
        }

        let virtual_group = self
            .config
            .as_ref()
            .is_some_and(|c| c.operation_mode == OperationMode::VirtualGroup);
        if virtual_group && self.barriers.is_behind_barrier(&item.key) {
            tracing::warn!(node_id, "commit rejected behind the barrier");
            return Ok(ItemResult::failed(
                Status::Error,
                "key is behind the garbage-collection barrier",
            ));
        }
        if item.commit_notify {
            tracing::trace!(node_id, "notifying commit");
        }
        self.data.upsert(
            item.key,
            CommittedValue {
                meta: item.meta,
                value_chain: item.value_chain,
                keep_state: item.keep_state,
                public: item.public,
                uncertain: item.uncertain,
            },
        )?;
        Ok(ItemResult::ok())
    }

    /// Retire every id of `seqs` still on loan to `node_id`.
    fn retire_leased(&mut self, node_id: NodeId, seqs: &[BlobSeqId]) {
        let Some(agent) = self.agents.get_mut(&node_id) else {
            return;
        };
        for seq in seqs {
            if seq.generation != self.generation {
                continue;
            }
            let value = seq.to_sequential();
            let Some(range) = agent.given.get_mut(&seq.channel) else {
                continue;
            };
            if !range.contains(value) {
                continue;
            }
            range.remove_point(value);
            if let Some(channel) = self.channels.channel_mut(seq.channel) {
                channel.given_id_range.remove_point(value);
            }
        }
    }

    fn resolve(
        &mut self,
        connection: ConnectionId,
        request_id: RequestId,
        items: Vec<ResolveItem>,
    ) -> anyhow::Result<()> {
        if let Some(group_id) = self.active_decommission_group() {
            if self.needs_assimilation(&items) {
                return self.start_decommit(connection, request_id, items, group_id);
            }
        }
        let result = self.data.resolve(&items, self.page_size());
        self.reply(connection, request_id, CoordinatorResponse::Resolved(result));
        Ok(())
    }

    fn needs_assimilation(&self, items: &[ResolveItem]) -> bool {
        items.iter().any(|item| {
            item.tablet_id.is_some()
                && match &item.target {
                    ResolveTarget::Range { end, .. } => !self.data.is_assimilated(end),
                    ResolveTarget::Exact(key) => !self.data.is_assimilated(key),
                }
        })
    }

    fn discard(&mut self, node_id: NodeId, ids: Vec<BlobSeqId>) -> anyhow::Result<()> {
        let tablet_id = self.tablet_id();
        for seq in ids {
            if seq.generation == self.generation {
                let value = seq.to_sequential();
                let held = self
                    .agents
                    .get_mut(&node_id)
                    .and_then(|agent| agent.given.get_mut(&seq.channel))
                    .is_some_and(|range| range.remove_point(value));
                if held {
                    if let Some(channel) = self.channels.channel_mut(seq.channel) {
                        channel.given_id_range.remove_point(value);
                    }
                }
            }
            let dropped = self.data.drop_uncertain(seq, tablet_id)?;
            tracing::debug!(node_id, %seq, dropped = dropped.len(), "spoiled blob seq id discarded");
        }
        self.table.persist().context("persist discarded values")
    }

    fn push_notify_result(
        &mut self,
        node_id: NodeId,
        correlation_id: u64,
        writes_in_flight: Vec<BlobSeqId>,
    ) -> anyhow::Result<()> {
        let Some(push) = self.pending_pushes.remove(&correlation_id) else {
            tracing::debug!(node_id, correlation_id, "stale push notify result");
            return Ok(());
        };
        anyhow::ensure!(
            push.node_id == node_id,
            "node {node_id} answered push notify {correlation_id} sent to node {}",
            push.node_id
        );

        let generation = self.generation;
        let Some(range) = self
            .agents
            .get_mut(&node_id)
            .and_then(|agent| agent.given.get_mut(&push.channel))
        else {
            return Ok(());
        };
        let mut reclaimed = range.trim_below(push.below);
        for seq in writes_in_flight
            .iter()
            .filter(|seq| seq.channel == push.channel && seq.generation == generation)
        {
            let value = seq.to_sequential();
            if reclaimed.remove_point(value) {
                range
                    .issue_new_range(value, value + 1)
                    .context("restore lease of in-flight write")?;
            }
        }
        if let Some(channel) = self.channels.channel_mut(push.channel) {
            channel.given_id_range.subtract(&reclaimed);
        }
        tracing::info!(
            node_id,
            channel = push.channel,
            reclaimed = reclaimed.num_points(),
            "leases invalidated below bound"
        );
        Ok(())
    }

    fn start_decommit(
        &mut self,
        connection: ConnectionId,
        request_id: RequestId,
        items: Vec<ResolveItem>,
        group_id: GroupId,
    ) -> anyhow::Result<()> {
        let driver_id = self.allocate_id();
        let mut driver = DecommitDriver::new(connection, request_id, items, group_id);
        let actions = driver.start();
        tracing::debug!(driver_id, scans = actions.len(), "decommission driver started");
        self.drivers.insert(driver_id, driver);
        self.run_decommit_actions(driver_id, actions);
        self.finish_decommit_if_done(driver_id)
    }

    fn run_decommit_actions(&mut self, driver: u64, actions: Vec<DecommitAction>) {
        for action in actions {
            match action {
                DecommitAction::Scan { scan } => {
                    let id = self.allocate_id();
                    self.store_contexts.insert(
                        id,
                        StoreContext::DecommitScan {
                            driver,
                            must_restore: scan.must_restore_first,
                        },
                    );
                    self.outbox.push(CoordinatorOutput::Store {
                        id,
                        request: StoreRequest::Range(scan),
                    });
                }
                DecommitAction::Fetch { id: blob, read } => {
                    let id = self.allocate_id();
                    self.store_contexts
                        .insert(id, StoreContext::DecommitFetch { driver, id: blob });
                    self.outbox.push(CoordinatorOutput::Store {
                        id,
                        request: StoreRequest::Get {
                            reads: vec![read],
                            handle_class: HandleClass::AsyncRead,
                        },
                    });
                }
                DecommitAction::Write { id, data } => self.start_internal_write(driver, id, data),
            }
        }
    }

    fn start_internal_write(&mut self, driver: u64, key: LogoBlobId, data: Bytes) {
        let Some((seq, group_id)) = self.lease_internal() else {
            if let Some(d) = self.drivers.get_mut(&driver) {
                d.on_written(key, Err("no data channel available".to_string()));
            }
            return;
        };
        let max_blob_size = self
            .config
            .as_ref()
            .map_or(u32::MAX, |c| c.max_blob_size);
        let (locator, writes) =
            plan_blob_writes(seq, self.tablet_id(), group_id, &key, &data, max_blob_size);

        let write = self.allocate_id();
        self.internal_writes.insert(
            write,
            InternalWrite {
                driver,
                key,
                seq,
                locator,
                remaining: writes.len(),
                error: None,
            },
        );
        for blob in writes {
            let id = self.allocate_id();
            self.store_contexts
                .insert(id, StoreContext::DecommitWrite { write });
            self.outbox.push(CoordinatorOutput::Store {
                id,
                request: StoreRequest::Put(BlobPut {
                    group_id,
                    blob_id: blob.blob_id,
                    data: blob.data,
                    deadline: None,
                    handle_class: HandleClass::AsyncRead,
                }),
            });
        }
    }

    fn lease_internal(&mut self) -> Option<(BlobSeqId, GroupId)> {
        let run = self
            .channels
            .allocate(ChannelKind::Data, 1, &mut self.rng)
            .into_iter()
            .next()?;
        let group_id = self.channels.channel(run.channel)?.group_id;
        let seq = BlobSeqId::from_sequential(run.channel, self.generation, run.begin)?;
        if let Err(err) = self
            .internal_given
            .entry(run.channel)
            .or_default()
            .issue_new_range(run.begin, run.end)
        {
            tracing::error!(error = ?err, channel = run.channel, "internal lease overlaps");
            return None;
        }
        Some((seq, group_id))
    }

    fn finish_decommit_if_done(&mut self, driver_id: u64) -> anyhow::Result<()> {
        if !self
            .drivers
            .get(&driver_id)
            .is_some_and(DecommitDriver::is_done)
        {
            return Ok(());
        }
        let Some(driver) = self.drivers.remove(&driver_id) else {
            return Ok(());
        };

        let result = match driver.failure() {
            Some(reason) => ResolveResult::failed(Status::Error, reason),
            None => {
                let mut committed = 0usize;
                for batch in driver.commit_batches() {
                    for item in batch {
                        if self.data.get(&item.key).is_some() {
                            continue;
                        }
                        self.data.upsert(
                            item.key,
                            CommittedValue {
                                value_chain: item.value_chain,
                                ..CommittedValue::default()
                            },
                        )?;
                        committed += 1;
                    }
                    self.table.persist().context("persist assimilated batch")?;
                }
                tracing::info!(driver_id, committed, "legacy keys assimilated");
                self.refresh_least_expected();
                self.data.resolve(&driver.items, self.page_size())
            }
        };

        let requester_alive = self
            .connections
            .get(&driver.connection)
            .is_some_and(|state| state.node_id.is_some());
        if requester_alive {
            self.reply(
                driver.connection,
                driver.request_id,
                CoordinatorResponse::Resolved(result),
            );
        } else {
            tracing::debug!(driver_id, "requester gone before decommission resolve finished");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depot::authority::{BarrierTable, BlocksTable, MemTable};
    use crate::depot::data::DATA_PARTITION;
    use crate::depot::types::{
        BlobKind, GivenRange, RangeBlob, StoreGetResult, StorePutResult, StoreRangeResult,
    };

    const TABLET: TabletId = 72;

    struct Harness {
        coordinator: Coordinator,
        table: Arc<MemTable>,
        barriers: BarrierTable,
        blocks: BlocksTable,
        next_request: RequestId,
    }

    impl Harness {
        fn unconfigured() -> Self {
            let table = Arc::new(MemTable::new());
            let blocks = BlocksTable::new();
            let barriers = BarrierTable::new();
            let coordinator = Coordinator::open(
                1,
                Collaborators {
                    table: table.clone(),
                    blocks: Arc::new(blocks.clone()),
                    barriers: Arc::new(barriers.clone()),
                },
                7,
            )
            .unwrap();
            Self {
                coordinator,
                table,
                barriers,
                blocks,
                next_request: 1,
            }
        }

        fn new() -> Self {
            let mut harness = Self::unconfigured();
            harness
                .coordinator
                .apply_config(DepotConfig::with_data_groups(TABLET, 1, &[7]))
                .unwrap();
            harness
        }

        fn send(&mut self, connection: ConnectionId, request: AgentRequest) -> anyhow::Result<RequestId> {
            let request_id = self.next_request;
            self.next_request += 1;
            self.coordinator.handle(
                connection,
                AgentMessage {
                    request_id,
                    request,
                },
            )?;
            Ok(request_id)
        }

        /// Send and return the reply addressed to this request.
        fn call(&mut self, connection: ConnectionId, request: AgentRequest) -> CoordinatorResponse {
            let request_id = self.send(connection, request).unwrap();
            self.reply_for(connection, request_id)
                .expect("request should be answered")
        }

        fn reply_for(&mut self, connection: ConnectionId, id: RequestId) -> Option<CoordinatorResponse> {
            self.coordinator
                .drain_outbox()
                .into_iter()
                .find_map(|output| match output {
                    CoordinatorOutput::Send {
                        connection: c,
                        message:
                            CoordinatorMessage::Reply {
                                request_id,
                                response,
                            },
                    } if c == connection && request_id == id => Some(response),
                    _ => None,
                })
        }

        fn register(&mut self, connection: ConnectionId, node_id: NodeId, instance_id: u64) {
            self.coordinator.connect(connection);
            let response = self.call(
                connection,
                AgentRequest::Register {
                    node_id,
                    instance_id,
                },
            );
            assert!(matches!(response, CoordinatorResponse::Registered(_)));
        }

        fn allocate(&mut self, connection: ConnectionId, count: u32) -> Vec<GivenRange> {
            match self.call(
                connection,
                AgentRequest::AllocateIds {
                    kind: ChannelKind::Data,
                    count,
                },
            ) {
                CoordinatorResponse::Allocated(result) => result.ranges,
                other => panic!("unexpected response {other:?}"),
            }
        }

        fn commit(&mut self, connection: ConnectionId, items: Vec<CommitItem>) -> Vec<ItemResult> {
            match self.call(connection, AgentRequest::Commit { items }) {
                CoordinatorResponse::Committed(result) => result.items,
                other => panic!("unexpected response {other:?}"),
            }
        }

        fn channel_ranges(&self, channel: u8) -> Vec<(u64, u64)> {
            self.coordinator
                .channel(channel)
                .unwrap()
                .given_id_range
                .ranges()
                .collect()
        }

        fn agent_ranges(&self, node_id: NodeId, channel: u8) -> Vec<(u64, u64)> {
            self.coordinator
                .agent_range(node_id, channel)
                .map(|r| r.ranges().collect())
                .unwrap_or_default()
        }
    }

    fn seq(value: u64) -> BlobSeqId {
        BlobSeqId::from_sequential(2, 1, value).unwrap()
    }

    fn item(key: &[u8], value: u64) -> CommitItem {
        let locator = BlobLocator {
            group_id: 7,
            blob_id: seq(value).to_blob_id(TABLET, BlobKind::Composite, 0, 40),
            data_len: 14,
        };
        CommitItem::new(key.to_vec(), vec![locator])
    }

    #[test]
    fn allocate_then_commit_retires_the_point() {
        let mut h = Harness::new();
        h.register(1, 10, 1);
        h.coordinator.channels.channel_mut(2).unwrap().next_seq = 10;

        let ranges = h.allocate(1, 3);
        assert_eq!(
            ranges,
            vec![GivenRange {
                channel: 2,
                begin: 10,
                end: 13
            }]
        );
        assert_eq!(h.agent_ranges(10, 2), vec![(10, 13)]);
        assert_eq!(h.channel_ranges(2), vec![(10, 13)]);

        let results = h.commit(1, vec![item(b"k", 10)]);
        assert_eq!(results, vec![ItemResult::ok()]);
        assert_eq!(h.agent_ranges(10, 2), vec![(11, 13)]);
        assert_eq!(h.channel_ranges(2), vec![(11, 13)]);
        assert_eq!(h.table.len(DATA_PARTITION), 1);
    }

    #[test]
    fn duplicate_commit_is_idempotent_and_conflict_is_race() {
        let mut h = Harness::new();
        h.register(1, 10, 1);
        h.coordinator.channels.channel_mut(2).unwrap().next_seq = 10;
        h.allocate(1, 3);

        assert_eq!(h.commit(1, vec![item(b"k", 10)]), vec![ItemResult::ok()]);
        assert_eq!(h.commit(1, vec![item(b"k", 10)]), vec![ItemResult::ok()]);
        let results = h.commit(1, vec![item(b"k", 11)]);
        assert_eq!(results[0].status, Status::Race);
        // The losing id is still retired.
        assert_eq!(h.channel_ranges(2), vec![(12, 13)]);
        assert_eq!(h.agent_ranges(10, 2), vec![(12, 13)]);
        // Retrying the losing value after its id is gone is still a race.
        let results = h.commit(1, vec![item(b"k", 11)]);
        assert_eq!(results[0].status, Status::Race);
    }

    /// Rejects data rows for one key.
    struct FailingTable {
        inner: MemTable,
        poisoned: Vec<u8>,
    }

    impl DurableTable for FailingTable {
        fn upsert(&self, partition: &str, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
            anyhow::ensure!(
                partition != DATA_PARTITION || key != self.poisoned.as_slice(),
                "disk full"
            );
            DurableTable::upsert(&self.inner, partition, key, value)
        }

        fn delete(&self, partition: &str, key: &[u8]) -> anyhow::Result<()> {
            DurableTable::delete(&self.inner, partition, key)
        }

        fn scan(&self, partition: &str) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
            DurableTable::scan(&self.inner, partition)
        }
    }

    #[test]
    fn table_failure_fails_only_its_item() {
        let mut h = Harness::new();
        h.coordinator = Coordinator::open(
            1,
            Collaborators {
                table: Arc::new(FailingTable {
                    inner: MemTable::new(),
                    poisoned: b"bad".to_vec(),
                }),
                blocks: Arc::new(h.blocks.clone()),
                barriers: Arc::new(h.barriers.clone()),
            },
            7,
        )
        .unwrap();
        h.coordinator
            .apply_config(DepotConfig::with_data_groups(TABLET, 1, &[7]))
            .unwrap();
        h.register(1, 10, 1);
        h.coordinator.channels.channel_mut(2).unwrap().next_seq = 10;
        h.allocate(1, 3);

        let results = h.commit(1, vec![item(b"a", 10), item(b"bad", 11), item(b"c", 12)]);
        assert_eq!(results[0], ItemResult::ok());
        assert_eq!(results[1].status, Status::Error);
        assert_eq!(results[2], ItemResult::ok());
        assert!(h.coordinator.data().get(b"a").is_some());
        assert!(h.coordinator.data().get(b"bad").is_none());
        assert!(h.coordinator.data().get(b"c").is_some());
        assert!(h.coordinator.is_connected(10));
    }

    #[test]
    fn uncertain_commit_is_finalized_by_certain_commit() {
        let mut h = Harness::new();
        h.register(1, 10, 1);
        h.coordinator.channels.channel_mut(2).unwrap().next_seq = 10;
        h.allocate(1, 1);

        let mut uncertain = item(b"k", 10);
        uncertain.uncertain = true;
        assert_eq!(h.commit(1, vec![uncertain]), vec![ItemResult::ok()]);
        assert!(h.coordinator.data().get(b"k").unwrap().uncertain);

        let mut certain = item(b"k", 10);
        certain.commit_notify = true;
        assert_eq!(h.commit(1, vec![certain]), vec![ItemResult::ok()]);
        assert!(!h.coordinator.data().get(b"k").unwrap().uncertain);
    }

    #[test]
    fn unleased_and_barrier_items_fail_alone() {
        let mut h = Harness::new();
        h.register(1, 10, 1);
        h.coordinator.channels.channel_mut(2).unwrap().next_seq = 10;
        h.allocate(1, 3);

        let fenced = LogoBlobId::new(500, 1, 1, 0, 0, 5).to_key();
        h.barriers.set_barrier(500, 0, 1, 1);
        let results = h.commit(
            1,
            vec![item(b"a", 10), item(&fenced, 11), item(b"c", 99)],
        );
        assert_eq!(results[0], ItemResult::ok());
        assert_eq!(results[1].status, Status::Error);
        assert_eq!(results[2].status, Status::Error);
        assert!(h.coordinator.data().get(b"a").is_some());
        assert!(h.coordinator.data().get(&fenced).is_none());
        assert_eq!(h.channel_ranges(2), vec![(12, 13)]);
    }

    #[test]
    fn key_value_mode_skips_the_barrier() {
        let mut h = Harness::new();
        let mut config = DepotConfig::with_data_groups(TABLET, 1, &[7]);
        config.operation_mode = OperationMode::KeyValue;
        h.coordinator.apply_config(config).unwrap();
        h.register(1, 10, 1);
        h.coordinator.channels.channel_mut(2).unwrap().next_seq = 10;
        h.allocate(1, 1);

        let fenced = LogoBlobId::new(500, 1, 1, 0, 0, 5).to_key();
        h.barriers.set_barrier(500, 0, 1, 1);
        assert_eq!(h.commit(1, vec![item(&fenced, 10)]), vec![ItemResult::ok()]);
    }

    #[test]
    fn instance_change_reclaims_leases_without_touching_live_agents() {
        let mut h = Harness::new();
        h.register(1, 10, 1);
        h.register(2, 20, 1);
        h.coordinator.channels.channel_mut(2).unwrap().next_seq = 10;
        h.allocate(1, 3);
        h.allocate(2, 2);
        assert_eq!(h.channel_ranges(2), vec![(10, 15)]);

        h.coordinator.disconnect(1, Instant::now());
        h.register(3, 10, 2);
        assert!(h.agent_ranges(10, 2).is_empty());
        assert_eq!(h.channel_ranges(2), vec![(13, 15)]);

        let fresh = h.allocate(3, 4);
        for run in fresh {
            assert!(run.begin >= 15);
        }
        assert_eq!(h.agent_ranges(20, 2), vec![(13, 15)]);
    }

    #[test]
    fn expired_agent_is_reset_by_sweep() {
        let mut h = Harness::new();
        h.register(1, 10, 1);
        h.allocate(1, 4);
        let now = Instant::now();
        h.coordinator.disconnect(1, now);

        assert!(h.coordinator.sweep_expired(now + Duration::from_secs(30)).is_empty());
        assert_eq!(h.coordinator.debug_stats().leased_ids, 4);
        assert_eq!(
            h.coordinator.sweep_expired(now + AGENT_EXPIRATION + Duration::from_secs(1)),
            vec![10]
        );
        assert_eq!(h.coordinator.debug_stats().leased_ids, 0);
        assert_eq!(h.coordinator.debug_stats().agents, 0);
    }

    #[test]
    fn reconnect_with_same_instance_keeps_leases() {
        let mut h = Harness::new();
        h.register(1, 10, 1);
        h.coordinator.channels.channel_mut(2).unwrap().next_seq = 10;
        h.allocate(1, 2);
        h.coordinator.disconnect(1, Instant::now());
        assert!(!h.coordinator.is_connected(10));

        h.register(2, 10, 1);
        assert_eq!(h.agent_ranges(10, 2), vec![(10, 12)]);
        assert_eq!(h.commit(2, vec![item(b"k", 11)]), vec![ItemResult::ok()]);
    }

    #[test]
    fn registration_waits_for_config() {
        let mut h = Harness::unconfigured();
        h.coordinator.connect(1);
        let first = h
            .send(
                1,
                AgentRequest::Register {
                    node_id: 10,
                    instance_id: 1,
                },
            )
            .unwrap();
        assert!(h.coordinator.drain_outbox().is_empty());
        assert!(h
            .send(
                1,
                AgentRequest::Register {
                    node_id: 10,
                    instance_id: 1
                }
            )
            .is_err());

        h.coordinator
            .apply_config(DepotConfig::with_data_groups(TABLET, 1, &[7, 8]))
            .unwrap();
        let Some(CoordinatorResponse::Registered(result)) = h.reply_for(1, first) else {
            panic!("queued registration should be answered");
        };
        assert_eq!(result.tablet_id, TABLET);
        assert_eq!(result.kinds.len(), 1);
        assert_eq!(result.kinds[0].channels.len(), 2);
    }

    #[test]
    fn requests_before_registration_break_the_connection() {
        let mut h = Harness::new();
        h.coordinator.connect(1);
        assert!(h
            .send(
                1,
                AgentRequest::AllocateIds {
                    kind: ChannelKind::Data,
                    count: 1
                }
            )
            .is_err());
        assert!(h.send(9, AgentRequest::Resolve { items: vec![] }).is_err());
    }

    #[test]
    fn query_blocks_reports_authority_state() {
        let mut h = Harness::new();
        h.register(1, 10, 1);
        h.blocks.block(100, 4);
        let response = h.call(
            1,
            AgentRequest::QueryBlocks {
                tablet_id: 100,
                generation: 4,
            },
        );
        assert_eq!(
            response,
            CoordinatorResponse::BlocksQueried(BlocksResult {
                tablet_id: 100,
                status: Status::Blocked
            })
        );
    }

    #[test]
    fn discard_reclaims_id_and_drops_uncertain_entry() {
        let mut h = Harness::new();
        h.register(1, 10, 1);
        h.coordinator.channels.channel_mut(2).unwrap().next_seq = 10;
        h.allocate(1, 2);

        let mut uncertain = item(b"k", 10);
        uncertain.uncertain = true;
        h.commit(1, vec![uncertain]);
        h.send(
            1,
            AgentRequest::DiscardSpoiledBlobSeq {
                ids: vec![seq(10), seq(11)],
            },
        )
        .unwrap();
        assert!(h.coordinator.drain_outbox().is_empty());
        assert!(h.coordinator.data().get(b"k").is_none());
        assert!(h.channel_ranges(2).is_empty());
        assert!(h.agent_ranges(10, 2).is_empty());
    }

    #[test]
    fn push_notify_keeps_writes_in_flight() {
        let mut h = Harness::new();
        h.register(1, 10, 1);
        h.coordinator.channels.channel_mut(2).unwrap().next_seq = 10;
        h.allocate(1, 3);

        assert_eq!(h.coordinator.invalidate_below(2, 12), 1);
        assert_eq!(h.coordinator.invalidate_below(2, 5), 0);
        let outputs = h.coordinator.drain_outbox();
        let Some(CoordinatorOutput::Send {
            connection: 1,
            message:
                CoordinatorMessage::PushNotify {
                    correlation_id,
                    invalidate,
                },
        }) = outputs.into_iter().next()
        else {
            panic!("expected push notify");
        };
        assert_eq!(invalidate, vec![(2, 12)]);

        h.send(
            1,
            AgentRequest::PushNotifyResult {
                correlation_id,
                writes_in_flight: vec![seq(10)],
            },
        )
        .unwrap();
        assert_eq!(h.agent_ranges(10, 2), vec![(10, 11), (12, 13)]);
        assert_eq!(h.channel_ranges(2), vec![(10, 11), (12, 13)]);
    }

    #[test]
    fn restart_reloads_config_and_index_under_a_new_generation() {
        let mut h = Harness::new();
        h.register(1, 10, 1);
        h.coordinator.channels.channel_mut(2).unwrap().next_seq = 10;
        h.allocate(1, 2);
        let mut uncertain = item(b"u", 10);
        uncertain.uncertain = true;
        h.commit(1, vec![item(b"k", 11), uncertain]);

        let reopened = Coordinator::open(
            2,
            Collaborators {
                table: h.table.clone(),
                blocks: Arc::new(BlocksTable::new()),
                barriers: Arc::new(BarrierTable::new()),
            },
            1,
        )
        .unwrap();
        assert_eq!(reopened.generation(), 2);
        assert_eq!(reopened.config().unwrap().tablet_id, TABLET);
        assert_eq!(reopened.data().len(), 2);
        assert!(reopened.data().get(b"u").unwrap().uncertain);
        assert_eq!(reopened.least_expected_seq(2), Some(seq(10)));
        assert!(reopened.channel(2).unwrap().given_id_range.is_empty());
    }

    fn decommission_harness() -> Harness {
        let mut h = Harness::unconfigured();
        let mut config = DepotConfig::with_data_groups(TABLET, 1, &[7]);
        config.decommission_group = Some(50);
        h.coordinator.apply_config(config).unwrap();
        h
    }

    fn tablet_range(tablet_id: TabletId, must_restore: bool) -> ResolveItem {
        let mut item = ResolveItem::range(
            LogoBlobId::first_of_tablet(tablet_id).to_key(),
            LogoBlobId::last_of_tablet(tablet_id).to_key(),
        );
        item.tablet_id = Some(tablet_id);
        item.must_restore_first = must_restore;
        item
    }

    fn store_requests(outputs: Vec<CoordinatorOutput>) -> Vec<(u64, StoreRequest)> {
        outputs
            .into_iter()
            .filter_map(|output| match output {
                CoordinatorOutput::Store { id, request } => Some((id, request)),
                CoordinatorOutput::Send { .. } => None,
            })
            .collect()
    }

    #[test]
    fn decommission_blocks_gate_registration() {
        let mut h = decommission_harness();
        assert_eq!(h.coordinator.decommit_state(), DecommitState::Blocks);
        h.coordinator.connect(1);
        let id = h
            .send(
                1,
                AgentRequest::Register {
                    node_id: 10,
                    instance_id: 1,
                },
            )
            .unwrap();
        assert!(h.reply_for(1, id).is_none());

        h.coordinator.finish_decommission_blocks().unwrap();
        let Some(CoordinatorResponse::Registered(result)) = h.reply_for(1, id) else {
            panic!("registration should be replayed");
        };
        assert_eq!(result.decommission_group, Some(50));
    }

    #[test]
    fn index_only_decommission_indexes_legacy_blobs_before_resolving() {
        let mut h = decommission_harness();
        h.coordinator.finish_decommission_blocks().unwrap();
        h.register(1, 10, 1);

        let request_id = h
            .send(
                1,
                AgentRequest::Resolve {
                    items: vec![tablet_range(100, false)],
                },
            )
            .unwrap();
        let requests = store_requests(h.coordinator.drain_outbox());
        assert_eq!(requests.len(), 1);
        let (scan_id, StoreRequest::Range(scan)) = &requests[0] else {
            panic!("expected a range scan");
        };
        assert_eq!(scan.group_id, 50);

        let legacy = LogoBlobId::new(100, 3, 1, 0, 0, 11);
        h.coordinator
            .handle_store_response(
                *scan_id,
                StoreResponse::Range(StoreRangeResult {
                    status: Status::Ok,
                    blobs: vec![RangeBlob {
                        id: legacy,
                        data: None,
                    }],
                    error: None,
                }),
            )
            .unwrap();

        let Some(CoordinatorResponse::Resolved(result)) = h.reply_for(1, request_id) else {
            panic!("resolve should be answered after the scan");
        };
        assert_eq!(result.status, Status::Ok);
        assert_eq!(result.items.len(), 1);
        let value = result.items[0].value.clone().unwrap();
        assert_eq!(value.value_chain[0].group_id, 50);
        assert_eq!(value.value_chain[0].blob_id, legacy);
    }

    #[test]
    fn must_restore_decommission_reputs_into_depot_channels() {
        let mut h = decommission_harness();
        h.coordinator.finish_decommission_blocks().unwrap();
        h.register(1, 10, 1);

        let request_id = h
            .send(
                1,
                AgentRequest::Resolve {
                    items: vec![tablet_range(100, true)],
                },
            )
            .unwrap();
        let requests = store_requests(h.coordinator.drain_outbox());
        let scan_id = requests[0].0;

        let legacy = LogoBlobId::new(100, 3, 1, 0, 0, 4);
        h.coordinator
            .handle_store_response(
                scan_id,
                StoreResponse::Range(StoreRangeResult {
                    status: Status::Ok,
                    blobs: vec![RangeBlob {
                        id: legacy,
                        data: None,
                    }],
                    error: None,
                }),
            )
            .unwrap();
        let requests = store_requests(h.coordinator.drain_outbox());
        let (fetch_id, StoreRequest::Get { reads, .. }) = &requests[0] else {
            panic!("expected a legacy fetch");
        };
        assert_eq!(reads[0].group_id, 50);

        h.coordinator
            .handle_store_response(
                *fetch_id,
                StoreResponse::Get(StoreGetResult {
                    status: Status::Ok,
                    data: Some(Bytes::from_static(b"data")),
                    error: None,
                }),
            )
            .unwrap();
        let requests = store_requests(h.coordinator.drain_outbox());
        assert_eq!(requests.len(), 1);
        let (put_id, StoreRequest::Put(put)) = &requests[0] else {
            panic!("expected a re-put");
        };
        assert_eq!(put.group_id, 7);
        assert_eq!(put.blob_id.tablet_id, TABLET);
        assert_eq!(h.coordinator.debug_stats().leased_ids, 1);

        h.coordinator
            .handle_store_response(
                *put_id,
                StoreResponse::Put(StorePutResult {
                    status: Status::Ok,
                    error: None,
                }),
            )
            .unwrap();
        assert_eq!(h.coordinator.debug_stats().leased_ids, 0);
        let Some(CoordinatorResponse::Resolved(result)) = h.reply_for(1, request_id) else {
            panic!("resolve should be answered after the re-put");
        };
        let value = result.items[0].value.clone().unwrap();
        assert_eq!(value.value_chain[0].group_id, 7);
        assert_eq!(value.value_chain[0].data_len, 4);
    }

    #[test]
    fn assimilated_keys_resolve_directly() {
        let mut h = decommission_harness();
        h.coordinator.finish_decommission_blocks().unwrap();
        h.register(1, 10, 1);
        h.coordinator
            .set_last_assimilated(LogoBlobId::last_of_tablet(100).to_key())
            .unwrap();

        let response = h.call(
            1,
            AgentRequest::Resolve {
                items: vec![tablet_range(100, false)],
            },
        );
        assert!(matches!(response, CoordinatorResponse::Resolved(_)));

        h.coordinator.complete_decommission().unwrap();
        let response = h.call(
            1,
            AgentRequest::Resolve {
                items: vec![tablet_range(200, false)],
            },
        );
        assert!(matches!(response, CoordinatorResponse::Resolved(_)));
    }
}
