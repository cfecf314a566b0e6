//! Tokio tasks driving the coordinator and agent state machines.
//!
//! Each state machine is owned by one task fed through an unbounded mpsc
//! channel. After every event the task drains the machine's outbox: messages
//! go to the peer's channel and store requests run as spawned tasks whose
//! completions come back as events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use blob_depot::agent::{
    Agent, AgentConfig, AgentOutput, ClientRequest, GetRequest, PutRequest, QueryId,
    QueryOutcome, RangeRequest, ReadItem,
};
use blob_depot::depot::{
    AgentMessage, BlobStore, ConnectionId, Coordinator, CoordinatorMessage, CoordinatorOutput,
    DebugStats, Key, RequestId, StoreResponse,
};
use blob_depot::DepotError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

enum CoordinatorEvent {
    Connect {
        connection: ConnectionId,
        tx: mpsc::UnboundedSender<CoordinatorMessage>,
    },
    Disconnect {
        connection: ConnectionId,
    },
    Message {
        connection: ConnectionId,
        message: AgentMessage,
    },
    StoreDone {
        id: u64,
        response: StoreResponse,
    },
    Admin {
        command: AdminCommand,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<DebugStats>,
    },
    Shutdown,
}

enum AdminCommand {
    InvalidateBelow { channel: u8, below: u64 },
    FinishDecommissionBlocks,
    CompleteDecommission,
    SetLastAssimilated(Key),
}

/// Cloneable entry point to a running coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
    next_connection: Arc<AtomicU64>,
}

/// One agent's session with the coordinator. Dropping it closes the session.
pub struct CoordinatorLink {
    connection: ConnectionId,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    rx: mpsc::UnboundedReceiver<CoordinatorMessage>,
}

impl CoordinatorLink {
    pub fn send(&self, message: AgentMessage) -> anyhow::Result<()> {
        self.events
            .send(CoordinatorEvent::Message {
                connection: self.connection,
                message,
            })
            .map_err(|_| anyhow::anyhow!("coordinator task is gone"))
    }

    pub async fn recv(&mut self) -> Option<CoordinatorMessage> {
        self.rx.recv().await
    }
}

impl Drop for CoordinatorLink {
    fn drop(&mut self) {
        let _ = self.events.send(CoordinatorEvent::Disconnect {
            connection: self.connection,
        });
    }
}

impl CoordinatorHandle {
    pub fn connect(&self) -> anyhow::Result<CoordinatorLink> {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx
            .send(CoordinatorEvent::Connect { connection, tx })
            .map_err(|_| anyhow::anyhow!("coordinator task is gone"))?;
        Ok(CoordinatorLink {
            connection,
            events: self.tx.clone(),
            rx,
        })
    }

    pub async fn debug_stats(&self) -> anyhow::Result<DebugStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorEvent::Stats { reply })
            .map_err(|_| anyhow::anyhow!("coordinator task is gone"))?;
        Ok(rx.await?)
    }

    pub async fn invalidate_below(&self, channel: u8, below: u64) -> anyhow::Result<()> {
        self.admin(AdminCommand::InvalidateBelow { channel, below }).await
    }

    pub async fn finish_decommission_blocks(&self) -> anyhow::Result<()> {
        self.admin(AdminCommand::FinishDecommissionBlocks).await
    }

    pub async fn complete_decommission(&self) -> anyhow::Result<()> {
        self.admin(AdminCommand::CompleteDecommission).await
    }

    pub async fn set_last_assimilated(&self, key: Key) -> anyhow::Result<()> {
        self.admin(AdminCommand::SetLastAssimilated(key)).await
    }

    fn shutdown(&self) {
        let _ = self.tx.send(CoordinatorEvent::Shutdown);
    }

    async fn admin(&self, command: AdminCommand) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorEvent::Admin { command, reply })
            .map_err(|_| anyhow::anyhow!("coordinator task is gone"))?;
        rx.await?
    }
}

pub fn spawn_coordinator(
    coordinator: Coordinator,
    store: Arc<dyn BlobStore>,
    sweep_interval: Duration,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = CoordinatorHandle {
        tx: tx.clone(),
        next_connection: Arc::new(AtomicU64::new(1)),
    };
    let task = tokio::spawn(run_coordinator(coordinator, rx, tx, store, sweep_interval));
    (handle, task)
}

async fn run_coordinator(
    mut coordinator: Coordinator,
    mut rx: mpsc::UnboundedReceiver<CoordinatorEvent>,
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
    store: Arc<dyn BlobStore>,
    sweep_interval: Duration,
) {
    let mut links: HashMap<ConnectionId, mpsc::UnboundedSender<CoordinatorMessage>> =
        HashMap::new();
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(event) = maybe else {
                    break;
                };
                match event {
                    CoordinatorEvent::Connect { connection, tx } => {
                        links.insert(connection, tx);
                        coordinator.connect(connection);
                    }
                    CoordinatorEvent::Disconnect { connection } => {
                        links.remove(&connection);
                        coordinator.disconnect(connection, Instant::now());
                    }
                    CoordinatorEvent::Message { connection, message } => {
                        if let Err(err) = coordinator.handle(connection, message) {
                            tracing::warn!(error = ?err, connection, "closing agent connection");
                            links.remove(&connection);
                            coordinator.disconnect(connection, Instant::now());
                        }
                    }
                    CoordinatorEvent::StoreDone { id, response } => {
                        if let Err(err) = coordinator.handle_store_response(id, response) {
                            tracing::error!(error = ?err, id, "store completion failed");
                        }
                    }
                    CoordinatorEvent::Admin { command, reply } => {
                        let result = match command {
                            AdminCommand::InvalidateBelow { channel, below } => {
                                let notified = coordinator.invalidate_below(channel, below);
                                tracing::info!(channel, below, notified, "invalidating leases");
                                Ok(())
                            }
                            AdminCommand::FinishDecommissionBlocks => {
                                coordinator.finish_decommission_blocks()
                            }
                            AdminCommand::CompleteDecommission => coordinator.complete_decommission(),
                            AdminCommand::SetLastAssimilated(key) => {
                                coordinator.set_last_assimilated(key)
                            }
                        };
                        let _ = reply.send(result);
                    }
                    CoordinatorEvent::Stats { reply } => {
                        let _ = reply.send(coordinator.debug_stats());
                    }
                    CoordinatorEvent::Shutdown => break,
                }
            }
            _ = ticker.tick() => {
                let expired = coordinator.sweep_expired(Instant::now());
                if !expired.is_empty() {
                    tracing::info!(?expired, "expired agents reset");
                }
            }
        }

        for output in coordinator.drain_outbox() {
            match output {
                CoordinatorOutput::Send {
                    connection,
                    message,
                } => {
                    let delivered = links
                        .get(&connection)
                        .is_some_and(|link| link.send(message).is_ok());
                    if !delivered {
                        tracing::debug!(connection, "dropping message for a closed connection");
                    }
                }
                CoordinatorOutput::Store { id, request } => {
                    let store = store.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let response = store.execute(request).await;
                        let _ = tx.send(CoordinatorEvent::StoreDone { id, response });
                    });
                }
            }
        }
    }
    tracing::info!(generation = coordinator.generation(), "coordinator stopped");
}

enum AgentEvent {
    Submit {
        request: ClientRequest,
        reply: oneshot::Sender<QueryOutcome>,
    },
    StoreDone {
        id: RequestId,
        response: StoreResponse,
    },
    Disconnect,
    Reconnect,
    Shutdown,
}

/// Client entry point to a running agent task.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentHandle {
    pub async fn put(&self, request: PutRequest) -> Result<(), DepotError> {
        match self.submit(ClientRequest::Put(request)).await? {
            QueryOutcome::Put(result) => result,
            QueryOutcome::Read(_) => Err(DepotError::Malformed("read outcome for a put".into())),
        }
    }

    pub async fn range(&self, request: RangeRequest) -> Result<Vec<ReadItem>, DepotError> {
        self.read(ClientRequest::Range(request)).await
    }

    pub async fn get(&self, request: GetRequest) -> Result<Vec<ReadItem>, DepotError> {
        self.read(ClientRequest::Get(request)).await
    }

    /// Drop the coordinator session until `reconnect`.
    pub fn disconnect(&self) {
        let _ = self.tx.send(AgentEvent::Disconnect);
    }

    pub fn reconnect(&self) {
        let _ = self.tx.send(AgentEvent::Reconnect);
    }

    fn shutdown(&self) {
        let _ = self.tx.send(AgentEvent::Shutdown);
    }

    async fn read(&self, request: ClientRequest) -> Result<Vec<ReadItem>, DepotError> {
        match self.submit(request).await? {
            QueryOutcome::Read(result) => result,
            QueryOutcome::Put(_) => Err(DepotError::Malformed("put outcome for a read".into())),
        }
    }

    async fn submit(&self, request: ClientRequest) -> Result<QueryOutcome, DepotError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AgentEvent::Submit { request, reply })
            .map_err(|_| DepotError::Cancelled)?;
        rx.await.map_err(|_| DepotError::Cancelled)
    }
}

pub fn spawn_agent(
    config: AgentConfig,
    coordinator: CoordinatorHandle,
    store: Arc<dyn BlobStore>,
    tick_interval: Duration,
) -> (AgentHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = AgentHandle { tx: tx.clone() };
    let task = tokio::spawn(run_agent(config, coordinator, store, rx, tx, tick_interval));
    (handle, task)
}

struct AgentRuntime {
    agent: Agent,
    coordinator: CoordinatorHandle,
    link: Option<CoordinatorLink>,
    /// Set by an explicit disconnect; suppresses automatic reconnects.
    paused: bool,
    store: Arc<dyn BlobStore>,
    store_tasks: Arc<Mutex<HashMap<RequestId, AbortHandle>>>,
    waiters: HashMap<QueryId, oneshot::Sender<QueryOutcome>>,
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentRuntime {
    fn connect(&mut self) {
        match self.coordinator.connect() {
            Ok(link) => {
                self.link = Some(link);
                self.agent.connected();
            }
            Err(err) => tracing::warn!(error = ?err, "coordinator unavailable"),
        }
    }

    fn drop_link(&mut self) {
        if self.link.take().is_some() {
            self.agent.coordinator_disconnected(Instant::now());
        }
    }

    fn flush(&mut self) {
        for output in self.agent.drain_outbox() {
            match output {
                AgentOutput::ToCoordinator(message) => {
                    let sent = self
                        .link
                        .as_ref()
                        .is_some_and(|link| link.send(message).is_ok());
                    if !sent {
                        tracing::debug!("coordinator link down, message dropped");
                    }
                }
                AgentOutput::ToStore { id, request } => {
                    let store = self.store.clone();
                    let tx = self.tx.clone();
                    let task = tokio::spawn(async move {
                        let response = store.execute(request).await;
                        let _ = tx.send(AgentEvent::StoreDone { id, response });
                    });
                    self.store_tasks
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(id, task.abort_handle());
                }
                AgentOutput::Completed { query, outcome } => {
                    if let Some(reply) = self.waiters.remove(&query) {
                        let _ = reply.send(outcome);
                    }
                }
            }
        }
    }
}

enum Wake {
    Event(Option<AgentEvent>),
    Link(Option<CoordinatorMessage>),
    Tick,
}

async fn recv_link(link: &mut Option<CoordinatorLink>) -> Option<CoordinatorMessage> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_agent(
    config: AgentConfig,
    coordinator: CoordinatorHandle,
    store: Arc<dyn BlobStore>,
    mut rx: mpsc::UnboundedReceiver<AgentEvent>,
    tx: mpsc::UnboundedSender<AgentEvent>,
    tick_interval: Duration,
) {
    let node_id = config.node_id;
    let store_tasks: Arc<Mutex<HashMap<RequestId, AbortHandle>>> = Arc::default();
    let mut agent = Agent::new(config);
    let cancel_tasks = store_tasks.clone();
    agent.set_store_cancel_hook(Arc::new(move |id| {
        let task = cancel_tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
        if let Some(task) = task {
            task.abort();
        }
    }));

    let mut runtime = AgentRuntime {
        agent,
        coordinator,
        link: None,
        paused: false,
        store,
        store_tasks,
        waiters: HashMap::new(),
        tx,
    };
    runtime.connect();
    runtime.flush();

    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let wake = tokio::select! {
            maybe = rx.recv() => Wake::Event(maybe),
            message = recv_link(&mut runtime.link) => Wake::Link(message),
            _ = ticker.tick() => Wake::Tick,
        };
        match wake {
            Wake::Event(None) | Wake::Event(Some(AgentEvent::Shutdown)) => break,
            Wake::Event(Some(AgentEvent::Submit { request, reply })) => {
                let query = runtime.agent.submit(request, Instant::now());
                runtime.waiters.insert(query, reply);
            }
            Wake::Event(Some(AgentEvent::StoreDone { id, response })) => {
                runtime
                    .store_tasks
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&id);
                runtime.agent.handle_store(id, response);
            }
            Wake::Event(Some(AgentEvent::Disconnect)) => {
                runtime.paused = true;
                runtime.drop_link();
            }
            Wake::Event(Some(AgentEvent::Reconnect)) => {
                runtime.paused = false;
                if runtime.link.is_none() {
                    runtime.connect();
                }
            }
            Wake::Link(Some(message)) => runtime.agent.handle_coordinator(message, Instant::now()),
            Wake::Link(None) => {
                tracing::info!(node_id, "coordinator closed the session");
                runtime.drop_link();
            }
            Wake::Tick => {
                runtime.agent.tick(Instant::now());
                if runtime.link.is_none() && !runtime.paused {
                    runtime.connect();
                }
            }
        }
        runtime.flush();
    }

    for (_, task) in runtime
        .store_tasks
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .drain()
    {
        task.abort();
    }
    tracing::info!(node_id, "agent stopped");
}

/// Handles to every task of one node.
pub struct DepotNode {
    coordinator: CoordinatorHandle,
    agents: Vec<AgentHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl DepotNode {
    pub(crate) fn new(
        coordinator: CoordinatorHandle,
        agents: Vec<AgentHandle>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            coordinator,
            agents,
            tasks,
        }
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    pub fn agent(&self, index: usize) -> Option<&AgentHandle> {
        self.agents.get(index)
    }

    pub fn agents(&self) -> &[AgentHandle] {
        &self.agents
    }

    /// Stop agents first, then the coordinator, and wait for every task.
    pub async fn shutdown(self) {
        for agent in &self.agents {
            agent.shutdown();
        }
        self.coordinator.shutdown();
        for result in futures_util::future::join_all(self.tasks).await {
            if let Err(err) = result {
                tracing::warn!(error = ?err, "node task ended abnormally");
            }
        }
    }
}
