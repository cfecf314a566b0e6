//! Shared types for the blob depot protocol.
//!
//! Ids, wire messages between agents and the coordinator, store requests and
//! the collaborator contracts (store, durable table, blocks and barrier
//! authorities) live here so both sides of the protocol share one definition.

use std::fmt;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Tablet that owns a logical blob (or the depot itself).
pub type TabletId = u64;
/// Agent node identity bound at registration.
pub type NodeId = u32;
/// Storage group id in the underlying store.
pub type GroupId = u32;
/// Coordinator (or tablet) generation.
pub type Generation = u32;
/// Transport session between one agent and the coordinator.
pub type ConnectionId = u64;
/// Agent-assigned request cookie echoed back in replies.
pub type RequestId = u64;
/// Opaque index key.
pub type Key = Vec<u8>;

/// Bits of the sequential number taken by `BlobSeqId::index`.
pub const INDEX_BITS: u32 = 20;
pub const MAX_INDEX: u32 = (1 << INDEX_BITS) - 1;
/// Channels below this index are reserved for the system and never leased.
pub const FIRST_DATA_CHANNEL: u8 = 2;
/// Low cookie bits carrying the `BlobKind` tag of a physical blob id.
const BLOB_KIND_BITS: u32 = 2;
/// Encoded length of `LogoBlobId::to_key`.
pub const LOGO_BLOB_KEY_LEN: usize = 26;

/// Wire status shared by coordinator and store replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Error,
    Race,
    Overrun,
    NoData,
    Unknown,
    Blocked,
    NotReady,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::Error => "ERROR",
            Status::Race => "RACE",
            Status::Overrun => "OVERRUN",
            Status::NoData => "NODATA",
            Status::Unknown => "UNKNOWN",
            Status::Blocked => "BLOCKED",
            Status::NotReady => "NOTREADY",
        };
        f.write_str(name)
    }
}

/// Purpose of a channel; allocation targets are picked per kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelKind {
    System,
    Data,
    Log,
}

/// Tag stored in the cookie of a physical blob id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobKind {
    /// Payload followed by its footer in one blob.
    Composite,
    /// Payload only; the footer lives in a sibling `Footer` blob.
    Data,
    Footer,
}

impl BlobKind {
    fn tag(self) -> u32 {
        match self {
            BlobKind::Composite => 0,
            BlobKind::Data => 1,
            BlobKind::Footer => 2,
        }
    }

    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(BlobKind::Composite),
            1 => Some(BlobKind::Data),
            2 => Some(BlobKind::Footer),
            _ => None,
        }
    }
}

/// Physical (or logical) blob identifier in the underlying store.
///
/// Field order matters: the derived ordering and `to_key` agree, so encoded
/// keys sort the same way as ids.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LogoBlobId {
    pub tablet_id: TabletId,
    pub generation: Generation,
    pub step: u32,
    pub channel: u8,
    pub cookie: u32,
    pub blob_size: u32,
    pub part: u8,
}

impl LogoBlobId {
    pub fn new(
        tablet_id: TabletId,
        generation: Generation,
        step: u32,
        channel: u8,
        cookie: u32,
        blob_size: u32,
    ) -> Self {
        Self {
            tablet_id,
            generation,
            step,
            channel,
            cookie,
            blob_size,
            part: 0,
        }
    }

    /// Smallest id owned by `tablet_id`.
    pub fn first_of_tablet(tablet_id: TabletId) -> Self {
        Self {
            tablet_id,
            ..Self::default()
        }
    }

    /// Largest id owned by `tablet_id`.
    pub fn last_of_tablet(tablet_id: TabletId) -> Self {
        Self {
            tablet_id,
            generation: Generation::MAX,
            step: u32::MAX,
            channel: u8::MAX,
            cookie: u32::MAX,
            blob_size: u32::MAX,
            part: u8::MAX,
        }
    }

    /// The zero id is never a valid client key.
    pub fn is_zero(&self) -> bool {
        self.tablet_id == 0
    }

    pub fn blob_kind(&self) -> Option<BlobKind> {
        BlobKind::from_tag(self.cookie & ((1 << BLOB_KIND_BITS) - 1))
    }

    /// Order-preserving big-endian encoding used as the index key.
    pub fn to_key(&self) -> Key {
        let mut out = Vec::with_capacity(LOGO_BLOB_KEY_LEN);
        out.extend_from_slice(&self.tablet_id.to_be_bytes());
        out.extend_from_slice(&self.generation.to_be_bytes());
        out.extend_from_slice(&self.step.to_be_bytes());
        out.push(self.channel);
        out.extend_from_slice(&self.cookie.to_be_bytes());
        out.extend_from_slice(&self.blob_size.to_be_bytes());
        out.push(self.part);
        out
    }

    pub fn from_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != LOGO_BLOB_KEY_LEN {
            return None;
        }
        let u32_at = |at: usize| -> Option<u32> {
            Some(u32::from_be_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
        };
        Some(Self {
            tablet_id: u64::from_be_bytes(bytes.get(0..8)?.try_into().ok()?),
            generation: u32_at(8)?,
            step: u32_at(12)?,
            channel: bytes[16],
            cookie: u32_at(17)?,
            blob_size: u32_at(21)?,
            part: bytes[25],
        })
    }
}

impl fmt::Display for LogoBlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}:{}:{}:{}:{}:{}]",
            self.tablet_id,
            self.generation,
            self.step,
            self.channel,
            self.cookie,
            self.blob_size,
            self.part
        )
    }
}

/// Sequence id leased from a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobSeqId {
    pub channel: u8,
    pub generation: Generation,
    pub step: u32,
    pub index: u32,
}

impl BlobSeqId {
    pub fn to_sequential(&self) -> u64 {
        (u64::from(self.step) << INDEX_BITS) | u64::from(self.index & MAX_INDEX)
    }

    /// Inverse of `to_sequential`; `None` when the step would overflow.
    pub fn from_sequential(channel: u8, generation: Generation, value: u64) -> Option<Self> {
        let step = u32::try_from(value >> INDEX_BITS).ok()?;
        Some(Self {
            channel,
            generation,
            step,
            index: (value & u64::from(MAX_INDEX)) as u32,
        })
    }

    /// Physical id for one blob written under this sequence id.
    pub fn to_blob_id(&self, tablet_id: TabletId, kind: BlobKind, part: u8, size: u32) -> LogoBlobId {
        LogoBlobId {
            tablet_id,
            generation: self.generation,
            step: self.step,
            channel: self.channel,
            cookie: (self.index << BLOB_KIND_BITS) | kind.tag(),
            blob_size: size,
            part,
        }
    }

    pub fn from_blob_id(id: &LogoBlobId) -> Self {
        Self {
            channel: id.channel,
            generation: id.generation,
            step: id.step,
            index: id.cookie >> BLOB_KIND_BITS,
        }
    }
}

impl Ord for BlobSeqId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.channel, self.generation, self.to_sequential()).cmp(&(
            other.channel,
            other.generation,
            other.to_sequential(),
        ))
    }
}

impl PartialOrd for BlobSeqId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BlobSeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.channel, self.generation, self.step, self.index
        )
    }
}

/// Where the payload of one value-chain element lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobLocator {
    pub group_id: GroupId,
    /// Blob holding the payload at offset zero (plain data or composite).
    pub blob_id: LogoBlobId,
    pub data_len: u32,
}

impl BlobLocator {
    /// Sequence id backing this locator when the blob was written by the
    /// depot itself; legacy locators return `None`.
    pub fn blob_seq_id(&self, depot_tablet_id: TabletId) -> Option<BlobSeqId> {
        (self.blob_id.tablet_id == depot_tablet_id).then(|| BlobSeqId::from_blob_id(&self.blob_id))
    }

    pub fn read(&self) -> BlobRead {
        BlobRead {
            group_id: self.group_id,
            blob_id: self.blob_id,
            offset: 0,
            size: self.data_len,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeepState {
    #[default]
    Default,
    Keep,
    DoNotKeep,
}

/// Index record for one key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedValue {
    #[serde(default)]
    pub meta: Vec<u8>,
    pub value_chain: Vec<BlobLocator>,
    #[serde(default)]
    pub keep_state: KeepState,
    #[serde(default)]
    pub public: bool,
    /// Committed before the physical write was confirmed durable.
    #[serde(default)]
    pub uncertain: bool,
}

impl CommittedValue {
    pub fn data_len(&self) -> u64 {
        self.value_chain.iter().map(|l| u64::from(l.data_len)).sum()
    }
}

/// One `[begin, end)` run of sequential numbers granted on a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GivenRange {
    pub channel: u8,
    pub begin: u64,
    pub end: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelGroup {
    pub channel: u8,
    pub group_id: GroupId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KindLayout {
    pub kind: ChannelKind,
    pub channels: Vec<ChannelGroup>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitItem {
    pub key: Key,
    pub meta: Vec<u8>,
    pub value_chain: Vec<BlobLocator>,
    pub keep_state: KeepState,
    pub public: bool,
    pub uncertain: bool,
    pub commit_notify: bool,
}

impl CommitItem {
    pub fn new(key: Key, value_chain: Vec<BlobLocator>) -> Self {
        Self {
            key,
            meta: Vec::new(),
            value_chain,
            keep_state: KeepState::Default,
            public: false,
            uncertain: false,
            commit_notify: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemResult {
    pub status: Status,
    pub error: Option<String>,
}

impl ItemResult {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            error: None,
        }
    }

    pub fn failed(status: Status, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
        }
    }
}

/// Inclusive key interval or a single key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolveTarget {
    Range { begin: Key, end: Key },
    Exact(Key),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveItem {
    pub target: ResolveTarget,
    pub tablet_id: Option<TabletId>,
    pub must_restore_first: bool,
    /// Exclusive lower bound carried over from an `OVERRUN` reply.
    pub continuation: Option<Key>,
}

impl ResolveItem {
    pub fn range(begin: Key, end: Key) -> Self {
        Self {
            target: ResolveTarget::Range { begin, end },
            tablet_id: None,
            must_restore_first: false,
            continuation: None,
        }
    }

    pub fn exact(key: Key) -> Self {
        Self {
            target: ResolveTarget::Exact(key),
            tablet_id: None,
            must_restore_first: false,
            continuation: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedValue {
    pub meta: Vec<u8>,
    pub value_chain: Vec<BlobLocator>,
    pub uncertain: bool,
}

impl From<&CommittedValue> for ResolvedValue {
    fn from(value: &CommittedValue) -> Self {
        Self {
            meta: value.meta.clone(),
            value_chain: value.value_chain.clone(),
            uncertain: value.uncertain,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key: Key,
    pub value: Result<ResolvedValue, String>,
}

/// Where a truncated resolve stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveContinuation {
    pub item_index: usize,
    pub after: Option<Key>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveResult {
    pub status: Status,
    pub items: Vec<ResolvedKey>,
    pub continuation: Option<ResolveContinuation>,
    pub error: Option<String>,
}

impl ResolveResult {
    pub fn failed(status: Status, error: impl Into<String>) -> Self {
        Self {
            status,
            items: Vec::new(),
            continuation: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterResult {
    pub generation: Generation,
    pub tablet_id: TabletId,
    pub kinds: Vec<KindLayout>,
    pub decommission_group: Option<GroupId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocateResult {
    pub kind: ChannelKind,
    pub generation: Generation,
    pub ranges: Vec<GivenRange>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlocksResult {
    pub tablet_id: TabletId,
    pub status: Status,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitResult {
    pub items: Vec<ItemResult>,
}

/// Agent → coordinator request body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentRequest {
    Register {
        node_id: NodeId,
        instance_id: u64,
    },
    AllocateIds {
        kind: ChannelKind,
        count: u32,
    },
    QueryBlocks {
        tablet_id: TabletId,
        generation: Generation,
    },
    Commit {
        items: Vec<CommitItem>,
    },
    Resolve {
        items: Vec<ResolveItem>,
    },
    /// Fire-and-forget: these ids will never carry live data.
    DiscardSpoiledBlobSeq {
        ids: Vec<BlobSeqId>,
    },
    /// Fire-and-forget answer to `CoordinatorMessage::PushNotify`.
    PushNotifyResult {
        correlation_id: u64,
        writes_in_flight: Vec<BlobSeqId>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentMessage {
    pub request_id: RequestId,
    pub request: AgentRequest,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinatorResponse {
    Registered(RegisterResult),
    Allocated(AllocateResult),
    BlocksQueried(BlocksResult),
    Committed(CommitResult),
    Resolved(ResolveResult),
}

/// Coordinator → agent message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinatorMessage {
    Reply {
        request_id: RequestId,
        response: CoordinatorResponse,
    },
    /// Drop every leased id below `below` on each listed channel.
    PushNotify {
        correlation_id: u64,
        invalidate: Vec<(u8, u64)>,
    },
}

/// Queue class hint passed through to the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HandleClass {
    TabletLog,
    #[default]
    UserData,
    AsyncRead,
    FastRead,
    Discover,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobPut {
    pub group_id: GroupId,
    pub blob_id: LogoBlobId,
    pub data: Bytes,
    pub deadline: Option<Instant>,
    pub handle_class: HandleClass,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobRead {
    pub group_id: GroupId,
    pub blob_id: LogoBlobId,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeScan {
    pub group_id: GroupId,
    pub tablet_id: TabletId,
    pub from: LogoBlobId,
    pub to: LogoBlobId,
    pub index_only: bool,
    pub must_restore_first: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreRequest {
    Put(BlobPut),
    Get {
        reads: Vec<BlobRead>,
        handle_class: HandleClass,
    },
    Range(RangeScan),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorePutResult {
    pub status: Status,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreGetResult {
    pub status: Status,
    /// Concatenation of every requested read, in request order.
    pub data: Option<Bytes>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeBlob {
    pub id: LogoBlobId,
    pub data: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreRangeResult {
    pub status: Status,
    pub blobs: Vec<RangeBlob>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreResponse {
    Put(StorePutResult),
    Get(StoreGetResult),
    Range(StoreRangeResult),
}

/// Content-addressed blob store the depot writes through.
///
/// Ids are opaque and immutable once written; the depot never overwrites.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn put(&self, put: BlobPut) -> StorePutResult;

    async fn get(&self, reads: Vec<BlobRead>, handle_class: HandleClass) -> StoreGetResult;

    async fn range(&self, scan: RangeScan) -> StoreRangeResult;

    async fn execute(&self, request: StoreRequest) -> StoreResponse {
        match request {
            StoreRequest::Put(put) => StoreResponse::Put(self.put(put).await),
            StoreRequest::Get {
                reads,
                handle_class,
            } => StoreResponse::Get(self.get(reads, handle_class).await),
            StoreRequest::Range(scan) => StoreResponse::Range(self.range(scan).await),
        }
    }
}

/// Durable key-value table used for the index and configuration.
///
/// Upsert-only from the depot's perspective apart from discarding uncertain
/// entries.
pub trait DurableTable: Send + Sync + 'static {
    fn upsert(&self, partition: &str, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
    fn delete(&self, partition: &str, key: &[u8]) -> anyhow::Result<()>;
    fn scan(&self, partition: &str) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Flush buffered writes to stable storage.
    fn persist(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Tablet block authority consulted before a write is allowed to proceed.
pub trait BlocksAuthority: Send + Sync + 'static {
    /// `Ok` when `generation` may still write, `Blocked` when it has been
    /// fenced off, `Unknown` when the authority cannot tell yet.
    fn check(&self, tablet_id: TabletId, generation: Generation) -> Status;
}

/// Garbage-collection fence for committed keys.
pub trait BarrierAuthority: Send + Sync + 'static {
    fn is_behind_barrier(&self, key: &[u8]) -> bool;
}
