//! Coordinator-side wiring.
//!
//! `types` defines ids, wire messages and collaborator contracts,
//! `given_id_range` and `channels` hold lease bookkeeping, `data` is the
//! committed-value index, `coordinator` is the allocator/commit state machine
//! and `decommission` backfills the index from a legacy group.

mod authority;
mod channels;
mod config;
mod coordinator;
mod data;
mod decommission;
mod footer;
mod given_id_range;
mod types;

pub use authority::{BarrierTable, BlocksTable, MemTable};
pub use channels::{Channel, ChannelRegistry};
pub use config::{ChannelProfile, DepotConfig, OperationMode};
pub use coordinator::{
    Collaborators, Coordinator, CoordinatorOutput, DebugStats, DecommitState, AGENT_EXPIRATION,
};
pub use data::{Data, CONFIG_PARTITION, DATA_PARTITION};
pub use decommission::{
    DECOMMIT_COMMIT_BATCH, DECOMMIT_MAX_BYTES_IN_FLIGHT, DECOMMIT_MAX_FETCHES_IN_FLIGHT,
};
pub use footer::{parse_footer, plan_blob_writes, BlobWrite, FOOTER_LEN};
pub use given_id_range::GivenIdRange;
pub use types::{
    AgentMessage, AgentRequest, AllocateResult, BarrierAuthority, BlobKind, BlobLocator, BlobPut,
    BlobRead, BlobSeqId, BlobStore, BlocksAuthority, BlocksResult, ChannelGroup, ChannelKind,
    CommitItem, CommitResult, CommittedValue, ConnectionId, CoordinatorMessage,
    CoordinatorResponse, DurableTable, Generation, GivenRange, GroupId, HandleClass, ItemResult,
    KeepState, Key, KindLayout, LogoBlobId, NodeId, RangeBlob, RangeScan, RegisterResult,
    RequestId, ResolveContinuation, ResolveItem, ResolveResult, ResolveTarget, ResolvedKey,
    ResolvedValue, Status, StoreGetResult, StorePutResult, StoreRangeResult, StoreRequest,
    StoreResponse, TabletId, FIRST_DATA_CHANNEL, INDEX_BITS, LOGO_BLOB_KEY_LEN, MAX_INDEX,
};
