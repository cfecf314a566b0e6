//! Agent-side wiring.
//!
//! `requests` routes answers to their owners, `kinds` caches leased ids,
//! `pending` holds work submitted before registration, `put` and `read` are
//! the per-query state machines and `session` ties them to one coordinator
//! session.

mod kinds;
mod pending;
mod put;
mod read;
mod requests;
mod session;

pub use pending::{PendingEventQueue, PENDING_EXPIRATION, PENDING_QUEUE_MAX_BYTES};
pub use put::{PutRequest, PutState};
pub use read::{GetRequest, RangeRequest, ReadItem, ReadState};
pub use requests::{
    CancelHook, KeyResolvedEvent, QueryId, RequestOwner, RequestTable, RequestTarget, Response,
};
pub use session::{
    Agent, AgentConfig, AgentOutput, ClientRequest, QueryOutcome, StoreCancelHook,
};
