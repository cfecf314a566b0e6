//! Blob depot protocol crate.
//!
//! A single coordinator leases disjoint blob sequence id ranges to agents and
//! durably records which ids became committed blobs; agents turn client puts
//! and reads into store writes, commits and resolves. Both sides are
//! single-threaded state machines driven by inbound messages: callers feed
//! them messages and drain an outbox. `depot_node` supplies the runtime.

pub mod agent;
pub mod depot;
mod error;

pub use error::DepotError;
