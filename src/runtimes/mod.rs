//! The State Store (§3/§6): durable home for `Run`, `Attempt`, and
//! `Checkpoint` records. The Orchestrator and Worker Pool are written
//! against the [`StateStore`] trait alone; [`InMemoryStateStore`] backs
//! tests and local development, [`sqlite::SqliteStateStore`] and
//! [`postgres::PostgresStateStore`] are the durable backends, gated behind
//! the `sqlite`/`postgres` cargo features.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;
mod store;

pub use memory::InMemoryStateStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStateStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;
pub use store::{
    AttemptRecord, CheckpointRecord, ClaimedRun, RunFilter, RunRecord, StateStore, StateStoreError,
    payload_fingerprint,
};
