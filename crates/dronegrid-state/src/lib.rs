//! dronegrid-state — persistence collaborator for the DroneGrid scheduler.
//!
//! Backed by [redb](https://docs.rs/redb), holds the records the scheduler
//! reads and mutates every tick: hosts, labels, atomic groups, jobs, host
//! queue entries and special tasks.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Every table is keyed by a `u64` id, so iteration always yields records in
//! ascending id order. Ids for new rows are allocated from a counters table
//! inside the same write transaction that inserts the row.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).
//! Schema ownership lives outside the scheduler; this crate only exposes the
//! `fetch`/`save` surface the scheduler consumes.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
