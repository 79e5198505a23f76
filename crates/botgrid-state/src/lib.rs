//! botgrid-state: embedded state store for BotGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for group definitions, account leases, and routine execution
//! records.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Execution records use `{session_id}:{instance}:{seq}` keys so one
//! orchestration session can be scanned by prefix.
//!
//! Account checkout runs inside a single write transaction per call:
//! the current lease is read, the staleness window is applied, and the
//! new lease is written before commit. redb serializes write transactions,
//! so two sessions racing for the same account cannot both win.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod checkout;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use checkout::ReconcileOutcome;
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
