//! capgrid-state — embedded state store for capgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for capacity pools, resource pools, endpoints, profiles,
//! resource descriptions, compute hosts and journaled task documents.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by their self link. Capacity reservation is a single redb write
//! transaction (read, check, decrement, write), which makes it the one
//! serialization point for concurrent reservations.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod inventory;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use inventory::{Inventory, SeedSummary};
pub use store::StateStore;
pub use types::*;
