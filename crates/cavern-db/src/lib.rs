//! Durable tier for the Cavern consensus grid (`PostgreSQL`), plus
//! publication of the grid view to `Dragonfly`.
//!
//! # Architecture
//!
//! ```text
//! Engine
//!     |
//!     +-- DurableStore trait
//!     |     |-- PostgresStore        (production)
//!     |     |     |-- GridStore      (epochs, observations, cell_aggregates)
//!     |     |     +-- RecordStore    (roles, last_scan, user_configs, presets, max counts)
//!     |     +-- MemoryDurableStore   (tests, embedded use)
//!     |
//!     +-- After flush ----------> Dragonfly (DragonflyPool::publish_grid)
//! ```
//!
//! # Modules
//!
//! - [`durable`] -- The [`DurableStore`] contract and its `PostgreSQL` implementation
//! - [`grid_store`] -- Epoch-scoped tables
//! - [`record_store`] -- Cross-epoch tables
//! - [`memory`] -- In-memory store with outage simulation
//! - [`dragonfly`] -- `Dragonfly` publication of the grid view
//! - [`postgres`] -- `PostgreSQL` pool and its limits
//! - [`error`] -- Shared error types

pub mod dragonfly;
pub mod durable;
pub mod error;
pub mod grid_store;
pub mod memory;
pub mod postgres;
pub mod record_store;

// Re-export primary types for convenience.
pub use dragonfly::DragonflyPool;
pub use durable::{CellRow, DurableRecords, DurableStore, EpochSnapshot, PostgresStore, StoreCounts};
pub use error::DbError;
pub use grid_store::{GridStore, ObservationRow};
pub use memory::MemoryDurableStore;
pub use postgres::{PoolLimits, PostgresPool};
pub use record_store::RecordStore;
