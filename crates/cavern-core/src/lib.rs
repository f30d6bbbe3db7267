//! Epoch engine and persistence coordination for the Cavern consensus grid.
//!
//! This crate wires the working tier from `cavern-grid` to the durable tier
//! from `cavern-db`: it serializes access to the active epoch, rotates it at
//! each week boundary, mirrors cross-epoch records, and runs the periodic
//! flush in the background.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `cavern-config.yaml` into
//!   strongly-typed structs.
//! - [`coordinator`] -- Sync policy per table class, batched flushes,
//!   hydration, and record resync.
//! - [`engine`] -- [`Engine`], the single entry point for reports, queries,
//!   roles, presets, and rotation.
//! - [`epoch`] -- [`Clock`], [`WeeklySchedule`], and the [`ReingestHook`].
//! - [`maintenance`] -- Background flush and rotation-check task.
//! - [`records`] -- Working copy of the cross-epoch records.
//!
//! [`Engine`]: engine::Engine
//! [`Clock`]: epoch::Clock
//! [`WeeklySchedule`]: epoch::WeeklySchedule
//! [`ReingestHook`]: epoch::ReingestHook

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod epoch;
pub mod maintenance;
pub mod records;

pub use config::{CavernConfig, ConfigError};
pub use coordinator::{PersistError, PersistenceCoordinator, RecordMutation, SyncPolicy, TableClass};
pub use engine::{Engine, EngineError, EngineSettings, IngestSummary};
pub use epoch::{Clock, ManualClock, NoReplay, ReingestHook, RotationDetails, SystemClock, WeeklySchedule};
pub use maintenance::{MaintenanceHandle, MaintenanceSettings};
