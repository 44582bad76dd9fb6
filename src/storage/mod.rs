//! Engine state persistence
//!
//! Identity cooldown state and watch item snapshots survive restarts through
//! a JSON snapshot file. Cache entries, budgets and health windows are
//! rebuilt from live traffic instead.

pub mod snapshot;

pub use snapshot::{EngineSnapshot, SnapshotStore, SNAPSHOT_VERSION};
