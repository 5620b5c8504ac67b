//! Synchronization: pull external state in and reconcile it with the
//! registry.

pub mod config;
pub mod log;
pub mod service;
pub mod situation;

pub use config::{SyncActionConfig, SyncActionOverrides, SyncConfig, SyncConfigStore};
pub use log::{SyncActionLog, SyncItemLog, SyncItemOutcome, SyncLogStore, SyncRunLog};
pub use service::{SyncError, SyncResult, Synchronizer};
pub use situation::{
    classify, LinkedAction, MissingAccountAction, MissingEntityAction, SyncSituation,
    UnlinkedAction,
};
