//! # Connector capability boundary
//!
//! The provisioning core never talks to a remote system directly. Everything
//! it needs from the outside world goes through the [`Connector`] trait
//! defined here: create/update/delete an object, set a password, read one
//! object back, or stream changes for synchronization.
//!
//! This crate also owns the wire-level vocabulary shared between the core
//! and connector implementations:
//!
//! - [`Uid`]: the identifier of an object on a target system
//! - [`AttributeSet`] / [`AttributeValue`]: normalized attribute payloads
//! - [`ResolvedAttributes`]: plain attributes plus guarded secrets, kept
//!   apart so secrets never end up in plain payloads or logs
//! - [`ConnectorError`]: the error taxonomy, classified into transient and
//!   validation failures so the executor can decide retry vs. terminal
//!   without inspecting messages

pub mod error;
pub mod operation;
pub mod traits;
pub mod types;

pub use error::{ConnectorError, ConnectorResult, FailureClass};
pub use operation::{AttributeSet, AttributeValue, ResolvedAttributes, Uid};
pub use traits::Connector;
pub use types::{OperationType, SyncDeltaType, SyncEntry, SyncPage};
