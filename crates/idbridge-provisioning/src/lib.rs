//! Provisioning and synchronization core for the identity registry.
//!
//! Outbound changes are queued as [`queue::ProvisioningOperation`]s,
//! serialized per account through [`queue::ProvisioningBatch`]es, and
//! executed by the [`executor::ProvisioningExecutor`] under a retry policy
//! and a per-system circuit breaker. Inbound changes are pulled by the
//! [`sync::Synchronizer`], which classifies each reported object into a
//! reconciliation situation and applies the configured action.
//!
//! Storage is abstracted behind per-module traits with a Postgres backend
//! ([`store::PgStore`]) and an in-memory backend ([`store::MemoryStore`]).
//! Connected systems are opaque [`idbridge_connector::Connector`]
//! implementations supplied by the embedder.

pub mod account;
pub mod breaker;
pub mod executor;
pub mod link;
pub mod notify;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod sync;
pub mod task;
pub mod worker;

pub use account::{Account, AccountStore, EntityAccountLink, EntityStore, RegistryEntity};
pub use breaker::{BreakConfig, BreakConfigStore, BreakerCache, BreakerTransition};
pub use executor::{
    BatchOutcome, ConnectorRegistry, ExecutorConfig, ExecutorError, ProvisioningExecutor,
};
pub use link::LinkService;
pub use notify::{LogNotifier, NotificationTemplate, Notifier};
pub use queue::{
    EnqueueRequest, OperationQueue, OperationState, ProvisioningBatch, ProvisioningOperation,
    ProvisioningRequest, QueueError, QueueStore,
};
pub use resolver::{
    merge_attribute_lists, to_resolved, AttributeResolver, DirectResolver, MappedAttribute,
    MergeStrategy, ResolverError,
};
pub use retry::{BackoffPolicy, RetryPolicy};
pub use store::{MemoryStore, Page, PgStore, StoreError, StoreResult};
pub use sync::{
    LinkedAction, MissingAccountAction, MissingEntityAction, SyncActionConfig,
    SyncActionOverrides, SyncConfig, SyncConfigStore, SyncError, SyncItemLog, SyncItemOutcome,
    SyncLogStore, SyncRunLog, SyncSituation, Synchronizer, UnlinkedAction,
};
pub use task::{
    CancelSignal, StatefulTask, TaskConfig, TaskCounts, TaskError, TaskOutcome, TaskResult,
    TaskRun, TaskRunner, TaskState, TaskStateStore,
};
pub use worker::{ProvisioningWorker, WorkerConfig};
