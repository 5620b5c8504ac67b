//! Synchronization run, item, and action logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Page, StoreResult};
use crate::sync::situation::SyncSituation;

/// Outcome of handling one reported object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncItemOutcome {
    /// Action applied cleanly.
    Success,
    /// Action applied with a caveat (e.g. correlation ambiguity).
    Warning,
    /// Action failed; the item's changes were discarded.
    Error,
}

impl SyncItemOutcome {
    /// String form used in persisted state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncItemOutcome::Success => "success",
            SyncItemOutcome::Warning => "warning",
            SyncItemOutcome::Error => "error",
        }
    }
}

impl std::str::FromStr for SyncItemOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(SyncItemOutcome::Success),
            "warning" => Ok(SyncItemOutcome::Warning),
            "error" => Ok(SyncItemOutcome::Error),
            _ => Err(format!("unknown item outcome: {s}")),
        }
    }
}

/// One synchronization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunLog {
    /// Run id.
    pub id: Uuid,
    /// Configuration that drove the run.
    pub config_id: Uuid,
    /// System synchronized.
    pub system_id: Uuid,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// End timestamp, None while active.
    pub ended_at: Option<DateTime<Utc>>,
    /// Whether the run is still active.
    pub running: bool,
    /// Items handled cleanly.
    pub success_count: u32,
    /// Items handled with warnings.
    pub warning_count: u32,
    /// Items that failed.
    pub error_count: u32,
    /// Run was canceled before completion.
    pub canceled: bool,
    /// Fatal error that stopped the run before or during item processing.
    pub fatal_error: Option<String>,
}

impl SyncRunLog {
    /// New active run.
    pub fn started(config_id: Uuid, system_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            config_id,
            system_id,
            started_at: Utc::now(),
            ended_at: None,
            running: true,
            success_count: 0,
            warning_count: 0,
            error_count: 0,
            canceled: false,
            fatal_error: None,
        }
    }
}

/// Log line for one reported object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncItemLog {
    /// Item log id.
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Reported uid value.
    pub uid: String,
    /// Situation the item classified into, when classification got that
    /// far.
    pub situation: Option<SyncSituation>,
    /// Action taken, e.g. "update_entity".
    pub action: String,
    /// How it went.
    pub outcome: SyncItemOutcome,
    /// Detail message.
    pub message: Option<String>,
    /// Timestamp.
    pub created_at: DateTime<Utc>,
}

impl SyncItemLog {
    /// New item log line.
    pub fn new(
        run_id: Uuid,
        uid: impl Into<String>,
        situation: Option<SyncSituation>,
        action: impl Into<String>,
        outcome: SyncItemOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            uid: uid.into(),
            situation,
            action: action.into(),
            outcome,
            message: None,
            created_at: Utc::now(),
        }
    }

    /// Attach a detail message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Aggregated counter per (situation, action, outcome) within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncActionLog {
    /// Owning run.
    pub run_id: Uuid,
    /// Situation dimension.
    pub situation: SyncSituation,
    /// Action dimension.
    pub action: String,
    /// Outcome dimension.
    pub outcome: SyncItemOutcome,
    /// Number of items.
    pub count: u32,
}

/// Storage for synchronization logs.
#[async_trait]
pub trait SyncLogStore: Send + Sync {
    /// Insert a new run.
    async fn insert_run(&self, run: &SyncRunLog) -> StoreResult<()>;

    /// Update a run's counters and completion fields.
    async fn update_run(&self, run: &SyncRunLog) -> StoreResult<()>;

    /// Fetch a run.
    async fn get_run(&self, id: Uuid) -> StoreResult<Option<SyncRunLog>>;

    /// Whether the config has an active run.
    async fn is_running(&self, config_id: Uuid) -> StoreResult<bool>;

    /// Append an item log line.
    async fn append_item(&self, item: &SyncItemLog) -> StoreResult<()>;

    /// Add to a run's outcome counters.
    async fn bump_counts(
        &self,
        run_id: Uuid,
        success: u32,
        warning: u32,
        error: u32,
    ) -> StoreResult<()>;

    /// Bump the (situation, action, outcome) counter for a run.
    async fn bump_action(
        &self,
        run_id: Uuid,
        situation: SyncSituation,
        action: &str,
        outcome: SyncItemOutcome,
    ) -> StoreResult<()>;

    /// Item log lines of a run, oldest first.
    async fn items_for_run(&self, run_id: Uuid, page: Page) -> StoreResult<Vec<SyncItemLog>>;

    /// Action counters of a run.
    async fn actions_for_run(&self, run_id: Uuid) -> StoreResult<Vec<SyncActionLog>>;
}
