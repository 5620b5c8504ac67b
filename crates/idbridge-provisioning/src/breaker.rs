//! Provisioning circuit breaker.
//!
//! Tracks failures per (system, operation type) in a sliding window and
//! suspends further operations of that type when a configured threshold is
//! crossed. The cache is an explicitly owned value passed to the executor
//! and worker by the embedder; there is no process-global instance.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use idbridge_connector::OperationType;

use crate::store::StoreResult;

/// Breaker thresholds for one (system, operation type) pair.
///
/// A config with `system_id = None` is the global default for its
/// operation type; a per-system config overrides it completely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakConfig {
    /// System this config applies to. None means global default.
    pub system_id: Option<Uuid>,
    /// Operation type this config applies to.
    pub operation_type: OperationType,
    /// Failure count that triggers a warning notification. None disables
    /// the warning stage.
    pub warning_threshold: Option<u32>,
    /// Failure count that trips the breaker open.
    pub disable_threshold: u32,
    /// Width of the sliding failure window in seconds.
    pub window_secs: i64,
    /// Who gets the warning/disable notifications.
    pub recipients: Vec<String>,
    /// Whether this breaker is evaluated at all.
    pub enabled: bool,
}

impl BreakConfig {
    /// A global default config for the given operation type.
    pub fn global(operation_type: OperationType, disable_threshold: u32, window_secs: i64) -> Self {
        Self {
            system_id: None,
            operation_type,
            warning_threshold: None,
            disable_threshold,
            window_secs,
            recipients: Vec::new(),
            enabled: true,
        }
    }

    /// Restrict this config to one system.
    #[must_use]
    pub fn for_system(mut self, system_id: Uuid) -> Self {
        self.system_id = Some(system_id);
        self
    }

    /// Set the warning threshold.
    #[must_use]
    pub fn with_warning(mut self, threshold: u32) -> Self {
        self.warning_threshold = Some(threshold);
        self
    }

    /// Set the notification recipients.
    #[must_use]
    pub fn with_recipients(mut self, recipients: Vec<String>) -> Self {
        self.recipients = recipients;
        self
    }
}

/// Storage for breaker configurations.
#[async_trait]
pub trait BreakConfigStore: Send + Sync {
    /// Config for a system/operation pair: the per-system config when one
    /// exists, otherwise the global default, otherwise None (no breaker).
    async fn resolve(
        &self,
        system_id: Uuid,
        operation_type: OperationType,
    ) -> StoreResult<Option<BreakConfig>>;

    /// Insert or replace a config.
    async fn upsert(&self, config: &BreakConfig) -> StoreResult<()>;
}

/// What a recorded failure changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    /// Below all thresholds, nothing to report.
    None,
    /// Crossed the warning threshold just now. Notify once.
    Warned,
    /// Crossed the disable threshold just now. Notify once and stop
    /// processing this system/operation pair.
    Opened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Warned,
    Open,
}

#[derive(Debug)]
struct BreakerWindow {
    failures: VecDeque<DateTime<Utc>>,
    state: BreakerState,
    opened_at: Option<DateTime<Utc>>,
}

impl BreakerWindow {
    fn new() -> Self {
        Self {
            failures: VecDeque::new(),
            state: BreakerState::Closed,
            opened_at: None,
        }
    }

    fn evict(&mut self, window: Duration, now: DateTime<Utc>) {
        let cutoff = now - window;
        while self.failures.front().is_some_and(|t| *t < cutoff) {
            self.failures.pop_front();
        }
    }
}

/// In-memory sliding-window failure counters, one per (system, operation
/// type).
///
/// Shared between the executor (which records outcomes) and the queue scan
/// (which skips open pairs). Construct one per process and pass it where
/// it is needed.
#[derive(Debug, Default)]
pub struct BreakerCache {
    inner: RwLock<HashMap<(Uuid, OperationType), BreakerWindow>>,
}

impl BreakerCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed operation and report any threshold crossing.
    ///
    /// Transitions are edge-triggered: crossing a threshold reports it
    /// exactly once until the pair resets.
    pub fn record_failure(
        &self,
        system_id: Uuid,
        operation_type: OperationType,
        config: &BreakConfig,
        now: DateTime<Utc>,
    ) -> BreakerTransition {
        if !config.enabled {
            return BreakerTransition::None;
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let window = inner
            .entry((system_id, operation_type))
            .or_insert_with(BreakerWindow::new);
        window.evict(Duration::seconds(config.window_secs), now);
        window.failures.push_back(now);
        let count = window.failures.len() as u32;

        if count >= config.disable_threshold && window.state != BreakerState::Open {
            window.state = BreakerState::Open;
            window.opened_at = Some(now);
            return BreakerTransition::Opened;
        }
        if let Some(warn_at) = config.warning_threshold {
            if count >= warn_at && window.state == BreakerState::Closed {
                window.state = BreakerState::Warned;
                return BreakerTransition::Warned;
            }
        }
        BreakerTransition::None
    }

    /// Record a successful operation: the pair resets completely.
    pub fn record_success(&self, system_id: Uuid, operation_type: OperationType) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.remove(&(system_id, operation_type));
    }

    /// Whether the breaker for this pair is currently open.
    ///
    /// An open breaker closes again once its window has fully elapsed
    /// since the trip, so a quiet period heals the pair without manual
    /// intervention.
    pub fn is_open(
        &self,
        system_id: Uuid,
        operation_type: OperationType,
        config: &BreakConfig,
        now: DateTime<Utc>,
    ) -> bool {
        if !config.enabled {
            return false;
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(window) = inner.get_mut(&(system_id, operation_type)) else {
            return false;
        };
        if window.state != BreakerState::Open {
            return false;
        }
        let expired = window
            .opened_at
            .is_some_and(|at| now - at >= Duration::seconds(config.window_secs));
        if expired {
            inner.remove(&(system_id, operation_type));
            return false;
        }
        true
    }

    /// Manually reset the pair (operator action after fixing the target).
    pub fn clear(&self, system_id: Uuid, operation_type: OperationType) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.remove(&(system_id, operation_type));
    }

    /// Drop windows whose failures have all aged out. Called periodically
    /// by the worker so idle pairs do not accumulate.
    pub fn evict_expired(&self, window: Duration, now: DateTime<Utc>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.retain(|_, w| {
            w.evict(window, now);
            if w.state == BreakerState::Open {
                return w.opened_at.is_some_and(|at| now - at < window);
            }
            !w.failures.is_empty()
        });
    }

    /// Current failure count for a pair within its window.
    pub fn failure_count(
        &self,
        system_id: Uuid,
        operation_type: OperationType,
        config: &BreakConfig,
        now: DateTime<Utc>,
    ) -> u32 {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.get_mut(&(system_id, operation_type)) {
            Some(window) => {
                window.evict(Duration::seconds(config.window_secs), now);
                window.failures.len() as u32
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakConfig {
        BreakConfig::global(OperationType::Update, 5, 600).with_warning(3)
    }

    #[test]
    fn test_warning_then_open_each_reported_once() {
        let cache = BreakerCache::new();
        let system = Uuid::new_v4();
        let cfg = config();
        let now = Utc::now();

        let mut transitions = Vec::new();
        for i in 0..6 {
            let at = now + Duration::seconds(i);
            transitions.push(cache.record_failure(system, OperationType::Update, &cfg, at));
        }
        assert_eq!(
            transitions,
            vec![
                BreakerTransition::None,
                BreakerTransition::None,
                BreakerTransition::Warned,
                BreakerTransition::None,
                BreakerTransition::Opened,
                BreakerTransition::None,
            ]
        );
        assert!(cache.is_open(system, OperationType::Update, &cfg, now + Duration::seconds(10)));
    }

    #[test]
    fn test_success_resets_counter() {
        let cache = BreakerCache::new();
        let system = Uuid::new_v4();
        let cfg = config();
        let now = Utc::now();

        for _ in 0..4 {
            cache.record_failure(system, OperationType::Update, &cfg, now);
        }
        cache.record_success(system, OperationType::Update);
        assert_eq!(cache.failure_count(system, OperationType::Update, &cfg, now), 0);
        assert_eq!(
            cache.record_failure(system, OperationType::Update, &cfg, now),
            BreakerTransition::None
        );
    }

    #[test]
    fn test_window_expiry_closes_breaker() {
        let cache = BreakerCache::new();
        let system = Uuid::new_v4();
        let cfg = config();
        let now = Utc::now();

        for _ in 0..5 {
            cache.record_failure(system, OperationType::Update, &cfg, now);
        }
        assert!(cache.is_open(system, OperationType::Update, &cfg, now));
        let later = now + Duration::seconds(cfg.window_secs + 1);
        assert!(!cache.is_open(system, OperationType::Update, &cfg, later));
    }

    #[test]
    fn test_old_failures_age_out_of_window() {
        let cache = BreakerCache::new();
        let system = Uuid::new_v4();
        let cfg = config();
        let now = Utc::now();

        cache.record_failure(system, OperationType::Update, &cfg, now);
        cache.record_failure(system, OperationType::Update, &cfg, now);
        let later = now + Duration::seconds(cfg.window_secs + 1);
        cache.record_failure(system, OperationType::Update, &cfg, later);
        assert_eq!(
            cache.failure_count(system, OperationType::Update, &cfg, later),
            1
        );
    }

    #[test]
    fn test_manual_clear() {
        let cache = BreakerCache::new();
        let system = Uuid::new_v4();
        let cfg = config();
        let now = Utc::now();

        for _ in 0..5 {
            cache.record_failure(system, OperationType::Update, &cfg, now);
        }
        assert!(cache.is_open(system, OperationType::Update, &cfg, now));
        cache.clear(system, OperationType::Update);
        assert!(!cache.is_open(system, OperationType::Update, &cfg, now));
    }

    #[test]
    fn test_pairs_are_independent() {
        let cache = BreakerCache::new();
        let system = Uuid::new_v4();
        let cfg = config();
        let now = Utc::now();

        for _ in 0..5 {
            cache.record_failure(system, OperationType::Update, &cfg, now);
        }
        assert!(cache.is_open(system, OperationType::Update, &cfg, now));
        assert!(!cache.is_open(system, OperationType::Delete, &cfg, now));
        assert!(!cache.is_open(Uuid::new_v4(), OperationType::Update, &cfg, now));
    }

    #[test]
    fn test_disabled_config_never_opens() {
        let cache = BreakerCache::new();
        let system = Uuid::new_v4();
        let mut cfg = config();
        cfg.enabled = false;
        let now = Utc::now();

        for _ in 0..10 {
            assert_eq!(
                cache.record_failure(system, OperationType::Update, &cfg, now),
                BreakerTransition::None
            );
        }
        assert!(!cache.is_open(system, OperationType::Update, &cfg, now));
    }
}
