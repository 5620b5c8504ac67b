//! Shared fixtures: a scriptable connector, a recording notifier, and a
//! fully wired in-memory stack.

// Each test binary uses a different subset of these fixtures.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use idbridge_connector::{
    AttributeSet, Connector, ConnectorError, ConnectorResult, ResolvedAttributes, SyncPage, Uid,
};
use idbridge_provisioning::notify::{NotificationTemplate, Notifier, NotifyResult};
use idbridge_provisioning::{
    BackoffPolicy, BreakerCache, ConnectorRegistry, ExecutorConfig, MemoryStore, OperationQueue,
    ProvisioningExecutor,
};

/// Connector whose behavior tests script call by call.
#[derive(Default)]
pub struct MockConnector {
    /// Remaining calls that fail with a transient connection error.
    pub fail_transient: AtomicU32,
    /// Remaining calls that fail with a validation rejection.
    pub fail_validation: AtomicU32,
    /// When set, test_connection fails.
    pub unreachable: AtomicBool,
    /// Call log, e.g. "create:jdoe".
    pub calls: Mutex<Vec<String>>,
    /// Pages served by sync, in order.
    pub pages: Mutex<Vec<SyncPage>>,
    /// Uids served by list_uids.
    pub uids: Mutex<Vec<Uid>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_transient(self, times: u32) -> Self {
        self.fail_transient.store(times, Ordering::SeqCst);
        self
    }

    pub fn failing_validation(self, times: u32) -> Self {
        self.fail_validation.store(times, Ordering::SeqCst);
        self
    }

    pub fn with_pages(self, pages: Vec<SyncPage>) -> Self {
        *self.pages.lock().unwrap() = pages;
        self
    }

    pub fn with_uids(self, uids: Vec<Uid>) -> Self {
        *self.uids.lock().unwrap() = uids;
        self
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn delete_calls(&self) -> usize {
        self.call_log()
            .iter()
            .filter(|c| c.starts_with("delete:"))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn scripted_failure(&self) -> Option<ConnectorError> {
        if self.fail_transient.load(Ordering::SeqCst) > 0 {
            self.fail_transient.fetch_sub(1, Ordering::SeqCst);
            return Some(ConnectorError::connection_failed("scripted outage"));
        }
        if self.fail_validation.load(Ordering::SeqCst) > 0 {
            self.fail_validation.fetch_sub(1, Ordering::SeqCst);
            return Some(ConnectorError::value_rejected("mail", "scripted rejection"));
        }
        None
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn display_name(&self) -> &str {
        "mock"
    }

    async fn test_connection(&self) -> ConnectorResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ConnectorError::connection_failed("unreachable"));
        }
        Ok(())
    }

    async fn create(
        &self,
        _object_class: &str,
        attributes: &ResolvedAttributes,
    ) -> ConnectorResult<Uid> {
        let uid = attributes
            .attributes
            .get_string("uid")
            .unwrap_or("generated")
            .to_string();
        self.record(format!("create:{uid}"));
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        Ok(Uid::from_value(uid))
    }

    async fn update(
        &self,
        _object_class: &str,
        uid: &Uid,
        _attributes: &ResolvedAttributes,
    ) -> ConnectorResult<Uid> {
        self.record(format!("update:{}", uid.value()));
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        Ok(uid.clone())
    }

    async fn delete(&self, _object_class: &str, uid: &Uid) -> ConnectorResult<()> {
        self.record(format!("delete:{}", uid.value()));
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        Ok(())
    }

    async fn read(&self, _object_class: &str, _uid: &Uid) -> ConnectorResult<Option<AttributeSet>> {
        Ok(None)
    }

    async fn sync(
        &self,
        _object_class: &str,
        _last_token: Option<&str>,
        _batch_size: u32,
    ) -> ConnectorResult<SyncPage> {
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        let mut pages = self.pages.lock().unwrap();
        if pages.is_empty() {
            Ok(SyncPage::empty())
        } else {
            Ok(pages.remove(0))
        }
    }

    async fn list_uids(&self, _object_class: &str) -> ConnectorResult<Vec<Uid>> {
        Ok(self.uids.lock().unwrap().clone())
    }
}

/// Registry over a fixed system-to-connector map.
#[derive(Default)]
pub struct StaticRegistry {
    connectors: HashMap<Uuid, Arc<dyn Connector>>,
}

impl StaticRegistry {
    pub fn single(system_id: Uuid, connector: Arc<dyn Connector>) -> Self {
        let mut connectors = HashMap::new();
        connectors.insert(system_id, connector);
        Self { connectors }
    }
}

#[async_trait]
impl ConnectorRegistry for StaticRegistry {
    async fn connector(&self, system_id: Uuid) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&system_id).cloned()
    }
}

/// Notifier that records every delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(NotificationTemplate, Vec<String>)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_templates(&self) -> Vec<NotificationTemplate> {
        self.sent.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        recipients: &[String],
        template: NotificationTemplate,
        _context: &Value,
    ) -> NotifyResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((template, recipients.to_vec()));
        Ok(())
    }
}

/// Fully wired in-memory provisioning stack.
pub struct TestStack {
    pub system_id: Uuid,
    pub store: Arc<MemoryStore>,
    pub connector: Arc<MockConnector>,
    pub notifier: Arc<RecordingNotifier>,
    pub breaker: Arc<BreakerCache>,
    pub queue: Arc<OperationQueue>,
    pub executor: Arc<ProvisioningExecutor>,
}

impl TestStack {
    pub fn new(connector: MockConnector) -> Self {
        Self::with_retry(connector, BackoffPolicy::default().without_jitter())
    }

    pub fn with_retry(connector: MockConnector, retry: BackoffPolicy) -> Self {
        let system_id = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(connector);
        let notifier = Arc::new(RecordingNotifier::new());
        let breaker = Arc::new(BreakerCache::new());
        let queue = Arc::new(OperationQueue::new(
            Arc::clone(&store) as _,
            Arc::clone(&store) as _,
        ));
        let executor = Arc::new(ProvisioningExecutor::new(
            Arc::clone(&store) as _,
            Arc::clone(&store) as _,
            Arc::new(StaticRegistry::single(
                system_id,
                Arc::clone(&connector) as Arc<dyn Connector>,
            )),
            Arc::new(retry),
            Arc::clone(&breaker),
            Arc::clone(&store) as _,
            Arc::clone(&notifier) as _,
            ExecutorConfig::default(),
        ));
        Self {
            system_id,
            store,
            connector,
            notifier,
            breaker,
            queue,
            executor,
        }
    }
}
