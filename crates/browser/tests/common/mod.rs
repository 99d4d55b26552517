use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rpa_browser::{
    ExecutionUnitApi, ExecutionUnitError, ExecutionUnitManager, ProvisionRequest, ProvisionedUnit,
    Readiness, UnitManagerConfig,
};
use rpa_core::backoff::BackoffConfig;
use rpa_core::clock::ManualClock;
use rpa_core::execution_unit::ExecutionUnitState;
use rpa_store::repositories::UnitRepo;
use rpa_store::MemoryStore;

/// In-process control plane. Records the unit state it observes whenever a
/// termination request arrives.
pub struct FakeUnitApi {
    store: Arc<MemoryStore>,
    pub ready: AtomicBool,
    pub fail_provision: AtomicBool,
    pub provisions: AtomicUsize,
    pub terminations: Mutex<Vec<(String, Option<ExecutionUnitState>)>>,
}

impl FakeUnitApi {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            ready: AtomicBool::new(true),
            fail_provision: AtomicBool::new(false),
            provisions: AtomicUsize::new(0),
            terminations: Mutex::new(Vec::new()),
        }
    }

    pub fn termination_count(&self) -> usize {
        self.terminations.lock().unwrap().len()
    }

    pub fn terminated_states(&self) -> Vec<Option<ExecutionUnitState>> {
        self.terminations.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }
}

#[async_trait]
impl ExecutionUnitApi for FakeUnitApi {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionedUnit, ExecutionUnitError> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(ExecutionUnitError::Api {
                status: 503,
                body: "no capacity".into(),
            });
        }
        Ok(ProvisionedUnit {
            service_id: request.service_id.clone(),
            endpoint: format!("http://{}.units.test", request.service_id),
        })
    }

    async fn readiness(&self, _endpoint: &str) -> Result<Readiness, ExecutionUnitError> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(Readiness::Ready)
        } else {
            Ok(Readiness::NotReady("browser still starting".into()))
        }
    }

    async fn command(
        &self,
        _endpoint: &str,
        command: &serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionUnitError> {
        match command["type"].as_str() {
            Some("session.create") => Ok(serde_json::json!({ "session_id": "sess-1" })),
            _ => Ok(serde_json::json!({ "ok": true, "echo": command })),
        }
    }

    async fn terminate(&self, service_id: &str) -> Result<(), ExecutionUnitError> {
        let state = UnitRepo::find(self.store.as_ref(), service_id)
            .await
            .ok()
            .flatten()
            .map(|u| u.state);
        self.terminations
            .lock()
            .unwrap()
            .push((service_id.to_string(), state));
        Ok(())
    }
}

pub fn test_config() -> UnitManagerConfig {
    UnitManagerConfig {
        ready_timeout: Duration::from_secs(15),
        ready_poll_interval: Duration::from_millis(500),
        provision_attempts: 2,
        provision_backoff: BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
        },
        idle_timeout: Duration::from_secs(600),
        warm_pool_size: 0,
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub api: Arc<FakeUnitApi>,
    pub clock: Arc<ManualClock>,
    pub manager: Arc<ExecutionUnitManager>,
}

pub fn harness(config: UnitManagerConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let api = Arc::new(FakeUnitApi::new(Arc::clone(&store)));
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let manager = Arc::new(ExecutionUnitManager::new(
        store.clone(),
        api.clone(),
        clock.clone(),
        config,
    ));
    Harness {
        store,
        api,
        clock,
        manager,
    }
}
