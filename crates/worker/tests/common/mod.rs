#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use rpa_browser::{
    AutomationSession, ExecutionUnitApi, ExecutionUnitError, ExecutionUnitManager, ProvisionRequest,
    ProvisionedUnit, Readiness, UnitManagerConfig,
};
use rpa_core::backoff::BackoffConfig;
use rpa_core::batch::{new_batch_id, Batch};
use rpa_core::clock::ManualClock;
use rpa_core::config::CoordinationConfig;
use rpa_core::job::PendingJob;
use rpa_core::totp::TotpReservation;
use rpa_core::types::{JobId, Timestamp};
use rpa_core::wire::BatchAssignment;
use rpa_store::intake::{JobIntake, MemoryIntake};
use rpa_store::repositories::{BatchRepo, TotpRepo};
use rpa_store::MemoryStore;
use rpa_worker::router::build_app_router;
use rpa_worker::{
    AppState, AutomationError, BatchProcessor, CredentialStore, Credentials, ProcessorConfig,
    ProviderAutomation, ProviderRegistry,
};
use tokio::sync::Notify;
use tower::ServiceExt;

pub const WORKER: &str = "w1";
pub const PROVIDER: &str = "acme";
pub const ACTION: &str = "download_invoice";
pub const CODE: &str = "287082";

pub fn start() -> Timestamp {
    Utc.timestamp_opt(1_700_000_012, 0).unwrap()
}

/// In-process control plane. Units come up ready unless told otherwise.
pub struct FakeUnitApi {
    pub fail_provision: AtomicBool,
    pub provisions: AtomicUsize,
    sessions_opened: AtomicUsize,
    pub sessions_closed: Mutex<Vec<String>>,
}

impl FakeUnitApi {
    pub fn new() -> Self {
        Self {
            fail_provision: AtomicBool::new(false),
            provisions: AtomicUsize::new(0),
            sessions_opened: AtomicUsize::new(0),
            sessions_closed: Mutex::new(Vec::new()),
        }
    }

    pub fn closed_sessions(&self) -> Vec<String> {
        self.sessions_closed.lock().unwrap().clone()
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
        Ok(Readiness::Ready)
    }

    async fn command(
        &self,
        _endpoint: &str,
        command: &serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionUnitError> {
        match command["type"].as_str() {
            Some("session.create") => {
                let n = self.sessions_opened.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(serde_json::json!({ "session_id": format!("sess-{n}") }))
            }
            Some("session.close") => {
                let session_id = command["session_id"].as_str().unwrap_or_default().to_string();
                self.sessions_closed.lock().unwrap().push(session_id);
                Ok(serde_json::json!({ "ok": true }))
            }
            _ => Ok(serde_json::json!({ "ok": true })),
        }
    }

    async fn terminate(&self, _service_id: &str) -> Result<(), ExecutionUnitError> {
        Ok(())
    }
}

/// Provider automation that counts logins and can be told to report the
/// session as logged out.
pub struct FakeAutomation {
    pub logins: AtomicUsize,
    pub login_codes: Mutex<Vec<Option<String>>>,
    pub executions: AtomicUsize,
    /// Number of upcoming `execute` calls that report an invalid session.
    pub invalidations: AtomicUsize,
    /// Logins wait for `release` while set.
    pub hold: AtomicBool,
    pub release: Notify,
}

impl FakeAutomation {
    pub fn new() -> Self {
        Self {
            logins: AtomicUsize::new(0),
            login_codes: Mutex::new(Vec::new()),
            executions: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
            hold: AtomicBool::new(false),
            release: Notify::new(),
        }
    }

    pub fn invalidate_next(&self, count: usize) {
        self.invalidations.store(count, Ordering::SeqCst);
    }

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAutomation for FakeAutomation {
    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn login(
        &self,
        _units: &ExecutionUnitManager,
        _session: &AutomationSession,
        credentials: &Credentials,
        totp_code: Option<&str>,
    ) -> Result<(), AutomationError> {
        if self.hold.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        self.logins.fetch_add(1, Ordering::SeqCst);
        self.login_codes
            .lock()
            .unwrap()
            .push(totp_code.map(str::to_string));
        if credentials.password != "hunter2" {
            return Err(AutomationError::LoginFailed("bad password".into()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        _units: &ExecutionUnitManager,
        _session: &AutomationSession,
        action: &str,
        job: &PendingJob,
    ) -> Result<serde_json::Value, AutomationError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let invalidate = self
            .invalidations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if invalidate {
            return Err(AutomationError::SessionInvalid("redirected to login".into()));
        }
        Ok(serde_json::json!({ "action": action, "job_id": job.id }))
    }
}

pub fn unit_config() -> UnitManagerConfig {
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
    pub config: CoordinationConfig,
    pub store: Arc<MemoryStore>,
    pub intake: Arc<MemoryIntake>,
    pub clock: Arc<ManualClock>,
    pub api: Arc<FakeUnitApi>,
    pub units: Arc<ExecutionUnitManager>,
    pub automation: Arc<FakeAutomation>,
    pub processor: Arc<BatchProcessor>,
}

pub fn harness(capacity: u32) -> Harness {
    harness_with_password(capacity, "hunter2")
}

/// Harness whose stored password for [`PROVIDER`] is `password`. The fake
/// provider only accepts `hunter2`.
pub fn harness_with_password(capacity: u32, password: &str) -> Harness {
    let config = CoordinationConfig::default();
    let store = Arc::new(MemoryStore::new());
    let intake = Arc::new(MemoryIntake::new());
    let clock = Arc::new(ManualClock::new(start()));
    let api = Arc::new(FakeUnitApi::new());
    let units = Arc::new(ExecutionUnitManager::new(
        store.clone(),
        api.clone(),
        clock.clone(),
        unit_config(),
    ));

    let automation = Arc::new(FakeAutomation::new());
    let mut registry = ProviderRegistry::new();
    registry.register(automation.clone());
    let mut credentials = CredentialStore::new();
    credentials.insert(PROVIDER, "robot", password);

    let processor = Arc::new(BatchProcessor::new(
        ProcessorConfig::from_coordination(WORKER.to_string(), capacity, &config),
        store.clone(),
        intake.clone(),
        Arc::clone(&units),
        registry,
        credentials,
        clock.clone(),
    ));

    Harness {
        config,
        store,
        intake,
        clock,
        api,
        units,
        automation,
        processor,
    }
}

impl Harness {
    /// A batch of `count` jobs handed to `owner`, in the state the
    /// dispatcher leaves it: assigned, heartbeat started and its code
    /// reserved for `reservation_ttl`.
    pub async fn assigned_batch(&self, owner: &str, count: usize, reservation_ttl: Duration) -> BatchAssignment {
        let mut job_ids: Vec<JobId> = Vec::with_capacity(count);
        for n in 0..count {
            job_ids.push(
                self.intake
                    .submit(
                        PROVIDER,
                        ACTION,
                        serde_json::json!({ "invoice": n }),
                        start() + chrono::Duration::milliseconds(n as i64),
                    )
                    .await,
            );
        }
        let batch_id = new_batch_id();
        self.intake.mark_assigned(&job_ids, &batch_id).await.unwrap();

        let mut batch = Batch::new(batch_id.clone(), PROVIDER, ACTION, job_ids.clone(), start());
        batch.totp_code = Some(CODE.to_string());
        BatchRepo::create(self.store.as_ref(), &batch, self.config.batch_ttl)
            .await
            .unwrap();
        assert!(BatchRepo::claim(self.store.as_ref(), PROVIDER, &batch_id, owner)
            .await
            .unwrap()
            .is_applied());
        assert!(BatchRepo::start_heartbeat(
            self.store.as_ref(),
            PROVIDER,
            &batch_id,
            owner,
            self.config.heartbeat_ttl,
        )
        .await
        .unwrap());
        let reservation = TotpReservation {
            owner_batch_id: batch_id.clone(),
            reserved_at: start(),
        };
        assert!(TotpRepo::reserve(self.store.as_ref(), PROVIDER, CODE, &reservation, reservation_ttl)
            .await
            .unwrap());

        BatchAssignment {
            batch_id,
            provider: PROVIDER.to_string(),
            action: ACTION.to_string(),
            totp_code: Some(CODE.to_string()),
            jobs: self.intake.fetch_jobs(&job_ids).await.unwrap(),
        }
    }

    /// Same as [`Self::assigned_batch`], already accepted by [`WORKER`]
    /// without starting background processing.
    pub async fn in_progress_batch(&self, count: usize) -> BatchAssignment {
        let assignment = self.assigned_batch(WORKER, count, Duration::from_secs(60)).await;
        assert!(BatchRepo::accept(
            self.store.as_ref(),
            PROVIDER,
            &assignment.batch_id,
            WORKER,
            start(),
        )
        .await
        .unwrap()
        .is_applied());
        assignment
    }

    pub async fn batch(&self, batch_id: &str) -> Batch {
        BatchRepo::get(self.store.as_ref(), PROVIDER, batch_id).await.unwrap()
    }

    pub fn app(&self) -> Router {
        let state = AppState {
            processor: Arc::clone(&self.processor),
            store: self.store.clone(),
        };
        build_app_router(state, Duration::from_secs(30))
    }
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: &impl serde::Serialize) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
