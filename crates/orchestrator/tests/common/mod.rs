#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rpa_core::backoff::BackoffConfig;
use rpa_core::clock::{Clock, ManualClock};
use rpa_core::config::CoordinationConfig;
use rpa_core::totp::TotpSecret;
use rpa_core::types::{JobId, Timestamp, WorkerId};
use rpa_core::wire::{BatchAssignment, DispatchAck, WorkerStatus};
use rpa_core::worker_pool::WorkerEndpoint;
use rpa_orchestrator::{
    BatchAssembler, BatchDispatcher, DispatcherConfig, HeartbeatMonitor, TotpCoordinator,
    TransportError, WorkerTransport,
};
use rpa_store::intake::MemoryIntake;
use rpa_store::repositories::BatchRepo;
use rpa_store::MemoryStore;

pub const PROVIDER: &str = "acme";
pub const ACTION: &str = "download_invoice";
pub const SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

/// Two seconds into a 30 second TOTP window.
pub fn start() -> Timestamp {
    Utc.timestamp_opt(1_700_000_012, 0).unwrap()
}

pub fn workers(ids: &[&str]) -> Vec<WorkerEndpoint> {
    ids.iter()
        .map(|id| WorkerEndpoint {
            worker_id: id.to_string(),
            url: format!("http://{id}.workers.test"),
        })
        .collect()
}

/// In-process worker transport. Accepting workers take ownership through
/// the store the way a real worker does.
pub struct FakeTransport {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    failing: Mutex<HashSet<WorkerId>>,
    statuses: Mutex<HashMap<WorkerId, WorkerStatus>>,
    pub handoffs: Mutex<Vec<(WorkerId, BatchAssignment)>>,
}

impl FakeTransport {
    pub fn new(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> Self {
        Self {
            store,
            clock,
            failing: Mutex::new(HashSet::new()),
            statuses: Mutex::new(HashMap::new()),
            handoffs: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_worker(&self, worker_id: &str) {
        self.failing.lock().unwrap().insert(worker_id.to_string());
    }

    pub fn set_status(&self, worker_id: &str, active_batches: u32, capacity: u32) {
        self.statuses.lock().unwrap().insert(
            worker_id.to_string(),
            WorkerStatus {
                worker_id: worker_id.to_string(),
                active_batches,
                active_jobs: 0,
                capacity,
                jobs_processed: 0,
                jobs_failed: 0,
            },
        );
    }

    pub fn handoffs(&self) -> Vec<(WorkerId, BatchAssignment)> {
        self.handoffs.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerTransport for FakeTransport {
    async fn hand_off(
        &self,
        worker: &WorkerEndpoint,
        assignment: &BatchAssignment,
    ) -> Result<DispatchAck, TransportError> {
        self.handoffs
            .lock()
            .unwrap()
            .push((worker.worker_id.clone(), assignment.clone()));
        if self.failing.lock().unwrap().contains(&worker.worker_id) {
            return Err(TransportError::Api {
                status: 503,
                body: "worker unavailable".into(),
            });
        }
        let accepted = BatchRepo::accept(
            self.store.as_ref(),
            &assignment.provider,
            &assignment.batch_id,
            &worker.worker_id,
            self.clock.now(),
        )
        .await
        .map_err(|e| TransportError::Api {
            status: 500,
            body: e.to_string(),
        })?
        .is_applied();
        Ok(DispatchAck {
            batch_id: assignment.batch_id.clone(),
            worker_id: worker.worker_id.clone(),
            accepted,
            reason: (!accepted).then(|| "not assigned to this worker".to_string()),
        })
    }

    async fn status(&self, worker: &WorkerEndpoint) -> Result<WorkerStatus, TransportError> {
        self.statuses
            .lock()
            .unwrap()
            .get(&worker.worker_id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownWorker(worker.worker_id.clone()))
    }
}

pub fn test_config() -> CoordinationConfig {
    CoordinationConfig::default()
}

pub fn dispatcher_config(config: &CoordinationConfig) -> DispatcherConfig {
    DispatcherConfig {
        retry_backoff: BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..DispatcherConfig::from_coordination(config)
    }
}

pub struct Harness {
    pub config: CoordinationConfig,
    pub store: Arc<MemoryStore>,
    pub intake: Arc<MemoryIntake>,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<FakeTransport>,
    pub totp: Arc<TotpCoordinator>,
    pub dispatcher: Arc<BatchDispatcher>,
    pub assembler: BatchAssembler,
    pub monitor: HeartbeatMonitor,
}

pub fn harness(config: CoordinationConfig, worker_ids: &[&str]) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let intake = Arc::new(MemoryIntake::new());
    let clock = Arc::new(ManualClock::new(start()));
    let transport = Arc::new(FakeTransport::new(Arc::clone(&store), Arc::clone(&clock)));

    let mut secrets = HashMap::new();
    secrets.insert(PROVIDER.to_string(), TotpSecret::from_base32(SECRET).unwrap());
    let totp = Arc::new(TotpCoordinator::new(
        store.clone(),
        clock.clone(),
        secrets,
        &config,
    ));

    let dispatcher = Arc::new(BatchDispatcher::new(
        store.clone(),
        intake.clone(),
        Arc::clone(&totp),
        transport.clone(),
        workers(worker_ids),
        clock.clone(),
        dispatcher_config(&config),
    ));
    let assembler = BatchAssembler::new(store.clone(), intake.clone(), clock.clone(), &config);
    let monitor = HeartbeatMonitor::new(
        store.clone(),
        intake.clone(),
        Arc::clone(&dispatcher),
        clock.clone(),
        config.batch_ttl,
    );

    Harness {
        config,
        store,
        intake,
        clock,
        transport,
        totp,
        dispatcher,
        assembler,
        monitor,
    }
}

impl Harness {
    /// Submit `count` jobs old enough to flush as a partial batch.
    pub async fn submit(&self, provider: &str, count: usize) -> Vec<JobId> {
        let submitted_at = start() - chrono::Duration::seconds(60);
        let mut ids = Vec::with_capacity(count);
        for n in 0..count {
            ids.push(
                self.intake
                    .submit(
                        provider,
                        ACTION,
                        serde_json::json!({ "invoice": n }),
                        submitted_at + chrono::Duration::milliseconds(n as i64),
                    )
                    .await,
            );
        }
        ids
    }
}
