mod common;

use std::time::Duration;

use rpa_core::batch::{BatchFailure, BatchStatus};
use rpa_core::job::{JobReport, JobStatus};
use rpa_store::intake::JobIntake;
use rpa_store::repositories::{BatchRepo, JobMarkerRepo};

use common::{harness, test_config, PROVIDER};

#[tokio::test(start_paused = true)]
async fn crashed_worker_batch_moves_unfinished_jobs_to_a_new_batch() {
    let h = harness(test_config(), &["w1", "w2"]);
    let ids = h.submit(PROVIDER, 50).await;
    let batch = h.assembler.run_once().await.unwrap().remove(0);
    let outcome = h.dispatcher.dispatch(&batch).await.unwrap();
    let original = BatchRepo::get(h.store.as_ref(), PROVIDER, &batch.batch_id).await.unwrap();

    // The worker finishes ten jobs, then dies.
    for &id in &ids[..10] {
        let report = JobReport::completed(id, serde_json::json!({ "ok": true }));
        h.intake.report(&report).await.unwrap();
        JobMarkerRepo::complete(h.store.as_ref(), PROVIDER, &batch.batch_id, &report, h.config.batch_ttl)
            .await
            .unwrap();
        BatchRepo::record_outcome(h.store.as_ref(), PROVIDER, &batch.batch_id, &outcome.worker_id, true)
            .await
            .unwrap();
    }
    assert!(h.monitor.detect_abandoned().await.unwrap().is_empty());

    let silence = h.config.heartbeat_ttl + Duration::from_secs(1);
    tokio::time::advance(silence).await;
    h.clock.advance(silence);

    let recovered = h.monitor.run_once().await.unwrap();
    assert_eq!(recovered.len(), 1);
    let recovery = &recovered[0];
    assert_eq!(recovery.abandoned, batch.batch_id);
    assert_eq!(recovery.requeued, ids[10..].to_vec());
    assert!(recovery.dispatched);

    let abandoned = BatchRepo::get(h.store.as_ref(), PROVIDER, &batch.batch_id).await.unwrap();
    assert_eq!(abandoned.status, BatchStatus::Failed);
    assert_eq!(abandoned.failure, Some(BatchFailure::Abandoned));
    assert_eq!(abandoned.jobs_completed, 10);

    let replacement_id = recovery.replacement.clone().unwrap();
    let replacement = BatchRepo::get(h.store.as_ref(), PROVIDER, &replacement_id).await.unwrap();
    assert_eq!(replacement.job_ids, ids[10..].to_vec());
    assert_eq!(replacement.batch_size, 40);
    assert_eq!(replacement.status, BatchStatus::InProgress);
    assert_eq!(replacement.parent_batch_id.as_deref(), Some(batch.batch_id.as_str()));
    assert!(replacement.session_id.is_none());
    assert!(replacement.totp_code.is_some());
    assert_ne!(replacement.totp_code, original.totp_code);

    for &id in &ids[..10] {
        assert_eq!(h.intake.job(id).await.unwrap().status, JobStatus::Completed);
    }
    for &id in &ids[10..] {
        let job = h.intake.job(id).await.unwrap();
        assert_eq!(job.batch_id.as_deref(), Some(replacement_id.as_str()));
    }

    // A second pass finds nothing new.
    assert!(h.monitor.run_once().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn fully_processed_abandoned_batch_needs_no_replacement() {
    let h = harness(test_config(), &["w1"]);
    let ids = h.submit(PROVIDER, 2).await;
    let batch = h.assembler.run_once().await.unwrap().remove(0);
    h.dispatcher.dispatch(&batch).await.unwrap();
    for &id in &ids {
        let report = JobReport::completed(id, serde_json::json!({}));
        h.intake.report(&report).await.unwrap();
        JobMarkerRepo::complete(h.store.as_ref(), PROVIDER, &batch.batch_id, &report, h.config.batch_ttl)
            .await
            .unwrap();
    }

    tokio::time::advance(h.config.heartbeat_ttl + Duration::from_secs(1)).await;

    let recovered = h.monitor.run_once().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert!(recovered[0].replacement.is_none());
    assert!(recovered[0].requeued.is_empty());
}

#[tokio::test(start_paused = true)]
async fn live_heartbeats_keep_batches_owned() {
    let h = harness(test_config(), &["w1"]);
    h.submit(PROVIDER, 3).await;
    let batch = h.assembler.run_once().await.unwrap().remove(0);
    h.dispatcher.dispatch(&batch).await.unwrap();

    tokio::time::advance(Duration::from_secs(40)).await;
    assert!(BatchRepo::refresh_heartbeat(
        h.store.as_ref(),
        PROVIDER,
        &batch.batch_id,
        "w1",
        h.config.heartbeat_ttl,
    )
    .await
    .unwrap());
    tokio::time::advance(Duration::from_secs(40)).await;

    assert!(h.monitor.run_once().await.unwrap().is_empty());
    let stored = BatchRepo::get(h.store.as_ref(), PROVIDER, &batch.batch_id).await.unwrap();
    assert_eq!(stored.status, BatchStatus::InProgress);
}
