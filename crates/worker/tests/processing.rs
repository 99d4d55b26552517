mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use assert_matches::assert_matches;
use rpa_core::batch::{BatchFailure, BatchStatus};
use rpa_core::execution_unit::ExecutionUnitState;
use rpa_core::job::{JobErrorKind, JobStatus};
use rpa_core::wire::DispatchStatus;
use rpa_store::repositories::{BatchRepo, TotpRepo, UnitRepo};
use rpa_worker::ProcessorError;

use common::{harness, harness_with_password, CODE, PROVIDER, WORKER};

#[tokio::test]
async fn batch_logs_in_once_and_runs_every_job_in_order() {
    let h = harness(4);
    let assignment = h.assigned_batch(WORKER, 5, Duration::from_secs(60)).await;

    let ack = h.processor.accept(assignment.clone()).await.unwrap();
    assert!(ack.accepted);
    assert_eq!(ack.worker_id, WORKER);
    h.processor.drain().await;

    assert_eq!(h.automation.login_count(), 1);
    assert_eq!(h.automation.execution_count(), 5);
    assert_eq!(
        h.automation.login_codes.lock().unwrap().clone(),
        vec![Some(CODE.to_string())]
    );

    let reported: Vec<_> = h.intake.reports().await.iter().map(|r| r.job_id).collect();
    let expected: Vec<_> = assignment.jobs.iter().map(|j| j.id).collect();
    assert_eq!(reported, expected);
    for job in &assignment.jobs {
        assert_eq!(h.intake.job(job.id).await.unwrap().status, JobStatus::Completed);
    }

    let batch = h.batch(&assignment.batch_id).await;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.jobs_completed, 5);
    assert!(batch.session_id.is_some());
    assert_eq!(
        BatchRepo::heartbeat_owner(h.store.as_ref(), PROVIDER, &assignment.batch_id)
            .await
            .unwrap(),
        None
    );

    let metrics = TotpRepo::metrics(h.store.as_ref(), PROVIDER).await.unwrap();
    assert_eq!(metrics.consumed, 1);
    assert_eq!(metrics.successful, 1);

    assert_eq!(h.api.closed_sessions(), vec![batch.session_id.clone().unwrap()]);
    let units = UnitRepo::list(h.store.as_ref()).await.unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].state, ExecutionUnitState::Idle);

    let status = h.processor.status();
    assert_eq!(status.active_batches, 0);
    assert_eq!(status.jobs_processed, 5);
    assert_eq!(status.jobs_failed, 0);
}

#[tokio::test]
async fn duplicate_delivery_replays_the_recorded_report() {
    let h = harness(4);
    let assignment = h.in_progress_batch(2).await;
    let request = assignment.request_for(&assignment.jobs[0], None);

    let first = h.processor.process_job(&request).await.unwrap();
    let second = h.processor.process_job(&request).await.unwrap();

    assert_eq!(first.status, DispatchStatus::Completed);
    assert_eq!(second, first);
    assert_eq!(h.automation.execution_count(), 1);
    assert_eq!(h.intake.reports().await.len(), 1);
    assert_eq!(h.batch(&assignment.batch_id).await.jobs_completed, 1);
}

#[tokio::test]
async fn second_batch_reuses_the_idle_unit() {
    let h = harness(4);
    let first = h.assigned_batch(WORKER, 2, Duration::from_secs(60)).await;
    h.processor.accept(first).await.unwrap();
    h.processor.drain().await;

    let second = h.assigned_batch(WORKER, 2, Duration::from_secs(60)).await;
    h.processor.accept(second.clone()).await.unwrap();
    h.processor.drain().await;

    assert_eq!(h.api.provisions.load(Ordering::SeqCst), 1);
    assert_eq!(h.automation.login_count(), 2);
    assert_eq!(h.batch(&second.batch_id).await.status, BatchStatus::Completed);
}

#[tokio::test]
async fn invalidated_session_gets_one_relogin_without_repeating_the_job() {
    let h = harness(4);
    h.automation.invalidate_next(1);
    let assignment = h.assigned_batch(WORKER, 3, Duration::from_secs(60)).await;

    h.processor.accept(assignment.clone()).await.unwrap();
    h.processor.drain().await;

    assert_eq!(h.automation.login_count(), 2);
    // Each job reaches the provider once; the interrupted one is not replayed.
    assert_eq!(h.automation.execution_count(), 3);

    let interrupted = h.intake.job(assignment.jobs[0].id).await.unwrap();
    assert_eq!(interrupted.status, JobStatus::Failed);
    assert_eq!(interrupted.error.unwrap().kind, JobErrorKind::SessionExpired);
    for job in &assignment.jobs[1..] {
        assert_eq!(h.intake.job(job.id).await.unwrap().status, JobStatus::Completed);
    }

    let batch = h.batch(&assignment.batch_id).await;
    assert!(batch.relogin_attempted);
    assert_eq!(batch.session_terminal, None);
    assert_eq!(batch.jobs_completed, 2);
    assert_eq!(batch.jobs_failed, 1);

    let metrics = TotpRepo::metrics(h.store.as_ref(), PROVIDER).await.unwrap();
    assert_eq!(metrics.consumed, 2);
    assert_eq!(metrics.successful, 2);
}

#[tokio::test]
async fn second_invalidation_expires_the_rest_of_the_batch() {
    let h = harness(4);
    h.automation.invalidate_next(2);
    let assignment = h.assigned_batch(WORKER, 3, Duration::from_secs(60)).await;

    h.processor.accept(assignment.clone()).await.unwrap();
    h.processor.drain().await;

    assert_eq!(h.automation.login_count(), 2);
    assert_eq!(h.automation.execution_count(), 2);

    let reports = h.intake.reports().await;
    assert_eq!(reports.len(), 3);
    for report in &reports {
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error.as_ref().unwrap().kind, JobErrorKind::SessionExpired);
    }

    let batch = h.batch(&assignment.batch_id).await;
    assert_eq!(batch.session_terminal, Some(JobErrorKind::SessionExpired));
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.jobs_failed, 3);
    assert_eq!(h.processor.status().jobs_failed, 3);
}

#[tokio::test(start_paused = true)]
async fn relogin_is_skipped_once_the_code_reservation_lapsed() {
    let h = harness(4);
    h.automation.invalidate_next(1);
    let assignment = h.assigned_batch(WORKER, 2, Duration::from_secs(1)).await;
    tokio::time::advance(Duration::from_secs(2)).await;

    h.processor.accept(assignment.clone()).await.unwrap();
    h.processor.drain().await;

    assert_eq!(h.automation.login_count(), 1);
    assert_eq!(h.automation.execution_count(), 1);
    for job in &assignment.jobs {
        let job = h.intake.job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().kind, JobErrorKind::SessionExpired);
    }
}

#[tokio::test]
async fn rejected_login_fails_every_job_of_the_batch() {
    let h = harness_with_password(4, "wrong");
    let assignment = h.assigned_batch(WORKER, 3, Duration::from_secs(60)).await;

    h.processor.accept(assignment.clone()).await.unwrap();
    h.processor.drain().await;

    assert_eq!(h.automation.login_count(), 1);
    assert_eq!(h.automation.execution_count(), 0);
    for job in &assignment.jobs {
        let job = h.intake.job(job.id).await.unwrap();
        assert_eq!(job.error.unwrap().kind, JobErrorKind::LoginFailed);
    }
    let metrics = TotpRepo::metrics(h.store.as_ref(), PROVIDER).await.unwrap();
    assert_eq!(metrics.consumed, 1);
    assert_eq!(metrics.successful, 0);

    let units = UnitRepo::list(h.store.as_ref()).await.unwrap();
    assert_eq!(units[0].state, ExecutionUnitState::Idle);
}

#[tokio::test(start_paused = true)]
async fn provisioning_failure_requeues_the_batch() {
    let h = harness(4);
    h.api.fail_provision.store(true, Ordering::SeqCst);
    let assignment = h.assigned_batch(WORKER, 3, Duration::from_secs(60)).await;

    h.processor.accept(assignment.clone()).await.unwrap();
    h.processor.drain().await;

    assert_eq!(h.api.provisions.load(Ordering::SeqCst), 2);
    let batch = h.batch(&assignment.batch_id).await;
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.failure, Some(BatchFailure::Provisioning));
    assert_eq!(
        BatchRepo::heartbeat_owner(h.store.as_ref(), PROVIDER, &assignment.batch_id)
            .await
            .unwrap(),
        None
    );
    for job in &assignment.jobs {
        let job = h.intake.job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.batch_id, None);
    }
    assert!(h.intake.reports().await.is_empty());
    assert_eq!(h.processor.status().jobs_processed, 0);
}

#[tokio::test]
async fn full_worker_declines_new_batches() {
    let h = harness(1);
    h.automation.hold.store(true, Ordering::SeqCst);
    let first = h.assigned_batch(WORKER, 1, Duration::from_secs(60)).await;
    let second = h.assigned_batch(WORKER, 1, Duration::from_secs(60)).await;

    assert!(h.processor.accept(first.clone()).await.unwrap().accepted);
    let declined = h.processor.accept(second.clone()).await.unwrap();
    assert!(!declined.accepted);
    assert!(declined.reason.unwrap().contains("capacity"));
    assert_eq!(h.processor.status().active_batches, 1);

    h.automation.release.notify_one();
    h.processor.drain().await;

    assert_eq!(h.batch(&first.batch_id).await.status, BatchStatus::Completed);
    assert_eq!(h.batch(&second.batch_id).await.status, BatchStatus::Assigned);
}

#[tokio::test]
async fn repeated_handoff_of_a_running_batch_is_acknowledged_once() {
    let h = harness(4);
    h.automation.hold.store(true, Ordering::SeqCst);
    let assignment = h.assigned_batch(WORKER, 1, Duration::from_secs(60)).await;

    assert!(h.processor.accept(assignment.clone()).await.unwrap().accepted);
    assert!(h.processor.accept(assignment.clone()).await.unwrap().accepted);
    assert_eq!(h.processor.status().active_batches, 1);

    h.automation.release.notify_one();
    h.processor.drain().await;
    assert_eq!(h.automation.login_count(), 1);
}

#[tokio::test]
async fn batch_assigned_elsewhere_is_declined() {
    let h = harness(4);
    let assignment = h.assigned_batch("w2", 2, Duration::from_secs(60)).await;

    let ack = h.processor.accept(assignment.clone()).await.unwrap();

    assert!(!ack.accepted);
    assert_eq!(h.processor.status().active_batches, 0);
    assert_eq!(h.batch(&assignment.batch_id).await.status, BatchStatus::Assigned);
}

#[tokio::test]
async fn jobs_are_only_run_for_owned_batches() {
    let h = harness(4);
    let foreign = h.assigned_batch("w2", 1, Duration::from_secs(60)).await;
    let result = h
        .processor
        .process_job(&foreign.request_for(&foreign.jobs[0], None))
        .await;
    assert_matches!(result, Err(ProcessorError::NotOwner { .. }));

    let owned = h.in_progress_batch(1).await;
    let mut stray = foreign.jobs[0].clone();
    stray.id += 1000;
    let result = h.processor.process_job(&owned.request_for(&stray, None)).await;
    assert_matches!(result, Err(ProcessorError::UnknownJob { job_id, .. }) if job_id == stray.id);

    assert_eq!(h.automation.execution_count(), 0);
}
