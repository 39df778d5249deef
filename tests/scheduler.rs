//! Scheduler behavior: fairness, capacity, back-pressure, retry.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use req2run_engine::config::HostCapacity;
use req2run_engine::scheduler::{
    batch_exit_code, CancelOutcome, CancelReason, Job, JobTermination, Scheduler, SubmitError,
};
use req2run_engine::spec::ResourceCaps;

const AWAIT_BUDGET: Duration = Duration::from_secs(30);

fn job_for(scheduler_spec_id: &str, submitter: &str, job_id: &str) -> Job {
    Job::new(
        Arc::new(single_stage_spec(scheduler_spec_id)),
        submission(submitter),
        submitter,
    )
    .with_id(job_id)
    .with_priority(5)
}

// ============================================================================
// Scenario E: infra fault retried exactly once
// ============================================================================

#[tokio::test]
async fn infra_fault_retries_once_and_surfaces_attempts() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubSandboxProvider::new());
    provider.fail_next_provisions(1);
    let scheduler = Scheduler::new(test_config(tmp.path()), provider.clone());

    let job_id = scheduler
        .submit(job_for("retry-spec", "team-a", "job-e"))
        .unwrap();
    let termination = scheduler.await_result(&job_id, AWAIT_BUDGET).await.unwrap();

    match termination.as_ref() {
        JobTermination::Completed(result) => {
            assert_eq!(result.attempts, 2);
        }
        other => panic!("expected completion after retry, got {other:?}"),
    }
}

#[tokio::test]
async fn persistent_infra_fault_terminates_after_one_retry() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubSandboxProvider::new());
    provider.fail_next_provisions(10);
    let scheduler = Scheduler::new(test_config(tmp.path()), provider.clone());

    let job_id = scheduler
        .submit(job_for("retry-spec", "team-a", "job-e2"))
        .unwrap();
    let termination = scheduler.await_result(&job_id, AWAIT_BUDGET).await.unwrap();

    match termination.as_ref() {
        JobTermination::InfraFailed { attempts, .. } => assert_eq!(*attempts, 2),
        other => panic!("expected infra failure, got {other:?}"),
    }
    // First attempt plus exactly one retry.
    assert_eq!(provider.provisioned.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Scenario F: fairness across submitters
// ============================================================================

#[tokio::test]
async fn dispatch_alternates_between_submitters() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubSandboxProvider::new());
    provider.script(
        "build",
        StageScript::ok().with_real_delay(Duration::from_millis(10)),
    );
    let config = test_config(tmp.path()).with_max_concurrency(1);
    let scheduler = Scheduler::new(config, provider.clone());

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(
            scheduler
                .submit(job_for("fair-spec", "x", &format!("x-{i}")))
                .unwrap(),
        );
        ids.push(
            scheduler
                .submit(job_for("fair-spec", "y", &format!("y-{i}")))
                .unwrap(),
        );
    }
    for id in &ids {
        scheduler.await_result(id, AWAIT_BUDGET).await.unwrap();
    }

    // Recover dispatch order from provision-time scratch paths
    // (runs/<job-id>/scratch/…).
    let submitters: Vec<char> = provider
        .provision_log
        .lock()
        .iter()
        .map(|path| {
            let job = path
                .split('/')
                .rev()
                .nth(2)
                .expect("scratch path shape");
            job.chars().next().unwrap()
        })
        .collect();
    assert_eq!(submitters.len(), 40);
    for window in submitters.windows(8) {
        let x = window.iter().filter(|c| **c == 'x').count() as i64;
        let y = window.iter().filter(|c| **c == 'y').count() as i64;
        assert!((x - y).abs() <= 1, "unfair dispatch window: {window:?}");
    }
}

// ============================================================================
// Concurrency & capacity invariants
// ============================================================================

#[tokio::test]
async fn live_sandboxes_never_exceed_max_concurrency() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubSandboxProvider::new());
    provider.script(
        "build",
        StageScript::ok().with_real_delay(Duration::from_millis(30)),
    );
    let config = test_config(tmp.path()).with_max_concurrency(4);
    let scheduler = Scheduler::new(config, provider.clone());

    let ids: Vec<String> = (0..16)
        .map(|i| {
            scheduler
                .submit(job_for("cap-spec", "team-a", &format!("cap-{i}")))
                .unwrap()
        })
        .collect();
    for id in &ids {
        scheduler.await_result(id, AWAIT_BUDGET).await.unwrap();
    }

    assert!(provider.max_live.load(Ordering::SeqCst) <= 4);
    assert_eq!(
        provider.provisioned.load(Ordering::SeqCst),
        provider.released.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn oversized_caps_are_rejected_at_enqueue() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubSandboxProvider::new());
    let config = test_config(tmp.path()).with_host_capacity(HostCapacity {
        cpu_cores: 4.0,
        memory_bytes: 1024 * 1024 * 1024,
        sandboxes: 4,
    });
    let scheduler = Scheduler::new(config, provider);

    let mut spec = single_stage_spec("greedy");
    spec.caps = ResourceCaps {
        cpu_cores: 64.0,
        ..ResourceCaps::default()
    };
    let job = Job::new(Arc::new(spec), submission("team-a"), "team-a");
    let err = scheduler.submit(job).unwrap_err();
    assert!(matches!(err, SubmitError::CapacityExceeded { .. }));
}

#[tokio::test]
async fn queue_high_water_mark_pushes_back() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubSandboxProvider::new());
    provider.script(
        "build",
        StageScript::ok().with_real_delay(Duration::from_secs(30)),
    );
    let config = test_config(tmp.path())
        .with_max_concurrency(1)
        .with_queue_high_water(2);
    let scheduler = Scheduler::new(config, provider);

    // First job occupies the single slot.
    let running = scheduler
        .submit(job_for("hw-spec", "team-a", "hw-0"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.in_flight(), 1);

    scheduler
        .submit(job_for("hw-spec", "team-a", "hw-1"))
        .unwrap();
    scheduler
        .submit(job_for("hw-spec", "team-a", "hw-2"))
        .unwrap();
    let err = scheduler
        .submit(job_for("hw-spec", "team-a", "hw-3"))
        .unwrap_err();
    assert!(matches!(err, SubmitError::QueueFull { .. }));

    // Producers retry after the queue drains; unblock everything.
    assert_eq!(scheduler.cancel(&running), CancelOutcome::Ok);
    scheduler.cancel("hw-1");
    scheduler.cancel("hw-2");
}

// ============================================================================
// Cancellation lifecycle
// ============================================================================

#[tokio::test]
async fn cancel_transitions_are_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubSandboxProvider::new());
    provider.script(
        "build",
        StageScript::ok().with_real_delay(Duration::from_secs(30)),
    );
    let config = test_config(tmp.path()).with_max_concurrency(1);
    let scheduler = Scheduler::new(config, provider);

    assert_eq!(scheduler.cancel("nope"), CancelOutcome::NotFound);

    let running = scheduler
        .submit(job_for("cancel-spec", "team-a", "run-0"))
        .unwrap();
    let queued = scheduler
        .submit(job_for("cancel-spec", "team-a", "queued-0"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Queued: removed without running.
    assert_eq!(scheduler.cancel(&queued), CancelOutcome::Ok);
    let termination = scheduler.await_result(&queued, AWAIT_BUDGET).await.unwrap();
    assert!(matches!(
        termination.as_ref(),
        JobTermination::Cancelled {
            reason: CancelReason::Operator
        }
    ));

    // Running: signal propagates, run aborts.
    assert_eq!(scheduler.cancel(&running), CancelOutcome::Ok);
    let termination = scheduler
        .await_result(&running, AWAIT_BUDGET)
        .await
        .unwrap();
    assert!(matches!(
        termination.as_ref(),
        JobTermination::Cancelled { .. }
    ));

    // Late cancels on terminal jobs are no-ops.
    assert_eq!(scheduler.cancel(&running), CancelOutcome::AlreadyTerminal);
}

#[tokio::test]
async fn expired_deadline_terminates_without_running() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubSandboxProvider::new());
    let scheduler = Scheduler::new(test_config(tmp.path()), provider.clone());

    let job = job_for("deadline-spec", "team-a", "late-0")
        .with_deadline(Instant::now() - Duration::from_secs(1));
    let job_id = scheduler.submit(job).unwrap();
    let termination = scheduler.await_result(&job_id, AWAIT_BUDGET).await.unwrap();

    assert!(matches!(
        termination.as_ref(),
        JobTermination::Cancelled {
            reason: CancelReason::DeadlineExpired
        }
    ));
    assert_eq!(provider.provisioned.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Submit-side rejections & exit codes
// ============================================================================

#[tokio::test]
async fn duplicate_job_ids_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubSandboxProvider::new());
    provider.script(
        "build",
        StageScript::ok().with_real_delay(Duration::from_millis(200)),
    );
    let scheduler = Scheduler::new(test_config(tmp.path()), provider);

    scheduler
        .submit(job_for("dup-spec", "team-a", "dup-0"))
        .unwrap();
    let err = scheduler
        .submit(job_for("dup-spec", "team-a", "dup-0"))
        .unwrap_err();
    assert!(matches!(err, SubmitError::DuplicateJob { .. }));
}

#[tokio::test]
async fn batch_exit_codes_reflect_the_worst_outcome() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubSandboxProvider::new());
    // A failing build: requirement fail, job completes without passing.
    provider.script("build", StageScript::ok().with_exit(1));
    let scheduler = Scheduler::new(test_config(tmp.path()), provider);

    let job_id = scheduler
        .submit(job_for("exit-spec", "team-a", "exit-0"))
        .unwrap();
    let failed = scheduler.await_result(&job_id, AWAIT_BUDGET).await.unwrap();

    assert_eq!(batch_exit_code([failed.as_ref()]), 1);
    let infra = JobTermination::InfraFailed {
        detail: "runtime gone".into(),
        attempts: 2,
    };
    assert_eq!(batch_exit_code([failed.as_ref(), &infra]), 2);
}
