//! The per-run pipeline orchestrator.
//!
//! One orchestrator owns one (problem, submission) run from Init to a
//! terminal state:
//!
//! ```text
//! Init → Build → Deploy → FunctionalTest → PerformanceTest
//!      → SecurityScan → QualityCheck → Aggregate → Persist → Done
//! ```
//!
//! with Aborted (infra fault, cancellation, deadline) and Failed
//! (short-circuited stage failure) as sinks. Stages run strictly
//! sequentially, each in a freshly provisioned sandbox; the prior stage's
//! scratch directory is republished read-only as the next stage's
//! workspace. Nothing above this module sees exceptional control flow —
//! every way a run can end is a [`RunTermination`] value.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::cancel::{CancelSignal, CancelToken};
use crate::collectors::collector_for;
use crate::evidence::{EvidenceError, EvidenceStore, RunEvidence};
use crate::metrics::{Metrics, SecurityMetrics};
use crate::outcome::{OutcomeKind, StageOutcome};
use crate::result::{EvalResult, ScoreRecord, StageRecord, ENGINE_VERSION};
use crate::runner::{StageContext, StageRunner};
use crate::sandbox::{Mounts, SandboxProvider};
use crate::scorer;
use crate::spec::{OnFailure, ProblemSpec, Submission};

// ============================================================================
// Run request & termination
// ============================================================================

/// Everything the scheduler hands an orchestrator for one attempt.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub job_id: String,
    pub spec: Arc<ProblemSpec>,
    pub submission: Arc<Submission>,
    pub seed: u64,
    /// 1-based attempt number, surfaced in the result.
    pub attempt: u32,
    /// Job deadline; pre-empts any running stage.
    pub deadline: Option<Instant>,
    /// Explicit token permitting a re-run over a completed result.
    pub overwrite: bool,
}

/// Why an aborted run stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    Cancelled,
    DeadlineExpired,
}

/// Terminal state of one orchestrated run.
#[derive(Debug)]
pub enum RunTermination {
    /// The pipeline reached Persist and wrote a result.
    Completed(Box<EvalResult>),
    /// The environment failed; the job may be retried once.
    InfraFailed { stage: String, detail: String },
    /// Cancellation or deadline; partial evidence quarantined.
    Aborted(AbortReason),
    /// A completed result already exists and no overwrite was supplied.
    Refused { detail: String },
}

// ============================================================================
// Pipeline state
// ============================================================================

/// Phases of the run state machine, for logging and evidence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Init,
    Stage,
    Aggregate,
    Persist,
    Done,
}

/// Mutable per-run state, owned exclusively by the orchestrator.
struct PipelineState {
    phase: Phase,
    /// Completed stage outcomes, in execution order.
    completed: Vec<StageOutcome>,
    /// Monotonically increasing stage sequence number.
    sequence: u32,
    metrics: Metrics,
    endpoint: Option<String>,
}

impl PipelineState {
    fn new() -> Self {
        Self {
            phase: Phase::Init,
            completed: Vec::new(),
            sequence: 0,
            metrics: Metrics::default(),
            endpoint: None,
        }
    }

    fn advance(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "pipeline phase transition");
        self.phase = phase;
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives one run at a time; cheap to construct per job.
pub struct Orchestrator {
    runner: StageRunner,
    store: EvidenceStore,
}

impl Orchestrator {
    #[must_use]
    pub fn new(provider: Arc<dyn SandboxProvider>, store: EvidenceStore) -> Self {
        Self {
            runner: StageRunner::new(provider),
            store,
        }
    }

    /// Run the full pipeline for one job attempt.
    #[instrument(skip_all, fields(job = %request.job_id, spec = %request.spec.id, attempt = request.attempt))]
    pub async fn run(&self, request: RunRequest, external_cancel: CancelSignal) -> RunTermination {
        let started_at = Utc::now();
        let spec = Arc::clone(&request.spec);

        let weights = match spec.effective_weights() {
            Ok(weights) => weights,
            Err(err) => {
                // Weight validation happens at enqueue; reaching this is
                // an engine defect, reported as an infra failure rather
                // than a panic.
                return RunTermination::InfraFailed {
                    stage: "init".to_string(),
                    detail: err.to_string(),
                };
            }
        };

        let mut run = match self
            .store
            .begin_run(&request.job_id, &spec, request.overwrite)
            .await
        {
            Ok(run) => run,
            Err(EvidenceError::AlreadyCompleted { job_id }) => {
                return RunTermination::Refused {
                    detail: format!("job '{job_id}' already has a recorded result"),
                };
            }
            Err(err) => {
                return RunTermination::InfraFailed {
                    stage: "init".to_string(),
                    detail: err.to_string(),
                };
            }
        };

        // One run-local token merges external cancellation with the job
        // deadline; the watchdog marks which of the two fired.
        let cancel = CancelToken::new();
        let deadline_hit = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let forwarder = tokio::spawn({
            let mut external = external_cancel;
            let local = cancel.clone();
            async move {
                external.cancelled().await;
                local.cancel();
            }
        });
        let watchdog = request.deadline.map(|deadline| {
            let local = cancel.clone();
            let flag = Arc::clone(&deadline_hit);
            tokio::spawn(async move {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                local.cancel();
            })
        });

        let termination = self
            .drive(&request, &spec, &mut run, &cancel, started_at, weights)
            .await;

        forwarder.abort();
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        match termination {
            Driven::Completed(result) => RunTermination::Completed(result),
            Driven::Infra { stage, detail } => {
                // Quarantine partial evidence so the retry starts clean.
                if let Err(err) = run.quarantine_aborted().await {
                    warn!(error = %err, "failed to quarantine aborted evidence");
                }
                RunTermination::InfraFailed { stage, detail }
            }
            Driven::Cancelled => {
                if let Err(err) = run.quarantine_aborted().await {
                    warn!(error = %err, "failed to quarantine aborted evidence");
                }
                let reason = if deadline_hit.load(std::sync::atomic::Ordering::SeqCst) {
                    AbortReason::DeadlineExpired
                } else {
                    AbortReason::Cancelled
                };
                info!(reason = ?reason, "run aborted");
                RunTermination::Aborted(reason)
            }
            Driven::Refused { detail } => RunTermination::Refused { detail },
        }
    }

    async fn drive(
        &self,
        request: &RunRequest,
        spec: &ProblemSpec,
        run: &mut RunEvidence,
        cancel: &CancelToken,
        started_at: chrono::DateTime<Utc>,
        weights: crate::spec::ScoringWeights,
    ) -> Driven {
        let mut state = PipelineState::new();
        let overall_deadline = request.deadline;
        let mut previous_scratch: Option<std::path::PathBuf> = None;

        state.advance(Phase::Stage);
        for stage in &spec.stages {
            if cancel.is_cancelled() {
                return Driven::Cancelled;
            }

            let index = state.sequence;
            state.sequence += 1;

            let scratch = run.scratch_dir(index, &stage.name);
            let workspace = previous_scratch
                .clone()
                .or_else(|| Some(request.submission.root.clone()));
            let mounts = Mounts {
                workspace,
                scratch: scratch.clone(),
            };

            let mut evidence = match run.begin_stage(&stage.name).await {
                Ok(evidence) => evidence,
                Err(err) => {
                    return Driven::Infra {
                        stage: stage.name.clone(),
                        detail: err.to_string(),
                    };
                }
            };

            // The stage budget and the job deadline are independent;
            // whichever would fire first bounds this execution.
            let timeout = match overall_deadline {
                Some(deadline) => stage
                    .timeout
                    .min(deadline.saturating_duration_since(Instant::now())),
                None => stage.timeout,
            };
            let ctx = StageContext {
                job_id: request.job_id.clone(),
                seed: request.seed,
                endpoint: state.endpoint.clone(),
                timeout,
                cancel: cancel.signal(),
            };

            let execution = self
                .runner
                .run(stage, spec, mounts, &mut evidence, &ctx)
                .await;
            if let Err(err) = evidence.seal().await {
                warn!(stage = %stage.name, error = %err, "failed to seal stage evidence");
            }

            if execution.cancelled {
                state.completed.push(execution.outcome);
                return Driven::Cancelled;
            }

            let outcome = execution.outcome;
            info!(
                stage = %stage.name,
                kind = %outcome.kind,
                duration_ms = outcome.duration.as_millis() as u64,
                "stage finished"
            );

            if outcome.kind == OutcomeKind::InfraFault {
                let detail = outcome
                    .sub_reason
                    .clone()
                    .unwrap_or_else(|| "infrastructure fault".to_string());
                return Driven::Infra {
                    stage: stage.name.clone(),
                    detail,
                };
            }

            // Deploy publishes the endpoint later stages exercise.
            if let Some(endpoint) = &outcome.endpoint {
                debug!(endpoint = %endpoint, "deploy stage published endpoint");
                state.endpoint = Some(endpoint.clone());
            }

            // Collectors read the stage's scratch; failures to parse are
            // evidence-worthy but never fatal to the run.
            if let Some(collector) = collector_for(stage.kind) {
                match collector.collect(spec, &outcome, &scratch) {
                    Ok(partial) => state.metrics.absorb(partial),
                    Err(err) => {
                        warn!(stage = %stage.name, error = %err, "metric collection failed");
                    }
                }
            }
            state.metrics.flagged_keys.extend(outcome.flagged_metrics.clone());

            let failed = !outcome.kind.is_success();
            previous_scratch = Some(scratch);
            state.completed.push(outcome);

            if failed && stage.on_failure == OnFailure::ShortCircuit {
                info!(stage = %stage.name, "stage failed with short-circuit policy");
                break;
            }
        }

        if cancel.is_cancelled() {
            return Driven::Cancelled;
        }

        state.advance(Phase::Aggregate);
        // Runtime compliance covers the whole run: any policy violation
        // zeroes it even when the scan stage itself ran clean.
        if state.completed.iter().any(StageOutcome::is_policy_violation) {
            let security = state
                .metrics
                .security
                .get_or_insert_with(SecurityMetrics::default);
            security.runtime_compliance = 0.0;
        }
        let breakdown = scorer::score(
            &state.metrics,
            &weights,
            &spec.targets,
            &spec.caps,
            &state.completed,
        );

        state.advance(Phase::Persist);
        let result = EvalResult {
            engine_version: ENGINE_VERSION.to_string(),
            job_id: request.job_id.clone(),
            spec_id: spec.id.clone(),
            spec_checksum: spec.checksum(),
            submission_id: request.submission.id.clone(),
            seed: request.seed,
            started_at,
            ended_at: Utc::now(),
            stages: state.completed.iter().map(StageRecord::from).collect(),
            metrics: state.metrics.clone(),
            scores: ScoreRecord::from(&breakdown),
            pass: breakdown.pass,
            reason: breakdown.reason.clone(),
            attempts: request.attempt,
            evidence_root: run.run_dir().to_path_buf(),
        };

        match run.write_result(&result, request.overwrite).await {
            Ok(_) => {}
            Err(EvidenceError::AlreadyCompleted { job_id }) => {
                return Driven::Refused {
                    detail: format!("job '{job_id}' already has a recorded result"),
                };
            }
            Err(err) => {
                return Driven::Infra {
                    stage: "persist".to_string(),
                    detail: err.to_string(),
                };
            }
        }

        state.advance(Phase::Done);
        info!(
            total = breakdown.total,
            grade = %breakdown.grade,
            pass = breakdown.pass,
            "run completed"
        );
        Driven::Completed(Box::new(result))
    }
}

/// Internal driver verdict, before evidence quarantine decisions.
enum Driven {
    Completed(Box<EvalResult>),
    Infra { stage: String, detail: String },
    Cancelled,
    Refused { detail: String },
}
