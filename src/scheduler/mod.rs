//! Bounded-concurrency evaluation scheduling.
//!
//! The scheduler accepts jobs, runs up to the configured number of
//! orchestrators concurrently, never exceeds declared host capacity, and
//! keeps dispatch fair across submitters. It is the only process-wide
//! stateful object: orchestrators share nothing with each other, and the
//! queues live behind one mutex whose critical sections never span I/O
//! or an `.await`.
//!
//! Retry policy is deliberately narrow: only infrastructure failures
//! re-enqueue a job, and only once. Submission-attributable failures are
//! final and feed scoring.

pub mod queue;

use std::sync::Arc;
use std::time::{Duration, Instant};

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::evidence::EvidenceStore;
use crate::pipeline::{AbortReason, Orchestrator, RunRequest, RunTermination};
use crate::result::EvalResult;
use crate::sandbox::SandboxProvider;
use crate::spec::{ProblemSpec, Submission, WeightError};

use queue::FairQueue;

// ============================================================================
// Job
// ============================================================================

/// The scheduler's unit of work: one problem paired with one submission.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: String,
    pub spec: Arc<ProblemSpec>,
    pub submission: Arc<Submission>,
    pub submitter: String,
    pub priority: u8,
    pub deadline: Option<Instant>,
    /// Explicit token permitting a re-run over a completed result.
    pub overwrite: bool,
}

impl Job {
    #[must_use]
    pub fn new(
        spec: Arc<ProblemSpec>,
        submission: Arc<Submission>,
        submitter: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            spec,
            submission,
            submitter: submitter.into(),
            priority: 0,
            deadline: None,
            overwrite: false,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }
}

// ============================================================================
// Outcomes & errors
// ============================================================================

/// Why a cancelled job stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    Operator,
    DeadlineExpired,
}

/// Terminal state of a job.
#[derive(Debug)]
pub enum JobTermination {
    Completed(Box<EvalResult>),
    /// Infrastructure failed twice (or once past the retry budget).
    InfraFailed { detail: String, attempts: u32 },
    Cancelled { reason: CancelReason },
    /// The evidence store refused a re-run without an overwrite token.
    Refused { detail: String },
}

impl JobTermination {
    /// Whether the job completed with a passing grade.
    #[must_use]
    pub fn passed(&self) -> bool {
        matches!(self, Self::Completed(result) if result.pass)
    }

    #[must_use]
    pub fn is_infra_failure(&self) -> bool {
        matches!(self, Self::InfraFailed { .. })
    }
}

/// Batch exit code: 0 all passed, 1 at least one failed grading,
/// 2 infrastructure precluded grading. (3 is reserved for configuration
/// errors surfaced before any job runs.)
pub fn batch_exit_code<'a>(terminations: impl IntoIterator<Item = &'a JobTermination>) -> i32 {
    let mut any_failed = false;
    for termination in terminations {
        if termination.is_infra_failure() {
            return 2;
        }
        if !termination.passed() {
            any_failed = true;
        }
    }
    i32::from(any_failed)
}

/// Rejections surfaced at submit time. Configuration and capacity
/// problems never make it to dispatch.
#[derive(Debug, Error, Diagnostic)]
pub enum SubmitError {
    #[error("declared caps exceed host capacity ({what})")]
    #[diagnostic(
        code(req2run::scheduler::capacity_exceeded),
        help("Lower the spec's resource caps or run on a larger host.")
    )]
    CapacityExceeded { what: String },

    #[error("queue is at its high-water mark ({depth} jobs)")]
    #[diagnostic(
        code(req2run::scheduler::queue_full),
        help("Retry with exponential backoff; the queue drains as runs finish.")
    )]
    QueueFull { depth: usize },

    #[error("job '{job_id}' is already queued or running")]
    #[diagnostic(code(req2run::scheduler::duplicate))]
    DuplicateJob { job_id: String },

    #[error("job '{job_id}' already has a recorded result")]
    #[diagnostic(
        code(req2run::scheduler::already_completed),
        help("Submit with the overwrite token to re-run a completed job.")
    )]
    AlreadyCompleted { job_id: String },

    #[error(transparent)]
    #[diagnostic(code(req2run::scheduler::weights))]
    InvalidWeights(#[from] WeightError),
}

/// Outcome of a cancel call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Ok,
    NotFound,
    AlreadyTerminal,
}

#[derive(Debug, Error, Diagnostic)]
pub enum AwaitError {
    #[error("no job with id '{job_id}'")]
    #[diagnostic(code(req2run::scheduler::await_not_found))]
    NotFound { job_id: String },

    #[error("job '{job_id}' did not reach a terminal state in time")]
    #[diagnostic(code(req2run::scheduler::await_timeout))]
    Timeout { job_id: String },
}

// ============================================================================
// Scheduler
// ============================================================================

struct InFlight {
    cancel: CancelToken,
    cpu_cores: f64,
    memory_bytes: u64,
}

#[derive(Default)]
struct State {
    queue: FairQueue,
    in_flight: FxHashMap<String, InFlight>,
    terminal: FxHashMap<String, Arc<JobTermination>>,
    done_channels: FxHashMap<String, watch::Sender<bool>>,
    attempts: FxHashMap<String, u32>,
    committed_cpu: f64,
    committed_memory: u64,
}

struct Inner {
    config: EngineConfig,
    provider: Arc<dyn SandboxProvider>,
    store: EvidenceStore,
    state: Mutex<State>,
    wakeup: Notify,
}

/// The process-wide evaluation scheduler, owned by main.
pub struct Scheduler {
    inner: Arc<Inner>,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl Scheduler {
    /// Build a scheduler and start its dispatch loop. Must be called
    /// from within a tokio runtime.
    #[must_use]
    pub fn new(config: EngineConfig, provider: Arc<dyn SandboxProvider>) -> Self {
        let store = EvidenceStore::new(config.evidence_root.clone());
        let inner = Arc::new(Inner {
            config,
            provider,
            store,
            state: Mutex::new(State::default()),
            wakeup: Notify::new(),
        });
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&inner)));
        Self { inner, dispatcher }
    }

    /// Submit a job for evaluation. Admission control happens here:
    /// weight validation, capacity fit, queue depth, and re-run refusal.
    #[instrument(skip_all, fields(job = %job.id, submitter = %job.submitter))]
    pub fn submit(&self, job: Job) -> Result<String, SubmitError> {
        // Configuration errors surface at enqueue, never at dispatch.
        job.spec.effective_weights()?;

        let capacity = self.inner.config.host_capacity;
        if job.spec.caps.cpu_cores > capacity.cpu_cores {
            return Err(SubmitError::CapacityExceeded {
                what: format!(
                    "cpu: need {}, host has {}",
                    job.spec.caps.cpu_cores, capacity.cpu_cores
                ),
            });
        }
        if job.spec.caps.memory_bytes > capacity.memory_bytes {
            return Err(SubmitError::CapacityExceeded {
                what: format!(
                    "memory: need {}, host has {}",
                    job.spec.caps.memory_bytes, capacity.memory_bytes
                ),
            });
        }
        if self.inner.store.has_result(&job.id) && !job.overwrite {
            return Err(SubmitError::AlreadyCompleted { job_id: job.id });
        }

        let job_id = job.id.clone();
        {
            let mut state = self.inner.state.lock();
            if state.queue.len() >= self.inner.config.queue_high_water {
                return Err(SubmitError::QueueFull {
                    depth: state.queue.len(),
                });
            }
            if state.queue.contains(&job_id)
                || state.in_flight.contains_key(&job_id)
                || state.terminal.contains_key(&job_id)
            {
                return Err(SubmitError::DuplicateJob { job_id });
            }
            let (done_tx, _) = watch::channel(false);
            state.done_channels.insert(job_id.clone(), done_tx);
            state.attempts.insert(job_id.clone(), 1);
            state.queue.enqueue(job);
        }
        self.inner.wakeup.notify_one();
        info!("job accepted");
        Ok(job_id)
    }

    /// Cancel a queued or running job. Idempotent: late cancellations on
    /// terminal jobs report `AlreadyTerminal`.
    #[instrument(skip(self))]
    pub fn cancel(&self, job_id: &str) -> CancelOutcome {
        let mut state = self.inner.state.lock();
        if state.terminal.contains_key(job_id) {
            return CancelOutcome::AlreadyTerminal;
        }
        if let Some(in_flight) = state.in_flight.get(job_id) {
            in_flight.cancel.cancel();
            return CancelOutcome::Ok;
        }
        if state.queue.remove(job_id).is_some() {
            finish_locked(
                &mut state,
                job_id,
                JobTermination::Cancelled {
                    reason: CancelReason::Operator,
                },
            );
            return CancelOutcome::Ok;
        }
        CancelOutcome::NotFound
    }

    /// Wait until the job reaches a terminal state, up to `timeout`.
    pub async fn await_result(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<Arc<JobTermination>, AwaitError> {
        let mut done_rx = {
            let state = self.inner.state.lock();
            if let Some(terminal) = state.terminal.get(job_id) {
                return Ok(Arc::clone(terminal));
            }
            let Some(done_tx) = state.done_channels.get(job_id) else {
                return Err(AwaitError::NotFound {
                    job_id: job_id.to_string(),
                });
            };
            done_tx.subscribe()
        };

        let wait = async {
            while !*done_rx.borrow() {
                if done_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            return Err(AwaitError::Timeout {
                job_id: job_id.to_string(),
            });
        }

        let state = self.inner.state.lock();
        state
            .terminal
            .get(job_id)
            .map(Arc::clone)
            .ok_or_else(|| AwaitError::Timeout {
                job_id: job_id.to_string(),
            })
    }

    /// Snapshot: number of currently running orchestrators.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Snapshot: number of queued jobs.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

// ============================================================================
// Dispatch loop
// ============================================================================

async fn dispatch_loop(inner: Arc<Inner>) {
    loop {
        dispatch_ready(&inner);
        inner.wakeup.notified().await;
    }
}

/// Dispatch every currently-eligible job. Lock discipline: the state
/// mutex is taken per decision and released before any spawn or await.
fn dispatch_ready(inner: &Arc<Inner>) {
    loop {
        let dispatched = {
            let mut state = inner.state.lock();
            let limit = inner
                .config
                .max_concurrency
                .min(inner.config.host_capacity.sandboxes);
            if state.in_flight.len() >= limit {
                None
            } else {
                let capacity = inner.config.host_capacity;
                let committed_cpu = state.committed_cpu;
                let committed_memory = state.committed_memory;
                let popped = state.queue.pop_where(|job| {
                    job.spec.caps.cpu_cores + committed_cpu <= capacity.cpu_cores + 1e-9
                        && job.spec.caps.memory_bytes + committed_memory <= capacity.memory_bytes
                });
                match popped {
                    Some(job) if expired(&job) => {
                        // Past its deadline before dispatch: terminate
                        // without running.
                        finish_locked(
                            &mut state,
                            &job.id,
                            JobTermination::Cancelled {
                                reason: CancelReason::DeadlineExpired,
                            },
                        );
                        // Keep draining the queue this pass.
                        continue;
                    }
                    Some(job) => {
                        let cancel = CancelToken::new();
                        state.committed_cpu += job.spec.caps.cpu_cores;
                        state.committed_memory += job.spec.caps.memory_bytes;
                        state.in_flight.insert(
                            job.id.clone(),
                            InFlight {
                                cancel: cancel.clone(),
                                cpu_cores: job.spec.caps.cpu_cores,
                                memory_bytes: job.spec.caps.memory_bytes,
                            },
                        );
                        let attempt = state.attempts.get(&job.id).copied().unwrap_or(1);
                        Some((job, cancel, attempt))
                    }
                    None => None,
                }
            }
        };

        let Some((job, cancel, attempt)) = dispatched else {
            return;
        };
        spawn_run(inner, job, cancel, attempt);
    }
}

fn expired(job: &Job) -> bool {
    job.deadline.is_some_and(|d| Instant::now() >= d)
}

fn spawn_run(inner: &Arc<Inner>, job: Job, cancel: CancelToken, attempt: u32) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let orchestrator = Orchestrator::new(Arc::clone(&inner.provider), inner.store.clone());
        let request = RunRequest {
            job_id: job.id.clone(),
            spec: Arc::clone(&job.spec),
            submission: Arc::clone(&job.submission),
            seed: inner.config.default_seed,
            attempt,
            deadline: job.deadline,
            overwrite: job.overwrite,
        };
        let termination = orchestrator.run(request, cancel.signal()).await;

        let mut state = inner.state.lock();
        if let Some(done) = state.in_flight.remove(&job.id) {
            state.committed_cpu = (state.committed_cpu - done.cpu_cores).max(0.0);
            state.committed_memory = state.committed_memory.saturating_sub(done.memory_bytes);
        }

        match termination {
            RunTermination::Completed(result) => {
                finish_locked(&mut state, &job.id, JobTermination::Completed(result));
            }
            RunTermination::InfraFailed { stage, detail } => {
                let attempts = state.attempts.get(&job.id).copied().unwrap_or(1);
                if attempts < 2 {
                    warn!(job = %job.id, stage = %stage, detail = %detail, "infra fault, retrying once");
                    state.attempts.insert(job.id.clone(), attempts + 1);
                    state.queue.enqueue(job);
                } else {
                    finish_locked(
                        &mut state,
                        &job.id,
                        JobTermination::InfraFailed {
                            detail: format!("{stage}: {detail}"),
                            attempts,
                        },
                    );
                }
            }
            RunTermination::Aborted(AbortReason::Cancelled) => {
                finish_locked(
                    &mut state,
                    &job.id,
                    JobTermination::Cancelled {
                        reason: CancelReason::Operator,
                    },
                );
            }
            RunTermination::Aborted(AbortReason::DeadlineExpired) => {
                finish_locked(
                    &mut state,
                    &job.id,
                    JobTermination::Cancelled {
                        reason: CancelReason::DeadlineExpired,
                    },
                );
            }
            RunTermination::Refused { detail } => {
                finish_locked(&mut state, &job.id, JobTermination::Refused { detail });
            }
        }
        drop(state);
        inner.wakeup.notify_one();
    });
}

/// Record a terminal state and wake awaiters. Caller holds the lock.
fn finish_locked(state: &mut State, job_id: &str, termination: JobTermination) {
    state
        .terminal
        .insert(job_id.to_string(), Arc::new(termination));
    if let Some(done_tx) = state.done_channels.get(job_id) {
        let _ = done_tx.send(true);
    }
}
