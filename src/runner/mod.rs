//! Stage execution: one command set, one sandbox, one normalized outcome.
//!
//! The runner provisions nothing and schedules nothing — it receives a
//! stage descriptor plus a provider, executes the (template-substituted)
//! command inside a freshly provisioned sandbox, and reduces everything
//! that happened to a [`StageOutcome`]. Both output streams are consumed
//! concurrently so neither pipe can stall the child; every byte lands in
//! the evidence store while a bounded tail stays in memory and structured
//! `##METRIC` / `##ENDPOINT` lines are captured as they stream past.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use rustc_hash::FxHashMap;
use tracing::{debug, instrument, warn};

use crate::cancel::{CancelSignal, CancelToken};
use crate::evidence::StageEvidence;
use crate::metrics::MetricValue;
use crate::outcome::{
    OutcomeKind, StageOutcome, REASON_NO_ENDPOINT, REASON_OUTPUT_FLOOD, REASON_POLICY_VIOLATION,
};
use crate::sandbox::{
    ExecObservation, ExecRequest, Mounts, NetworkPolicy, SandboxProvider, ScopedSandbox,
    StdStream, StreamChunk,
};
use crate::spec::{ProblemSpec, StageKind, StageSpec};

/// In-memory tail kept per stream; earlier bytes live only in evidence.
pub const TAIL_LIMIT: usize = 1024 * 1024;
/// Combined stream budget; beyond it the stage is terminated as
/// `ResourceExceeded` with reason `output_flood`.
pub const FLOOD_LIMIT: u64 = 128 * 1024 * 1024;
/// Structured line prefixes on stdout.
const METRIC_PREFIX: &str = "##METRIC:";
const ENDPOINT_PREFIX: &str = "##ENDPOINT:";
/// Seed environment variable propagated into every stage.
pub const SEED_ENV_VAR: &str = "REQ2RUN_SEED";

// ============================================================================
// Context & result
// ============================================================================

/// Per-run values the orchestrator threads into each stage execution.
#[derive(Clone, Debug)]
pub struct StageContext {
    pub job_id: String,
    pub seed: u64,
    /// Endpoint published by the deploy stage, if any.
    pub endpoint: Option<String>,
    /// Effective wall budget: the stage budget, possibly shortened by the
    /// job deadline (whichever fires first wins).
    pub timeout: Duration,
    pub cancel: CancelSignal,
}

/// What one stage execution produced.
#[derive(Debug)]
pub struct StageExecution {
    pub outcome: StageOutcome,
    /// The external cancellation signal interrupted this stage.
    pub cancelled: bool,
    /// Trailing stdout/stderr bytes (full streams are in evidence).
    pub stdout_tail: Vec<u8>,
    pub stderr_tail: Vec<u8>,
}

// ============================================================================
// StageRunner
// ============================================================================

/// Executes single stages inside provider-managed sandboxes.
pub struct StageRunner {
    provider: Arc<dyn SandboxProvider>,
}

impl StageRunner {
    #[must_use]
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self { provider }
    }

    /// Run one stage to a normalized outcome. Never returns an error:
    /// environment failures become `InfraFault` outcomes and panics in
    /// the capture path become `CrashedInSandbox`.
    #[instrument(skip_all, fields(job = %ctx.job_id, stage = %stage.name))]
    pub async fn run(
        &self,
        stage: &StageSpec,
        spec: &ProblemSpec,
        mounts: Mounts,
        evidence: &mut StageEvidence,
        ctx: &StageContext,
    ) -> StageExecution {
        let evidence_dir = evidence.dir().to_path_buf();

        // A stage that exercises the deployed service cannot run without
        // a published endpoint.
        if stage.kind.needs_endpoint() && ctx.endpoint.is_none() {
            let mut outcome = StageOutcome::with_kind(
                &stage.name,
                stage.kind,
                OutcomeKind::ResourceExceeded,
                evidence_dir,
            );
            outcome.sub_reason = Some(REASON_NO_ENDPOINT.to_string());
            outcome.budget = stage.timeout;
            return StageExecution {
                outcome,
                cancelled: false,
                stdout_tail: Vec::new(),
                stderr_tail: Vec::new(),
            };
        }

        let policy = NetworkPolicy::from_egress(spec.egress.clone());
        let handle = match self
            .provider
            .provision(&spec.caps, &policy, mounts.clone())
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "sandbox provisioning failed");
                let mut outcome = StageOutcome::infra_fault(
                    &stage.name,
                    stage.kind,
                    evidence_dir,
                    err.to_string(),
                );
                outcome.budget = stage.timeout;
                return StageExecution {
                    outcome,
                    cancelled: false,
                    stdout_tail: Vec::new(),
                    stderr_tail: Vec::new(),
                };
            }
        };
        let sandbox = ScopedSandbox::new(Arc::clone(&self.provider), handle);

        let argv = substitute_command(&stage.command, &mounts, ctx.endpoint.as_deref());
        let request = ExecRequest {
            argv,
            env: vec![(SEED_ENV_VAR.to_string(), ctx.seed.to_string())],
            stdin: None,
            timeout: ctx.timeout,
        };

        // Flood termination and external cancellation share one signal
        // into the provider: the external signal is forwarded onto a
        // stage-local token the flood detector can also fire.
        let local_cancel = CancelToken::new();
        let forwarder = tokio::spawn({
            let mut external = ctx.cancel.clone();
            let local = local_cancel.clone();
            async move {
                external.cancelled().await;
                local.cancel();
            }
        });

        let (tx, rx) = flume::bounded::<StreamChunk>(256);
        // Exec and stream capture run as joined futures in this task so
        // the capture path can borrow the evidence writers; the guard
        // around the join converts any panic into CrashedInSandbox
        // instead of unwinding through the pipeline.
        let exec_fut = self
            .provider
            .exec(sandbox.handle(), request, tx, local_cancel.signal());
        let capture_fut = consume_streams(rx, evidence, stage.kind, local_cancel.clone());
        let guarded = std::panic::AssertUnwindSafe(futures_util::future::join(
            exec_fut,
            capture_fut,
        ))
        .catch_unwind()
        .await;
        sandbox.release().await;
        forwarder.abort();

        let (exec_result, capture) = match guarded {
            Ok(pair) => pair,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "stage guard caught panic".to_string());
                warn!(detail = %detail, "stage execution panicked");
                let mut outcome = StageOutcome::with_kind(
                    &stage.name,
                    stage.kind,
                    OutcomeKind::CrashedInSandbox,
                    evidence_dir,
                );
                outcome.sub_reason = Some(detail);
                outcome.budget = stage.timeout;
                return StageExecution {
                    outcome,
                    cancelled: ctx.cancel.is_cancelled(),
                    stdout_tail: Vec::new(),
                    stderr_tail: Vec::new(),
                };
            }
        };
        let StreamCapture {
            stdout_tail,
            stderr_tail,
            metrics,
            flagged,
            endpoint,
            flooded,
            total_bytes,
        } = capture;
        debug!(total_bytes, flooded, "stage streams drained");

        let mut outcome = match exec_result {
            Ok(obs) => {
                let mut outcome = StageOutcome::with_kind(
                    &stage.name,
                    stage.kind,
                    map_kind(stage, &obs, flooded),
                    evidence_dir,
                );
                outcome.duration = obs.wall;
                outcome.exit_code = obs.exit_code;
                outcome.peak_rss_bytes = obs.peak_rss_bytes;
                outcome.cpu_seconds = obs.cpu_seconds;
                outcome.sub_reason = sub_reason(&obs, flooded);
                outcome
            }
            Err(err) => {
                warn!(error = %err, "stage execution infra fault");
                StageOutcome::infra_fault(&stage.name, stage.kind, evidence_dir, err.to_string())
            }
        };
        outcome.budget = stage.timeout;
        outcome.metrics = metrics;
        outcome.flagged_metrics = flagged;
        if stage.kind == StageKind::Deploy {
            outcome.endpoint = endpoint;
        }

        StageExecution {
            cancelled: ctx.cancel.is_cancelled(),
            outcome,
            stdout_tail,
            stderr_tail,
        }
    }
}

fn map_kind(stage: &StageSpec, obs: &ExecObservation, flooded: bool) -> OutcomeKind {
    if flooded {
        return OutcomeKind::ResourceExceeded;
    }
    if obs.policy_violation.is_some() {
        return OutcomeKind::CrashedInSandbox;
    }
    if obs.timed_out {
        return OutcomeKind::Timeout;
    }
    if obs.cap_exceeded.is_some() {
        return OutcomeKind::ResourceExceeded;
    }
    if let Some(code) = obs.exit_code {
        if stage.exit_ok(code) {
            OutcomeKind::Success
        } else {
            OutcomeKind::RequirementFail
        }
    } else {
        // Killed by a signal outside the deliberate paths above.
        OutcomeKind::CrashedInSandbox
    }
}

fn sub_reason(obs: &ExecObservation, flooded: bool) -> Option<String> {
    if flooded {
        Some(REASON_OUTPUT_FLOOD.to_string())
    } else if obs.policy_violation.is_some() {
        Some(REASON_POLICY_VIOLATION.to_string())
    } else if let Some(cap) = &obs.cap_exceeded {
        Some(format!("{cap}_cap"))
    } else if obs.cancelled {
        Some("cancelled".to_string())
    } else {
        None
    }
}

// ============================================================================
// Template substitution
// ============================================================================

/// Literal substitution of `{workspace}`, `{scratch}`, `{endpoint}` and
/// `{port}` in every argv element, performed before exec.
#[must_use]
pub fn substitute_command(
    command: &[String],
    mounts: &Mounts,
    endpoint: Option<&str>,
) -> Vec<String> {
    let workspace = mounts
        .workspace
        .as_ref()
        .unwrap_or(&mounts.scratch)
        .to_string_lossy()
        .into_owned();
    let scratch = mounts.scratch.to_string_lossy().into_owned();
    let endpoint = endpoint.unwrap_or("");
    let port = endpoint_port(endpoint)
        .map(|p| p.to_string())
        .unwrap_or_default();

    command
        .iter()
        .map(|arg| {
            arg.replace("{workspace}", &workspace)
                .replace("{scratch}", &scratch)
                .replace("{endpoint}", endpoint)
                .replace("{port}", &port)
        })
        .collect()
}

/// Extract the port from `host:port` or a URL form.
#[must_use]
pub fn endpoint_port(endpoint: &str) -> Option<u16> {
    let without_scheme = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    let authority = without_scheme.split('/').next()?;
    let (_, port) = authority.rsplit_once(':')?;
    port.parse().ok()
}

// ============================================================================
// Stream capture
// ============================================================================

struct StreamCapture {
    stdout_tail: Vec<u8>,
    stderr_tail: Vec<u8>,
    metrics: FxHashMap<String, MetricValue>,
    flagged: Vec<String>,
    endpoint: Option<String>,
    flooded: bool,
    total_bytes: u64,
}

async fn consume_streams(
    rx: flume::Receiver<StreamChunk>,
    evidence: &mut StageEvidence,
    stage_kind: StageKind,
    flood_cancel: CancelToken,
) -> StreamCapture {
    let mut stdout_tail: Vec<u8> = Vec::new();
    let mut stderr_tail: Vec<u8> = Vec::new();
    let mut stdout_line = Vec::new();
    let mut metrics = FxHashMap::default();
    let mut flagged = Vec::new();
    let mut endpoint = None;
    let mut flooded = false;
    let mut total_bytes = 0u64;

    while let Ok(chunk) = rx.recv_async().await {
        total_bytes += chunk.bytes.len() as u64;
        if !flooded && total_bytes > FLOOD_LIMIT {
            flooded = true;
            flood_cancel.cancel();
        }

        match chunk.stream {
            StdStream::Stdout => {
                let _ = evidence.append_stdout(&chunk.bytes).await;
                append_tail(&mut stdout_tail, &chunk.bytes);
                // Scan complete lines for structured markers.
                for byte in &chunk.bytes {
                    if *byte == b'\n' {
                        let line = String::from_utf8_lossy(&stdout_line).into_owned();
                        parse_structured_line(
                            line.trim_end_matches('\r'),
                            stage_kind,
                            evidence,
                            &mut metrics,
                            &mut flagged,
                            &mut endpoint,
                        )
                        .await;
                        stdout_line.clear();
                    } else if stdout_line.len() < TAIL_LIMIT {
                        stdout_line.push(*byte);
                    }
                }
            }
            StdStream::Stderr => {
                let _ = evidence.append_stderr(&chunk.bytes).await;
                append_tail(&mut stderr_tail, &chunk.bytes);
            }
        }
    }

    // A final unterminated line still counts.
    if !stdout_line.is_empty() {
        let line = String::from_utf8_lossy(&stdout_line).into_owned();
        parse_structured_line(
            line.trim_end_matches('\r'),
            stage_kind,
            evidence,
            &mut metrics,
            &mut flagged,
            &mut endpoint,
        )
        .await;
    }

    StreamCapture {
        stdout_tail,
        stderr_tail,
        metrics,
        flagged,
        endpoint,
        flooded,
        total_bytes,
    }
}

fn append_tail(tail: &mut Vec<u8>, bytes: &[u8]) {
    tail.extend_from_slice(bytes);
    if tail.len() > TAIL_LIMIT {
        let excess = tail.len() - TAIL_LIMIT;
        tail.drain(..excess);
    }
}

async fn parse_structured_line(
    line: &str,
    stage_kind: StageKind,
    evidence: &mut StageEvidence,
    metrics: &mut FxHashMap<String, MetricValue>,
    flagged: &mut Vec<String>,
    endpoint: &mut Option<String>,
) {
    if let Some(rest) = line.strip_prefix(METRIC_PREFIX) {
        let Some((key, raw)) = rest.split_once(':') else {
            return;
        };
        let key = key.trim().to_string();
        let raw = raw.trim();
        let value = match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => MetricValue::Number(n),
            _ => {
                flagged.push(key.clone());
                MetricValue::Text(raw.to_string())
            }
        };
        let record = serde_json::json!({
            "at": chrono::Utc::now().to_rfc3339(),
            "key": key,
            "value": raw,
        });
        let _ = evidence.append_metric(&record).await;
        metrics.insert(key, value);
    } else if let Some(url) = line.strip_prefix(ENDPOINT_PREFIX) {
        // Endpoint publication is honoured from the deploy stage only.
        if stage_kind == StageKind::Deploy {
            *endpoint = Some(url.trim().to_string());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
