//! Stage outcomes — the normalized verdict of one pipeline stage.
//!
//! The stage runner maps every way a stage can end (clean exit, tolerated
//! exit, wall-clock exhaustion, cap breach, crash, host fault) into a
//! [`StageOutcome`]. Nothing above the runner sees raw exit statuses or
//! exceptional control flow; failures cross module boundaries only as
//! values of this type.

use std::path::PathBuf;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::metrics::MetricValue;
use crate::spec::StageKind;

/// Sub-reason attached when a sandbox policy was breached.
pub const REASON_POLICY_VIOLATION: &str = "policy_violation";
/// Sub-reason attached when a stage flooded its output streams.
pub const REASON_OUTPUT_FLOOD: &str = "output_flood";
/// Sub-reason attached when a stage needed a service endpoint the deploy
/// stage never published.
pub const REASON_NO_ENDPOINT: &str = "no_endpoint";

// ============================================================================
// OutcomeKind
// ============================================================================

/// How a stage terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Stage met its success criteria.
    Success,
    /// Stage ran to completion but failed its success criteria.
    RequirementFail,
    /// Wall-clock budget exceeded.
    Timeout,
    /// Memory/CPU/output cap hit.
    ResourceExceeded,
    /// The stage process died abnormally inside the sandbox, including
    /// syscall-policy kills (sub-reason `policy_violation`).
    CrashedInSandbox,
    /// The engine's environment failed, not the submission. Never scored;
    /// aborts the run and makes the job eligible for one retry.
    InfraFault,
}

impl OutcomeKind {
    #[must_use]
    pub fn variant_name(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RequirementFail => "requirement_fail",
            Self::Timeout => "timeout",
            Self::ResourceExceeded => "resource_exceeded",
            Self::CrashedInSandbox => "crashed_in_sandbox",
            Self::InfraFault => "infra_fault",
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Whether this outcome is attributable to the engine's environment.
    /// Infra faults abort the run and never contribute to the score.
    #[must_use]
    pub fn is_infra(self) -> bool {
        matches!(self, Self::InfraFault)
    }

    /// Whether the outcome feeds scoring (everything except infra faults).
    #[must_use]
    pub fn scoreable(self) -> bool {
        !self.is_infra()
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.variant_name())
    }
}

// ============================================================================
// StageOutcome
// ============================================================================

/// The full record of one executed stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Stage name from the descriptor.
    pub stage: String,
    pub stage_kind: StageKind,
    pub kind: OutcomeKind,
    /// Machine-readable refinement of `kind` (`policy_violation`,
    /// `output_flood`, `no_endpoint`).
    #[serde(default)]
    pub sub_reason: Option<String>,
    pub duration: Duration,
    /// Wall-clock budget the stage ran under, kept for the fast-run bonus.
    pub budget: Duration,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Structured `##METRIC` lines captured from stdout.
    #[serde(default)]
    pub metrics: FxHashMap<String, MetricValue>,
    /// Metric keys whose payload was non-numeric where a numeric value is
    /// required downstream. Recorded, not dropped; the scorer penalizes.
    #[serde(default)]
    pub flagged_metrics: Vec<String>,
    /// Service endpoint published by a deploy stage via `##ENDPOINT`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Evidence directory holding this stage's logs and artifacts.
    pub evidence_dir: PathBuf,
    #[serde(default)]
    pub peak_rss_bytes: u64,
    #[serde(default)]
    pub cpu_seconds: f64,
}

impl StageOutcome {
    /// A successful outcome skeleton; callers fill in measurements.
    #[must_use]
    pub fn success(stage: impl Into<String>, stage_kind: StageKind, evidence_dir: PathBuf) -> Self {
        Self::with_kind(stage, stage_kind, OutcomeKind::Success, evidence_dir)
    }

    /// An infra-fault outcome carrying the fault description.
    #[must_use]
    pub fn infra_fault(
        stage: impl Into<String>,
        stage_kind: StageKind,
        evidence_dir: PathBuf,
        reason: impl Into<String>,
    ) -> Self {
        let mut outcome = Self::with_kind(stage, stage_kind, OutcomeKind::InfraFault, evidence_dir);
        outcome.sub_reason = Some(reason.into());
        outcome
    }

    #[must_use]
    pub fn with_kind(
        stage: impl Into<String>,
        stage_kind: StageKind,
        kind: OutcomeKind,
        evidence_dir: PathBuf,
    ) -> Self {
        Self {
            stage: stage.into(),
            stage_kind,
            kind,
            sub_reason: None,
            duration: Duration::ZERO,
            budget: Duration::ZERO,
            exit_code: None,
            metrics: FxHashMap::default(),
            flagged_metrics: Vec::new(),
            endpoint: None,
            evidence_dir,
            peak_rss_bytes: 0,
            cpu_seconds: 0.0,
        }
    }

    /// Whether a syscall or egress policy breach was detected.
    #[must_use]
    pub fn is_policy_violation(&self) -> bool {
        self.sub_reason.as_deref() == Some(REASON_POLICY_VIOLATION)
    }

    /// Whether the stage finished within half of its wall budget.
    /// Every stage doing so earns the run a one-time bonus.
    #[must_use]
    pub fn within_half_budget(&self) -> bool {
        !self.budget.is_zero() && self.duration * 2 <= self.budget
    }

    /// Numeric view of a captured metric.
    #[must_use]
    pub fn metric_number(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).and_then(MetricValue::as_number)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infra_faults_never_score() {
        assert!(!OutcomeKind::InfraFault.scoreable());
        for kind in [
            OutcomeKind::Success,
            OutcomeKind::RequirementFail,
            OutcomeKind::Timeout,
            OutcomeKind::ResourceExceeded,
            OutcomeKind::CrashedInSandbox,
        ] {
            assert!(kind.scoreable(), "{kind} should feed scoring");
        }
    }

    #[test]
    fn policy_violation_detection() {
        let mut outcome = StageOutcome::with_kind(
            "scan",
            StageKind::SecurityScan,
            OutcomeKind::CrashedInSandbox,
            PathBuf::new(),
        );
        assert!(!outcome.is_policy_violation());
        outcome.sub_reason = Some(REASON_POLICY_VIOLATION.to_string());
        assert!(outcome.is_policy_violation());
    }

    #[test]
    fn half_budget_window() {
        let mut outcome = StageOutcome::success("build", StageKind::Build, PathBuf::new());
        outcome.budget = Duration::from_secs(100);
        outcome.duration = Duration::from_secs(50);
        assert!(outcome.within_half_budget());
        outcome.duration = Duration::from_secs(51);
        assert!(!outcome.within_half_budget());
        // A zero budget can never qualify.
        outcome.budget = Duration::ZERO;
        outcome.duration = Duration::ZERO;
        assert!(!outcome.within_half_budget());
    }

    #[test]
    fn outcome_round_trips_json() {
        let mut outcome = StageOutcome::success(
            "functional",
            StageKind::FunctionalTest,
            PathBuf::from("/tmp/ev"),
        );
        outcome.duration = Duration::from_millis(1500);
        outcome.budget = Duration::from_secs(60);
        outcome.exit_code = Some(0);
        outcome
            .metrics
            .insert("requests".into(), MetricValue::Number(42.0));
        let json = serde_json::to_string(&outcome).unwrap();
        let parsed: StageOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(outcome, parsed);
    }
}
