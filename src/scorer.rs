//! Deterministic weighted score aggregation.
//!
//! Scoring is a pure function of the collected [`Metrics`], the effective
//! weights, the spec's targets/caps, and the stage outcomes. Re-scoring a
//! stored metrics record must reproduce the stored total bit-for-bit, so
//! everything here is plain IEEE-754 double arithmetic in a fixed
//! evaluation order with a single final rounding step.

use serde::{Deserialize, Serialize};

use crate::metrics::{Metrics, QualityMetrics};
use crate::outcome::{OutcomeKind, StageOutcome};
use crate::spec::{NonFunctionalTargets, ResourceCaps, ScoringWeights, StageKind};

/// Penalty applied per timeout in a non-performance stage.
const PENALTY_TIMEOUT: f64 = 5.0;
/// Penalty applied per stage that crashed in its sandbox.
const PENALTY_CRASH: f64 = 10.0;
/// Penalty applied once when any policy violation occurred.
const PENALTY_POLICY_VIOLATION: f64 = 15.0;
/// Bonus applied once when every stage succeeded within half its budget.
const BONUS_FAST_RUN: f64 = 2.0;
/// Quality deduction per metric key flagged as non-numeric.
const PENALTY_FLAGGED_METRIC: f64 = 2.0;

// ============================================================================
// Grade
// ============================================================================

/// Categorical grade bands over the total score, with the additional
/// pass-gate conditions applied on top.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Gold,
    Silver,
    Bronze,
    Fail,
}

impl Grade {
    fn from_total(total: f64) -> Self {
        if total >= 90.0 {
            Self::Gold
        } else if total >= 80.0 {
            Self::Silver
        } else if total >= 70.0 {
            Self::Bronze
        } else {
            Self::Fail
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gold => write!(f, "gold"),
            Self::Silver => write!(f, "silver"),
            Self::Bronze => write!(f, "bronze"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

// ============================================================================
// ScoreBreakdown
// ============================================================================

/// Component scores (each in [0, 100]), the weighted total, and the gate
/// verdict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub functional: f64,
    pub test: f64,
    pub performance: f64,
    pub quality: f64,
    pub security: f64,
    /// Weighted sum after penalties/bonus, banker's-rounded to three
    /// decimals and clamped to [0, 100].
    pub total: f64,
    pub grade: Grade,
    pub pass: bool,
    /// Populated whenever `pass` is false.
    #[serde(default)]
    pub reason: Option<String>,
}

// ============================================================================
// Scorer
// ============================================================================

/// Score one run. `weights` must already be normalized
/// (see [`ScoringWeights::normalized`]).
#[must_use]
pub fn score(
    metrics: &Metrics,
    weights: &ScoringWeights,
    targets: &NonFunctionalTargets,
    caps: &ResourceCaps,
    outcomes: &[StageOutcome],
) -> ScoreBreakdown {
    let policy_violation = outcomes.iter().any(StageOutcome::is_policy_violation);

    let functional = metrics.functional_coverage.unwrap_or(0.0) * 100.0;
    let test = metrics.test_pass_rate.unwrap_or(0.0) * 100.0;
    let performance = performance_score(metrics, targets, caps, outcomes);
    let quality = quality_score(metrics);
    let security = if policy_violation {
        0.0
    } else {
        security_score(metrics)
    };

    let weighted = functional * weights.functional
        + test * weights.test
        + performance * weights.performance
        + quality * weights.quality
        + security * weights.security;

    let mut adjusted = weighted;
    for outcome in outcomes {
        match outcome.kind {
            OutcomeKind::Timeout if outcome.stage_kind != StageKind::PerformanceTest => {
                adjusted -= PENALTY_TIMEOUT;
            }
            // A policy-violation crash takes the heavier refinement below
            // instead of the generic crash penalty.
            OutcomeKind::CrashedInSandbox if !outcome.is_policy_violation() => {
                adjusted -= PENALTY_CRASH;
            }
            _ => {}
        }
    }
    if policy_violation {
        adjusted -= PENALTY_POLICY_VIOLATION;
    }
    if !outcomes.is_empty()
        && outcomes
            .iter()
            .all(|o| o.kind.is_success() && o.within_half_budget())
    {
        adjusted += BONUS_FAST_RUN;
    }

    let total = round_half_even_3(adjusted).clamp(0.0, 100.0);

    let coverage_complete = metrics.functional_coverage == Some(1.0);
    let compliant = metrics
        .security
        .map(|s| s.runtime_compliance == 1.0)
        .unwrap_or(false)
        && !policy_violation;

    let (pass, grade, reason) = if coverage_complete && compliant {
        (true, Grade::from_total(total), None)
    } else {
        let reason = if !coverage_complete {
            format!(
                "unmet MUST requirement: functional coverage {:.3} < 1.0",
                metrics.functional_coverage.unwrap_or(0.0)
            )
        } else {
            "sandbox runtime compliance violated".to_string()
        };
        (false, Grade::Fail, Some(reason))
    };

    ScoreBreakdown {
        functional: round_half_even_3(functional),
        test: round_half_even_3(test),
        performance: round_half_even_3(performance),
        quality: round_half_even_3(quality),
        security: round_half_even_3(security),
        total,
        grade,
        pass,
        reason,
    }
}

/// 0.4·latency + 0.4·throughput + 0.2·resource. When percentiles are
/// low-confidence their weight is halved and the freed weight is
/// redistributed pro-rata over throughput and resource.
fn performance_score(
    metrics: &Metrics,
    targets: &NonFunctionalTargets,
    caps: &ResourceCaps,
    outcomes: &[StageOutcome],
) -> f64 {
    let Some(perf) = metrics.performance else {
        return 0.0;
    };

    let latency = latency_score(perf.p95_ms, targets.p95_target_ms);
    let throughput = if targets.throughput_floor_rps > 0.0 {
        (perf.rps / targets.throughput_floor_rps).min(1.0) * 100.0
    } else {
        100.0
    };
    let resource = resource_score(peak_rss(outcomes), caps.memory_bytes);

    let (w_lat, w_thr, w_res) = if perf.low_confidence {
        // Halve the latency weight, spread the remainder 2:1.
        let freed = 0.2;
        (0.2, 0.4 + freed * (0.4 / 0.6), 0.2 + freed * (0.2 / 0.6))
    } else {
        (0.4, 0.4, 0.2)
    };

    latency * w_lat + throughput * w_thr + resource * w_res
}

/// 100 at or below target, linearly decaying to 0 at twice the target.
fn latency_score(p95_ms: f64, target_ms: f64) -> f64 {
    if target_ms <= 0.0 || p95_ms <= target_ms {
        return 100.0;
    }
    (100.0 * (2.0 - p95_ms / target_ms)).clamp(0.0, 100.0)
}

/// 100 at or below 80% of the cap, linearly decaying to 0 at the cap.
fn resource_score(peak_bytes: u64, cap_bytes: u64) -> f64 {
    if cap_bytes == 0 {
        return 100.0;
    }
    let peak = peak_bytes as f64;
    let cap = cap_bytes as f64;
    let knee = cap * 0.8;
    if peak <= knee {
        100.0
    } else {
        (100.0 * (cap - peak) / (cap - knee)).clamp(0.0, 100.0)
    }
}

fn peak_rss(outcomes: &[StageOutcome]) -> u64 {
    outcomes
        .iter()
        .filter(|o| o.kind.scoreable())
        .map(|o| o.peak_rss_bytes)
        .max()
        .unwrap_or(0)
}

/// Equal 0.25 weights over complexity, coverage, lint, documentation;
/// weights of absent reports are redistributed over the present ones.
/// Flagged non-numeric metrics each deduct a fixed quality penalty.
fn quality_score(metrics: &Metrics) -> f64 {
    let quality = metrics.quality.clone().unwrap_or_default();
    let components = quality_components(&quality);
    let present: Vec<f64> = components.into_iter().flatten().collect();
    let base = if present.is_empty() {
        0.0
    } else {
        present.iter().sum::<f64>() / present.len() as f64
    };
    (base - metrics.flagged_keys.len() as f64 * PENALTY_FLAGGED_METRIC).max(0.0)
}

fn quality_components(quality: &QualityMetrics) -> [Option<f64>; 4] {
    let complexity = quality.cyclomatic_avg.map(|avg| {
        // Published thresholds: 100 at avg <= 5, 0 at avg >= 20.
        if avg <= 5.0 {
            100.0
        } else {
            (100.0 * (20.0 - avg) / 15.0).clamp(0.0, 100.0)
        }
    });
    let coverage = quality.line_coverage.map(|c| (c * 100.0).clamp(0.0, 100.0));
    let lint = quality.lint.map(|l| {
        (100.0 - 10.0 * l.error as f64 - 2.0 * l.warning as f64 - 0.5 * l.info as f64).max(0.0)
    });
    let documentation = quality.documentation.map(|d| (d * 100.0).clamp(0.0, 100.0));
    [complexity, coverage, lint, documentation]
}

/// 0.5·compliance·100 + 0.5·max(0, 100 − 2c − 2h − m − 0.5l), floored at 0.
fn security_score(metrics: &Metrics) -> f64 {
    let Some(sec) = metrics.security else {
        return 0.0;
    };
    let findings = (100.0
        - 2.0 * sec.critical as f64
        - 2.0 * sec.high as f64
        - 1.0 * sec.medium as f64
        - 0.5 * sec.low as f64)
        .max(0.0);
    (0.5 * sec.runtime_compliance * 100.0 + 0.5 * findings).max(0.0)
}

/// Round to three decimal places with ties going to the even neighbour.
#[must_use]
pub fn round_half_even_3(value: f64) -> f64 {
    let scaled = value * 1000.0;
    let floor = scaled.floor();
    let fraction = scaled - floor;
    let rounded = if (fraction - 0.5).abs() <= f64::EPSILON * scaled.abs().max(1.0) {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        scaled.round()
    };
    rounded / 1000.0
}

// ============================================================================
// Tests
// ============================================================================
