//! The terminal, immutable result record of one evaluation run.
//!
//! # JSON schema (stable)
//!
//! `result.json` serializes to:
//!
//! ```json
//! {
//!   "engine_version": "0.3.0",
//!   "job_id": "…",
//!   "spec_id": "http-health-check",
//!   "spec_checksum": "ab12…",
//!   "submission_id": "sub-042",
//!   "seed": 42,
//!   "started_at": "2026-01-12T10:30:00Z",
//!   "ended_at": "2026-01-12T10:34:17Z",
//!   "stages": [
//!     {"name": "build", "kind": "success", "stage_kind": "build",
//!      "duration_seconds": 41.2, "exit_code": 0, "metrics": {}}
//!   ],
//!   "metrics": { "functional_coverage": 1.0, "...": "…" },
//!   "scores": { "functional": 100.0, "total": 75.2, "grade": "bronze" },
//!   "pass": true,
//!   "reason": null,
//!   "attempts": 1,
//!   "evidence_root": "runs/…"
//! }
//! ```
//!
//! Serialization → deserialization → serialization is byte-idempotent:
//! field order is fixed by declaration order and floats round-trip through
//! serde_json's shortest-representation rendering.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::metrics::{Metrics, MetricValue};
use crate::outcome::StageOutcome;
use crate::scorer::{Grade, ScoreBreakdown};
use crate::spec::StageKind;

/// Engine version stamped into every result and signature.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Records
// ============================================================================

/// Per-stage slice of the result record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    /// Outcome kind label (`success`, `timeout`, …).
    pub kind: String,
    pub stage_kind: StageKind,
    pub duration_seconds: f64,
    /// Wall budget the stage ran under; with `duration_seconds` and
    /// `peak_rss_bytes` this makes a stored result re-scorable.
    pub budget_seconds: f64,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub sub_reason: Option<String>,
    #[serde(default)]
    pub peak_rss_bytes: u64,
    #[serde(default)]
    pub metrics: FxHashMap<String, MetricValue>,
}

impl From<&StageOutcome> for StageRecord {
    fn from(outcome: &StageOutcome) -> Self {
        Self {
            name: outcome.stage.clone(),
            kind: outcome.kind.variant_name().to_string(),
            stage_kind: outcome.stage_kind,
            duration_seconds: outcome.duration.as_secs_f64(),
            budget_seconds: outcome.budget.as_secs_f64(),
            exit_code: outcome.exit_code,
            sub_reason: outcome.sub_reason.clone(),
            peak_rss_bytes: outcome.peak_rss_bytes,
            metrics: outcome.metrics.clone(),
        }
    }
}

/// Component scores as persisted.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub functional: f64,
    pub test: f64,
    pub performance: f64,
    pub quality: f64,
    pub security: f64,
    pub total: f64,
    pub grade: Grade,
}

impl From<&ScoreBreakdown> for ScoreRecord {
    fn from(breakdown: &ScoreBreakdown) -> Self {
        Self {
            functional: breakdown.functional,
            test: breakdown.test,
            performance: breakdown.performance,
            quality: breakdown.quality,
            security: breakdown.security,
            total: breakdown.total,
            grade: breakdown.grade,
        }
    }
}

/// The full terminal record. Written exactly once per job attempt chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub engine_version: String,
    pub job_id: String,
    pub spec_id: String,
    pub spec_checksum: String,
    pub submission_id: String,
    pub seed: u64,
    #[serde(with = "iso8601")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "iso8601")]
    pub ended_at: DateTime<Utc>,
    pub stages: Vec<StageRecord>,
    pub metrics: Metrics,
    pub scores: ScoreRecord,
    pub pass: bool,
    /// Always present when `pass` is false.
    pub reason: Option<String>,
    pub attempts: u32,
    pub evidence_root: PathBuf,
}

impl EvalResult {
    /// The canonical byte form persisted to `result.json` and hashed for
    /// the detached signature.
    #[must_use]
    pub fn canonical_json(&self) -> Vec<u8> {
        // A fully-owned record always serializes.
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }
}

/// UTC timestamps rendered as ISO-8601 with a trailing `Z`, fixed to
/// second precision so re-serialization is byte-stable.
mod iso8601 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> EvalResult {
        EvalResult {
            engine_version: ENGINE_VERSION.to_string(),
            job_id: "job-1".into(),
            spec_id: "http-health-check".into(),
            spec_checksum: "abcd".into(),
            submission_id: "sub-1".into(),
            seed: 42,
            started_at: Utc.with_ymd_and_hms(2026, 1, 12, 10, 30, 0).unwrap(),
            ended_at: Utc.with_ymd_and_hms(2026, 1, 12, 10, 34, 17).unwrap(),
            stages: vec![],
            metrics: Metrics::default(),
            scores: ScoreRecord {
                functional: 100.0,
                test: 85.0,
                performance: 62.5,
                quality: 70.0,
                security: 100.0,
                total: 75.125,
                grade: Grade::Bronze,
            },
            pass: true,
            reason: None,
            attempts: 1,
            evidence_root: PathBuf::from("runs/job-1"),
        }
    }

    #[test]
    fn serialization_is_byte_idempotent() {
        let result = sample();
        let first = result.canonical_json();
        let reparsed: EvalResult = serde_json::from_slice(&first).unwrap();
        let second = reparsed.canonical_json();
        assert_eq!(first, second);
    }

    #[test]
    fn timestamps_render_utc_iso8601() {
        let json = String::from_utf8(sample().canonical_json()).unwrap();
        assert!(json.contains("\"2026-01-12T10:30:00Z\""));
    }

    #[test]
    fn total_survives_round_trip_exactly() {
        let result = sample();
        let reparsed: EvalResult = serde_json::from_slice(&result.canonical_json()).unwrap();
        assert_eq!(
            result.scores.total.to_bits(),
            reparsed.scores.total.to_bits()
        );
    }
}
