//! Security collector: vulnerability tallies and runtime compliance.
//!
//! The scanner leaves `scan-report.json` in scratch, either as a findings
//! list (`{"findings": [{"severity": "high"}]}`) or as pre-tallied counts
//! (`{"critical": 0, "high": 1, "medium": 3, "low": 7}`).
//!
//! The collector reports compliance from its own stage's view; the
//! orchestrator zeroes `runtime_compliance` afterwards if any stage of
//! the run breached sandbox policy.

use std::path::Path;

use crate::metrics::{Metrics, SecurityMetrics};
use crate::outcome::StageOutcome;
use crate::spec::{ProblemSpec, StageKind};

use super::{read_json_report, CollectError, Collector};

const SCAN_REPORT: &str = "scan-report.json";
const SCAN_REPORT_ALT: &str = "vulnerabilities.json";

pub struct SecurityCollector;

impl Collector for SecurityCollector {
    fn stage_kind(&self) -> StageKind {
        StageKind::SecurityScan
    }

    fn collect(
        &self,
        _spec: &ProblemSpec,
        outcome: &StageOutcome,
        scratch: &Path,
    ) -> Result<Metrics, CollectError> {
        let report = read_json_report(scratch, &[SCAN_REPORT, SCAN_REPORT_ALT])?;
        let mut security = match report {
            Some((_, json)) => parse_report(&json)?,
            // A scan that produced no report still asserts compliance
            // when it ran cleanly; finding counts default to zero.
            None => SecurityMetrics::default(),
        };
        if outcome.is_policy_violation() {
            security.runtime_compliance = 0.0;
        }
        Ok(Metrics {
            security: Some(security),
            ..Metrics::default()
        })
    }
}

fn parse_report(json: &serde_json::Value) -> Result<SecurityMetrics, CollectError> {
    let mut security = SecurityMetrics::default();

    if let Some(findings) = json.get("findings").and_then(|f| f.as_array()) {
        for finding in findings {
            let severity = finding
                .get("severity")
                .and_then(|s| s.as_str())
                .ok_or_else(|| CollectError::parse("scan", "finding without severity"))?;
            match severity.to_ascii_lowercase().as_str() {
                "critical" => security.critical += 1,
                "high" => security.high += 1,
                "medium" => security.medium += 1,
                "low" | "info" | "informational" => security.low += 1,
                other => {
                    return Err(CollectError::parse(
                        "scan",
                        format!("unknown severity '{other}'"),
                    ))
                }
            }
        }
        return Ok(security);
    }

    security.critical = count_field(json, "critical");
    security.high = count_field(json, "high");
    security.medium = count_field(json, "medium");
    security.low = count_field(json, "low");
    Ok(security)
}

fn count_field(json: &serde_json::Value, key: &str) -> u64 {
    json.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

// ============================================================================
// Tests
// ============================================================================
