//! Quality collector: coverage, complexity, lint, and documentation.
//!
//! Reads `quality-report.json` from scratch:
//!
//! ```json
//! {
//!   "line_coverage": 0.83,
//!   "cyclomatic_avg": 6.2,
//!   "lint": {"error": 0, "warning": 4, "info": 12},
//!   "documentation": 0.55
//! }
//! ```
//!
//! Individual reports (`coverage.json`, `complexity.json`, `lint.json`)
//! are accepted as fallbacks. Any missing field stays `None`; the scorer
//! redistributes its weight across the present quality components.

use std::path::Path;

use crate::metrics::{LintCounts, Metrics, QualityMetrics};
use crate::outcome::StageOutcome;
use crate::spec::{ProblemSpec, StageKind};

use super::{read_json_report, CollectError, Collector};

const COMBINED_REPORT: &str = "quality-report.json";
const COVERAGE_REPORT: &str = "coverage.json";
const COMPLEXITY_REPORT: &str = "complexity.json";
const LINT_REPORT: &str = "lint.json";

pub struct QualityCollector;

impl Collector for QualityCollector {
    fn stage_kind(&self) -> StageKind {
        StageKind::QualityCheck
    }

    fn collect(
        &self,
        _spec: &ProblemSpec,
        _outcome: &StageOutcome,
        scratch: &Path,
    ) -> Result<Metrics, CollectError> {
        let mut quality = QualityMetrics::default();

        if let Some((_, json)) = read_json_report(scratch, &[COMBINED_REPORT])? {
            quality.line_coverage = json.get("line_coverage").and_then(|v| v.as_f64());
            quality.cyclomatic_avg = json.get("cyclomatic_avg").and_then(|v| v.as_f64());
            quality.documentation = json.get("documentation").and_then(|v| v.as_f64());
            quality.lint = json.get("lint").map(parse_lint);
        } else {
            if let Some((_, json)) = read_json_report(scratch, &[COVERAGE_REPORT])? {
                quality.line_coverage = json.get("line_coverage").and_then(|v| v.as_f64());
            }
            if let Some((_, json)) = read_json_report(scratch, &[COMPLEXITY_REPORT])? {
                quality.cyclomatic_avg = json.get("cyclomatic_avg").and_then(|v| v.as_f64());
            }
            if let Some((_, json)) = read_json_report(scratch, &[LINT_REPORT])? {
                quality.lint = Some(parse_lint(&json));
            }
        }

        if quality == QualityMetrics::default() {
            // No report of any kind: leave the component missing.
            return Ok(Metrics::default());
        }
        Ok(Metrics {
            quality: Some(quality),
            ..Metrics::default()
        })
    }
}

fn parse_lint(json: &serde_json::Value) -> LintCounts {
    LintCounts {
        error: json.get("error").and_then(|v| v.as_u64()).unwrap_or(0),
        warning: json.get("warning").and_then(|v| v.as_u64()).unwrap_or(0),
        info: json.get("info").and_then(|v| v.as_u64()).unwrap_or(0),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::StageSpec;
    use std::path::PathBuf;

    fn spec() -> ProblemSpec {
        ProblemSpec::builder("p")
            .stage(StageSpec::new("quality", StageKind::QualityCheck, vec![]))
            .build()
    }

    fn outcome() -> StageOutcome {
        StageOutcome::success("quality", StageKind::QualityCheck, PathBuf::new())
    }

    #[test]
    fn combined_report_fills_every_field() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(COMBINED_REPORT),
            serde_json::json!({
                "line_coverage": 0.83,
                "cyclomatic_avg": 6.2,
                "lint": {"error": 0, "warning": 4, "info": 12},
                "documentation": 0.55,
            })
            .to_string(),
        )
        .unwrap();

        let metrics = QualityCollector
            .collect(&spec(), &outcome(), tmp.path())
            .unwrap();
        let q = metrics.quality.unwrap();
        assert_eq!(q.line_coverage, Some(0.83));
        assert_eq!(q.cyclomatic_avg, Some(6.2));
        assert_eq!(q.documentation, Some(0.55));
        assert_eq!(q.lint.unwrap().warning, 4);
    }

    #[test]
    fn individual_reports_are_fallbacks() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(COVERAGE_REPORT),
            serde_json::json!({"line_coverage": 0.6}).to_string(),
        )
        .unwrap();
        std::fs::write(
            tmp.path().join(LINT_REPORT),
            serde_json::json!({"error": 2}).to_string(),
        )
        .unwrap();

        let metrics = QualityCollector
            .collect(&spec(), &outcome(), tmp.path())
            .unwrap();
        let q = metrics.quality.unwrap();
        assert_eq!(q.line_coverage, Some(0.6));
        assert_eq!(q.cyclomatic_avg, None);
        assert_eq!(q.lint.unwrap().error, 2);
    }

    #[test]
    fn no_report_leaves_component_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = QualityCollector
            .collect(&spec(), &outcome(), tmp.path())
            .unwrap();
        assert!(metrics.quality.is_none());
    }
}
