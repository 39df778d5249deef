//! Performance collector: latency percentiles, throughput, error rate.
//!
//! The load generator leaves `latency-histogram.json` in scratch:
//!
//! ```json
//! {"buckets": [{"upper_ms": 1.0, "count": 12}, {"upper_ms": 2.0, "count": 80}]}
//! ```
//!
//! Throughput and error rate come from the stage's `##METRIC:rps:` and
//! `##METRIC:error_rate:` lines, with a `load-report.json` fallback.
//! Fewer than 1,000 observations marks the percentiles low-confidence;
//! the scorer halves their weight.

use std::path::Path;

use crate::metrics::{HistogramBucket, LatencyHistogram, Metrics, PerformanceMetrics};
use crate::outcome::StageOutcome;
use crate::spec::{ProblemSpec, StageKind};

use super::{read_json_report, CollectError, Collector};

const HISTOGRAM_REPORT: &str = "latency-histogram.json";
const LOAD_REPORT: &str = "load-report.json";

pub struct PerformanceCollector;

impl Collector for PerformanceCollector {
    fn stage_kind(&self) -> StageKind {
        StageKind::PerformanceTest
    }

    fn collect(
        &self,
        _spec: &ProblemSpec,
        outcome: &StageOutcome,
        scratch: &Path,
    ) -> Result<Metrics, CollectError> {
        let Some((_, json)) = read_json_report(scratch, &[HISTOGRAM_REPORT])? else {
            return Ok(Metrics::default());
        };
        let histogram = parse_histogram(&json)?;
        let Some(p50) = histogram.percentile(50.0) else {
            // An empty histogram measures nothing.
            return Ok(Metrics::default());
        };
        let p95 = histogram.percentile(95.0).unwrap_or(p50);
        let p99 = histogram.percentile(99.0).unwrap_or(p95);

        let load = read_json_report(scratch, &[LOAD_REPORT])?.map(|(_, v)| v);
        let rps = outcome
            .metric_number("rps")
            .or_else(|| number_field(load.as_ref(), "rps"))
            .unwrap_or(0.0);
        let error_rate = outcome
            .metric_number("error_rate")
            .or_else(|| number_field(load.as_ref(), "error_rate"))
            .unwrap_or(0.0);

        Ok(Metrics {
            performance: Some(PerformanceMetrics {
                p50_ms: p50,
                p95_ms: p95,
                p99_ms: p99,
                rps,
                error_rate,
                low_confidence: histogram.is_low_confidence(),
            }),
            ..Metrics::default()
        })
    }
}

fn parse_histogram(json: &serde_json::Value) -> Result<LatencyHistogram, CollectError> {
    let buckets = json
        .get("buckets")
        .and_then(|b| b.as_array())
        .ok_or_else(|| CollectError::parse("histogram", "missing 'buckets' array"))?;
    let mut parsed = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        let upper_ms = bucket
            .get("upper_ms")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| CollectError::parse("histogram", "bucket without upper_ms"))?;
        let count = bucket
            .get("count")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| CollectError::parse("histogram", "bucket without count"))?;
        parsed.push(HistogramBucket { upper_ms, count });
    }
    Ok(LatencyHistogram::new(parsed))
}

fn number_field(json: Option<&serde_json::Value>, key: &str) -> Option<f64> {
    json?.get(key)?.as_f64()
}

// ============================================================================
// Tests
// ============================================================================
