//! Typed metric payloads and the per-run [`Metrics`] record.
//!
//! Stage output is dynamically shaped (structured stdout lines, scanner
//! JSON, coverage reports); everything the scorer consumes is first
//! narrowed into the closed [`MetricValue`] variant so the aggregation
//! step can pattern-match instead of sniffing JSON.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

// ============================================================================
// MetricValue
// ============================================================================

/// A single captured metric payload.
///
/// Closed tagged variant: collectors produce these, the scorer matches on
/// them. New shapes require a new variant and explicit handling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum MetricValue {
    Number(f64),
    Counts(FxHashMap<String, u64>),
    Histogram(LatencyHistogram),
    Text(String),
}

impl MetricValue {
    /// Numeric view of this value. `Text` and structured payloads have no
    /// numeric projection and return `None`; the scorer substitutes 0 and
    /// records a quality penalty for flagged keys.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Counts(_) => "counts",
            Self::Histogram(_) => "histogram",
            Self::Text(_) => "text",
        }
    }
}

// ============================================================================
// Latency histogram
// ============================================================================

/// One bucket of a log-scaled latency histogram.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramBucket {
    /// Inclusive upper boundary of the bucket, in milliseconds.
    pub upper_ms: f64,
    pub count: u64,
}

/// Bucketed, log-scaled latency distribution produced by the load
/// generator during the performance stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyHistogram {
    /// Buckets in ascending `upper_ms` order.
    pub buckets: Vec<HistogramBucket>,
}

impl LatencyHistogram {
    /// Minimum observation count below which percentiles are marked
    /// low-confidence and weighted at 50% by the scorer.
    pub const CONFIDENCE_FLOOR: u64 = 1_000;

    #[must_use]
    pub fn new(buckets: Vec<HistogramBucket>) -> Self {
        let mut buckets = buckets;
        buckets.sort_by(|a, b| a.upper_ms.total_cmp(&b.upper_ms));
        Self { buckets }
    }

    /// Total number of recorded observations.
    #[must_use]
    pub fn observations(&self) -> u64 {
        self.buckets.iter().map(|b| b.count).sum()
    }

    #[must_use]
    pub fn is_low_confidence(&self) -> bool {
        self.observations() < Self::CONFIDENCE_FLOOR
    }

    /// Percentile by cumulative bucket crossing.
    ///
    /// Reports the upper boundary of the first bucket whose cumulative
    /// count reaches the requested rank; a rank landing exactly on a
    /// bucket edge resolves to that bucket's upper boundary (ties break
    /// upward, never interpolated downward).
    #[must_use]
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let total = self.observations();
        if total == 0 || !(0.0..=100.0).contains(&p) {
            return None;
        }
        let rank = ((p / 100.0) * total as f64).ceil().max(1.0) as u64;
        let mut cumulative = 0u64;
        for bucket in &self.buckets {
            cumulative += bucket.count;
            if cumulative >= rank {
                return Some(bucket.upper_ms);
            }
        }
        self.buckets.last().map(|b| b.upper_ms)
    }
}

// ============================================================================
// Sub-records
// ============================================================================

/// Latency/throughput measurements from the performance stage.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub rps: f64,
    pub error_rate: f64,
    /// Fewer than [`LatencyHistogram::CONFIDENCE_FLOOR`] observations
    /// backed the percentiles; the scorer halves their weight.
    pub low_confidence: bool,
}

/// Lint findings tallied by severity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintCounts {
    pub error: u64,
    pub warning: u64,
    pub info: u64,
}

/// Code-quality measurements. A missing report leaves the corresponding
/// field `None`; the scorer redistributes its weight across the present
/// quality components.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Line coverage in [0, 1].
    pub line_coverage: Option<f64>,
    pub cyclomatic_avg: Option<f64>,
    pub lint: Option<LintCounts>,
    /// Documentation coverage in [0, 1].
    pub documentation: Option<f64>,
}

/// Vulnerability tallies plus runtime policy compliance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecurityMetrics {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    /// 1.0 when no sandbox policy violation and no egress breach attempt
    /// occurred during the run, otherwise 0.0.
    pub runtime_compliance: f64,
}

impl Default for SecurityMetrics {
    fn default() -> Self {
        Self {
            critical: 0,
            high: 0,
            medium: 0,
            low: 0,
            runtime_compliance: 1.0,
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// The full per-run metrics record the scorer consumes.
///
/// `None` components were never collected (their stage did not run or
/// produced nothing usable); the scorer treats them as 0 unless the spec
/// weights the component at zero, in which case the component is omitted
/// from weight normalization entirely.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Fraction of MUST requirements fully witnessed by passing tests,
    /// plus the SHOULD bonus, in [0, 1].
    pub functional_coverage: Option<f64>,
    /// Fraction of executed tests that passed, in [0, 1].
    pub test_pass_rate: Option<f64>,
    pub performance: Option<PerformanceMetrics>,
    pub quality: Option<QualityMetrics>,
    pub security: Option<SecurityMetrics>,
    /// Metric keys a stage emitted with a non-numeric payload where a
    /// numeric one was required downstream. Each costs a quality penalty.
    #[serde(default)]
    pub flagged_keys: Vec<String>,
}

impl Metrics {
    /// Merge a collector's partial record into the accumulated run record.
    /// Later stages never overwrite earlier components with `None`.
    pub fn absorb(&mut self, partial: Metrics) {
        if partial.functional_coverage.is_some() {
            self.functional_coverage = partial.functional_coverage;
        }
        if partial.test_pass_rate.is_some() {
            self.test_pass_rate = partial.test_pass_rate;
        }
        if partial.performance.is_some() {
            self.performance = partial.performance;
        }
        if partial.quality.is_some() {
            self.quality = partial.quality;
        }
        if partial.security.is_some() {
            self.security = partial.security;
        }
        self.flagged_keys.extend(partial.flagged_keys);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram(counts: &[(f64, u64)]) -> LatencyHistogram {
        LatencyHistogram::new(
            counts
                .iter()
                .map(|&(upper_ms, count)| HistogramBucket { upper_ms, count })
                .collect(),
        )
    }

    #[test]
    fn percentile_crosses_cumulative_buckets() {
        let h = histogram(&[(10.0, 50), (20.0, 30), (40.0, 15), (80.0, 5)]);
        assert_eq!(h.observations(), 100);
        assert_eq!(h.percentile(50.0), Some(10.0));
        assert_eq!(h.percentile(95.0), Some(40.0));
        assert_eq!(h.percentile(99.0), Some(80.0));
    }

    #[test]
    fn percentile_tie_resolves_to_upper_boundary() {
        // p50 of 100 observations lands exactly on the first bucket's edge.
        let h = histogram(&[(10.0, 50), (20.0, 50)]);
        assert_eq!(h.percentile(50.0), Some(10.0));
        // One observation past the edge crosses into the next bucket.
        let h = histogram(&[(10.0, 49), (20.0, 51)]);
        assert_eq!(h.percentile(50.0), Some(20.0));
    }

    #[test]
    fn empty_histogram_has_no_percentiles() {
        let h = LatencyHistogram::default();
        assert_eq!(h.percentile(95.0), None);
        assert!(h.is_low_confidence());
    }

    #[test]
    fn confidence_floor() {
        let h = histogram(&[(10.0, 999)]);
        assert!(h.is_low_confidence());
        let h = histogram(&[(10.0, 1_000)]);
        assert!(!h.is_low_confidence());
    }

    #[test]
    fn buckets_are_sorted_on_construction() {
        let h = histogram(&[(80.0, 1), (10.0, 99)]);
        assert_eq!(h.buckets[0].upper_ms, 10.0);
        assert_eq!(h.percentile(50.0), Some(10.0));
    }

    #[test]
    fn absorb_keeps_earlier_components() {
        let mut acc = Metrics {
            test_pass_rate: Some(0.9),
            ..Metrics::default()
        };
        acc.absorb(Metrics {
            security: Some(SecurityMetrics::default()),
            ..Metrics::default()
        });
        assert_eq!(acc.test_pass_rate, Some(0.9));
        assert!(acc.security.is_some());
    }

    #[test]
    fn metric_value_numeric_projection() {
        assert_eq!(MetricValue::Number(3.5).as_number(), Some(3.5));
        assert_eq!(MetricValue::Text("fast".into()).as_number(), None);
    }

    #[test]
    fn metrics_round_trip_json() {
        let m = Metrics {
            functional_coverage: Some(1.0),
            test_pass_rate: Some(0.85),
            performance: Some(PerformanceMetrics {
                p50_ms: 12.0,
                p95_ms: 140.0,
                p99_ms: 220.0,
                rps: 350.0,
                error_rate: 0.01,
                low_confidence: false,
            }),
            quality: Some(QualityMetrics::default()),
            security: Some(SecurityMetrics::default()),
            flagged_keys: vec!["speed".into()],
        };
        let json = serde_json::to_string(&m).unwrap();
        let parsed: Metrics = serde_json::from_str(&json).unwrap();
        assert_eq!(m, parsed);
    }
}
