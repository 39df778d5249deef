//! Shared spec/submission/config fixtures for the integration suite.

use std::sync::Arc;
use std::time::Duration;

use req2run_engine::config::{EngineConfig, HostCapacity};
use req2run_engine::spec::{
    NonFunctionalTargets, OnFailure, ProblemSpec, Requirement, RequirementPriority, StageKind,
    StageSpec, Submission,
};

/// A stage whose command is just its own name, so the stub provider can
/// key scripts on argv[0].
pub fn stage(name: &str, kind: StageKind) -> StageSpec {
    StageSpec::new(name, kind, vec![name.to_string()]).with_timeout(Duration::from_secs(60))
}

/// The full six-stage pipeline with one MUST requirement per test id in
/// `must_tests`, scored against a 100 ms p95 target.
pub fn full_pipeline_spec(id: &str, must_tests: &[&str]) -> ProblemSpec {
    let mut builder = ProblemSpec::builder(id)
        .category("web-api")
        .stage(stage("build", StageKind::Build))
        .stage(stage("deploy", StageKind::Deploy))
        .stage(stage("functional", StageKind::FunctionalTest))
        .stage(stage("performance", StageKind::PerformanceTest).with_on_failure(OnFailure::Continue))
        .stage(stage("security", StageKind::SecurityScan))
        .stage(stage("quality", StageKind::QualityCheck))
        .targets(NonFunctionalTargets {
            p95_target_ms: 100.0,
            throughput_floor_rps: 100.0,
        });
    for (i, test_id) in must_tests.iter().enumerate() {
        builder = builder
            .requirement(Requirement::new(
                format!("REQ-{i:03}"),
                RequirementPriority::Must,
                vec![test_id.to_string()],
            ))
            .test_case(*test_id, format!("requirement {i} witness"));
    }
    builder.build()
}

/// A single build-only spec for scheduler-focused tests.
pub fn single_stage_spec(id: &str) -> ProblemSpec {
    ProblemSpec::builder(id)
        .stage(stage("build", StageKind::Build))
        .build()
}

pub fn submission(id: &str) -> Arc<Submission> {
    Arc::new(Submission::new(id, format!("/tmp/candidates/{id}")))
}

/// Engine config rooted in a per-test temp directory.
pub fn test_config(evidence_root: &std::path::Path) -> EngineConfig {
    EngineConfig::default()
        .with_evidence_root(evidence_root)
        .with_max_concurrency(4)
        .with_queue_high_water(64)
        .with_host_capacity(HostCapacity {
            cpu_cores: 64.0,
            memory_bytes: 64 * 1024 * 1024 * 1024,
            sandboxes: 16,
        })
}

/// Manifest JSON for the functional stage: every id in `passing` passes,
/// every id in `failing` fails.
pub fn test_manifest(passing: &[&str], failing: &[&str]) -> String {
    let tests: Vec<serde_json::Value> = passing
        .iter()
        .map(|id| serde_json::json!({"id": id, "passed": true}))
        .chain(
            failing
                .iter()
                .map(|id| serde_json::json!({"id": id, "passed": false})),
        )
        .collect();
    serde_json::json!({ "tests": tests }).to_string()
}

/// A latency histogram whose p95 lands on `p95_ms`, with enough
/// observations to be full-confidence.
pub fn histogram_with_p95(p95_ms: f64) -> String {
    serde_json::json!({
        "buckets": [
            {"upper_ms": p95_ms / 4.0, "count": 900},
            {"upper_ms": p95_ms / 2.0, "count": 40},
            {"upper_ms": p95_ms, "count": 55},
            {"upper_ms": p95_ms * 2.0, "count": 5},
        ]
    })
    .to_string()
}
