//! Problem specifications and candidate submissions — the two immutable
//! inputs of an evaluation run.
//!
//! A [`ProblemSpec`] declares what the pipeline should do to a candidate:
//! which stages run, under which resource and time budgets, which
//! requirements gate the grade, and how the final score is weighted. A
//! [`Submission`] is just an identifier plus a path to candidate source.
//!
//! Specs arrive already validated by the catalog tooling; this module only
//! re-checks the parts the engine itself depends on (weight overrides,
//! stage ordering) and freezes a checksum for the determinism descriptor.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ============================================================================
// Stage descriptors
// ============================================================================

/// The kind of work a pipeline stage performs.
///
/// Stage kinds are closed: collectors and the orchestrator match on them,
/// and new kinds require explicit linkage (no runtime plugin discovery).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Build,
    Deploy,
    FunctionalTest,
    PerformanceTest,
    SecurityScan,
    QualityCheck,
}

impl StageKind {
    /// The canonical pipeline order. The orchestrator sequences stages in
    /// exactly this order; a spec may omit stages but never reorder them.
    pub const PIPELINE_ORDER: [StageKind; 6] = [
        StageKind::Build,
        StageKind::Deploy,
        StageKind::FunctionalTest,
        StageKind::PerformanceTest,
        StageKind::SecurityScan,
        StageKind::QualityCheck,
    ];

    /// Position of this kind in the canonical order.
    #[must_use]
    pub fn ordinal(self) -> usize {
        Self::PIPELINE_ORDER
            .iter()
            .position(|k| *k == self)
            .unwrap_or(usize::MAX)
    }

    /// Stages after Deploy that exercise a running service need the
    /// endpoint the deploy stage published.
    #[must_use]
    pub fn needs_endpoint(self) -> bool {
        matches!(self, StageKind::FunctionalTest | StageKind::PerformanceTest)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Build => "build",
            Self::Deploy => "deploy",
            Self::FunctionalTest => "functional_test",
            Self::PerformanceTest => "performance_test",
            Self::SecurityScan => "security_scan",
            Self::QualityCheck => "quality_check",
        };
        write!(f, "{label}")
    }
}

/// What the orchestrator does when a stage fails for submission-attributable
/// reasons (requirement failure, timeout, resource cap, crash).
///
/// Infrastructure faults ignore this policy — they always abort the run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Keep running the remaining stages; the failed stage scores zero.
    Continue,
    /// Skip straight to aggregation with remaining sub-scores at zero.
    #[default]
    ShortCircuit,
}

/// One declared step of the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Human-readable stage name, used in evidence paths (`<nn>-<name>`).
    pub name: String,
    pub kind: StageKind,
    /// Command template argv. Tokens `{workspace}`, `{scratch}`,
    /// `{endpoint}`, `{port}` are substituted literally before exec.
    pub command: Vec<String>,
    /// Wall-clock budget enforced by the stage runner.
    pub timeout: Duration,
    /// Non-zero exit codes that still count as success for this stage.
    #[serde(default)]
    pub tolerated_exit_codes: Vec<i32>,
    #[serde(default)]
    pub on_failure: OnFailure,
}

impl StageSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: StageKind, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            command,
            timeout: Duration::from_secs(300),
            tolerated_exit_codes: Vec::new(),
            on_failure: OnFailure::default(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tolerated_exits(mut self, codes: Vec<i32>) -> Self {
        self.tolerated_exit_codes = codes;
        self
    }

    #[must_use]
    pub fn with_on_failure(mut self, policy: OnFailure) -> Self {
        self.on_failure = policy;
        self
    }

    /// Whether `exit_code` satisfies this stage's success criteria.
    #[must_use]
    pub fn exit_ok(&self, exit_code: i32) -> bool {
        exit_code == 0 || self.tolerated_exit_codes.contains(&exit_code)
    }
}

// ============================================================================
// Resource & network policy
// ============================================================================

/// Hard caps applied to every sandbox a run provisions.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceCaps {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub pids: u32,
}

impl Default for ResourceCaps {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_bytes: 512 * 1024 * 1024,
            disk_bytes: 1024 * 1024 * 1024,
            pids: 128,
        }
    }
}

/// Sandbox egress policy. Deny-all unless the spec lists endpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "allow")]
pub enum EgressPolicy {
    #[default]
    DenyAll,
    /// Host:port or URL endpoints the sandbox may reach.
    AllowList(Vec<String>),
}

impl EgressPolicy {
    #[must_use]
    pub fn is_deny_all(&self) -> bool {
        matches!(self, Self::DenyAll)
    }
}

// ============================================================================
// Requirements & targets
// ============================================================================

/// Requirement priority tags. MUST gates the grade, SHOULD contributes a
/// bonus, MAY is informational.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequirementPriority {
    May,
    Should,
    Must,
}

impl fmt::Display for RequirementPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Must => write!(f, "MUST"),
            Self::Should => write!(f, "SHOULD"),
            Self::May => write!(f, "MAY"),
        }
    }
}

/// One functional requirement and the tests that witness it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub priority: RequirementPriority,
    /// Test case ids whose collective pass satisfies this requirement.
    pub test_ids: Vec<String>,
}

impl Requirement {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        priority: RequirementPriority,
        test_ids: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            test_ids,
        }
    }
}

/// A declared test case.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub name: String,
}

/// Non-functional targets the performance stage is scored against.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NonFunctionalTargets {
    /// Target p95 latency in milliseconds. Latency score is 100 at or
    /// below target, decaying linearly to 0 at twice the target.
    pub p95_target_ms: f64,
    /// Throughput floor in requests per second.
    pub throughput_floor_rps: f64,
}

impl Default for NonFunctionalTargets {
    fn default() -> Self {
        Self {
            p95_target_ms: 100.0,
            throughput_floor_rps: 100.0,
        }
    }
}

// ============================================================================
// Scoring weights
// ============================================================================

/// Per-component scoring weights. Overrides are normalized to sum to 1.0
/// before use; a component weighted at zero is omitted from normalization
/// when its metrics are missing.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub functional: f64,
    pub test: f64,
    pub performance: f64,
    pub quality: f64,
    pub security: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            functional: 0.35,
            test: 0.25,
            performance: 0.15,
            quality: 0.15,
            security: 0.10,
        }
    }
}

/// A spec's weight override failed validation.
///
/// Surfaced at enqueue time, never at dispatch.
#[derive(Debug, Error, Diagnostic)]
pub enum WeightError {
    #[error("weight for '{component}' is {value}, expected a finite value >= 0")]
    #[diagnostic(
        code(req2run::spec::negative_weight),
        help("Every scoring weight must be a finite non-negative number.")
    )]
    Invalid { component: &'static str, value: f64 },

    #[error("weights sum to {sum}, cannot be normalized")]
    #[diagnostic(
        code(req2run::spec::degenerate_weights),
        help("At least one scoring weight must be positive.")
    )]
    DegenerateSum { sum: f64 },
}

impl ScoringWeights {
    fn components(&self) -> [(&'static str, f64); 5] {
        [
            ("functional", self.functional),
            ("test", self.test),
            ("performance", self.performance),
            ("quality", self.quality),
            ("security", self.security),
        ]
    }

    /// Validate and normalize so the components sum to exactly 1.0.
    pub fn normalized(&self) -> Result<ScoringWeights, WeightError> {
        for (component, value) in self.components() {
            if !value.is_finite() || value < 0.0 {
                return Err(WeightError::Invalid { component, value });
            }
        }
        let sum: f64 = self.components().iter().map(|(_, v)| v).sum();
        if sum <= 0.0 {
            return Err(WeightError::DegenerateSum { sum });
        }
        Ok(ScoringWeights {
            functional: self.functional / sum,
            test: self.test / sum,
            performance: self.performance / sum,
            quality: self.quality / sum,
            security: self.security / sum,
        })
    }
}

// ============================================================================
// ProblemSpec
// ============================================================================

/// Difficulty tier of a benchmark problem. Informational for scoring, used
/// by the catalog for grouping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifficultyTier {
    Basic,
    #[default]
    Intermediate,
    Advanced,
    Expert,
}

/// One declarative benchmark problem, frozen for the lifetime of a run.
///
/// The engine consumes specs already validated by the catalog tooling;
/// [`ProblemSpec::checksum`] freezes the exact bytes that went into a run
/// so results are reproducible and attributable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProblemSpec {
    pub id: String,
    pub tier: DifficultyTier,
    pub category: String,
    /// Stage descriptors in pipeline order.
    pub stages: Vec<StageSpec>,
    pub caps: ResourceCaps,
    #[serde(default)]
    pub egress: EgressPolicy,
    pub requirements: Vec<Requirement>,
    pub tests: Vec<TestCase>,
    pub targets: NonFunctionalTargets,
    /// Optional override of the default scoring weights.
    #[serde(default)]
    pub weights: Option<ScoringWeights>,
    /// Declared external service dependencies (named, resolved by the
    /// deployment, translated into egress allow entries per variant).
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ProblemSpec {
    /// Start building a spec. Category defaults to `"general"`.
    #[must_use]
    pub fn builder(id: impl Into<String>) -> ProblemSpecBuilder {
        ProblemSpecBuilder::new(id)
    }

    /// The effective weights for this spec: the override when present,
    /// defaults otherwise, always normalized.
    pub fn effective_weights(&self) -> Result<ScoringWeights, WeightError> {
        self.weights.unwrap_or_default().normalized()
    }

    /// SHA-256 over the spec's canonical JSON form, hex-encoded.
    ///
    /// Recorded in the determinism descriptor of every result; two runs
    /// with the same checksum saw byte-identical specs.
    #[must_use]
    pub fn checksum(&self) -> String {
        // Serialization of a fully-owned struct cannot fail.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        crate::util::hex_encode(&digest)
    }

    /// MUST-priority requirements, the grade gate.
    pub fn must_requirements(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements
            .iter()
            .filter(|r| r.priority == RequirementPriority::Must)
    }

    /// SHOULD-priority requirements, the bonus pool.
    pub fn should_requirements(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements
            .iter()
            .filter(|r| r.priority == RequirementPriority::Should)
    }

    /// Sum of stage wall-clock budgets, used for the termination bound.
    #[must_use]
    pub fn total_stage_budget(&self) -> Duration {
        self.stages.iter().map(|s| s.timeout).sum()
    }
}

/// Builder for [`ProblemSpec`].
#[derive(Debug)]
pub struct ProblemSpecBuilder {
    spec: ProblemSpec,
}

impl ProblemSpecBuilder {
    fn new(id: impl Into<String>) -> Self {
        Self {
            spec: ProblemSpec {
                id: id.into(),
                tier: DifficultyTier::default(),
                category: "general".to_string(),
                stages: Vec::new(),
                caps: ResourceCaps::default(),
                egress: EgressPolicy::default(),
                requirements: Vec::new(),
                tests: Vec::new(),
                targets: NonFunctionalTargets::default(),
                weights: None,
                dependencies: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn tier(mut self, tier: DifficultyTier) -> Self {
        self.spec.tier = tier;
        self
    }

    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.spec.category = category.into();
        self
    }

    #[must_use]
    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.spec.stages.push(stage);
        self
    }

    #[must_use]
    pub fn caps(mut self, caps: ResourceCaps) -> Self {
        self.spec.caps = caps;
        self
    }

    #[must_use]
    pub fn egress(mut self, egress: EgressPolicy) -> Self {
        self.spec.egress = egress;
        self
    }

    #[must_use]
    pub fn requirement(mut self, requirement: Requirement) -> Self {
        self.spec.requirements.push(requirement);
        self
    }

    #[must_use]
    pub fn test_case(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.spec.tests.push(TestCase {
            id: id.into(),
            name: name.into(),
        });
        self
    }

    #[must_use]
    pub fn targets(mut self, targets: NonFunctionalTargets) -> Self {
        self.spec.targets = targets;
        self
    }

    #[must_use]
    pub fn weights(mut self, weights: ScoringWeights) -> Self {
        self.spec.weights = Some(weights);
        self
    }

    #[must_use]
    pub fn dependency(mut self, name: impl Into<String>) -> Self {
        self.spec.dependencies.push(name.into());
        self
    }

    /// Finish the build. Stages are sorted into canonical pipeline order;
    /// relative order of same-kind stages is preserved.
    #[must_use]
    pub fn build(mut self) -> ProblemSpec {
        self.spec.stages.sort_by_key(|s| s.kind.ordinal());
        self.spec
    }
}

// ============================================================================
// Submission
// ============================================================================

/// A candidate implementation under evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    /// Root of the candidate source tree, mounted read-only into the
    /// build stage's sandbox.
    pub root: PathBuf,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
}

impl Submission {
    #[must_use]
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            language: None,
            entrypoint: None,
        }
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    #[must_use]
    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
