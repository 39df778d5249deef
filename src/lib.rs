//! # Req2Run Engine: Sandboxed Evaluation Pipelines
//!
//! The engine evaluates candidate software implementations against
//! declarative problem specifications: given one [`spec::ProblemSpec`]
//! and one [`spec::Submission`], it provisions an isolated sandbox per
//! stage, drives the submission through a deterministic pipeline
//! (build → deploy → functional test → performance test → security scan →
//! quality check), collects typed metrics, computes a weighted score, and
//! persists a signed result record.
//!
//! ## Core Concepts
//!
//! - **Jobs**: one (problem, submission) pair, scheduled fairly across
//!   submitters under bounded concurrency
//! - **Sandboxes**: isolated execution contexts with enforced resource
//!   caps and default-deny egress, one per stage
//! - **Stages**: strictly sequential steps whose outcomes are typed
//!   values, never exceptions
//! - **Evidence**: append-only per-run directories holding logs, metric
//!   lines, artifacts, and the signed result
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use req2run_engine::config::EngineConfig;
//! use req2run_engine::sandbox::local::LocalProcessSandbox;
//! use req2run_engine::scheduler::{Job, Scheduler};
//! use req2run_engine::spec::{ProblemSpec, StageKind, StageSpec, Submission};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env()?;
//! req2run_engine::telemetry::init(&config);
//!
//! let scheduler = Scheduler::new(config, Arc::new(LocalProcessSandbox::new()));
//!
//! let spec = Arc::new(
//!     ProblemSpec::builder("http-health-check")
//!         .stage(StageSpec::new(
//!             "build",
//!             StageKind::Build,
//!             vec!["make".into(), "build".into()],
//!         ))
//!         .build(),
//! );
//! let submission = Arc::new(Submission::new("sub-042", "./candidates/sub-042"));
//!
//! let job_id = scheduler.submit(Job::new(spec, submission, "team-a"))?;
//! let result = scheduler
//!     .await_result(&job_id, Duration::from_secs(600))
//!     .await?;
//! println!("passed: {}", result.passed());
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure Model
//!
//! Failures cross module boundaries only as typed values. Everything at
//! or below the stage runner maps into a
//! [`outcome::StageOutcome`]; only scheduler-level rejections
//! (`CapacityExceeded`, `QueueFull`, …) surface to the caller, at submit
//! time. Infrastructure faults abort a run and re-enqueue its job at most
//! once; submission-attributable failures are final and feed scoring.
//!
//! ## Module Guide
//!
//! - [`spec`] - Problem specifications, submissions, scoring weights
//! - [`sandbox`] - Sandbox provider seam and its variants
//! - [`runner`] - Single-stage execution and output capture
//! - [`collectors`] - Per-stage metric collectors
//! - [`metrics`] - Typed metric payloads and the per-run record
//! - [`scorer`] - Deterministic weighted aggregation and grading
//! - [`pipeline`] - The per-run orchestrator state machine
//! - [`scheduler`] - Fair bounded-concurrency dispatch
//! - [`evidence`] - Append-only evidence persistence
//! - [`result`] - The terminal result record

pub mod cancel;
pub mod collectors;
pub mod config;
pub mod evidence;
pub mod metrics;
pub mod outcome;
pub mod pipeline;
pub mod result;
pub mod runner;
pub mod sandbox;
pub mod scheduler;
pub mod scorer;
pub mod spec;
pub mod telemetry;
mod util;
