//! Per-stage metric collectors.
//!
//! Each collector is a pure transform from one [`StageOutcome`] plus the
//! auxiliary files its stage left in scratch to a partial [`Metrics`]
//! record. Collectors never perform I/O outside the run's own scratch
//! and evidence directories, and never mutate anything — the orchestrator
//! absorbs their partial records into the run's accumulated metrics.
//!
//! The registry is a compile-time table: adding a collector means adding
//! a variant arm here, not dropping a plugin into a directory.

pub mod functional;
pub mod performance;
pub mod quality;
pub mod security;

use std::path::Path;

use miette::Diagnostic;
use thiserror::Error;

use crate::metrics::Metrics;
use crate::outcome::StageOutcome;
use crate::spec::{ProblemSpec, StageKind};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, Diagnostic)]
pub enum CollectError {
    #[error("could not read {path}: {source}")]
    #[diagnostic(code(req2run::collectors::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {format} report: {message}")]
    #[diagnostic(
        code(req2run::collectors::parse),
        help("The stage produced a report the collector cannot interpret; see the stage's evidence directory.")
    )]
    Parse { format: &'static str, message: String },
}

impl CollectError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn parse(format: &'static str, message: impl Into<String>) -> Self {
        Self::Parse {
            format,
            message: message.into(),
        }
    }
}

// ============================================================================
// Collector trait & registry
// ============================================================================

/// A pure per-stage transform into partial metrics.
pub trait Collector: Send + Sync {
    /// The stage kind this collector interprets.
    fn stage_kind(&self) -> StageKind;

    /// Transform one outcome (plus auxiliary files in `scratch`) into a
    /// partial metrics record.
    fn collect(
        &self,
        spec: &ProblemSpec,
        outcome: &StageOutcome,
        scratch: &Path,
    ) -> Result<Metrics, CollectError>;
}

static FUNCTIONAL: functional::FunctionalCollector = functional::FunctionalCollector;
static PERFORMANCE: performance::PerformanceCollector = performance::PerformanceCollector;
static SECURITY: security::SecurityCollector = security::SecurityCollector;
static QUALITY: quality::QualityCollector = quality::QualityCollector;

/// The compile-time collector table. Build and deploy stages produce no
/// metrics of their own and have no collector.
#[must_use]
pub fn collector_for(kind: StageKind) -> Option<&'static dyn Collector> {
    match kind {
        StageKind::FunctionalTest => Some(&FUNCTIONAL),
        StageKind::PerformanceTest => Some(&PERFORMANCE),
        StageKind::SecurityScan => Some(&SECURITY),
        StageKind::QualityCheck => Some(&QUALITY),
        StageKind::Build | StageKind::Deploy => None,
    }
}

/// Read an optional JSON report from scratch, trying `names` in order.
pub(crate) fn read_json_report(
    scratch: &Path,
    names: &[&str],
) -> Result<Option<(String, serde_json::Value)>, CollectError> {
    for name in names {
        let path = scratch.join(name);
        if !path.exists() {
            continue;
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| CollectError::io(&path, e))?;
        let value = serde_json::from_str(&raw)
            .map_err(|e| CollectError::parse("json", format!("{name}: {e}")))?;
        return Ok(Some(((*name).to_string(), value)));
    }
    Ok(None)
}
