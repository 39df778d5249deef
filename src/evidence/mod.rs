//! Append-only, per-run evidence persistence.
//!
//! Layout under the store root:
//!
//! ```text
//! runs/<job-id>/
//!   spec.json                     frozen ProblemSpec used for the run
//!   stages/<nn>-<name>/           sealed stage directory
//!     stdout.log                  verbatim stream capture
//!     stderr.log
//!     metrics.jsonl               structured metric lines, append-ordered
//!     artifacts/                  files a collector or stage preserved
//!   scratch/<nn>-<name>/          stage scratch, republished read-only as
//!                                 the next stage's workspace
//!   result.json                   terminal record (exactly once)
//!   signature                     sha256 over result.json + engine version
//! ```
//!
//! Stage directories are created with a `.partial` suffix and sealed by a
//! single atomic rename at stage end, so a crashed run never leaves a
//! directory that looks complete. Aborted runs are quarantined by
//! renaming the whole run directory with an `.aborted` suffix; later
//! attempts start from a fresh directory and never consult quarantined
//! evidence.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::result::EvalResult;
use crate::spec::ProblemSpec;
use crate::util::hex_encode;

/// Suffix of an unsealed stage directory.
const PARTIAL_SUFFIX: &str = ".partial";
/// Suffix quarantining the evidence of an aborted run.
const ABORTED_SUFFIX: &str = ".aborted";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, Diagnostic)]
pub enum EvidenceError {
    /// A completed result already exists for this job.
    #[error("result already recorded for job '{job_id}'")]
    #[diagnostic(
        code(req2run::evidence::already_completed),
        help("Re-running a completed job requires an explicit overwrite token.")
    )]
    AlreadyCompleted { job_id: String },

    #[error("evidence i/o failed at {path}")]
    #[diagnostic(code(req2run::evidence::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(req2run::evidence::serialize))]
    Serialize(#[from] serde_json::Error),
}

fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> EvidenceError {
    let path = path.into();
    move |source| EvidenceError::Io { path, source }
}

// ============================================================================
// EvidenceStore
// ============================================================================

/// Root of the evidence tree. Cheap to clone; runs own their own
/// subdirectories so no cross-run locking is needed.
#[derive(Clone, Debug)]
pub struct EvidenceStore {
    root: PathBuf,
}

impl EvidenceStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn run_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// Whether a completed (non-quarantined) result exists for this job.
    #[must_use]
    pub fn has_result(&self, job_id: &str) -> bool {
        self.run_dir(job_id).join("result.json").exists()
    }

    /// Open the evidence directory for a fresh run, freezing the spec.
    ///
    /// Refuses when a completed result is already present unless
    /// `overwrite` is set (the explicit overwrite token).
    pub async fn begin_run(
        &self,
        job_id: &str,
        spec: &ProblemSpec,
        overwrite: bool,
    ) -> Result<RunEvidence, EvidenceError> {
        if self.has_result(job_id) && !overwrite {
            return Err(EvidenceError::AlreadyCompleted {
                job_id: job_id.to_string(),
            });
        }

        let run_dir = self.run_dir(job_id);
        if overwrite && run_dir.exists() {
            tokio::fs::remove_dir_all(&run_dir)
                .await
                .map_err(io_err(&run_dir))?;
        }
        tokio::fs::create_dir_all(run_dir.join("stages"))
            .await
            .map_err(io_err(&run_dir))?;
        tokio::fs::create_dir_all(run_dir.join("scratch"))
            .await
            .map_err(io_err(&run_dir))?;

        let spec_path = run_dir.join("spec.json");
        let frozen = serde_json::to_vec_pretty(spec)?;
        tokio::fs::write(&spec_path, frozen)
            .await
            .map_err(io_err(&spec_path))?;

        debug!(job = %job_id, dir = %run_dir.display(), "opened evidence run directory");
        Ok(RunEvidence {
            job_id: job_id.to_string(),
            run_dir,
            next_stage: 0,
        })
    }
}

// ============================================================================
// RunEvidence
// ============================================================================

/// One run's slice of the evidence tree, owned by its orchestrator.
#[derive(Debug)]
pub struct RunEvidence {
    job_id: String,
    run_dir: PathBuf,
    next_stage: u32,
}

impl RunEvidence {
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Scratch directory for the stage at `index`.
    #[must_use]
    pub fn scratch_dir(&self, index: u32, name: &str) -> PathBuf {
        self.run_dir
            .join("scratch")
            .join(format!("{index:02}-{name}"))
    }

    /// Open the next stage's evidence directory (as `.partial` until
    /// sealed). Stage sequence numbers increase monotonically.
    pub async fn begin_stage(&mut self, name: &str) -> Result<StageEvidence, EvidenceError> {
        let index = self.next_stage;
        self.next_stage += 1;

        let sealed_name = format!("{index:02}-{name}");
        let dir = self
            .run_dir
            .join("stages")
            .join(format!("{sealed_name}{PARTIAL_SUFFIX}"));
        tokio::fs::create_dir_all(dir.join("artifacts"))
            .await
            .map_err(io_err(&dir))?;

        let stdout_log = open_append(dir.join("stdout.log")).await?;
        let stderr_log = open_append(dir.join("stderr.log")).await?;
        let metrics_log = open_append(dir.join("metrics.jsonl")).await?;

        Ok(StageEvidence {
            index,
            dir,
            stdout_log,
            stderr_log,
            metrics_log,
        })
    }

    /// Persist the terminal record and its detached signature.
    ///
    /// Exactly-once: refuses when `result.json` already exists unless
    /// `overwrite` is set.
    pub async fn write_result(
        &self,
        result: &EvalResult,
        overwrite: bool,
    ) -> Result<PathBuf, EvidenceError> {
        let result_path = self.run_dir.join("result.json");
        if result_path.exists() && !overwrite {
            return Err(EvidenceError::AlreadyCompleted {
                job_id: self.job_id.clone(),
            });
        }

        let bytes = result.canonical_json();
        tokio::fs::write(&result_path, &bytes)
            .await
            .map_err(io_err(&result_path))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.update(result.engine_version.as_bytes());
        let signature = hex_encode(&hasher.finalize());
        let signature_path = self.run_dir.join("signature");
        tokio::fs::write(&signature_path, signature)
            .await
            .map_err(io_err(&signature_path))?;

        Ok(result_path)
    }

    /// Quarantine this run's partial evidence after an abort. The
    /// directory is renamed with an `.aborted` suffix (uniquified if a
    /// prior attempt already aborted) and never consulted again.
    pub async fn quarantine_aborted(self) -> Result<PathBuf, EvidenceError> {
        let mut target = PathBuf::from(format!("{}{ABORTED_SUFFIX}", self.run_dir.display()));
        let mut attempt = 1u32;
        while target.exists() {
            target = PathBuf::from(format!(
                "{}{ABORTED_SUFFIX}.{attempt}",
                self.run_dir.display()
            ));
            attempt += 1;
        }
        tokio::fs::rename(&self.run_dir, &target)
            .await
            .map_err(io_err(&self.run_dir))?;
        debug!(job = %self.job_id, to = %target.display(), "quarantined aborted run evidence");
        Ok(target)
    }
}

async fn open_append(path: PathBuf) -> Result<tokio::fs::File, EvidenceError> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(io_err(path))
}

// ============================================================================
// StageEvidence
// ============================================================================

/// Append-only writers for one stage's logs and artifacts.
#[derive(Debug)]
pub struct StageEvidence {
    index: u32,
    dir: PathBuf,
    stdout_log: tokio::fs::File,
    stderr_log: tokio::fs::File,
    metrics_log: tokio::fs::File,
}

impl StageEvidence {
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The (still `.partial`) stage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.dir.join("artifacts")
    }

    pub async fn append_stdout(&mut self, bytes: &[u8]) -> Result<(), EvidenceError> {
        self.stdout_log
            .write_all(bytes)
            .await
            .map_err(io_err(self.dir.join("stdout.log")))
    }

    pub async fn append_stderr(&mut self, bytes: &[u8]) -> Result<(), EvidenceError> {
        self.stderr_log
            .write_all(bytes)
            .await
            .map_err(io_err(self.dir.join("stderr.log")))
    }

    /// Append one structured metric record as a JSON line.
    pub async fn append_metric(
        &mut self,
        record: &serde_json::Value,
    ) -> Result<(), EvidenceError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.metrics_log
            .write_all(&line)
            .await
            .map_err(io_err(self.dir.join("metrics.jsonl")))
    }

    /// Flush, sync, and atomically rename the directory to its sealed
    /// name. Returns the sealed path.
    pub async fn seal(mut self) -> Result<PathBuf, EvidenceError> {
        self.stdout_log
            .sync_all()
            .await
            .map_err(io_err(self.dir.join("stdout.log")))?;
        self.stderr_log
            .sync_all()
            .await
            .map_err(io_err(self.dir.join("stderr.log")))?;
        self.metrics_log
            .sync_all()
            .await
            .map_err(io_err(self.dir.join("metrics.jsonl")))?;

        let sealed = sealed_path(&self.dir);
        tokio::fs::rename(&self.dir, &sealed)
            .await
            .map_err(io_err(&self.dir))?;
        Ok(sealed)
    }
}

fn sealed_path(partial: &Path) -> PathBuf {
    let raw = partial.to_string_lossy();
    PathBuf::from(raw.strip_suffix(PARTIAL_SUFFIX).unwrap_or(&raw).to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ProblemSpec, StageKind, StageSpec};

    fn spec() -> ProblemSpec {
        ProblemSpec::builder("p1")
            .stage(StageSpec::new("build", StageKind::Build, vec!["make".into()]))
            .build()
    }

    fn store(dir: &tempfile::TempDir) -> EvidenceStore {
        EvidenceStore::new(dir.path().join("runs"))
    }

    #[tokio::test]
    async fn run_layout_is_created_and_spec_frozen() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let run = store.begin_run("job-1", &spec(), false).await.unwrap();

        assert!(run.run_dir().join("stages").is_dir());
        let frozen = std::fs::read_to_string(run.run_dir().join("spec.json")).unwrap();
        let parsed: ProblemSpec = serde_json::from_str(&frozen).unwrap();
        assert_eq!(parsed.id, "p1");
    }

    #[tokio::test]
    async fn stage_dirs_seal_atomically() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let mut run = store.begin_run("job-1", &spec(), false).await.unwrap();

        let mut stage = run.begin_stage("build").await.unwrap();
        stage.append_stdout(b"compiling\n").await.unwrap();
        stage
            .append_metric(&serde_json::json!({"key": "requests", "value": 7}))
            .await
            .unwrap();
        let partial = stage.dir().to_path_buf();
        assert!(partial.to_string_lossy().ends_with(".partial"));

        let sealed = stage.seal().await.unwrap();
        assert!(!partial.exists());
        assert!(sealed.join("stdout.log").exists());
        assert!(sealed.ends_with("00-build"));
    }

    #[tokio::test]
    async fn stage_indices_are_monotonic() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let mut run = store.begin_run("job-1", &spec(), false).await.unwrap();
        let a = run.begin_stage("build").await.unwrap();
        let b = run.begin_stage("deploy").await.unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
    }

    #[tokio::test]
    async fn result_is_written_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let run = store.begin_run("job-1", &spec(), false).await.unwrap();
        let result = sample_result();

        run.write_result(&result, false).await.unwrap();
        assert!(run.run_dir().join("signature").exists());

        let refused = run.write_result(&result, false).await;
        assert!(matches!(
            refused,
            Err(EvidenceError::AlreadyCompleted { .. })
        ));
        // The explicit overwrite token is honoured.
        run.write_result(&result, true).await.unwrap();
    }

    #[tokio::test]
    async fn completed_runs_refuse_a_second_begin() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let run = store.begin_run("job-1", &spec(), false).await.unwrap();
        run.write_result(&sample_result(), false).await.unwrap();

        let refused = store.begin_run("job-1", &spec(), false).await;
        assert!(matches!(
            refused,
            Err(EvidenceError::AlreadyCompleted { .. })
        ));
        assert!(store.begin_run("job-1", &spec(), true).await.is_ok());
    }

    #[tokio::test]
    async fn aborted_runs_are_quarantined() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let run = store.begin_run("job-1", &spec(), false).await.unwrap();
        let quarantined = run.quarantine_aborted().await.unwrap();

        assert!(quarantined.to_string_lossy().ends_with(".aborted"));
        assert!(!store.has_result("job-1"));
        // A later attempt starts clean.
        let rerun = store.begin_run("job-1", &spec(), false).await.unwrap();
        assert!(rerun.run_dir().exists());
    }

    #[tokio::test]
    async fn signature_covers_result_and_engine_version() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let run = store.begin_run("job-1", &spec(), false).await.unwrap();
        let result = sample_result();
        run.write_result(&result, false).await.unwrap();

        let bytes = std::fs::read(run.run_dir().join("result.json")).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.update(result.engine_version.as_bytes());
        let expected = hex_encode(&hasher.finalize());
        let actual = std::fs::read_to_string(run.run_dir().join("signature")).unwrap();
        assert_eq!(actual, expected);
    }

    fn sample_result() -> EvalResult {
        use crate::metrics::Metrics;
        use crate::result::{ScoreRecord, ENGINE_VERSION};
        use crate::scorer::Grade;
        use chrono::Utc;

        EvalResult {
            engine_version: ENGINE_VERSION.to_string(),
            job_id: "job-1".into(),
            spec_id: "p1".into(),
            spec_checksum: "00".into(),
            submission_id: "s1".into(),
            seed: 42,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            stages: vec![],
            metrics: Metrics::default(),
            scores: ScoreRecord {
                functional: 0.0,
                test: 0.0,
                performance: 0.0,
                quality: 0.0,
                security: 0.0,
                total: 0.0,
                grade: Grade::Fail,
            },
            pass: false,
            reason: Some("no stages ran".into()),
            attempts: 1,
            evidence_root: PathBuf::new(),
        }
    }
}
