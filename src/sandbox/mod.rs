//! Sandbox provisioning and scoped execution.
//!
//! Every pipeline stage runs inside an isolated execution context with
//! enforced resource caps and a default-deny network policy. The
//! [`SandboxProvider`] trait is the narrow seam between the engine and
//! whichever isolation backend a deployment selects; variants are
//! registered at compile time and chosen once per deployment, never per
//! run.
//!
//! Providers guarantee release on every exit path: the stage runner holds
//! sandboxes through a [`ScopedSandbox`] guard whose drop path releases
//! even when execution panics or is cancelled.

pub mod cluster;
pub mod container;
pub mod local;
pub mod policy;
pub(crate) mod proc;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelSignal;
use crate::spec::ResourceCaps;

pub use policy::{NetworkPolicy, SyscallClass};

/// Grace window between SIGTERM and SIGKILL on timeout or cancellation.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Variant selection
// ============================================================================

/// Which isolation backend a deployment runs stages under.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxVariant {
    Container,
    ClusterPod,
    #[default]
    LocalProcess,
}

impl FromStr for SandboxVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(Self::Container),
            "cluster_pod" => Ok(Self::ClusterPod),
            "local_process" => Ok(Self::LocalProcess),
            other => Err(format!("unknown sandbox variant '{other}'")),
        }
    }
}

impl std::fmt::Display for SandboxVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::ClusterPod => write!(f, "cluster_pod"),
            Self::LocalProcess => write!(f, "local_process"),
        }
    }
}

/// Deployment-level settings consumed by the variant constructor table.
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    /// Container runtime CLI (`docker` or `podman`).
    pub container_runtime: String,
    /// Image stages run under for the container and cluster variants.
    pub image: String,
    pub kubectl: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            container_runtime: "docker".to_string(),
            image: "req2run/stage:latest".to_string(),
            kubectl: "kubectl".to_string(),
        }
    }
}

/// The compile-time variant table: new sandbox backends require explicit
/// linkage here, not runtime discovery.
#[must_use]
pub fn provider_for(variant: SandboxVariant, settings: &ProviderSettings) -> Arc<dyn SandboxProvider> {
    match variant {
        SandboxVariant::LocalProcess => Arc::new(local::LocalProcessSandbox::new()),
        SandboxVariant::Container => Arc::new(container::ContainerSandbox::new(
            settings.container_runtime.clone(),
            settings.image.clone(),
        )),
        SandboxVariant::ClusterPod => Arc::new(cluster::ClusterPodSandbox::new(
            settings.kubectl.clone(),
            settings.image.clone(),
        )),
    }
}

// ============================================================================
// Handles & requests
// ============================================================================

/// Filesystem surface of a sandbox: a read-only workspace carrying the
/// prior stage's artifacts and a writable scratch directory.
#[derive(Clone, Debug)]
pub struct Mounts {
    pub workspace: Option<PathBuf>,
    pub scratch: PathBuf,
}

/// Handle to one provisioned sandbox. Bound to exactly one stage; never
/// shared across stages of the same run.
#[derive(Clone, Debug)]
pub struct SandboxHandle {
    pub id: String,
    pub variant: SandboxVariant,
    pub scratch: PathBuf,
    pub workspace: Option<PathBuf>,
    /// Caps the sandbox was provisioned under, re-checked during exec.
    pub caps: ResourceCaps,
    /// Egress was denied at provision time.
    pub network_denied: bool,
    /// Backend-specific token (container id, pod name). Absent for local
    /// processes.
    pub token: Option<String>,
}

/// One command execution inside a provisioned sandbox.
#[derive(Clone, Debug)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

/// Which standard stream a chunk came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

/// A raw chunk of stage output, streamed to the stage runner as it is
/// produced so neither pipe can stall the child.
#[derive(Clone, Debug)]
pub struct StreamChunk {
    pub stream: StdStream,
    pub bytes: Vec<u8>,
}

/// What the provider measured about one finished execution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecObservation {
    pub exit_code: Option<i32>,
    /// Terminating signal when the process did not exit normally.
    pub signal: Option<i32>,
    pub wall: Duration,
    pub peak_rss_bytes: u64,
    pub cpu_seconds: f64,
    /// The wall-clock budget fired before the process exited.
    pub timed_out: bool,
    /// The provider killed the process for breaching a resource cap
    /// (value names the cap, e.g. `"memory"`).
    pub cap_exceeded: Option<String>,
    /// A syscall or egress policy breach was detected (value names the
    /// violation).
    pub policy_violation: Option<String>,
    /// The external cancellation signal terminated the execution.
    pub cancelled: bool,
}

// ============================================================================
// Errors
// ============================================================================

/// Provisioning failed for environment reasons — always an infra fault.
#[derive(Debug, Error, Diagnostic)]
pub enum ProvisionError {
    #[error("{variant} runtime unavailable: {message}")]
    #[diagnostic(
        code(req2run::sandbox::runtime_unavailable),
        help("Check that the container runtime daemon is reachable from the engine host.")
    )]
    RuntimeUnavailable {
        variant: SandboxVariant,
        message: String,
    },

    #[error("image pull failed for '{image}': {message}")]
    #[diagnostic(code(req2run::sandbox::image_pull))]
    ImagePull { image: String, message: String },

    #[error("sandbox quota exhausted: {what}")]
    #[diagnostic(
        code(req2run::sandbox::quota),
        help("Reduce max concurrency or raise the host's sandbox quota.")
    )]
    QuotaExhausted { what: String },

    #[error("sandbox filesystem setup failed")]
    #[diagnostic(code(req2run::sandbox::io))]
    Io(#[from] std::io::Error),
}

/// Execution failed before or outside the child process itself — always
/// an infra fault. Submission-attributable failures (non-zero exits,
/// signals, cap kills) are reported inside [`ExecObservation`] instead.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecError {
    #[error("failed to spawn stage command")]
    #[diagnostic(code(req2run::sandbox::spawn))]
    Spawn(#[source] std::io::Error),

    #[error("sandbox backend fault: {message}")]
    #[diagnostic(code(req2run::sandbox::backend))]
    Backend { message: String },

    #[error("sandbox i/o fault")]
    #[diagnostic(code(req2run::sandbox::exec_io))]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Provider trait
// ============================================================================

/// The isolation backend seam.
///
/// # Contract
///
/// - `provision` enforces the resource caps and translates the egress
///   policy into backend rules before returning a handle.
/// - `exec` streams output chunks to `output` as they arrive, applies the
///   wall-clock budget (SIGTERM at expiry, SIGKILL after
///   [`TERMINATION_GRACE`]) and honours `cancel` the same way.
/// - `release` is idempotent and must succeed even after `exec` failed.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn variant(&self) -> SandboxVariant;

    async fn provision(
        &self,
        caps: &ResourceCaps,
        policy: &NetworkPolicy,
        mounts: Mounts,
    ) -> Result<SandboxHandle, ProvisionError>;

    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: ExecRequest,
        output: flume::Sender<StreamChunk>,
        cancel: CancelSignal,
    ) -> Result<ExecObservation, ExecError>;

    async fn release(&self, handle: &SandboxHandle);
}

// ============================================================================
// Scoped ownership
// ============================================================================

/// Owns a provisioned sandbox and guarantees its release.
///
/// The happy path calls [`release`](Self::release) explicitly; if the
/// guard is dropped while still live (panic inside the stage guard, task
/// cancellation), release is dispatched onto the runtime as a detached
/// task so the sandbox never leaks.
pub struct ScopedSandbox {
    provider: Arc<dyn SandboxProvider>,
    handle: Option<SandboxHandle>,
}

impl ScopedSandbox {
    #[must_use]
    pub fn new(provider: Arc<dyn SandboxProvider>, handle: SandboxHandle) -> Self {
        Self {
            provider,
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn handle(&self) -> &SandboxHandle {
        // Invariant: `handle` is only taken by release/drop, which consume
        // or finish the guard.
        self.handle.as_ref().expect("sandbox already released")
    }

    /// Release the sandbox now.
    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.provider.release(&handle).await;
        }
    }
}

impl Drop for ScopedSandbox {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let provider = Arc::clone(&self.provider);
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    provider.release(&handle).await;
                });
            }
        }
    }
}
