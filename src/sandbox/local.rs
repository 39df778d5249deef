//! Local-process sandbox variant.
//!
//! Runs stage commands as ordinary child processes on the engine host.
//! Isolation is advisory compared to the container variant: resource caps
//! are enforced by monitoring rather than cgroups, and network denial is
//! signalled to tooling via [`NETWORK_DISABLED_ENV_VAR`] instead of a
//! packet filter. Suitable for trusted baselines and for development;
//! untrusted submissions belong in the container variant.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::spec::ResourceCaps;

use super::policy::{NETWORK_DISABLED_ENV_VAR, SIGSYS};
use super::proc::{spawn_pump, terminate_with_grace, unix_signal};
use super::{
    ExecError, ExecObservation, ExecRequest, Mounts, NetworkPolicy, ProvisionError, SandboxHandle,
    SandboxProvider, SandboxVariant, StdStream, StreamChunk,
};

/// How often the resource monitor samples the child's /proc entry.
const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

/// Sandbox provider backed by plain host processes.
pub struct LocalProcessSandbox;

impl LocalProcessSandbox {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalProcessSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxProvider for LocalProcessSandbox {
    fn variant(&self) -> SandboxVariant {
        SandboxVariant::LocalProcess
    }

    async fn provision(
        &self,
        caps: &ResourceCaps,
        policy: &NetworkPolicy,
        mounts: Mounts,
    ) -> Result<SandboxHandle, ProvisionError> {
        tokio::fs::create_dir_all(&mounts.scratch).await?;
        Ok(SandboxHandle {
            id: Uuid::new_v4().to_string(),
            variant: SandboxVariant::LocalProcess,
            scratch: mounts.scratch,
            workspace: mounts.workspace,
            caps: *caps,
            network_denied: policy.is_deny_all(),
            token: None,
        })
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: ExecRequest,
        output: flume::Sender<StreamChunk>,
        mut cancel: CancelSignal,
    ) -> Result<ExecObservation, ExecError> {
        let Some(program) = request.argv.first() else {
            return Err(ExecError::Backend {
                message: "empty argv".to_string(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(&request.argv[1..])
            .current_dir(handle.workspace.as_ref().unwrap_or(&handle.scratch))
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        if handle.network_denied {
            cmd.env(NETWORK_DISABLED_ENV_VAR, "1");
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(ExecError::Spawn)?;
        let pid = child.id();

        if let (Some(bytes), Some(mut stdin)) = (request.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                let _ = stdin.write_all(&bytes).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_pump = stdout.map(|s| spawn_pump(s, StdStream::Stdout, output.clone()));
        let err_pump = stderr.map(|s| spawn_pump(s, StdStream::Stderr, output));

        let samples = Arc::new(Mutex::new(ResourceSample::default()));
        let breach = Arc::new(Notify::new());
        let monitor = pid.map(|pid| {
            tokio::spawn(monitor_process(
                pid,
                handle.caps,
                Arc::clone(&samples),
                Arc::clone(&breach),
            ))
        });

        let mut timed_out = false;
        let mut cancelled = false;
        let mut cap_exceeded = None;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(request.timeout) => {
                timed_out = true;
                terminate_with_grace(&mut child, pid).await?
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                terminate_with_grace(&mut child, pid).await?
            }
            _ = breach.notified() => {
                cap_exceeded = Some("memory".to_string());
                terminate_with_grace(&mut child, pid).await?
            }
        };

        if let Some(task) = monitor {
            task.abort();
        }
        // Drain the pumps so the tail of the output is delivered before
        // the observation is returned.
        if let Some(pump) = out_pump {
            let _ = pump.await;
        }
        if let Some(pump) = err_pump {
            let _ = pump.await;
        }

        let sample = *samples.lock();
        let signal = unix_signal(&status);
        let policy_violation = (signal == Some(SIGSYS)).then(|| "syscall_denied".to_string());

        debug!(
            sandbox = %handle.id,
            exit = ?status.code(),
            wall_ms = started.elapsed().as_millis() as u64,
            "stage command finished"
        );

        Ok(ExecObservation {
            exit_code: status.code(),
            signal,
            wall: started.elapsed(),
            peak_rss_bytes: sample.peak_rss_bytes,
            cpu_seconds: sample.cpu_seconds,
            timed_out,
            cap_exceeded,
            policy_violation,
            cancelled,
        })
    }

    async fn release(&self, handle: &SandboxHandle) {
        // The child is reaped by exec (kill_on_drop as backstop) and the
        // scratch directory outlives the sandbox as the next stage's
        // workspace, so there is no writable layer left to remove here.
        debug!(sandbox = %handle.id, "released local sandbox");
    }
}

// ============================================================================
// Resource monitoring
// ============================================================================

#[derive(Clone, Copy, Debug, Default)]
struct ResourceSample {
    peak_rss_bytes: u64,
    cpu_seconds: f64,
}

/// Poll /proc for the child's peak RSS and CPU time, notifying `breach`
/// when the memory cap is crossed. Best-effort: on hosts without procfs
/// the observation reports zeros.
async fn monitor_process(
    pid: u32,
    caps: ResourceCaps,
    samples: Arc<Mutex<ResourceSample>>,
    breach: Arc<Notify>,
) {
    let mut interval = tokio::time::interval(MONITOR_INTERVAL);
    loop {
        interval.tick().await;
        let Some(sample) = read_proc_sample(pid) else {
            // Process gone or no procfs; stop sampling.
            return;
        };
        {
            let mut current = samples.lock();
            current.peak_rss_bytes = current.peak_rss_bytes.max(sample.peak_rss_bytes);
            current.cpu_seconds = current.cpu_seconds.max(sample.cpu_seconds);
        }
        if caps.memory_bytes > 0 && sample.peak_rss_bytes > caps.memory_bytes {
            breach.notify_one();
            return;
        }
    }
}

#[cfg(target_os = "linux")]
fn read_proc_sample(pid: u32) -> Option<ResourceSample> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let peak_rss_bytes = status
        .lines()
        .find(|l| l.starts_with("VmHWM:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0);

    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // utime and stime are fields 14 and 15, counted after the
    // parenthesised comm field (which may itself contain spaces).
    let after_comm = stat.rfind(')').map(|i| &stat[i + 2..])?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // `after_comm` starts at field 3, so utime/stime sit at offsets 11/12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let cpu_seconds = (utime + stime) as f64 / 100.0; // USER_HZ
    Some(ResourceSample {
        peak_rss_bytes,
        cpu_seconds,
    })
}

#[cfg(not(target_os = "linux"))]
fn read_proc_sample(_pid: u32) -> Option<ResourceSample> {
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_mounts(dir: &tempfile::TempDir) -> Mounts {
        Mounts {
            workspace: None,
            scratch: dir.path().join("scratch"),
        }
    }

    async fn run(
        provider: &LocalProcessSandbox,
        handle: &SandboxHandle,
        argv: &[&str],
        timeout: Duration,
    ) -> (ExecObservation, Vec<u8>, Vec<u8>) {
        let (tx, rx) = flume::unbounded();
        let request = ExecRequest {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            env: vec![],
            stdin: None,
            timeout,
        };
        let obs = provider
            .exec(handle, request, tx, CancelSignal::never())
            .await
            .unwrap();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            match chunk.stream {
                StdStream::Stdout => stdout.extend(chunk.bytes),
                StdStream::Stderr => stderr.extend(chunk.bytes),
            }
        }
        (obs, stdout, stderr)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_exit_code_and_streams() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProcessSandbox::new();
        let handle = provider
            .provision(
                &ResourceCaps::default(),
                &NetworkPolicy::deny_all(),
                scratch_mounts(&dir),
            )
            .await
            .unwrap();

        let (obs, stdout, _) = run(
            &provider,
            &handle,
            &["sh", "-c", "echo hello; exit 3"],
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(obs.exit_code, Some(3));
        assert!(!obs.timed_out);
        assert_eq!(String::from_utf8_lossy(&stdout).trim(), "hello");
        provider.release(&handle).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_terminates_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProcessSandbox::new();
        let handle = provider
            .provision(
                &ResourceCaps::default(),
                &NetworkPolicy::deny_all(),
                scratch_mounts(&dir),
            )
            .await
            .unwrap();

        let started = Instant::now();
        let (obs, _, _) = run(
            &provider,
            &handle,
            &["sh", "-c", "sleep 30"],
            Duration::from_millis(200),
        )
        .await;
        assert!(obs.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
        provider.release(&handle).await;
    }

    #[tokio::test]
    async fn empty_argv_is_a_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProcessSandbox::new();
        let handle = provider
            .provision(
                &ResourceCaps::default(),
                &NetworkPolicy::deny_all(),
                scratch_mounts(&dir),
            )
            .await
            .unwrap();
        let (tx, _rx) = flume::unbounded();
        let request = ExecRequest {
            argv: vec![],
            env: vec![],
            stdin: None,
            timeout: Duration::from_secs(1),
        };
        let err = provider
            .exec(&handle, request, tx, CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Backend { .. }));
    }
}
