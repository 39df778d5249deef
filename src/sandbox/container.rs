//! Container sandbox variant.
//!
//! Drives an OCI-compatible runtime through its CLI. One container is
//! created per sandbox (so per stage): provision creates and starts it
//! idle, exec runs the stage command inside it, release force-removes it.
//! Resource caps map onto the runtime's cgroup flags and the syscall
//! deny-list onto a generated seccomp profile; deny-all egress detaches
//! the container from every network.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::spec::ResourceCaps;

use super::policy::{seccomp_profile_json, SIGSYS};
use super::proc::{spawn_pump, unix_signal};
use super::{
    ExecError, ExecObservation, ExecRequest, Mounts, NetworkPolicy, ProvisionError, SandboxHandle,
    SandboxProvider, SandboxVariant, StdStream, StreamChunk, TERMINATION_GRACE,
};

/// In-container mount points for the shared filesystem surface.
const WORKSPACE_MOUNT: &str = "/workspace";
const SCRATCH_MOUNT: &str = "/scratch";

/// Sandbox provider backed by a container runtime CLI (docker or podman).
pub struct ContainerSandbox {
    runtime_bin: String,
    image: String,
}

impl ContainerSandbox {
    #[must_use]
    pub fn new(runtime_bin: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            runtime_bin: runtime_bin.into(),
            image: image.into(),
        }
    }

    async fn runtime_available(&self) -> Result<(), ProvisionError> {
        let probe = tokio::process::Command::new(&self.runtime_bin)
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match probe {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(ProvisionError::RuntimeUnavailable {
                variant: SandboxVariant::Container,
                message: format!("runtime probe exited with {status}"),
            }),
            Err(err) => Err(ProvisionError::RuntimeUnavailable {
                variant: SandboxVariant::Container,
                message: err.to_string(),
            }),
        }
    }

    async fn run_runtime(&self, args: &[String]) -> Result<std::process::Output, ExecError> {
        tokio::process::Command::new(&self.runtime_bin)
            .args(args)
            .output()
            .await
            .map_err(ExecError::Io)
    }
}

#[async_trait]
impl SandboxProvider for ContainerSandbox {
    fn variant(&self) -> SandboxVariant {
        SandboxVariant::Container
    }

    async fn provision(
        &self,
        caps: &ResourceCaps,
        policy: &NetworkPolicy,
        mounts: Mounts,
    ) -> Result<SandboxHandle, ProvisionError> {
        self.runtime_available().await?;
        tokio::fs::create_dir_all(&mounts.scratch).await?;

        let profile_path = mounts.scratch.join(".seccomp.json");
        let profile = serde_json::to_vec(&seccomp_profile_json()).unwrap_or_default();
        tokio::fs::write(&profile_path, profile).await?;

        let id = format!("req2run-{}", Uuid::new_v4());
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            id.clone(),
            format!("--cpus={}", caps.cpu_cores),
            format!("--memory={}", caps.memory_bytes),
            format!("--pids-limit={}", caps.pids),
            format!("--security-opt=seccomp={}", profile_path.display()),
            "-v".into(),
            format!("{}:{SCRATCH_MOUNT}", mounts.scratch.display()),
        ];
        if let Some(workspace) = &mounts.workspace {
            args.push("-v".into());
            args.push(format!("{}:{WORKSPACE_MOUNT}:ro", workspace.display()));
        }
        if policy.is_deny_all() {
            args.push("--network=none".into());
        }
        // Allow-listed endpoints ride the default network; the concrete
        // firewall rules are installed by the deployment from
        // `policy.allowed_endpoints()`.
        args.push(self.image.clone());
        args.push("sleep".into());
        args.push("infinity".into());

        let created = tokio::process::Command::new(&self.runtime_bin)
            .args(&args)
            .output()
            .await?;
        if !created.status.success() {
            let message = String::from_utf8_lossy(&created.stderr).into_owned();
            return Err(if message.contains("pull") || message.contains("manifest") {
                ProvisionError::ImagePull {
                    image: self.image.clone(),
                    message,
                }
            } else {
                ProvisionError::RuntimeUnavailable {
                    variant: SandboxVariant::Container,
                    message,
                }
            });
        }

        let started = tokio::process::Command::new(&self.runtime_bin)
            .args(["start", &id])
            .output()
            .await?;
        if !started.status.success() {
            return Err(ProvisionError::RuntimeUnavailable {
                variant: SandboxVariant::Container,
                message: String::from_utf8_lossy(&started.stderr).into_owned(),
            });
        }

        debug!(container = %id, image = %self.image, "provisioned container sandbox");
        Ok(SandboxHandle {
            id: id.clone(),
            variant: SandboxVariant::Container,
            scratch: mounts.scratch,
            workspace: mounts.workspace,
            caps: *caps,
            network_denied: policy.is_deny_all(),
            token: Some(id),
        })
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: ExecRequest,
        output: flume::Sender<StreamChunk>,
        mut cancel: CancelSignal,
    ) -> Result<ExecObservation, ExecError> {
        let Some(token) = handle.token.as_deref() else {
            return Err(ExecError::Backend {
                message: "container handle has no runtime token".to_string(),
            });
        };
        if request.argv.is_empty() {
            return Err(ExecError::Backend {
                message: "empty argv".to_string(),
            });
        }

        let mut args: Vec<String> = vec![
            "exec".into(),
            "-w".into(),
            if handle.workspace.is_some() {
                WORKSPACE_MOUNT.into()
            } else {
                SCRATCH_MOUNT.into()
            },
        ];
        for (key, value) in &request.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(token.to_string());
        args.extend(request.argv.iter().cloned());

        let started = Instant::now();
        let mut child = tokio::process::Command::new(&self.runtime_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecError::Spawn)?;

        let out_pump = child
            .stdout
            .take()
            .map(|s| spawn_pump(s, StdStream::Stdout, output.clone()));
        let err_pump = child
            .stderr
            .take()
            .map(|s| spawn_pump(s, StdStream::Stderr, output));

        let mut timed_out = false;
        let mut cancelled = false;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(request.timeout) => {
                timed_out = true;
                self.stop_container(token).await;
                child.wait().await?
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                self.stop_container(token).await;
                child.wait().await?
            }
        };

        if let Some(pump) = out_pump {
            let _ = pump.await;
        }
        if let Some(pump) = err_pump {
            let _ = pump.await;
        }

        // The CLI client folds in-container signals into 128+N exits.
        let signal = unix_signal(&status).or_else(|| {
            status
                .code()
                .filter(|code| *code > 128)
                .map(|code| code - 128)
        });
        let policy_violation = (signal == Some(SIGSYS)).then(|| "syscall_denied".to_string());

        Ok(ExecObservation {
            exit_code: status.code(),
            signal,
            wall: started.elapsed(),
            peak_rss_bytes: self.sample_memory(token).await,
            cpu_seconds: 0.0,
            timed_out,
            cap_exceeded: None,
            policy_violation,
            cancelled,
        })
    }

    async fn release(&self, handle: &SandboxHandle) {
        let Some(token) = handle.token.as_deref() else {
            return;
        };
        // rm -f is idempotent: a second release of the same handle is a
        // no-op reported as "no such container".
        let args: Vec<String> = vec!["rm".into(), "-f".into(), token.to_string()];
        match self.run_runtime(&args).await {
            Ok(out) if out.status.success() => {
                debug!(container = %token, "released container sandbox");
            }
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                if !stderr.contains("No such container") {
                    warn!(container = %token, error = %stderr, "container release failed");
                }
            }
            Err(err) => warn!(container = %token, error = %err, "container release failed"),
        }
    }
}

impl ContainerSandbox {
    /// `stop` delivers SIGTERM and escalates to SIGKILL after the grace
    /// window, matching the engine's termination contract.
    async fn stop_container(&self, token: &str) {
        let args: Vec<String> = vec![
            "stop".into(),
            "--time".into(),
            TERMINATION_GRACE.as_secs().to_string(),
            token.to_string(),
        ];
        if let Err(err) = self.run_runtime(&args).await {
            warn!(container = %token, error = %err, "container stop failed");
        }
    }

    /// Best-effort memory high-water sample from `stats`.
    async fn sample_memory(&self, token: &str) -> u64 {
        let args: Vec<String> = vec![
            "stats".into(),
            "--no-stream".into(),
            "--format".into(),
            "{{.MemUsage}}".into(),
            token.to_string(),
        ];
        match self.run_runtime(&args).await {
            Ok(out) if out.status.success() => {
                parse_mem_usage(String::from_utf8_lossy(&out.stdout).trim()).unwrap_or(0)
            }
            _ => 0,
        }
    }
}

/// Parse the `used / limit` column of `stats` output, e.g. `"41.5MiB / 512MiB"`.
fn parse_mem_usage(raw: &str) -> Option<u64> {
    let used = raw.split('/').next()?.trim();
    let split_at = used.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = used.split_at(split_at);
    let value: f64 = number.trim().parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "B" => 1.0,
        "KiB" | "kB" => 1024.0,
        "MiB" | "MB" => 1024.0 * 1024.0,
        "GiB" | "GB" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}
