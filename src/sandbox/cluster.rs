//! Cluster-pod sandbox variant.
//!
//! Drives a Kubernetes cluster through `kubectl`: one pod per sandbox,
//! created idle at provision, exercised with `kubectl exec`, removed at
//! release. Resource caps map onto container limits and the syscall
//! deny-list onto the pod's seccomp profile annotation. The engine-side
//! scratch directory is synchronized with the pod's `/scratch` after
//! each exec so collectors can read the stage's reports locally.
//!
//! Egress allow-lists translate to NetworkPolicy objects owned by the
//! deployment; this variant only distinguishes deny-all (the benchmark
//! namespace's default-deny policy applies) from allow-listed pods,
//! which it labels for the deployment's policy selectors.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::spec::ResourceCaps;

use super::policy::SIGSYS;
use super::proc::{spawn_pump, unix_signal};
use super::{
    ExecError, ExecObservation, ExecRequest, Mounts, NetworkPolicy, ProvisionError, SandboxHandle,
    SandboxProvider, SandboxVariant, StdStream, StreamChunk, TERMINATION_GRACE,
};

const WORKSPACE_MOUNT: &str = "/workspace";
const SCRATCH_MOUNT: &str = "/scratch";
/// Label carrying the egress mode for the deployment's NetworkPolicy
/// selectors.
const EGRESS_LABEL: &str = "req2run.io/egress";

/// Sandbox provider backed by a Kubernetes cluster via `kubectl`.
pub struct ClusterPodSandbox {
    kubectl_bin: String,
    image: String,
}

impl ClusterPodSandbox {
    #[must_use]
    pub fn new(kubectl_bin: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            kubectl_bin: kubectl_bin.into(),
            image: image.into(),
        }
    }

    async fn kubectl(&self, args: &[String]) -> Result<std::process::Output, std::io::Error> {
        tokio::process::Command::new(&self.kubectl_bin)
            .args(args)
            .output()
            .await
    }

    fn pod_overrides(&self, caps: &ResourceCaps) -> serde_json::Value {
        serde_json::json!({
            "spec": {
                "securityContext": {
                    "seccompProfile": {"type": "RuntimeDefault"},
                },
                "containers": [{
                    "name": "stage",
                    "image": self.image,
                    "command": ["sleep", "infinity"],
                    "resources": {
                        "limits": {
                            "cpu": caps.cpu_cores.to_string(),
                            "memory": caps.memory_bytes.to_string(),
                        },
                    },
                    "volumeMounts": [
                        {"name": "scratch", "mountPath": SCRATCH_MOUNT},
                        {"name": "workspace", "mountPath": WORKSPACE_MOUNT, "readOnly": true},
                    ],
                }],
                "volumes": [
                    {"name": "scratch", "emptyDir": {}},
                    {"name": "workspace", "emptyDir": {}},
                ],
            },
        })
    }
}

#[async_trait]
impl SandboxProvider for ClusterPodSandbox {
    fn variant(&self) -> SandboxVariant {
        SandboxVariant::ClusterPod
    }

    async fn provision(
        &self,
        caps: &ResourceCaps,
        policy: &NetworkPolicy,
        mounts: Mounts,
    ) -> Result<SandboxHandle, ProvisionError> {
        tokio::fs::create_dir_all(&mounts.scratch).await?;

        let name = format!("req2run-{}", Uuid::new_v4());
        let egress = if policy.is_deny_all() { "deny" } else { "allow" };
        let overrides = self.pod_overrides(caps).to_string();
        let args: Vec<String> = vec![
            "run".into(),
            name.clone(),
            format!("--image={}", self.image),
            "--restart=Never".into(),
            format!("--labels={EGRESS_LABEL}={egress}"),
            format!("--overrides={overrides}"),
        ];
        let created = self.kubectl(&args).await?;
        if !created.status.success() {
            let message = String::from_utf8_lossy(&created.stderr).into_owned();
            return Err(if message.contains("ImagePull") || message.contains("manifest") {
                ProvisionError::ImagePull {
                    image: self.image.clone(),
                    message,
                }
            } else if message.contains("exceeded quota") {
                ProvisionError::QuotaExhausted { what: message }
            } else {
                ProvisionError::RuntimeUnavailable {
                    variant: SandboxVariant::ClusterPod,
                    message,
                }
            });
        }

        let wait: Vec<String> = vec![
            "wait".into(),
            "--for=condition=Ready".into(),
            format!("pod/{name}"),
            "--timeout=120s".into(),
        ];
        let ready = self.kubectl(&wait).await?;
        if !ready.status.success() {
            let message = String::from_utf8_lossy(&ready.stderr).into_owned();
            // Do not leak the half-started pod.
            let _ = self
                .kubectl(&["delete".into(), format!("pod/{name}"), "--ignore-not-found=true".into()])
                .await;
            return Err(ProvisionError::RuntimeUnavailable {
                variant: SandboxVariant::ClusterPod,
                message,
            });
        }

        // Ship the prior stage's artifacts into the pod's workspace.
        if let Some(workspace) = &mounts.workspace {
            if workspace.exists() {
                let cp: Vec<String> = vec![
                    "cp".into(),
                    format!("{}/.", workspace.display()),
                    format!("{name}:{WORKSPACE_MOUNT}"),
                ];
                let copied = self.kubectl(&cp).await?;
                if !copied.status.success() {
                    warn!(pod = %name, "workspace copy into pod failed");
                }
            }
        }

        debug!(pod = %name, image = %self.image, "provisioned cluster-pod sandbox");
        Ok(SandboxHandle {
            id: name.clone(),
            variant: SandboxVariant::ClusterPod,
            scratch: mounts.scratch,
            workspace: mounts.workspace,
            caps: *caps,
            network_denied: policy.is_deny_all(),
            token: Some(name),
        })
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: ExecRequest,
        output: flume::Sender<StreamChunk>,
        mut cancel: CancelSignal,
    ) -> Result<ExecObservation, ExecError> {
        let Some(pod) = handle.token.as_deref() else {
            return Err(ExecError::Backend {
                message: "cluster handle has no pod token".to_string(),
            });
        };
        if request.argv.is_empty() {
            return Err(ExecError::Backend {
                message: "empty argv".to_string(),
            });
        }

        let cwd = if handle.workspace.is_some() {
            WORKSPACE_MOUNT
        } else {
            SCRATCH_MOUNT
        };
        let env_prefix: String = request
            .env
            .iter()
            .map(|(k, v)| format!("{}={} ", shell_quote(k), shell_quote(v)))
            .collect();
        let quoted: Vec<String> = request.argv.iter().map(|a| shell_quote(a)).collect();
        let script = format!("cd {cwd} && exec {env_prefix}{}", quoted.join(" "));

        let args: Vec<String> = vec![
            "exec".into(),
            pod.to_string(),
            "--".into(),
            "sh".into(),
            "-c".into(),
            script,
        ];

        let started = Instant::now();
        let mut child = tokio::process::Command::new(&self.kubectl_bin)
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
                self.delete_pod(pod, true).await;
                child.wait().await?
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                self.delete_pod(pod, true).await;
                child.wait().await?
            }
        };

        if let Some(pump) = out_pump {
            let _ = pump.await;
        }
        if let Some(pump) = err_pump {
            let _ = pump.await;
        }

        // Surface the pod's scratch (reports, artifacts) to the local
        // scratch directory the collectors read.
        let sync: Vec<String> = vec![
            "cp".into(),
            format!("{pod}:{SCRATCH_MOUNT}/."),
            handle.scratch.display().to_string(),
        ];
        if let Ok(out) = self.kubectl(&sync).await {
            if !out.status.success() && !timed_out && !cancelled {
                warn!(pod = %pod, "scratch copy out of pod failed");
            }
        }

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
            peak_rss_bytes: 0,
            cpu_seconds: 0.0,
            timed_out,
            cap_exceeded: None,
            policy_violation,
            cancelled,
        })
    }

    async fn release(&self, handle: &SandboxHandle) {
        let Some(pod) = handle.token.as_deref() else {
            return;
        };
        self.delete_pod(pod, false).await;
        debug!(pod = %pod, "released cluster-pod sandbox");
    }
}

impl ClusterPodSandbox {
    /// Delete with the standard grace window; `graceful` matches the
    /// SIGTERM-then-SIGKILL termination contract.
    async fn delete_pod(&self, pod: &str, graceful: bool) {
        let mut args: Vec<String> = vec![
            "delete".into(),
            format!("pod/{pod}"),
            "--ignore-not-found=true".into(),
        ];
        if graceful {
            args.push(format!("--grace-period={}", TERMINATION_GRACE.as_secs()));
        }
        if let Err(err) = self.kubectl(&args).await {
            warn!(pod = %pod, error = %err, "pod delete failed");
        }
    }
}

/// Minimal POSIX single-quote escaping for the in-pod shell line.
fn shell_quote(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:={}".contains(c))
    {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quoting() {
        assert_eq!(shell_quote("simple"), "simple");
        assert_eq!(shell_quote("/workspace/run.sh"), "/workspace/run.sh");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn overrides_carry_resource_limits() {
        let provider = ClusterPodSandbox::new("kubectl", "stage:latest");
        let caps = ResourceCaps {
            cpu_cores: 2.0,
            memory_bytes: 1024,
            disk_bytes: 0,
            pids: 64,
        };
        let overrides = provider.pod_overrides(&caps);
        let limits = &overrides["spec"]["containers"][0]["resources"]["limits"];
        assert_eq!(limits["cpu"], "2");
        assert_eq!(limits["memory"], "1024");
    }
}
