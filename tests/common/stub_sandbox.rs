//! A scripted sandbox provider for pipeline and scheduler tests.
//!
//! Each stage command (keyed by its argv[0]) is mapped to a script that
//! fakes the observable behavior of a real sandbox: stdout lines, files
//! dropped into scratch, exit status, simulated wall time, and optional
//! termination by signal. The provider also keeps the counters the
//! isolation invariants are asserted against (provision/release balance,
//! live-sandbox high-water mark, dispatch order).

use std::sync::atomic::{AtomicIsize, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use req2run_engine::cancel::CancelSignal;
use req2run_engine::sandbox::{
    ExecError, ExecObservation, ExecRequest, Mounts, NetworkPolicy, ProvisionError, SandboxHandle,
    SandboxProvider, SandboxVariant, StdStream, StreamChunk,
};
use req2run_engine::spec::ResourceCaps;

/// Signal number a seccomp kill reports.
pub const SIGSYS: i32 = 31;

/// Scripted behavior for one stage command.
#[derive(Clone, Debug, Default)]
pub struct StageScript {
    /// Lines written to stdout (newline-terminated by the stub).
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub exit_code: i32,
    /// Simulated wall time reported in the observation.
    pub run_for: Duration,
    /// Real time the exec call sleeps, for concurrency tests.
    pub real_delay: Duration,
    /// Terminate by signal instead of exiting (SIGSYS ⇒ policy violation).
    pub signal: Option<i32>,
    /// Files dropped into scratch before "running" (reports, manifests).
    pub files: Vec<(String, String)>,
    pub peak_rss_bytes: u64,
}

impl StageScript {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_stdout(mut self, lines: &[&str]) -> Self {
        self.stdout_lines = lines.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_exit(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_file(mut self, name: &str, contents: String) -> Self {
        self.files.push((name.to_string(), contents));
        self
    }

    pub fn with_run_for(mut self, duration: Duration) -> Self {
        self.run_for = duration;
        self
    }

    pub fn with_real_delay(mut self, duration: Duration) -> Self {
        self.real_delay = duration;
        self
    }

    pub fn killed_by(mut self, signal: i32) -> Self {
        self.signal = Some(signal);
        self
    }
}

#[derive(Default)]
pub struct StubSandboxProvider {
    scripts: Mutex<FxHashMap<String, StageScript>>,
    fail_provisions: AtomicU32,
    pub provisioned: AtomicUsize,
    pub released: AtomicUsize,
    live: AtomicIsize,
    pub max_live: AtomicIsize,
    /// Scratch paths seen at provision time, in order.
    pub provision_log: Mutex<Vec<String>>,
}

impl StubSandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the script for a stage command (matched on argv[0]).
    pub fn script(&self, command: &str, script: StageScript) {
        self.scripts.lock().insert(command.to_string(), script);
    }

    /// Make the next `n` provisions fail as infrastructure faults.
    pub fn fail_next_provisions(&self, n: u32) {
        self.fail_provisions.store(n, Ordering::SeqCst);
    }

    pub fn live_sandboxes(&self) -> isize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for StubSandboxProvider {
    fn variant(&self) -> SandboxVariant {
        SandboxVariant::LocalProcess
    }

    async fn provision(
        &self,
        caps: &ResourceCaps,
        policy: &NetworkPolicy,
        mounts: Mounts,
    ) -> Result<SandboxHandle, ProvisionError> {
        let remaining = self.fail_provisions.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .fail_provisions
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(ProvisionError::RuntimeUnavailable {
                variant: SandboxVariant::LocalProcess,
                message: "scripted runtime outage".to_string(),
            });
        }

        tokio::fs::create_dir_all(&mounts.scratch).await?;
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        self.provision_log
            .lock()
            .push(mounts.scratch.display().to_string());

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
        let key = request
            .argv
            .first()
            .cloned()
            .unwrap_or_default();
        let script = self.scripts.lock().get(&key).cloned().unwrap_or_default();

        for (name, contents) in &script.files {
            let path = handle.scratch.join(name);
            tokio::fs::write(&path, contents).await?;
        }

        if !script.stdout_lines.is_empty() {
            let payload = format!("{}\n", script.stdout_lines.join("\n"));
            let _ = output
                .send_async(StreamChunk {
                    stream: StdStream::Stdout,
                    bytes: payload.into_bytes(),
                })
                .await;
        }
        if !script.stderr_lines.is_empty() {
            let payload = format!("{}\n", script.stderr_lines.join("\n"));
            let _ = output
                .send_async(StreamChunk {
                    stream: StdStream::Stderr,
                    bytes: payload.into_bytes(),
                })
                .await;
        }
        drop(output);

        let mut cancelled = false;
        if !script.real_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(script.real_delay) => {}
                _ = cancel.cancelled() => cancelled = true,
            }
        } else if cancel.is_cancelled() {
            cancelled = true;
        }

        let timed_out = script.run_for > request.timeout;
        let wall = if timed_out {
            request.timeout
        } else {
            script.run_for
        };

        let policy_violation =
            (script.signal == Some(SIGSYS)).then(|| "syscall_denied".to_string());
        let exit_code = if script.signal.is_some() || timed_out || cancelled {
            None
        } else {
            Some(script.exit_code)
        };

        Ok(ExecObservation {
            exit_code,
            signal: script.signal,
            wall,
            peak_rss_bytes: script.peak_rss_bytes,
            cpu_seconds: wall.as_secs_f64() * 0.5,
            timed_out,
            cap_exceeded: None,
            policy_violation,
            cancelled,
        })
    }

    async fn release(&self, _handle: &SandboxHandle) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
