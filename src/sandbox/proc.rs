//! Shared child-process plumbing for sandbox variants that shell out to
//! the host (local processes, container CLI clients).

use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tracing::warn;

use super::{ExecError, StdStream, StreamChunk, TERMINATION_GRACE};

/// Read size for the stream pumps.
pub(crate) const PUMP_CHUNK: usize = 8 * 1024;

/// Pump one child stream into the runner's chunk channel until EOF.
pub(crate) fn spawn_pump(
    mut stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    kind: StdStream,
    sender: flume::Sender<StreamChunk>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_CHUNK];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = StreamChunk {
                        stream: kind,
                        bytes: buf[..n].to_vec(),
                    };
                    if sender.send_async(chunk).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// SIGTERM, the configured grace window, then SIGKILL.
pub(crate) async fn terminate_with_grace(
    child: &mut Child,
    pid: Option<u32>,
) -> Result<std::process::ExitStatus, ExecError> {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: signalling a pid we spawned and still hold a handle to.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    match tokio::time::timeout(TERMINATION_GRACE, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            warn!("stage ignored SIGTERM, escalating to SIGKILL");
            child.start_kill()?;
            Ok(child.wait().await?)
        }
    }
}

/// Terminating signal of an exit status, if any.
pub(crate) fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}
