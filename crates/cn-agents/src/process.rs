use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("signal failed: {0}")]
    Signal(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// ProcessSpawner trait (for testability)
// ---------------------------------------------------------------------------

/// What to run and where.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Abstraction over starting the agent binary so tests can substitute a
/// scripted process.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedProcess, ProcessError>;
}

/// Signals and exit status of a started process.
#[async_trait]
pub trait ProcessControl: Send {
    /// Ask the process to stop (SIGTERM on unix).
    fn terminate(&mut self) -> Result<(), ProcessError>;
    /// Stop it unconditionally.
    fn kill(&mut self) -> Result<(), ProcessError>;
    /// Wait for exit. `None` when the process ended without an exit code
    /// (killed by a signal) or the status could not be read.
    async fn wait(&mut self) -> Option<i32>;
}

/// A running process: its output lines (stdout and stderr merged) and a
/// control handle. The line channel disconnects once both streams close.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub lines: flume::Receiver<String>,
    pub control: Box<dyn ProcessControl>,
}

// ---------------------------------------------------------------------------
// Real tokio-based spawner
// ---------------------------------------------------------------------------

pub struct TokioProcessSpawner;

#[async_trait]
impl ProcessSpawner for TokioProcessSpawner {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedProcess, ProcessError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let pid = child.id();
        let (tx, rx) = flume::unbounded();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx);
        }
        debug!(program = %spec.program, ?pid, cwd = %spec.cwd.display(), "process started");

        Ok(SpawnedProcess {
            pid,
            lines: rx,
            control: Box::new(TokioControl { child }),
        })
    }
}

fn forward_lines<R>(stream: R, tx: flume::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send_async(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "reading process output failed");
                    break;
                }
            }
        }
    });
}

struct TokioControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for TokioControl {
    fn terminate(&mut self) -> Result<(), ProcessError> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                let pid = libc::pid_t::try_from(pid).map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range")
                })?;
                // SAFETY: sending a signal to a pid we spawned has no memory effects.
                let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
                if rc != 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            self.kill()
        }
    }

    fn kill(&mut self) -> Result<(), ProcessError> {
        Ok(self.child.start_kill()?)
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "waiting for process failed");
                None
            }
        }
    }
}
