use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result, anyhow};
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

/// Handle on a running worker, used to reap it or force it down.
pub trait WorkerProcess: Send {
    /// Resolves once the worker has exited. Returns a short description of
    /// how it went down, for the log.
    fn wait(&mut self) -> BoxFuture<'_, Result<String>>;

    fn kill(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// The pipes and process handle of a freshly started worker.
pub struct LaunchedWorker {
    /// Parent → worker.
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    /// Worker → parent.
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub process: Box<dyn WorkerProcess>,
}

/// Starts worker processes for the cluster pool.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, worker_id: usize, env: &BTreeMap<String, String>) -> Result<LaunchedWorker>;
}

// ────────────────────────────────────────────────────────────────
// OS processes
// ────────────────────────────────────────────────────────────────

/// Re-executes a binary (by default the current one) with the worker
/// environment; frames travel over the child's stdin and stdout, while its
/// stderr is inherited so worker logs reach the terminal.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("failed to resolve current executable")?;
        Ok(Self::new(program, Vec::new()))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, worker_id: usize, env: &BTreeMap<String, String>) -> Result<LaunchedWorker> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn worker {worker_id} from {}",
                    self.program.display()
                )
            })?;

        let input = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("worker {worker_id} has no stdin pipe"))?;
        let output = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker {worker_id} has no stdout pipe"))?;

        Ok(LaunchedWorker {
            input: Box::new(input),
            output: Box::new(output),
            process: Box::new(ChildProcess { child }),
        })
    }
}

struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    async fn wait_status(&mut self) -> Result<String> {
        let status: ExitStatus = self.child.wait().await.context("failed to reap worker process")?;
        Ok(status.to_string())
    }

    async fn kill_child(&mut self) -> Result<()> {
        self.child.kill().await.context("failed to kill worker process")
    }
}

impl WorkerProcess for ChildProcess {
    fn wait(&mut self) -> BoxFuture<'_, Result<String>> {
        Box::pin(self.wait_status())
    }

    fn kill(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.kill_child())
    }
}
