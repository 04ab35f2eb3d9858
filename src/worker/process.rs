use anyhow::{Context, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

use super::{ParseJob, ParseWorker, WorkerHandle, WorkerMessage, WorkerOutcome};

/// Runs each job in a child process: `<program> <args..> worker ...`.
///
/// The child reports one JSON [`WorkerMessage`] line on stdout; its stderr
/// is inherited so its logs reach the parent's log stream.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessWorker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-invoke the running executable.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("locating current executable")?;
        Ok(Self::new(program))
    }

    /// Arguments placed before the `worker` subcommand.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, job: &ParseJob) -> Command {
        let limits = &job.options.archive;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("worker")
            .arg("--kind")
            .arg(job.kind.as_str())
            .arg("--max-prj-bytes")
            .arg(job.options.max_prj_bytes.to_string())
            .arg("--max-archive-entries")
            .arg(limits.max_entries.to_string())
            .arg("--max-archive-bytes")
            .arg(limits.max_total_bytes.to_string())
            .arg("--max-compression-ratio")
            .arg(limits.max_compression_ratio.to_string())
            .arg(&job.file_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ParseWorker for ProcessWorker {
    type Handle = ProcessHandle;

    async fn spawn(&self, job: &ParseJob) -> Result<ProcessHandle> {
        let mut child = self
            .command(job)
            .spawn()
            .with_context(|| format!("spawning {}", self.program.display()))?;
        let stdout = child.stdout.take().context("worker stdout was not captured")?;
        debug!(pid = child.id(), "worker process spawned");
        Ok(ProcessHandle {
            child,
            stdout: BufReader::new(stdout),
        })
    }
}

pub struct ProcessHandle {
    child: Child,
    stdout: BufReader<ChildStdout>,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    async fn outcome(&mut self) -> Result<WorkerOutcome> {
        let mut line = String::new();
        self.stdout
            .read_line(&mut line)
            .await
            .context("reading worker message")?;

        if line.trim().is_empty() {
            let status = self.child.wait().await.context("waiting for worker")?;
            return Ok(WorkerOutcome::Exited(status.code()));
        }

        let message: WorkerMessage = serde_json::from_str(line.trim()).context("malformed worker message")?;
        let status = self.child.wait().await.context("waiting for worker")?;
        debug!(%status, "worker process exited");
        Ok(WorkerOutcome::Message(message))
    }

    async fn terminate(&mut self) -> Result<()> {
        // kill() also reaps the child, so nothing is left behind.
        self.child.kill().await.context("killing worker")?;
        debug!("worker process terminated");
        Ok(())
    }
}
