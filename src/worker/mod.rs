//! Isolated execution of decoders.
//!
//! A decode runs in a separate execution unit and reports back with a single
//! [`WorkerMessage`]. The parent side races that message against a deadline
//! and forcibly terminates the worker when the deadline wins. Worker
//! lifecycle: `Spawned -> Running -> {Completed | Failed | TimedOut |
//! CrashedNonZeroExit}`.

mod process;

pub use process::{ProcessHandle, ProcessWorker};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::DecodeOptions;
use crate::decode::{FileKind, decode_file};
use crate::error::{ErrorKind, ExtractError, Result};
use crate::geojson::FeatureCollection;

/// What a worker sends back: the decoded GeoJSON, or a structured error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerMessage {
    Completed { payload: Value },
    Failed { kind: Option<ErrorKind>, message: String },
}

impl WorkerMessage {
    pub fn from_result(result: Result<FeatureCollection>) -> Self {
        let collection = match result {
            Ok(collection) => collection,
            Err(e) => {
                return WorkerMessage::Failed {
                    kind: Some(e.kind()),
                    message: e.message().to_string(),
                };
            }
        };
        match serde_json::to_value(&collection) {
            Ok(payload) => WorkerMessage::Completed { payload },
            Err(e) => WorkerMessage::Failed {
                kind: Some(ErrorKind::Internal),
                message: format!("failed to encode GeoJSON: {e}"),
            },
        }
    }

    /// A failure without a recognized kind becomes `Internal`.
    pub fn into_result(self) -> Result<Value> {
        match self {
            WorkerMessage::Completed { payload } => Ok(payload),
            WorkerMessage::Failed { kind, message } => {
                Err(ExtractError::new(kind.unwrap_or(ErrorKind::Internal), message))
            }
        }
    }
}

/// One decode to run in isolation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseJob {
    pub file_path: PathBuf,
    pub kind: FileKind,
    pub options: DecodeOptions,
}

/// How a worker finished, as observed by the parent.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Message(WorkerMessage),
    /// Exited without sending a message.
    Exited(Option<i32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawned,
    Running,
    Completed,
    Failed,
    TimedOut,
    CrashedNonZeroExit,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerState::Spawned => "spawned",
            WorkerState::Running => "running",
            WorkerState::Completed => "completed",
            WorkerState::Failed => "failed",
            WorkerState::TimedOut => "timed_out",
            WorkerState::CrashedNonZeroExit => "crashed",
        })
    }
}

/// Starts isolated decode workers.
#[async_trait]
pub trait ParseWorker: Send + Sync {
    type Handle: WorkerHandle;

    async fn spawn(&self, job: &ParseJob) -> anyhow::Result<Self::Handle>;
}

/// A running worker.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Wait until the worker delivers its message or exits.
    async fn outcome(&mut self) -> anyhow::Result<WorkerOutcome>;

    /// Stop the worker and reap it; returns once it is gone.
    async fn terminate(&mut self) -> anyhow::Result<()>;
}

/// Run `job` on a fresh worker, failing with `ClientTimeout` if no outcome
/// arrives within `deadline`.
pub async fn dispatch<W: ParseWorker>(worker: &W, job: &ParseJob, deadline: Duration) -> Result<Value> {
    let mut handle = worker
        .spawn(job)
        .await
        .map_err(|e| ExtractError::from_anyhow(e, "failed to start parse worker"))?;
    debug!(state = %WorkerState::Spawned, kind = %job.kind, "parse worker started");
    debug!(state = %WorkerState::Running, deadline_ms = deadline.as_millis() as u64, "awaiting parse worker");

    let outcome = match tokio::time::timeout(deadline, handle.outcome()).await {
        Ok(outcome) => outcome.map_err(|e| ExtractError::from_anyhow(e, "parse worker failed"))?,
        Err(_) => {
            warn!(state = %WorkerState::TimedOut, deadline_ms = deadline.as_millis() as u64, "terminating parse worker");
            if let Err(e) = handle.terminate().await {
                error!(error = %format!("{e:#}"), "failed to terminate parse worker");
            }
            return Err(ExtractError::ClientTimeout("processing exceeded budget".into()));
        }
    };

    match outcome {
        WorkerOutcome::Message(message) => {
            let result = message.into_result();
            match &result {
                Ok(_) => info!(state = %WorkerState::Completed, "parse worker finished"),
                Err(e) => info!(state = %WorkerState::Failed, error = %e, "parse worker reported failure"),
            }
            result
        }
        WorkerOutcome::Exited(code) => {
            let code = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
            error!(state = %WorkerState::CrashedNonZeroExit, code = %code, "parse worker exited without a result");
            Err(ExtractError::Internal(format!("worker stopped unexpectedly with code {code}")))
        }
    }
}

/// Worker-side entry: decode the job and package the result as a message.
pub async fn run_job(job: &ParseJob) -> WorkerMessage {
    WorkerMessage::from_result(decode_file(job.kind, &job.file_path, &job.options).await)
}
