use std::fmt;

use anyhow::{Context, Result, anyhow, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::MAX_FRAME_LEN;
use crate::models::TaskOutcome;

/// Identity of one assignment: `worker-index-sequence-offset`.
///
/// `sequence` comes from a per-pool counter bumped on every assignment, so a
/// requeued task never reuses the id of its earlier attempt. `offset` is the
/// position inside the batch it was sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub worker_id: usize,
    pub task_index: usize,
    pub sequence: u64,
    pub offset: usize,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.worker_id, self.task_index, self.sequence, self.offset
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub task_index: usize,
}

/// Parent → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParentMessage {
    /// Bitcode-encoded `SharedBuildSnapshot`, sent exactly once per worker.
    Init { snapshot: Vec<u8> },
    Task {
        task_id: TaskId,
        task_index: usize,
        worker_id: usize,
    },
    BatchTask {
        tasks: Vec<TaskAssignment>,
        worker_id: usize,
    },
    Shutdown,
    Ping,
}

impl ParentMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ParentMessage::Init { .. } => "init",
            ParentMessage::Task { .. } => "task",
            ParentMessage::BatchTask { .. } => "batch-task",
            ParentMessage::Shutdown => "shutdown",
            ParentMessage::Ping => "ping",
        }
    }
}

/// One entry of a `BatchResult`, independent of its siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskReply {
    Success { task_id: TaskId, value: TaskOutcome },
    Failure { task_id: TaskId, message: String },
}

impl TaskReply {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskReply::Success { task_id, .. } | TaskReply::Failure { task_id, .. } => *task_id,
        }
    }

    /// Collapse into the outcome the parent records for the task.
    pub fn into_outcome(self) -> TaskOutcome {
        match self {
            TaskReply::Success { value, .. } => value,
            TaskReply::Failure { message, .. } => TaskOutcome::failed(message),
        }
    }
}

/// Worker → parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerMessage {
    Ready { worker_id: usize },
    Pong { worker_id: usize },
    InitComplete { worker_id: usize },
    /// The snapshot could not be decoded or the processor could not be built.
    /// Sent instead of `InitComplete`; the worker exits right after.
    InitFailed { worker_id: usize, message: String },
    Result { task_id: TaskId, value: TaskOutcome },
    Error { task_id: TaskId, message: String },
    BatchResult { results: Vec<TaskReply> },
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Ready { .. } => "ready",
            WorkerMessage::Pong { .. } => "pong",
            WorkerMessage::InitComplete { .. } => "init-complete",
            WorkerMessage::InitFailed { .. } => "init-failed",
            WorkerMessage::Result { .. } => "result",
            WorkerMessage::Error { .. } => "error",
            WorkerMessage::BatchResult { .. } => "batch-result",
        }
    }
}

// ────────────────────────────────────────────────────────────────
// Framing: u32 little-endian length, then a bitcode payload
// ────────────────────────────────────────────────────────────────

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bitcode::serialize(message).context("failed to encode frame")?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| anyhow!("frame of {} bytes exceeds the frame limit", payload.len()))?;

    writer.write_u32_le(len).await.context("failed to write frame header")?;
    writer.write_all(&payload).await.context("failed to write frame payload")?;
    writer.flush().await.context("failed to flush frame")?;
    Ok(())
}

/// `Ok(None)` on a clean end of stream before a header.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame header"),
    };
    if len > MAX_FRAME_LEN {
        bail!("frame of {len} bytes exceeds the frame limit");
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .context("stream ended inside a frame")?;
    let message = bitcode::deserialize(&payload).context("failed to decode frame")?;
    Ok(Some(message))
}
