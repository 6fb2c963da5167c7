use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::{JoinError, JoinSet};

use super::protocol::{ParentMessage, TaskAssignment, TaskId, TaskReply, WorkerMessage, read_frame, write_frame};
use crate::background::TaskRunner;
use crate::background::worker_pool::panic_message;
use crate::config::BuildOptions;
use crate::interfaces::ProcessorFactory;
use crate::models::SharedBuildSnapshot;

const NOT_INITIALIZED: &str = "worker received a task before init";
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Message loop of one cluster worker.
///
/// Announces itself with `Ready`, waits for `Init`, then serves tasks until
/// `Shutdown` or the end of its input. A per-task error becomes an `Error`
/// reply; a panic while processing is a fault of the whole worker and makes
/// this function return `Err`, which the parent observes as an exit.
pub async fn run_worker<R, W>(
    input: R,
    output: W,
    worker_id: usize,
    factory: Arc<dyn ProcessorFactory>,
    options: BuildOptions,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel::<Result<ParentMessage>>();
    let (outbound, outbound_rx) = mpsc::unbounded_channel::<WorkerMessage>();

    let reader = tokio::spawn(read_loop(input, inbound_tx));
    let writer = tokio::spawn(write_loop(output, outbound_rx));

    let mut worker = WorkerRuntime {
        worker_id,
        factory,
        options,
        runner: None,
        outbound,
        handlers: JoinSet::new(),
    };

    let served = worker.serve(&mut inbound).await;
    reader.abort();

    if let Err(e) = served {
        error!("worker {worker_id} is going down: {e:#}");
        worker.handlers.shutdown().await;
        // Flush whatever was queued before the failure, `InitFailed` included.
        drop(worker);
        if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
            warn!("worker {worker_id} could not flush its output before exiting");
        }
        return Err(e);
    }

    // Closing the last sender lets the writer flush what is queued and stop.
    drop(worker);
    writer
        .await
        .map_err(|e| anyhow!("writer task of worker {worker_id} failed: {e}"))??;
    info!("worker {worker_id} stopped");
    Ok(())
}

/// Serve the worker protocol over this process's stdin and stdout.
pub async fn serve_stdio(
    worker_id: usize,
    factory: Arc<dyn ProcessorFactory>,
    options: BuildOptions,
) -> Result<()> {
    run_worker(tokio::io::stdin(), tokio::io::stdout(), worker_id, factory, options).await
}

async fn read_loop<R>(mut input: R, inbound: UnboundedSender<Result<ParentMessage>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame::<_, ParentMessage>(&mut input).await {
            Ok(Some(message)) => {
                if inbound.send(Ok(message)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = inbound.send(Err(e));
                return;
            }
        }
    }
}

async fn write_loop<W>(mut output: W, mut outbound: mpsc::UnboundedReceiver<WorkerMessage>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        write_frame(&mut output, &message)
            .await
            .with_context(|| format!("failed to send {} to parent", message.kind()))?;
    }
    Ok(())
}

struct WorkerRuntime {
    worker_id: usize,
    factory: Arc<dyn ProcessorFactory>,
    options: BuildOptions,
    runner: Option<TaskRunner>,
    outbound: UnboundedSender<WorkerMessage>,
    handlers: JoinSet<()>,
}

impl WorkerRuntime {
    async fn serve(&mut self, inbound: &mut mpsc::UnboundedReceiver<Result<ParentMessage>>) -> Result<()> {
        self.send(WorkerMessage::Ready {
            worker_id: self.worker_id,
        })?;

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(Ok(ParentMessage::Shutdown)) => {
                        debug!("worker {} received shutdown", self.worker_id);
                        break;
                    }
                    Some(Ok(message)) => self.handle(message)?,
                    Some(Err(e)) => return Err(e.context("parent channel is corrupt")),
                    None => {
                        debug!("worker {} input closed", self.worker_id);
                        break;
                    }
                },
                Some(joined) = self.handlers.join_next(), if !self.handlers.is_empty() => {
                    check_handler(joined)?;
                }
            }
        }

        while let Some(joined) = self.handlers.join_next().await {
            check_handler(joined)?;
        }
        Ok(())
    }

    fn handle(&mut self, message: ParentMessage) -> Result<()> {
        match message {
            ParentMessage::Init { snapshot } => {
                if let Err(e) = self.init(&snapshot) {
                    self.send(WorkerMessage::InitFailed {
                        worker_id: self.worker_id,
                        message: format!("{e:#}"),
                    })?;
                    return Err(e.context("worker initialization failed"));
                }
                Ok(())
            }
            ParentMessage::Task {
                task_id,
                task_index,
                worker_id,
            } => {
                let Some(runner) = self.runner.clone() else {
                    warn!("worker {} rejected task {task_id}: not initialized", self.worker_id);
                    return self.send(WorkerMessage::Error {
                        task_id,
                        message: NOT_INITIALIZED.to_string(),
                    });
                };
                let outbound = self.outbound.clone();
                self.handlers.spawn(async move {
                    let reply = match run_one(&runner, task_id, task_index, worker_id).await {
                        TaskReply::Success { task_id, value } => WorkerMessage::Result { task_id, value },
                        TaskReply::Failure { task_id, message } => WorkerMessage::Error { task_id, message },
                    };
                    let _ = outbound.send(reply);
                });
                Ok(())
            }
            ParentMessage::BatchTask { tasks, worker_id } => {
                let Some(runner) = self.runner.clone() else {
                    warn!(
                        "worker {} rejected a batch of {} tasks: not initialized",
                        self.worker_id,
                        tasks.len()
                    );
                    let results = tasks
                        .iter()
                        .map(|task| TaskReply::Failure {
                            task_id: task.task_id,
                            message: NOT_INITIALIZED.to_string(),
                        })
                        .collect();
                    return self.send(WorkerMessage::BatchResult { results });
                };
                let outbound = self.outbound.clone();
                self.handlers.spawn(async move {
                    let results = run_batch(&runner, &tasks, worker_id).await;
                    let _ = outbound.send(WorkerMessage::BatchResult { results });
                });
                Ok(())
            }
            ParentMessage::Ping => self.send(WorkerMessage::Pong {
                worker_id: self.worker_id,
            }),
            ParentMessage::Shutdown => Ok(()),
        }
    }

    fn init(&mut self, bytes: &[u8]) -> Result<()> {
        if self.runner.is_some() {
            warn!("worker {} ignored a second init", self.worker_id);
            return Ok(());
        }

        let start_time = Instant::now();
        let snapshot = Arc::new(SharedBuildSnapshot::decode(bytes)?);
        let total = snapshot.len();
        let runner = TaskRunner::new(snapshot, self.factory.as_ref(), self.options.clone())?;
        self.runner = Some(runner);
        info!(
            duration = &*format!("{:?}", start_time.elapsed());
            "worker {} initialized with {} tasks", self.worker_id, total
        );

        self.send(WorkerMessage::InitComplete {
            worker_id: self.worker_id,
        })
    }

    fn send(&self, message: WorkerMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|e| anyhow!("output to parent closed while sending {}", e.0.kind()))
    }
}

async fn run_one(runner: &TaskRunner, task_id: TaskId, task_index: usize, worker_id: usize) -> TaskReply {
    match runner.run(task_index, worker_id).await {
        Ok(value) => TaskReply::Success { task_id, value },
        Err(e) => {
            warn!("{e:#}");
            TaskReply::Failure {
                task_id,
                message: format!("{e:#}"),
            }
        }
    }
}

/// Every task of the batch runs concurrently; one reply per task, in batch order.
async fn run_batch(runner: &TaskRunner, tasks: &[TaskAssignment], worker_id: usize) -> Vec<TaskReply> {
    join_all(
        tasks
            .iter()
            .map(|task| run_one(runner, task.task_id, task.task_index, worker_id)),
    )
    .await
}

fn check_handler(joined: std::result::Result<(), JoinError>) -> Result<()> {
    match joined {
        Ok(()) => Ok(()),
        Err(e) if e.is_panic() => bail!("task handler panicked: {}", panic_message(&e.into_panic())),
        Err(e) => bail!("task handler failed: {e}"),
    }
}
