//! Multi-process execution: a supervisor that forks workers, hands them the
//! shared snapshot once, feeds them batches and requeues the work of any
//! worker that dies.

pub mod launcher;
pub mod protocol;
pub mod worker;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::common::{
    CLUSTER_WORKER_ENV, MAX_WORKER_RESTARTS, WORKER_CONCURRENCY_ENV, WORKER_ID_ENV, WORKER_PING_INTERVAL,
    WORKER_RESPAWN_DELAY, WORKER_SHUTDOWN_TIMEOUT, WORKER_START_TIMEOUT,
};
use crate::models::{SharedBuildSnapshot, TaskOutcome};
use launcher::{LaunchedWorker, WorkerLauncher, WorkerProcess};
use protocol::{ParentMessage, TaskAssignment, TaskId, WorkerMessage, read_frame, write_frame};

pub use launcher::ProcessLauncher;
pub use worker::{run_worker, serve_stdio};

#[derive(Debug, Clone)]
pub struct ClusterPoolOptions {
    /// Upper bound on worker processes.
    pub concurrency: usize,
    pub total_tasks: usize,
    /// Upper bound on in-flight tasks per worker.
    pub worker_concurrency: usize,
    /// Extra variables for every worker, on top of its identity.
    pub worker_env: BTreeMap<String, String>,
    pub start_timeout: Duration,
    pub respawn_delay: Duration,
    pub shutdown_timeout: Duration,
    /// How often initialized workers are pinged. A worker that has not
    /// answered the previous ping by the next one is logged as unresponsive.
    /// Zero turns pings off.
    pub ping_interval: Duration,
    /// Unexpected exits tolerated over the life of the pool.
    pub max_restarts: usize,
}

impl ClusterPoolOptions {
    pub fn new(concurrency: usize, total_tasks: usize, worker_concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            total_tasks,
            worker_concurrency: worker_concurrency.max(1),
            worker_env: BTreeMap::new(),
            start_timeout: WORKER_START_TIMEOUT,
            respawn_delay: WORKER_RESPAWN_DELAY,
            shutdown_timeout: WORKER_SHUTDOWN_TIMEOUT,
            ping_interval: WORKER_PING_INTERVAL,
            max_restarts: MAX_WORKER_RESTARTS,
        }
    }

    pub fn with_worker_env(mut self, worker_env: BTreeMap<String, String>) -> Self {
        self.worker_env = worker_env;
        self
    }

    /// Never start more workers than can be kept busy.
    pub fn worker_count(&self) -> usize {
        self.concurrency
            .min(self.total_tasks.div_ceil(self.worker_concurrency))
    }

    fn env_for(&self, worker_id: usize) -> BTreeMap<String, String> {
        let mut env = self.worker_env.clone();
        env.insert(WORKER_ID_ENV.to_string(), worker_id.to_string());
        env.insert(CLUSTER_WORKER_ENV.to_string(), "true".to_string());
        env.insert(
            WORKER_CONCURRENCY_ENV.to_string(),
            self.worker_concurrency.to_string(),
        );
        env
    }
}

/// Parent-side view of one worker.
///
/// `Initializing` happens inside the worker, between the parent sending
/// `Init` and receiving `InitComplete`; the parent sees it as `AwaitingInit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Forking,
    Online,
    AwaitingInit,
    Idle,
    Busy,
    Exited,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Forking => "forking",
            WorkerState::Online => "online",
            WorkerState::AwaitingInit => "awaiting-init",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Exited => "exited",
        };
        f.write_str(name)
    }
}

pub struct ClusterPool {
    options: ClusterPoolOptions,
    snapshot: Arc<SharedBuildSnapshot>,
    launcher: Arc<dyn WorkerLauncher>,
}

impl ClusterPool {
    pub fn new(
        options: ClusterPoolOptions,
        snapshot: Arc<SharedBuildSnapshot>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            options,
            snapshot,
            launcher,
        }
    }

    /// Run every task to a terminal state.
    ///
    /// `on_settled` is called once per task index, in completion order. The
    /// returned outcomes are ordered by task index. Only setup failures (a
    /// worker that never comes online, a launch error, too many crashes) end
    /// the pool early. A worker that reports `InitFailed` ends it too, with
    /// the worker's message in the error.
    pub async fn execute<S>(self, on_settled: S) -> Result<Vec<TaskOutcome>>
    where
        S: FnMut(usize, &TaskOutcome),
    {
        let total = self.options.total_tasks;
        if total == 0 {
            return Ok(Vec::new());
        }

        let start_time = Instant::now();
        let snapshot = self.snapshot.encode()?;
        let worker_count = self.options.worker_count();
        info!(
            "starting {} workers for {} tasks ({} in flight per worker)",
            worker_count, total, self.options.worker_concurrency
        );

        let (events_tx, events) = mpsc::unbounded_channel();
        let mut supervisor = Supervisor {
            queue: (0..total).collect(),
            results: (0..total).map(|_| None).collect(),
            remaining: total,
            assignments: HashMap::new(),
            workers: (0..worker_count).map(|_| WorkerSlot::default()).collect(),
            restarts: 0,
            next_sequence: 0,
            heartbeat: None,
            shutting_down: false,
            snapshot,
            options: self.options,
            launcher: self.launcher,
            events_tx,
        };

        let outcome = supervisor.run(events, on_settled).await;
        supervisor.shutdown().await;
        let results = outcome?;

        info!(
            duration = &*format!("{:?}", start_time.elapsed());
            "cluster finished {} tasks with {} restarts", total, supervisor.restarts
        );
        Ok(results)
    }
}

// ────────────────────────────────────────────────────────────────
// Supervisor
// ────────────────────────────────────────────────────────────────

enum PoolEvent {
    Message {
        worker_id: usize,
        generation: u64,
        message: WorkerMessage,
    },
    Disconnected {
        worker_id: usize,
        generation: u64,
        reason: String,
    },
    StartTimeout {
        worker_id: usize,
        generation: u64,
    },
    Respawn {
        worker_id: usize,
    },
    Heartbeat,
}

struct WorkerSlot {
    state: WorkerState,
    /// Bumped on every launch so events from a dead incarnation are ignored.
    generation: u64,
    input: Option<UnboundedSender<ParentMessage>>,
    process: Option<Box<dyn WorkerProcess>>,
    /// Task indices assigned and not yet acknowledged.
    in_flight: BTreeSet<usize>,
    /// A ping went out and no pong has come back yet.
    awaiting_pong: bool,
    io_tasks: Vec<JoinHandle<()>>,
}

impl Default for WorkerSlot {
    fn default() -> Self {
        Self {
            state: WorkerState::Exited,
            generation: 0,
            input: None,
            process: None,
            in_flight: BTreeSet::new(),
            awaiting_pong: false,
            io_tasks: Vec::new(),
        }
    }
}

impl WorkerSlot {
    fn accepts_tasks(&self) -> bool {
        matches!(self.state, WorkerState::Idle | WorkerState::Busy)
    }
}

struct Supervisor {
    queue: VecDeque<usize>,
    results: Vec<Option<TaskOutcome>>,
    remaining: usize,
    /// Current assignment of every in-flight task index.
    assignments: HashMap<usize, TaskId>,
    workers: Vec<WorkerSlot>,
    restarts: usize,
    /// Source of `TaskId::sequence`, bumped on every assignment.
    next_sequence: u64,
    heartbeat: Option<JoinHandle<()>>,
    shutting_down: bool,
    snapshot: Vec<u8>,
    options: ClusterPoolOptions,
    launcher: Arc<dyn WorkerLauncher>,
    events_tx: UnboundedSender<PoolEvent>,
}

impl Supervisor {
    async fn run<S>(&mut self, mut events: UnboundedReceiver<PoolEvent>, mut on_settled: S) -> Result<Vec<TaskOutcome>>
    where
        S: FnMut(usize, &TaskOutcome),
    {
        for worker_id in 0..self.workers.len() {
            self.spawn_worker(worker_id)?;
        }
        self.start_heartbeat();

        while self.remaining > 0 {
            let Some(event) = events.recv().await else {
                bail!("cluster event channel closed with {} tasks left", self.remaining);
            };
            match event {
                PoolEvent::Message {
                    worker_id,
                    generation,
                    message,
                } => {
                    if self.is_current(worker_id, generation) {
                        self.on_message(worker_id, message, &mut on_settled)?;
                    }
                }
                PoolEvent::Disconnected {
                    worker_id,
                    generation,
                    reason,
                } => {
                    if self.is_current(worker_id, generation) {
                        self.on_exit(worker_id, &reason)?;
                    }
                }
                PoolEvent::StartTimeout {
                    worker_id,
                    generation,
                } => {
                    let slot = &self.workers[worker_id];
                    if slot.generation == generation
                        && matches!(slot.state, WorkerState::Forking | WorkerState::Online)
                    {
                        bail!(
                            "worker {worker_id} did not come online within {:?}",
                            self.options.start_timeout
                        );
                    }
                }
                PoolEvent::Respawn { worker_id } => {
                    if self.remaining > 0 {
                        self.spawn_worker(worker_id)?;
                    }
                }
                PoolEvent::Heartbeat => self.ping_workers(),
            }
        }

        Ok(std::mem::take(&mut self.results)
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| TaskOutcome::failed("task never settled")))
            .collect())
    }

    fn is_current(&self, worker_id: usize, generation: u64) -> bool {
        self.workers
            .get(worker_id)
            .is_some_and(|slot| slot.generation == generation && slot.state != WorkerState::Exited)
    }

    fn spawn_worker(&mut self, worker_id: usize) -> Result<()> {
        let env = self.options.env_for(worker_id);
        let slot = &mut self.workers[worker_id];
        slot.generation += 1;
        slot.state = WorkerState::Forking;
        let generation = slot.generation;

        let LaunchedWorker {
            mut input,
            mut output,
            process,
        } = self
            .launcher
            .launch(worker_id, &env)
            .with_context(|| format!("failed to launch worker {worker_id}"))?;

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<ParentMessage>();
        let writer = tokio::spawn(async move {
            while let Some(message) = input_rx.recv().await {
                if let Err(e) = write_frame(&mut input, &message).await {
                    debug!("worker {worker_id} input closed: {e:#}");
                    break;
                }
            }
        });

        let events = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match read_frame::<_, WorkerMessage>(&mut output).await {
                    Ok(Some(message)) => {
                        let event = PoolEvent::Message {
                            worker_id,
                            generation,
                            message,
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break "output closed".to_string(),
                    Err(e) => break format!("{e:#}"),
                }
            };
            let _ = events.send(PoolEvent::Disconnected {
                worker_id,
                generation,
                reason,
            });
        });

        let events = self.events_tx.clone();
        let start_timeout = self.options.start_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(start_timeout).await;
            let _ = events.send(PoolEvent::StartTimeout {
                worker_id,
                generation,
            });
        });

        let slot = &mut self.workers[worker_id];
        slot.state = WorkerState::Online;
        slot.input = Some(input_tx);
        slot.process = Some(process);
        slot.in_flight.clear();
        slot.awaiting_pong = false;
        slot.io_tasks = vec![writer, reader, timer];
        debug!("worker {worker_id} is online (generation {generation})");
        Ok(())
    }

    fn on_message<S>(&mut self, worker_id: usize, message: WorkerMessage, on_settled: &mut S) -> Result<()>
    where
        S: FnMut(usize, &TaskOutcome),
    {
        match message {
            WorkerMessage::Ready { .. } => {
                if self.workers[worker_id].state != WorkerState::Online {
                    warn!("worker {worker_id} reported ready twice");
                    return Ok(());
                }
                let init = ParentMessage::Init {
                    snapshot: self.snapshot.clone(),
                };
                self.workers[worker_id].state = WorkerState::AwaitingInit;
                self.send(worker_id, init);
            }
            WorkerMessage::InitComplete { .. } => {
                if self.workers[worker_id].state != WorkerState::AwaitingInit {
                    warn!("worker {worker_id} acknowledged an init it was not sent");
                    return Ok(());
                }
                debug!("worker {worker_id} initialized");
                self.workers[worker_id].state = WorkerState::Idle;
                self.assign(worker_id);
            }
            // Every worker builds from the same snapshot, so a replacement
            // would fail the same way.
            WorkerMessage::InitFailed { message, .. } => {
                bail!("worker {worker_id} failed to initialize: {message}");
            }
            WorkerMessage::Pong { .. } => {
                debug!("worker {worker_id} answered ping");
                self.workers[worker_id].awaiting_pong = false;
            }
            WorkerMessage::Result { task_id, value } => {
                self.settle(task_id, value, on_settled);
                self.assign(worker_id);
            }
            WorkerMessage::Error { task_id, message } => {
                warn!("task {task_id} failed on worker {worker_id}: {message}");
                self.settle(task_id, TaskOutcome::failed(message), on_settled);
                self.assign(worker_id);
            }
            WorkerMessage::BatchResult { results } => {
                for reply in results {
                    self.settle(reply.task_id(), reply.into_outcome(), on_settled);
                }
                self.assign(worker_id);
            }
        }
        Ok(())
    }

    /// Record a reply. A reply for an assignment that is no longer current is
    /// logged and dropped; that covers replies from a dead incarnation, a
    /// duplicate of an accepted reply, and any id the pool never issued.
    fn settle<S>(&mut self, task_id: TaskId, outcome: TaskOutcome, on_settled: &mut S)
    where
        S: FnMut(usize, &TaskOutcome),
    {
        let index = task_id.task_index;
        if self.assignments.get(&index) != Some(&task_id) {
            warn!("dropping stale reply for task {task_id}");
            return;
        }
        self.assignments.remove(&index);
        if let Some(slot) = self.workers.get_mut(task_id.worker_id) {
            slot.in_flight.remove(&index);
            if slot.state == WorkerState::Busy && slot.in_flight.is_empty() {
                slot.state = WorkerState::Idle;
            }
        }

        // Only indices below the task count are ever assigned, and an index
        // leaves `assignments` the moment it settles.
        on_settled(index, &outcome);
        self.results[index] = Some(outcome);
        self.remaining -= 1;
    }

    /// Fill the worker's free slots from the front of the queue.
    fn assign(&mut self, worker_id: usize) {
        let slot = &self.workers[worker_id];
        if !slot.accepts_tasks() || self.queue.is_empty() {
            return;
        }
        let free = self
            .options
            .worker_concurrency
            .saturating_sub(slot.in_flight.len());
        let count = free.min(self.queue.len());
        if count == 0 {
            return;
        }

        self.next_sequence += 1;
        let sequence = self.next_sequence;
        let tasks: Vec<TaskAssignment> = self
            .queue
            .drain(..count)
            .enumerate()
            .map(|(offset, task_index)| TaskAssignment {
                task_id: TaskId {
                    worker_id,
                    task_index,
                    sequence,
                    offset,
                },
                task_index,
            })
            .collect();

        let slot = &mut self.workers[worker_id];
        for task in &tasks {
            slot.in_flight.insert(task.task_index);
            self.assignments.insert(task.task_index, task.task_id);
        }
        slot.state = WorkerState::Busy;

        let message = if let [task] = tasks[..] {
            ParentMessage::Task {
                task_id: task.task_id,
                task_index: task.task_index,
                worker_id,
            }
        } else {
            ParentMessage::BatchTask { tasks, worker_id }
        };
        self.send(worker_id, message);
    }

    fn start_heartbeat(&mut self) {
        let period = self.options.ping_interval;
        if period.is_zero() {
            return;
        }
        let events = self.events_tx.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticks.tick().await;
                if events.send(PoolEvent::Heartbeat).is_err() {
                    return;
                }
            }
        }));
    }

    /// Ping every initialized worker, flagging those that never answered the
    /// previous round.
    fn ping_workers(&mut self) {
        let interval = self.options.ping_interval;
        for worker_id in 0..self.workers.len() {
            let slot = &mut self.workers[worker_id];
            if !slot.accepts_tasks() {
                continue;
            }
            if slot.awaiting_pong {
                warn!(
                    "worker {worker_id} has not answered a ping in {interval:?} ({} tasks in flight)",
                    slot.in_flight.len()
                );
            }
            slot.awaiting_pong = true;
            self.send(worker_id, ParentMessage::Ping);
        }
    }

    fn assign_all(&mut self) {
        for worker_id in 0..self.workers.len() {
            self.assign(worker_id);
        }
    }

    fn send(&self, worker_id: usize, message: ParentMessage) {
        let delivered = self.workers[worker_id]
            .input
            .as_ref()
            .is_some_and(|input| input.send(message).is_ok());
        // An undelivered message is recovered by the disconnect that follows.
        if !delivered {
            debug!("worker {worker_id} input is gone");
        }
    }

    /// Unexpected exit: put the worker's unacknowledged tasks back at the
    /// front of the queue and schedule a replacement.
    fn on_exit(&mut self, worker_id: usize, reason: &str) -> Result<()> {
        let slot = &mut self.workers[worker_id];
        let previous = slot.state;
        slot.state = WorkerState::Exited;
        slot.input = None;
        let requeued = std::mem::take(&mut slot.in_flight);
        let process = slot.process.take();
        for task in slot.io_tasks.drain(..) {
            task.abort();
        }
        if let Some(process) = process {
            tokio::spawn(reap(worker_id, process, self.options.shutdown_timeout));
        }

        if self.shutting_down {
            return Ok(());
        }

        warn!(
            "worker {worker_id} exited while {previous} ({reason}); requeueing {} tasks",
            requeued.len()
        );
        for index in requeued.iter().rev() {
            self.assignments.remove(index);
            self.queue.push_front(*index);
        }

        self.restarts += 1;
        if self.restarts > self.options.max_restarts {
            bail!(
                "workers exited unexpectedly {} times, giving up with {} tasks left",
                self.restarts,
                self.remaining
            );
        }

        let events = self.events_tx.clone();
        let delay = self.options.respawn_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(PoolEvent::Respawn { worker_id });
        });

        self.assign_all();
        Ok(())
    }

    /// Ask every worker to stop, wait a bounded time, then force the rest.
    async fn shutdown(&mut self) {
        self.shutting_down = true;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        let mut processes = Vec::new();

        for (worker_id, slot) in self.workers.iter_mut().enumerate() {
            if let Some(input) = slot.input.take() {
                let _ = input.send(ParentMessage::Shutdown);
            }
            slot.state = WorkerState::Exited;
            slot.in_flight.clear();
            if let Some(process) = slot.process.take() {
                processes.push((worker_id, process));
            }
        }

        let timeout = self.options.shutdown_timeout;
        futures::future::join_all(
            processes
                .into_iter()
                .map(|(worker_id, process)| reap(worker_id, process, timeout)),
        )
        .await;

        for slot in &mut self.workers {
            for task in slot.io_tasks.drain(..) {
                task.abort();
            }
        }
        self.assignments.clear();
        self.queue.clear();
    }
}

async fn reap(worker_id: usize, mut process: Box<dyn WorkerProcess>, timeout: Duration) {
    match tokio::time::timeout(timeout, process.wait()).await {
        Ok(Ok(status)) => debug!("worker {worker_id} exited: {status}"),
        Ok(Err(e)) => warn!("worker {worker_id}: {e:#}"),
        Err(_) => {
            warn!("worker {worker_id} did not exit within {timeout:?}, killing it");
            if let Err(e) = process.kill().await {
                warn!("worker {worker_id}: {e:#}");
            }
        }
    }
}
