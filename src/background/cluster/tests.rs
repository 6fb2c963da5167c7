use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::DuplexStream;

use super::*;
use super::protocol::TaskReply;
use crate::config::BuilderConfig;
use crate::models::{OutcomeKind, StorageObject};
use crate::testing::{EchoProcessorFactory, InProcessLauncher, TaskProcess};

fn snapshot(keys: &[String]) -> Arc<SharedBuildSnapshot> {
    Arc::new(SharedBuildSnapshot::new(
        HashMap::new(),
        HashMap::new(),
        keys.iter().map(|key| StorageObject::new(key.as_str()).with_size(1)).collect(),
        BuilderConfig::default(),
    ))
}

fn keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("album/IMG_{i:04}.jpg")).collect()
}

fn fast_options(concurrency: usize, total: usize, worker_concurrency: usize) -> ClusterPoolOptions {
    ClusterPoolOptions {
        start_timeout: Duration::from_secs(5),
        respawn_delay: Duration::from_millis(10),
        shutdown_timeout: Duration::from_millis(500),
        ..ClusterPoolOptions::new(concurrency, total, worker_concurrency)
    }
}

/// Speaks the worker protocol by hand. Every task is answered first under an
/// id the pool never issued, then twice under its real id. With `hold_until_ping`
/// the answers are kept back until the next ping arrives.
#[derive(Default)]
struct ReplayingLauncher {
    hold_until_ping: bool,
    received: Arc<Mutex<Vec<&'static str>>>,
}

impl ReplayingLauncher {
    fn received(&self) -> Vec<&'static str> {
        self.received.lock().unwrap().clone()
    }
}

impl WorkerLauncher for ReplayingLauncher {
    fn launch(&self, worker_id: usize, _env: &BTreeMap<String, String>) -> Result<LaunchedWorker> {
        let (parent_in, worker_in) = tokio::io::duplex(1 << 20);
        let (worker_out, parent_out) = tokio::io::duplex(1 << 20);
        let handle = tokio::spawn(replaying_worker(
            worker_in,
            worker_out,
            worker_id,
            self.hold_until_ping,
            self.received.clone(),
        ));
        Ok(LaunchedWorker {
            input: Box::new(parent_in),
            output: Box::new(parent_out),
            process: Box::new(TaskProcess::new(handle)),
        })
    }
}

async fn replaying_worker(
    mut input: DuplexStream,
    mut output: DuplexStream,
    worker_id: usize,
    hold_until_ping: bool,
    received: Arc<Mutex<Vec<&'static str>>>,
) -> Result<()> {
    write_frame(&mut output, &WorkerMessage::Ready { worker_id }).await?;
    let mut held = Vec::new();

    while let Some(message) = read_frame::<_, ParentMessage>(&mut input).await? {
        received.lock().unwrap().push(message.kind());
        let ids = match message {
            ParentMessage::Init { .. } => {
                write_frame(&mut output, &WorkerMessage::InitComplete { worker_id }).await?;
                continue;
            }
            ParentMessage::Ping => {
                write_frame(&mut output, &WorkerMessage::Pong { worker_id }).await?;
                for reply in held.drain(..) {
                    write_frame(&mut output, &reply).await?;
                }
                continue;
            }
            ParentMessage::Shutdown => return Ok(()),
            ParentMessage::Task { task_id, .. } => vec![task_id],
            ParentMessage::BatchTask { tasks, .. } => tasks.iter().map(|task| task.task_id).collect(),
        };

        let never_issued: Vec<TaskReply> = ids
            .iter()
            .map(|id| TaskReply::Failure {
                task_id: TaskId { sequence: 0, ..*id },
                message: "never issued".to_string(),
            })
            .collect();
        let real: Vec<TaskReply> = ids
            .iter()
            .map(|id| TaskReply::Failure {
                task_id: *id,
                message: format!("answer for task {}", id.task_index),
            })
            .collect();
        let replies = [
            WorkerMessage::BatchResult { results: never_issued },
            WorkerMessage::BatchResult { results: real.clone() },
            WorkerMessage::BatchResult { results: real },
        ];

        if hold_until_ping {
            held.extend(replies);
        } else {
            for reply in &replies {
                write_frame(&mut output, reply).await?;
            }
        }
    }
    Ok(())
}

#[test]
fn worker_count_never_exceeds_the_work_available() {
    assert_eq!(ClusterPoolOptions::new(2, 10, 5).worker_count(), 2);
    assert_eq!(ClusterPoolOptions::new(8, 10, 5).worker_count(), 2);
    assert_eq!(ClusterPoolOptions::new(8, 11, 5).worker_count(), 3);
    assert_eq!(ClusterPoolOptions::new(2, 100, 1).worker_count(), 2);
    assert_eq!(ClusterPoolOptions::new(4, 0, 2).worker_count(), 0);
}

#[test]
fn workers_receive_identity_and_caller_env() {
    let options = ClusterPoolOptions::new(2, 4, 2).with_worker_env(BTreeMap::from([(
        "GALLERY_FORCE_FULL_RESCAN".to_string(),
        "true".to_string(),
    )]));
    let env = options.env_for(1);
    assert_eq!(env["GALLERY_WORKER_ID"], "1");
    assert_eq!(env["GALLERY_CLUSTER_WORKER"], "true");
    assert_eq!(env["GALLERY_WORKER_CONCURRENCY"], "2");
    assert_eq!(env["GALLERY_FORCE_FULL_RESCAN"], "true");
}

#[tokio::test]
async fn every_task_settles_into_its_own_slot() {
    let keys = keys(10);
    let launcher = Arc::new(InProcessLauncher::new(
        EchoProcessorFactory::default().with_delay(Duration::from_millis(2)),
    ));
    let pool = ClusterPool::new(fast_options(2, keys.len(), 5), snapshot(&keys), launcher.clone());

    let mut settled = Vec::new();
    let results = pool
        .execute(|index, _| settled.push(index))
        .await
        .unwrap();

    assert_eq!(launcher.launches(), 2);
    assert_eq!(results.len(), keys.len());
    for (index, outcome) in results.iter().enumerate() {
        assert_eq!(outcome.kind, OutcomeKind::New);
        assert_eq!(outcome.item.as_ref().unwrap().key, keys[index]);
    }
    settled.sort_unstable();
    assert_eq!(settled, (0..keys.len()).collect::<Vec<_>>());
}

#[tokio::test]
async fn per_task_errors_do_not_take_the_worker_down() {
    let keys = keys(6);
    let launcher = Arc::new(InProcessLauncher::new(
        EchoProcessorFactory::default().fail_on(&keys[3]),
    ));
    let pool = ClusterPool::new(fast_options(2, keys.len(), 3), snapshot(&keys), launcher.clone());

    let results = pool.execute(|_, _| {}).await.unwrap();

    assert_eq!(launcher.launches(), 2);
    assert!(results[3].is_failed());
    assert!(results[3].item.is_none());
    assert!(results[3].error.as_deref().unwrap().contains("cannot decode"));
    assert_eq!(results.iter().filter(|o| o.is_failed()).count(), 1);
}

#[tokio::test]
async fn crash_mid_batch_requeues_unacknowledged_tasks() {
    let keys = keys(8);
    let factory = EchoProcessorFactory::default()
        .panic_once_on(&keys[1])
        .with_delay(Duration::from_millis(20));
    let launcher = Arc::new(InProcessLauncher::new(factory.clone()));
    // Respawn immediately so the replacement joins while the survivor is still busy.
    let options = ClusterPoolOptions {
        respawn_delay: Duration::ZERO,
        ..fast_options(2, keys.len(), 4)
    };
    let pool = ClusterPool::new(options, snapshot(&keys), launcher.clone());

    let mut settled = Vec::new();
    let results = pool
        .execute(|index, _| settled.push(index))
        .await
        .unwrap();

    // One replacement was forked for the crashed worker.
    assert_eq!(launcher.launches(), 3);
    assert_eq!(results.len(), keys.len());
    for (index, outcome) in results.iter().enumerate() {
        assert!(!outcome.is_failed(), "task {index} failed: {:?}", outcome.error);
        assert_eq!(outcome.item.as_ref().unwrap().key, keys[index]);
    }

    // Each slot settled exactly once even though the crashed batch ran twice.
    settled.sort_unstable();
    assert_eq!(settled, (0..keys.len()).collect::<Vec<_>>());
    let attempts = factory.calls().iter().filter(|key| **key == keys[1]).count();
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn repeated_crashes_exhaust_the_restart_budget() {
    let keys = keys(3);
    let launcher = Arc::new(InProcessLauncher::new(
        EchoProcessorFactory::default().panic_always_on(&keys[0]),
    ));
    let options = ClusterPoolOptions {
        max_restarts: 2,
        ..fast_options(1, keys.len(), 1)
    };
    let pool = ClusterPool::new(options, snapshot(&keys), launcher.clone());

    let err = pool.execute(|_, _| {}).await.unwrap_err();

    assert!(err.to_string().contains("exited unexpectedly"), "{err:#}");
    assert_eq!(launcher.launches(), 3);
}

#[tokio::test]
async fn a_worker_that_never_reports_ready_fails_the_pool() {
    let keys = keys(2);
    let launcher = Arc::new(InProcessLauncher::silent());
    let options = ClusterPoolOptions {
        start_timeout: Duration::from_millis(50),
        ..fast_options(1, keys.len(), 2)
    };
    let pool = ClusterPool::new(options, snapshot(&keys), launcher);

    let err = pool.execute(|_, _| {}).await.unwrap_err();
    assert!(err.to_string().contains("did not come online"), "{err:#}");
}

#[tokio::test]
async fn empty_task_set_starts_no_workers() {
    let launcher = Arc::new(InProcessLauncher::new(EchoProcessorFactory::default()));
    let pool = ClusterPool::new(fast_options(4, 0, 2), snapshot(&[]), launcher.clone());

    let results = pool.execute(|_, _| {}).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn a_failed_init_ends_the_pool_with_the_worker_message() {
    let keys = keys(4);
    let launcher = Arc::new(InProcessLauncher::new(
        EchoProcessorFactory::default().fail_create("storage credentials missing"),
    ));
    let pool = ClusterPool::new(fast_options(2, keys.len(), 2), snapshot(&keys), launcher.clone());

    let err = pool.execute(|_, _| {}).await.unwrap_err();

    let text = format!("{err:#}");
    assert!(text.contains("failed to initialize"), "{text}");
    assert!(text.contains("storage credentials missing"), "{text}");
    // No replacements were forked for a failure every worker would repeat.
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test]
async fn unknown_and_repeated_replies_are_dropped() {
    let keys = keys(7);
    let launcher = Arc::new(ReplayingLauncher::default());
    let pool = ClusterPool::new(fast_options(2, keys.len(), 3), snapshot(&keys), launcher.clone());

    let mut settled = Vec::new();
    let results = pool
        .execute(|index, _| settled.push(index))
        .await
        .unwrap();

    settled.sort_unstable();
    assert_eq!(settled, (0..keys.len()).collect::<Vec<_>>());
    assert_eq!(results.len(), keys.len());
    for (index, outcome) in results.iter().enumerate() {
        assert_eq!(
            outcome.error.as_deref(),
            Some(format!("answer for task {index}").as_str())
        );
    }
}

#[tokio::test]
async fn busy_workers_are_pinged() {
    let keys = keys(3);
    let launcher = Arc::new(ReplayingLauncher {
        hold_until_ping: true,
        ..ReplayingLauncher::default()
    });
    let options = ClusterPoolOptions {
        ping_interval: Duration::from_millis(20),
        ..fast_options(1, keys.len(), 3)
    };
    let pool = ClusterPool::new(options, snapshot(&keys), launcher.clone());

    let results = pool.execute(|_, _| {}).await.unwrap();

    assert_eq!(results.len(), keys.len());
    let received = launcher.received();
    assert_eq!(received[..2], ["init", "batch-task"]);
    assert!(received.contains(&"ping"), "{received:?}");
    assert_eq!(received.last(), Some(&"shutdown"));
}
