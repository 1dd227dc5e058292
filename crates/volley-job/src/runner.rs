//! Controller runner
//!
//! Wires the pieces of the reconcile loop together:
//!
//! ```text
//! tracking API poll ─► ChangeBridge ─┐
//!                                    ├─► channel ─► WorkQueue ─► N workers ─► reconcile
//! workload watcher (kube) ───────────┘
//! ```
//!
//! Workers take one key at a time from the [`WorkQueue`]; a key is never
//! reconciled by two workers at once.

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use volley_client::{RemoteClient, WatchOptions};
use volley_common::api::Job;
use volley_common::{BatchJob, RemoteObject, WorkloadRef, MANAGED_SELECTOR};

use crate::bridge::{not_draft, not_terminal, ChangeBridge};
use crate::controller::{error_policy, reconcile, JobContext};
use crate::error::JobError;
use crate::queue::WorkQueue;

/// Watcher timeout (seconds); must stay below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Runner tuning
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Concurrent reconcile workers
    pub workers: usize,
    /// Capacity of the channel between the change sources and the queue
    pub channel_capacity: usize,
    /// Tracking API poll settings
    pub watch: WatchOptions,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 100,
            watch: WatchOptions::default(),
        }
    }
}

/// Run the job controller until `stop` fires
///
/// `kube` enables the workload watcher, which requeues a job whenever its
/// workload changes; without it jobs advance on the poll and requeue timers
/// alone.
pub async fn run_controller(
    ctx: Arc<JobContext>,
    remote: RemoteClient,
    kube: Option<Client>,
    config: RunnerConfig,
    stop: CancellationToken,
) -> Result<(), JobError> {
    let namespace = ctx.settings.namespace.clone();
    let feed = remote.watch(Job::KIND, config.watch.clone(), stop.clone())?;
    let queue = Arc::new(WorkQueue::new());
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));

    info!(
        namespace = %namespace,
        location = %ctx.settings.location,
        workers = config.workers,
        "starting job controller"
    );

    let mut tasks = JoinSet::new();
    let bridge = ChangeBridge::new(namespace.clone())
        .with_filter(not_terminal)
        .with_filter(not_draft);
    tasks.spawn(bridge.run(feed, tx.clone(), stop.clone()));

    if let Some(client) = kube {
        tasks.spawn(watch_workloads(client, namespace, tx, stop.clone()));
    } else {
        drop(tx);
    }

    tasks.spawn(pump(rx, Arc::clone(&queue)));
    spawn_workers(&mut tasks, config.workers, &queue, &ctx);

    stop.cancelled().await;
    info!("stopping job controller");
    queue.shutdown();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "controller task ended abnormally");
        }
    }
    info!("job controller stopped");
    Ok(())
}

/// Move keys from the change channel into the queue until every sender is gone
async fn pump(mut rx: mpsc::Receiver<WorkloadRef>, queue: Arc<WorkQueue<WorkloadRef>>) {
    while let Some(key) = rx.recv().await {
        queue.add(key);
    }
    debug!("change channel closed");
}

fn spawn_workers(
    tasks: &mut JoinSet<()>,
    count: usize,
    queue: &Arc<WorkQueue<WorkloadRef>>,
    ctx: &Arc<JobContext>,
) {
    for id in 0..count.max(1) {
        tasks.spawn(worker(id, Arc::clone(queue), Arc::clone(ctx)));
    }
}

async fn worker(id: usize, queue: Arc<WorkQueue<WorkloadRef>>, ctx: Arc<JobContext>) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        match reconcile(key.clone(), Arc::clone(&ctx)).await {
            Ok(action) => {
                queue.forget(&key);
                if let Some(delay) = action.requeue_after() {
                    queue.add_after(key.clone(), delay);
                }
                debug!(worker = id, job = %key.name, ?action, "reconciliation completed");
            }
            Err(e) => {
                error_policy(&key, &e, &queue);
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}

/// Requeue a job whenever one of the operator's workloads changes
async fn watch_workloads(
    client: Client,
    namespace: String,
    tx: mpsc::Sender<WorkloadRef>,
    stop: CancellationToken,
) {
    let api: Api<BatchJob> = Api::namespaced(client, &namespace);
    let config = watcher::Config::default()
        .labels(MANAGED_SELECTOR)
        .timeout(WATCH_TIMEOUT_SECS);
    let stream = watcher(api, config).default_backoff().applied_objects();
    tokio::pin!(stream);

    info!(namespace = %namespace, "watching workloads");
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(workload)) => {
                let key = WorkloadRef::new(&workload.name_any()).within(&namespace);
                if tx.send(key).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => warn!(error = %e, "workload watch error"),
            None => break,
        }
    }
    debug!("workload watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::timeout;
    use volley_client::ClientError;

    use crate::controller::Settings;
    use crate::igniter::IgniterIndex;
    use crate::tracker::MockJobTracker;
    use crate::workload::{MockWorkerControl, MockWorkloadClient};

    fn context(tracker: MockJobTracker, workloads: MockWorkloadClient) -> Arc<JobContext> {
        let igniters = IgniterIndex::new(
            Arc::new(MockWorkerControl::new()),
            "loadtests",
            CancellationToken::new(),
        );
        Arc::new(JobContext::new(
            Arc::new(tracker),
            Arc::new(workloads),
            Arc::new(igniters),
            Settings::new("loadtests", "eu-west"),
        ))
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    #[tokio::test]
    async fn workers_reconcile_queued_keys() {
        let deletes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&deletes);

        let mut tracker = MockJobTracker::new();
        tracker.expect_get_job().returning(|_| Ok(None));
        let mut workloads = MockWorkloadClient::new();
        workloads.expect_delete_workload().returning(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let ctx = context(tracker, workloads);

        let queue = Arc::new(WorkQueue::new());
        let mut tasks = JoinSet::new();
        spawn_workers(&mut tasks, 2, &queue, &ctx);

        queue.add(WorkloadRef::new("job-1").within("loadtests"));
        queue.add(WorkloadRef::new("job-2").within("loadtests"));
        eventually("both deletes", || deletes.load(Ordering::SeqCst) == 2).await;

        queue.shutdown();
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    }

    #[tokio::test]
    async fn failed_keys_are_retried_with_backoff() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);

        let mut tracker = MockJobTracker::new();
        tracker.expect_get_job().returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ClientError::Remote {
                    method: "GET".to_string(),
                    url: "http://tracker/api/jobs/job-1".to_string(),
                    code: 502,
                    body: String::new(),
                })
            } else {
                Ok(None)
            }
        });
        let mut workloads = MockWorkloadClient::new();
        workloads.expect_delete_workload().returning(|_, _| Ok(()));
        let ctx = context(tracker, workloads);

        let queue = Arc::new(WorkQueue::new());
        let mut tasks = JoinSet::new();
        spawn_workers(&mut tasks, 1, &queue, &ctx);

        let key = WorkloadRef::new("job-1").within("loadtests");
        queue.add(key.clone());
        eventually("third attempt", || attempts.load(Ordering::SeqCst) >= 3).await;
        // success resets the backoff
        eventually("backoff reset", || queue.num_requeues(&key) == 0).await;

        queue.shutdown();
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn pump_forwards_until_senders_drop() {
        let queue = Arc::new(WorkQueue::new());
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(pump(rx, Arc::clone(&queue)));

        tx.send(WorkloadRef::new("job-1").within("loadtests"))
            .await
            .unwrap();
        tx.send(WorkloadRef::new("job-1").within("loadtests"))
            .await
            .unwrap();
        drop(tx);

        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn default_config_runs_several_workers() {
        let config = RunnerConfig::default();
        assert_eq!(config.workers, 4);
        assert!(!config.watch.dedup);
    }
}
