//! Polling change feed over the tracking API
//!
//! The tracking API has no watch verb, so [`RemoteClient::watch`] lists the
//! collection on a fixed interval and pushes every item into a channel. By
//! default every poll re-emits every item; downstream reconciliation is
//! idempotent and relies on that for periodic resync. With `dedup` on, only
//! items whose wire form changed since the previous poll are emitted.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use volley_common::metrics::POLL_FAILURES;
use volley_common::DynObject;

use crate::{ClientError, RemoteClient};

/// Default time between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default pause after a failed poll
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(8);

/// Default channel capacity
pub const DEFAULT_BUFFER: usize = 100;

/// Tuning for [`RemoteClient::watch`]
#[derive(Clone, Debug)]
pub struct WatchOptions {
    /// Time between polls
    pub interval: Duration,
    /// Extra pause after a failed poll
    pub failure_backoff: Duration,
    /// Emit only items that changed since the previous poll
    pub dedup: bool,
    /// Channel capacity; a full channel blocks the poller
    pub buffer: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
            dedup: false,
            buffer: DEFAULT_BUFFER,
        }
    }
}

/// Wire form of every item seen on the previous poll, keyed by name
#[derive(Default)]
struct Snapshot {
    seen: HashMap<String, serde_json::Value>,
}

impl Snapshot {
    /// Keep the items that are new or changed and forget names that vanished
    fn changed(&mut self, items: Vec<Box<dyn DynObject>>) -> Vec<Box<dyn DynObject>> {
        let present: HashSet<String> = items.iter().map(|i| i.name().to_string()).collect();
        self.seen.retain(|name, _| present.contains(name));

        items
            .into_iter()
            .filter(|item| match item.to_json() {
                Ok(value) => {
                    let unchanged = self.seen.get(item.name()) == Some(&value);
                    self.seen.insert(item.name().to_string(), value);
                    !unchanged
                }
                // can't compare, so don't suppress
                Err(_) => true,
            })
            .collect()
    }
}

impl RemoteClient {
    /// Start polling `kind` and return the receiving end of the feed
    ///
    /// Fails immediately when `kind` is not registered. The poller stops when
    /// `stop` is cancelled or the receiver is dropped; the channel closes
    /// once it has stopped.
    pub fn watch(
        &self,
        kind: &str,
        opts: WatchOptions,
        stop: CancellationToken,
    ) -> Result<mpsc::Receiver<Box<dyn DynObject>>, ClientError> {
        if !self.registry().contains(kind) {
            return Err(ClientError::UnknownType(kind.to_string()));
        }

        let (tx, rx) = mpsc::channel(opts.buffer.max(1));
        let client = self.clone();
        let kind = kind.to_string();
        tokio::spawn(async move {
            poll_loop(client, kind, opts, tx, stop).await;
        });
        Ok(rx)
    }
}

async fn poll_loop(
    client: RemoteClient,
    kind: String,
    opts: WatchOptions,
    tx: mpsc::Sender<Box<dyn DynObject>>,
    stop: CancellationToken,
) {
    info!(kind = %kind, interval = ?opts.interval, dedup = opts.dedup, "starting remote watch");

    let mut ticker = tokio::time::interval(opts.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut snapshot = Snapshot::default();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let listed = tokio::select! {
            _ = stop.cancelled() => break,
            listed = client.list_dyn(&kind) => listed,
        };

        match listed {
            Ok(collection) => {
                let mut items = collection.into_objects();
                if opts.dedup {
                    items = snapshot.changed(items);
                }
                debug!(kind = %kind, count = items.len(), "poll complete");

                for item in items {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        sent = tx.send(item) => {
                            if sent.is_err() {
                                debug!(kind = %kind, "watch receiver dropped, stopping poller");
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "poll failed, backing off");
                POLL_FAILURES.add(1, &[KeyValue::new("kind", kind.clone())]);
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(opts.failure_backoff) => {}
                }
            }
        }
    }

    info!(kind = %kind, "remote watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use tokio::time::timeout;
    use volley_common::api::{Job, Status};

    use crate::ClientConfig;

    #[derive(Clone, Default)]
    struct Fake {
        jobs: Arc<Mutex<Vec<Job>>>,
        failures_left: Arc<AtomicU32>,
        hits: Arc<AtomicU32>,
    }

    async fn list_jobs(State(fake): State<Fake>) -> Result<Json<Vec<Job>>, StatusCode> {
        fake.hits.fetch_add(1, Ordering::SeqCst);
        let left = fake.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            fake.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(StatusCode::BAD_GATEWAY);
        }
        Ok(Json(fake.jobs.lock().clone()))
    }

    async fn client_for(fake: &Fake) -> RemoteClient {
        let app = Router::new()
            .route("/api/workers/{location}/jobs", get(list_jobs))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let config =
            ClientConfig::new("eu-west").with_endpoint(format!("http://{}/api/", addr));
        RemoteClient::new(config, Arc::new(crate::default_registry())).unwrap()
    }

    fn job(name: &str, status: Status) -> Job {
        Job {
            name: name.to_string(),
            status,
            ..Default::default()
        }
    }

    fn fast(dedup: bool) -> WatchOptions {
        WatchOptions {
            interval: Duration::from_millis(40),
            failure_backoff: Duration::from_millis(60),
            dedup,
            buffer: 4,
        }
    }

    async fn next_name(rx: &mut mpsc::Receiver<Box<dyn DynObject>>) -> String {
        let item = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("watch produced nothing")
            .expect("watch closed");
        item.name().to_string()
    }

    #[tokio::test]
    async fn every_poll_re_emits_every_item_in_order() {
        let fake = Fake::default();
        fake.jobs
            .lock()
            .extend([job("a", Status::Pending), job("b", Status::Running)]);
        let client = client_for(&fake).await;
        let stop = CancellationToken::new();

        let mut rx = client.watch("Job", fast(false), stop.clone()).unwrap();
        let mut names = Vec::new();
        for _ in 0..4 {
            names.push(next_name(&mut rx).await);
        }
        assert_eq!(names, vec!["a", "b", "a", "b"]);
        stop.cancel();
    }

    #[tokio::test]
    async fn dedup_suppresses_unchanged_items() {
        let fake = Fake::default();
        fake.jobs
            .lock()
            .extend([job("a", Status::Pending), job("b", Status::Running)]);
        let client = client_for(&fake).await;
        let stop = CancellationToken::new();

        let mut rx = client.watch("Job", fast(true), stop.clone()).unwrap();
        assert_eq!(next_name(&mut rx).await, "a");
        assert_eq!(next_name(&mut rx).await, "b");

        // several polls pass without any change
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

        fake.jobs.lock()[1].status = Status::Completed;
        assert_eq!(next_name(&mut rx).await, "b");
        stop.cancel();
    }

    #[tokio::test]
    async fn failed_polls_back_off_then_recover() {
        let fake = Fake::default();
        fake.jobs.lock().push(job("a", Status::Queued));
        fake.failures_left.store(2, Ordering::SeqCst);
        let client = client_for(&fake).await;
        let stop = CancellationToken::new();

        let mut rx = client.watch("Job", fast(false), stop.clone()).unwrap();
        assert_eq!(next_name(&mut rx).await, "a");
        assert!(fake.hits.load(Ordering::SeqCst) >= 3);
        stop.cancel();
    }

    #[tokio::test]
    async fn cancelling_closes_the_channel() {
        let fake = Fake::default();
        let client = client_for(&fake).await;
        let stop = CancellationToken::new();

        let mut rx = client.watch("Job", fast(false), stop.clone()).unwrap();
        stop.cancel();
        let closed = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn unknown_kind_fails_fast() {
        let fake = Fake::default();
        let client = client_for(&fake).await;
        let err = client
            .watch("Ping", WatchOptions::default(), CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownType(k) if k == "Ping"));
    }

    #[test]
    fn snapshot_forgets_vanished_names() {
        let mut snapshot = Snapshot::default();
        let first: Vec<Box<dyn DynObject>> =
            vec![Box::new(job("a", Status::Pending)), Box::new(job("b", Status::Pending))];
        assert_eq!(snapshot.changed(first).len(), 2);

        let second: Vec<Box<dyn DynObject>> = vec![Box::new(job("a", Status::Pending))];
        assert!(snapshot.changed(second).is_empty());
        assert!(!snapshot.seen.contains_key("b"));

        // a reappearing name counts as new
        let third: Vec<Box<dyn DynObject>> = vec![Box::new(job("b", Status::Pending))];
        assert_eq!(snapshot.changed(third).len(), 1);
    }
}
