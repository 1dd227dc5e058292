//! Change bridge from the remote feed into the reconcile queue
//!
//! Takes type-erased items from a [`volley_client::RemoteClient::watch`]
//! feed, applies the configured predicates, and forwards the workload
//! reference of every passing item.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use volley_common::api::{Job, Status};
use volley_common::{Convertible, DynObject, Identifiable, WorkloadRef};

/// Predicate over a feed item; every installed filter must pass
pub type Filter = Box<dyn Fn(&dyn DynObject) -> bool + Send + Sync>;

/// Jobs that still need reconciling: everything except completed and failed
///
/// Canceled jobs pass so the reconciler can suspend their workload. Items
/// that are not jobs fail.
pub fn not_terminal(obj: &dyn DynObject) -> bool {
    obj.as_any()
        .downcast_ref::<Job>()
        .is_some_and(|job| !matches!(job.status, Status::Completed | Status::Failed))
}

/// Jobs whose run is not a draft; items that are not jobs fail
pub fn not_draft(obj: &dyn DynObject) -> bool {
    obj.as_any()
        .downcast_ref::<Job>()
        .is_some_and(|job| !job.test_run.draft)
}

/// Filters feed items and forwards their workload references
pub struct ChangeBridge {
    namespace: String,
    filters: Vec<Filter>,
}

impl ChangeBridge {
    /// Bridge mapping items into `namespace`, with no filters
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            filters: Vec::new(),
        }
    }

    /// Add a predicate
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&dyn DynObject) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Box::new(filter));
        self
    }

    /// Whether every filter accepts `obj`
    pub fn accepts(&self, obj: &dyn DynObject) -> bool {
        self.filters.iter().all(|f| f(obj))
    }

    /// Forward until the feed closes, the queue closes, or `stop` fires
    ///
    /// Sends are awaited: a slow consumer slows the bridge down rather than
    /// losing items.
    pub async fn run(
        self,
        mut feed: mpsc::Receiver<Box<dyn DynObject>>,
        queue: mpsc::Sender<WorkloadRef>,
        stop: CancellationToken,
    ) {
        info!(namespace = %self.namespace, filters = self.filters.len(), "change bridge started");
        loop {
            let item = tokio::select! {
                _ = stop.cancelled() => break,
                item = feed.recv() => match item {
                    Some(item) => item,
                    None => {
                        debug!("feed closed");
                        break;
                    }
                },
            };

            if !self.accepts(item.as_ref()) {
                trace!(kind = item.kind(), name = %item.name(), "filtered out");
                continue;
            }

            let key = item.to_workload_ref(&self.namespace);
            tokio::select! {
                _ = stop.cancelled() => break,
                sent = queue.send(key) => {
                    if sent.is_err() {
                        debug!("queue closed");
                        break;
                    }
                }
            }
        }
        info!("change bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use volley_common::RemoteObject;

    fn job(name: &str, status: Status) -> Job {
        Job {
            name: name.to_string(),
            status,
            ..Default::default()
        }
    }

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct Other {
        name: String,
    }

    impl Identifiable for Other {
        fn name(&self) -> &str {
            &self.name
        }
    }

    impl Convertible for Other {
        fn to_workload_ref(&self, namespace: &str) -> WorkloadRef {
            WorkloadRef::new(&self.name).within(namespace)
        }
    }

    impl RemoteObject for Other {
        const KIND: &'static str = "Other";
    }

    #[test]
    fn terminal_jobs_are_dropped_but_canceled_passes() {
        assert!(not_terminal(&job("a", Status::Pending)));
        assert!(not_terminal(&job("a", Status::Running)));
        assert!(not_terminal(&job("a", Status::Canceled)));
        assert!(!not_terminal(&job("a", Status::Completed)));
        assert!(!not_terminal(&job("a", Status::Failed)));
    }

    #[test]
    fn foreign_types_fail_closed() {
        let other = Other {
            name: "x".to_string(),
        };
        assert!(!not_terminal(&other));
        assert!(!not_draft(&other));
    }

    #[test]
    fn filters_combine_with_and() {
        let bridge = ChangeBridge::new("loadtests")
            .with_filter(not_terminal)
            .with_filter(not_draft);
        let mut draft = job("a", Status::Pending);
        draft.test_run.draft = true;
        assert!(!bridge.accepts(&draft));
        assert!(bridge.accepts(&job("b", Status::Pending)));
        assert!(ChangeBridge::new("loadtests").accepts(&draft));
    }

    #[tokio::test]
    async fn forwards_passing_items_in_order() {
        let (feed_tx, feed_rx) = mpsc::channel::<Box<dyn DynObject>>(8);
        let (queue_tx, mut queue_rx) = mpsc::channel(8);
        let stop = CancellationToken::new();

        let bridge = ChangeBridge::new("loadtests").with_filter(not_terminal);
        let handle = tokio::spawn(bridge.run(feed_rx, queue_tx, stop.clone()));

        for (name, status) in [
            ("job-1", Status::Pending),
            ("job-2", Status::Completed),
            ("job-3", Status::Canceled),
        ] {
            feed_tx.send(Box::new(job(name, status))).await.unwrap();
        }
        drop(feed_tx);

        let first = queue_rx.recv().await.unwrap();
        assert_eq!(first.name, "job-1");
        assert_eq!(first.namespace.as_deref(), Some("loadtests"));
        assert_eq!(queue_rx.recv().await.unwrap().name, "job-3");

        // feed closed, so the bridge exits and the queue closes
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(queue_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_queue_blocks_instead_of_dropping() {
        let (feed_tx, feed_rx) = mpsc::channel::<Box<dyn DynObject>>(8);
        let (queue_tx, mut queue_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        tokio::spawn(ChangeBridge::new("loadtests").run(feed_rx, queue_tx, stop.clone()));

        for i in 0..4 {
            feed_tx
                .send(Box::new(job(&format!("job-{}", i), Status::Queued)))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut names = Vec::new();
        for _ in 0..4 {
            names.push(queue_rx.recv().await.unwrap().name);
        }
        assert_eq!(names, vec!["job-0", "job-1", "job-2", "job-3"]);
        stop.cancel();
    }
}
