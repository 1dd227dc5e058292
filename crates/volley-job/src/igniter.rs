//! Ignition coordinator
//!
//! Workers come up paused. Once a job is `ready`, one [`Igniter`] per job
//! waits for the scheduled start and then unpauses every worker at once, so
//! the whole cohort starts generating load together. The reconciler polls
//! the igniter's `started` flag and error slot to drive the job forward.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use volley_common::api::{Job, Status};
use volley_common::metrics::{Outcome, IGNITIONS, IGNITION_SKEW};

use crate::error::JobError;
use crate::workload::WorkerControl;

/// Ignition state for one job
#[derive(Debug)]
pub struct Igniter {
    job: Job,
    pods: Vec<String>,
    started: AtomicBool,
    error: Mutex<Option<String>>,
    token: CancellationToken,
    done: CancellationToken,
}

impl Igniter {
    /// Whether the scheduled start was reached and dispatch began
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// First unpause failure, if any
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Wait for the driver to exit
    pub async fn finished(&self) {
        self.done.cancelled().await
    }

    /// Record `message` unless an earlier error is already stored; true if stored
    fn record_error(&self, message: String) -> bool {
        let mut slot = self.error.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(message);
        true
    }
}

/// Why `job` can't be ignited with `pods`, if anything
fn readiness_problem(job: &Job, pods: &[String]) -> Option<String> {
    if job.status != Status::Ready {
        return Some(format!("status is {}, expected ready", job.status));
    }
    if job.start_at().is_none() {
        return Some("scheduled start time is unknown".to_string());
    }
    if job.deadline().is_none() {
        return Some("job deadline is unknown".to_string());
    }
    if let Err(e) = job.validate_segments() {
        return Some(e.to_string());
    }
    if pods.len() != job.num_workers as usize {
        return Some(format!(
            "expected {} worker pods, got {}",
            job.num_workers,
            pods.len()
        ));
    }
    None
}

/// One [`Igniter`] per job name
pub struct IgniterIndex {
    igniters: DashMap<String, Arc<Igniter>>,
    control: Arc<dyn WorkerControl>,
    namespace: String,
    root: CancellationToken,
}

impl IgniterIndex {
    /// Index dispatching through `control` to pods in `namespace`
    ///
    /// Cancelling `root` stops every driver still waiting; dispatch already
    /// under way always runs to completion.
    pub fn new(
        control: Arc<dyn WorkerControl>,
        namespace: impl Into<String>,
        root: CancellationToken,
    ) -> Self {
        Self {
            igniters: DashMap::new(),
            control,
            namespace: namespace.into(),
            root,
        }
    }

    /// Existing igniter for the job, or a new one with its driver started
    ///
    /// Creation requires a `ready` job with a known start time and deadline
    /// and exactly one pod per assigned segment; anything else is
    /// [`JobError::NotReady`]. The check and the insert are one atomic step,
    /// so concurrent callers always share a single igniter.
    pub fn get_or_create(&self, job: &Job, pods: Vec<String>) -> Result<Arc<Igniter>, JobError> {
        match self.igniters.entry(job.name.clone()) {
            Entry::Occupied(existing) => Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                if let Some(reason) = readiness_problem(job, &pods) {
                    return Err(JobError::not_ready(&job.name, reason));
                }
                let igniter = Arc::new(Igniter {
                    job: job.clone(),
                    pods,
                    started: AtomicBool::new(false),
                    error: Mutex::new(None),
                    token: self.root.child_token(),
                    done: CancellationToken::new(),
                });
                slot.insert(Arc::clone(&igniter));

                tokio::spawn(drive(
                    Arc::clone(&igniter),
                    Arc::clone(&self.control),
                    self.namespace.clone(),
                ));
                info!(job = %job.name, start_at = ?job.start_at(), "igniter created");
                Ok(igniter)
            }
        }
    }

    /// Igniter for a job name
    pub fn get(&self, name: &str) -> Option<Arc<Igniter>> {
        self.igniters.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Remove the igniter, cancelling its driver if it is still waiting; true if there was one
    pub fn evict(&self, name: &str) -> bool {
        match self.igniters.remove(name) {
            Some((_, igniter)) => {
                igniter.token.cancel();
                debug!(job = %name, "igniter evicted");
                true
            }
            None => false,
        }
    }

    /// Number of live igniters
    pub fn len(&self) -> usize {
        self.igniters.len()
    }

    /// True when no igniters are live
    pub fn is_empty(&self) -> bool {
        self.igniters.is_empty()
    }
}

async fn drive(igniter: Arc<Igniter>, control: Arc<dyn WorkerControl>, namespace: String) {
    let name = igniter.job.name.clone();
    let wait = igniter
        .job
        .start_at()
        .and_then(|at| (at - Utc::now()).to_std().ok())
        .unwrap_or(Duration::ZERO);

    tokio::select! {
        _ = igniter.token.cancelled() => {
            debug!(job = %name, "igniter cancelled before start");
            igniter.done.cancel();
            return;
        }
        _ = tokio::time::sleep(wait) => {}
    }

    igniter.started.store(true, Ordering::SeqCst);
    info!(job = %name, workers = igniter.pods.len(), "igniting workers");

    // Once dispatch begins only an unpause failure may cancel it: neither
    // eviction nor shutdown may leave part of the cohort paused.
    let group = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for pod in igniter.pods.iter().cloned() {
        let control = Arc::clone(&control);
        let group = group.clone();
        let namespace = namespace.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = group.cancelled() => Err(format!("unpause of pod {} cancelled", pod)),
                res = control.unpause(&namespace, &pod) => res
                    .map(|_| Instant::now())
                    .map_err(|e| format!("failed to unpause pod {}: {}", pod, e)),
            }
        });
    }

    let mut first_ack: Option<Instant> = None;
    let mut last_ack: Option<Instant> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.unwrap_or_else(|e| Err(format!("unpause task failed: {}", e))) {
            Ok(at) => {
                first_ack = Some(first_ack.map_or(at, |f| f.min(at)));
                last_ack = Some(last_ack.map_or(at, |l| l.max(at)));
            }
            Err(message) => {
                if igniter.record_error(message.clone()) {
                    warn!(job = %name, error = %message, "ignition failed, cancelling remaining workers");
                    group.cancel();
                }
            }
        }
    }

    let outcome = if igniter.error().is_some() {
        Outcome::Error
    } else {
        Outcome::Success
    };
    IGNITIONS.add(1, &[KeyValue::new("result", outcome.as_str())]);
    if let (Some(first), Some(last)) = (first_ack, last_ack) {
        IGNITION_SKEW.record((last - first).as_secs_f64(), &[]);
    }
    if outcome == Outcome::Success {
        info!(job = %name, "all workers unpaused");
    }
    igniter.done.cancel();
}
