//! Job reconciliation
//!
//! [`reconcile`] is invoked once per workload reference, at least once per
//! change, and is idempotent: every pass re-reads the job record and the
//! cluster state and moves the job at most one step along
//! `pending → queued → ready → running → completed`, or to `failed`.
//!
//! Status writes go through [`JobTracker::update_job`]; any error is
//! returned so the runner can retry the key with backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, error, info, warn};

use volley_common::api::{Job, OutputCatalog, OutputConfig, OutputRef, Status};
use volley_common::metrics::{record_reconcile, record_transition, Outcome};
use volley_common::{BatchJob, WorkloadRef};

use crate::compiler::{self, stored_hash};
use crate::error::JobError;
use crate::igniter::IgniterIndex;
use crate::queue::{Action, WorkQueue};
use crate::tracker::JobTracker;
use crate::workload::{self, WorkloadClient};

/// Requeue interval while a job converges towards `ready`
pub const CONVERGE_INTERVAL: Duration = Duration::from_secs(5);
/// Requeue interval while workers generate load
pub const RUNNING_INTERVAL: Duration = Duration::from_secs(15);
/// Longest wait between passes of a `ready` job before its start time
pub const MAX_START_WAIT: Duration = Duration::from_secs(60);
/// Shortest wait between passes of a `ready` job
pub const MIN_START_WAIT: Duration = Duration::from_secs(1);
/// How long a pod must have been ready before it counts as online
pub const DEFAULT_STABILITY_WINDOW: Duration = Duration::from_secs(1);

const QUEUED_DESCRIPTION: &str = "Test run is queued for execution";
const READY_DESCRIPTION: &str = "Worker pods are ready and waiting to start testing";
const RUNNING_DESCRIPTION: &str = "Workers have been started";
const COMPLETED_DESCRIPTION: &str = "All workers finished successfully";

/// Static reconciler settings
#[derive(Clone, Debug)]
pub struct Settings {
    /// Namespace workloads are created in
    pub namespace: String,
    /// Location slug this operator serves
    pub location: String,
    /// Minimum time a pod must have been ready to count as online
    pub stability_window: Duration,
    /// Metrics sinks that test runs may refer to by name
    pub outputs: OutputCatalog,
}

impl Settings {
    /// Settings with the default stability window
    pub fn new(namespace: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            location: location.into(),
            stability_window: DEFAULT_STABILITY_WINDOW,
            outputs: OutputCatalog::new(),
        }
    }

    /// Override the stability window
    pub fn with_stability_window(mut self, window: Duration) -> Self {
        self.stability_window = window;
        self
    }

    /// Set the named metrics sinks
    pub fn with_outputs(mut self, outputs: OutputCatalog) -> Self {
        self.outputs = outputs;
        self
    }

    /// Metrics sink for `job`, if it has one this operator can resolve
    ///
    /// A sink named on the record but missing from [`Settings::outputs`]
    /// leaves the workers without a sidecar.
    pub fn output_for<'a>(&'a self, job: &'a Job) -> Option<&'a OutputConfig> {
        let output = job.test_run.test_output.as_ref()?;
        let resolved = output.resolve(&self.outputs);
        if resolved.is_none() {
            if let OutputRef::Named(name) = output {
                warn!(job = %job.name, sink = %name, "unknown metrics sink, running without metrics");
            }
        }
        resolved
    }
}

/// Shared state for every reconcile pass
pub struct JobContext {
    /// Job records on the tracking API
    pub tracker: Arc<dyn JobTracker>,
    /// Cluster access for workloads and their pods
    pub workloads: Arc<dyn WorkloadClient>,
    /// Live igniters, one per `ready` or `running` job
    pub igniters: Arc<IgniterIndex>,
    /// Static settings
    pub settings: Settings,
}

impl JobContext {
    /// Bundle the reconciler's dependencies
    pub fn new(
        tracker: Arc<dyn JobTracker>,
        workloads: Arc<dyn WorkloadClient>,
        igniters: Arc<IgniterIndex>,
        settings: Settings,
    ) -> Self {
        Self {
            tracker,
            workloads,
            igniters,
            settings,
        }
    }
}

/// Reconcile the job behind `key`
pub async fn reconcile(key: WorkloadRef, ctx: Arc<JobContext>) -> Result<Action, JobError> {
    let started = Instant::now();
    let namespace = key
        .namespace
        .clone()
        .unwrap_or_else(|| ctx.settings.namespace.clone());

    let (observed, result) = match ctx.tracker.get_job(&key.name).await {
        Err(e) => (None, Err(JobError::from(e))),
        Ok(None) => (None, reconcile_missing(&key.name, &namespace, &ctx).await),
        Ok(Some(job)) => {
            let status = job.status;
            (Some(status), reconcile_job(job, &namespace, &ctx).await)
        }
    };

    record_reconcile(
        observed,
        Outcome::of(&result),
        started.elapsed().as_secs_f64(),
    );
    result
}

/// Log a failed pass and schedule the key with per-key backoff
///
/// Errors that can't clear on their own are not retried; the next poll of
/// the tracking API brings the key back if the job record changes.
pub fn error_policy(
    key: &WorkloadRef,
    error: &JobError,
    queue: &Arc<WorkQueue<WorkloadRef>>,
) -> Action {
    if !error.is_retryable() {
        error!(job = %key.name, %error, "reconciliation failed permanently");
        queue.forget(key);
        return Action::await_change();
    }

    let delay = queue.add_rate_limited(key.clone());
    match error {
        JobError::NotReady { .. } => {
            debug!(job = %key.name, %error, ?delay, "job not ready yet");
        }
        _ => {
            warn!(job = %key.name, %error, ?delay, "reconciliation failed, retrying");
        }
    }
    Action::requeue(delay)
}

async fn reconcile_missing(
    name: &str,
    namespace: &str,
    ctx: &JobContext,
) -> Result<Action, JobError> {
    info!(job = %name, "job no longer tracked, removing workload");
    ctx.igniters.evict(name);
    ctx.workloads.delete_workload(namespace, name).await?;
    Ok(Action::await_change())
}

async fn reconcile_job(
    mut job: Job,
    namespace: &str,
    ctx: &JobContext,
) -> Result<Action, JobError> {
    debug!(job = %job.name, status = %job.status, "reconciling job");

    match job.status {
        Status::Completed | Status::Failed => {
            ctx.igniters.evict(&job.name);
            return Ok(Action::await_change());
        }
        Status::Canceled => {
            ctx.workloads.suspend_workload(namespace, &job.name).await?;
            ctx.igniters.evict(&job.name);
            return Ok(Action::await_change());
        }
        _ => {}
    }

    let existing = ctx.workloads.get_workload(namespace, &job.name).await?;
    let workload = match (job.status, existing) {
        (Status::Pending | Status::Queued, existing) => {
            sync_workload(&mut job, namespace, existing, ctx).await?
        }
        (_, Some(workload)) => workload,
        (_, None) => {
            warn!(job = %job.name, status = %job.status, "workload disappeared");
            fail_job(&mut job, ctx, "Workload disappeared while the test was in progress").await?;
            ctx.igniters.evict(&job.name);
            return Ok(Action::await_change());
        }
    };

    if let Some(message) = workload::failure_message(&workload) {
        warn!(job = %job.name, %message, "workload failed");
        fail_job(&mut job, ctx, format!("Workload failed: {}", message)).await?;
        ctx.igniters.evict(&job.name);
        return Ok(Action::await_change());
    }

    match job.status {
        Status::Pending => {
            set_status(&mut job, ctx, Status::Queued, QUEUED_DESCRIPTION).await?;
            Ok(Action::requeue(CONVERGE_INTERVAL))
        }
        Status::Queued => reconcile_queued(&mut job, namespace, &workload, ctx).await,
        Status::Ready => reconcile_ready(&mut job, namespace, ctx).await,
        Status::Running => reconcile_running(&mut job, &workload, ctx).await,
        _ => Ok(Action::await_change()),
    }
}

/// Make the workload, sidecar secret and disruption budget match the job
///
/// A segment mismatch or a failed write fails the job and returns the error.
async fn sync_workload(
    job: &mut Job,
    namespace: &str,
    existing: Option<BatchJob>,
    ctx: &JobContext,
) -> Result<BatchJob, JobError> {
    if let Err(e) = job.validate_segments() {
        let expected = job.num_workers;
        let actual = job.assigned_segments.len();
        fail_job(job, ctx, e.to_string()).await?;
        return Err(JobError::SegmentMismatch {
            job: job.name.clone(),
            expected,
            actual,
        });
    }

    match upsert_objects(job, namespace, existing, ctx).await {
        Ok(workload) => Ok(workload),
        Err(e @ JobError::NotReady { .. }) => Err(e),
        Err(e) => {
            fail_job(job, ctx, format!("Failed to create workers: {}", e)).await?;
            Err(e)
        }
    }
}

async fn upsert_objects(
    job: &Job,
    namespace: &str,
    existing: Option<BatchJob>,
    ctx: &JobContext,
) -> Result<BatchJob, JobError> {
    let location = &ctx.settings.location;
    let output = ctx.settings.output_for(job);
    let desired = compiler::build_workload(job, namespace, location, output)?;

    let workload = match existing {
        Some(current) if stored_hash(&current.metadata) == stored_hash(&desired.metadata) => {
            debug!(job = %job.name, "workload up to date");
            current
        }
        Some(current) => return replace_workload(job, namespace, &current, ctx).await,
        None => {
            let applied = ctx.workloads.apply_workload(&desired).await?;
            info!(job = %job.name, workers = job.num_workers, "workload applied");
            applied
        }
    };

    let owner = compiler::owner_reference(&workload);

    if let Some(output) = output {
        let secret =
            compiler::build_metrics_secret(job, namespace, location, output, owner.clone())?;
        let name = compiler::metrics_secret_name(&job.name);
        let current = ctx.workloads.get_secret(namespace, &name).await?;
        if !same_hash(current.as_ref().map(|s| &s.metadata), &secret.metadata) {
            ctx.workloads.apply_secret(&secret).await?;
            debug!(job = %job.name, secret = %name, "metrics secret applied");
        }
    }

    let pdb = compiler::build_pdb(job, namespace, owner)?;
    let current = ctx.workloads.get_pdb(namespace, &job.name).await?;
    if !same_hash(current.as_ref().map(|p| &p.metadata), &pdb.metadata) {
        ctx.workloads.apply_pdb(&pdb).await?;
        debug!(job = %job.name, "disruption budget applied");
    }

    Ok(workload)
}

/// Delete a workload whose definition no longer matches the job
///
/// A Job's pod template is immutable, so the workload is recreated on a
/// later pass once the old one is gone.
async fn replace_workload(
    job: &Job,
    namespace: &str,
    current: &BatchJob,
    ctx: &JobContext,
) -> Result<BatchJob, JobError> {
    if current.metadata.deletion_timestamp.is_none() {
        info!(job = %job.name, "workload definition changed, recreating workers");
        ctx.workloads.delete_workload(namespace, &job.name).await?;
    }
    Err(JobError::not_ready(
        &job.name,
        "waiting for the outdated workload to be removed",
    ))
}

fn same_hash(current: Option<&ObjectMeta>, desired: &ObjectMeta) -> bool {
    match (current.and_then(stored_hash), stored_hash(desired)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

async fn reconcile_queued(
    job: &mut Job,
    namespace: &str,
    workload: &BatchJob,
    ctx: &JobContext,
) -> Result<Action, JobError> {
    let pods = ctx.workloads.list_worker_pods(namespace, &job.name).await?;
    let now = Utc::now();
    let online = pods
        .iter()
        .filter(|p| workload::is_pod_stable_ready(p, now, ctx.settings.stability_window))
        .count() as u32;

    let changed = online != job.online_workers;
    job.online_workers = online;

    let ready = workload::counts(workload).ready;
    if online == job.num_workers && ready >= job.num_workers {
        info!(job = %job.name, workers = online, "all workers online");
        set_status(job, ctx, Status::Ready, READY_DESCRIPTION).await?;
        return Ok(Action::requeue(MIN_START_WAIT));
    }

    if changed {
        debug!(job = %job.name, online, wanted = job.num_workers, "online workers changed");
        ctx.tracker.update_job(job).await?;
    }
    Ok(Action::requeue(CONVERGE_INTERVAL))
}

async fn reconcile_ready(
    job: &mut Job,
    namespace: &str,
    ctx: &JobContext,
) -> Result<Action, JobError> {
    let igniter = match ctx.igniters.get(&job.name) {
        Some(igniter) => igniter,
        None => {
            let pods = ctx.workloads.list_worker_pods(namespace, &job.name).await?;
            let names = workload::pods_by_ordinal(&pods, job.num_workers)
                .map_err(|reason| JobError::not_ready(&job.name, reason))?;
            ctx.igniters.get_or_create(job, names)?
        }
    };

    if let Some(message) = igniter.error() {
        fail_job(job, ctx, format!("Failed to start workers: {}", message)).await?;
        ctx.igniters.evict(&job.name);
        return Ok(Action::await_change());
    }

    if igniter.is_started() {
        set_status(job, ctx, Status::Running, RUNNING_DESCRIPTION).await?;
        return Ok(Action::requeue(RUNNING_INTERVAL));
    }

    Ok(Action::requeue(start_wait(job)))
}

fn start_wait(job: &Job) -> Duration {
    job.start_at()
        .and_then(|at| (at - Utc::now()).to_std().ok())
        .unwrap_or(Duration::ZERO)
        .clamp(MIN_START_WAIT, MAX_START_WAIT)
}

async fn reconcile_running(
    job: &mut Job,
    workload: &BatchJob,
    ctx: &JobContext,
) -> Result<Action, JobError> {
    if let Some(message) = ctx.igniters.get(&job.name).and_then(|i| i.error()) {
        fail_job(job, ctx, format!("Failed to start workers: {}", message)).await?;
        ctx.igniters.evict(&job.name);
        return Ok(Action::await_change());
    }

    let counts = workload::counts(workload);
    if counts.active > 0 {
        return Ok(Action::requeue(RUNNING_INTERVAL));
    }

    if counts.succeeded >= job.num_workers {
        set_status(job, ctx, Status::Completed, COMPLETED_DESCRIPTION).await?;
    } else {
        let message = format!(
            "{} of {} workers finished successfully",
            counts.succeeded, job.num_workers
        );
        fail_job(job, ctx, message).await?;
    }
    ctx.igniters.evict(&job.name);
    Ok(Action::await_change())
}

async fn fail_job(
    job: &mut Job,
    ctx: &JobContext,
    message: impl Into<String>,
) -> Result<bool, JobError> {
    set_status(job, ctx, Status::Failed, message).await
}

/// Move the job to `next` and write it back
///
/// Invalid transitions are logged and skipped; returns whether a write happened.
async fn set_status(
    job: &mut Job,
    ctx: &JobContext,
    next: Status,
    description: impl Into<String>,
) -> Result<bool, JobError> {
    let from = job.status;
    if let Err(e) = job.transition(next, description) {
        warn!(job = %job.name, error = %e, "refusing status transition");
        return Ok(false);
    }

    ctx.tracker.update_job(job).await?;
    if from != next {
        record_transition(from, next);
        info!(job = %job.name, %from, to = %next, "job status changed");
    }
    Ok(true)
}
