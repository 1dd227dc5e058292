//! Kubernetes access for workloads and their workers
//!
//! [`WorkloadClient`] and [`WorkerControl`] are the seams between the
//! reconciler and the cluster; [`KubeWorkloadClient`] implements both on a
//! kube [`Client`]. The free functions read workload and pod state without
//! touching the API server.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PropagationPolicy};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use volley_common::api::StatusRequest;
use volley_common::kube_utils::{find_condition, is_not_found, CONDITION_FAILED, CONDITION_READY};
use volley_common::{BatchJob, LABEL_INSTANCE, LABEL_NAME, WORKLOAD_KIND};

use crate::compiler::{COMPLETION_INDEX_LABEL, CONTROL_PORT};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "volley-operator";

/// Cluster operations the reconciler performs on a job's objects
///
/// Getters return `Ok(None)` for absent objects. Apply calls are server-side
/// apply with the object's own name and namespace.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Fetch the workload Job
    async fn get_workload(&self, namespace: &str, name: &str)
        -> Result<Option<BatchJob>, kube::Error>;

    /// Create or update the workload Job, returning the stored object
    async fn apply_workload(&self, workload: &BatchJob) -> Result<BatchJob, kube::Error>;

    /// Fetch a secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error>;

    /// Create or update a secret
    async fn apply_secret(&self, secret: &Secret) -> Result<(), kube::Error>;

    /// Fetch a disruption budget
    async fn get_pdb(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodDisruptionBudget>, kube::Error>;

    /// Create or update a disruption budget
    async fn apply_pdb(&self, pdb: &PodDisruptionBudget) -> Result<(), kube::Error>;

    /// Delete the workload and, in the background, its pods and companions
    ///
    /// Absent workloads are not an error.
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Suspend the workload, terminating its pods
    ///
    /// No-op when absent or already suspended.
    async fn suspend_workload(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Pods belonging to the workload
    async fn list_worker_pods(&self, namespace: &str, name: &str) -> Result<Vec<Pod>, kube::Error>;
}

/// Control channel to running load generators
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkerControl: Send + Sync {
    /// Tell the paused k6 process in `pod` to start
    async fn unpause(&self, namespace: &str, pod: &str) -> Result<(), kube::Error>;
}

/// [`WorkloadClient`] and [`WorkerControl`] backed by the API server
#[derive(Clone)]
pub struct KubeWorkloadClient {
    client: Client,
}

impl KubeWorkloadClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn jobs(&self, namespace: &str) -> Api<BatchJob> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn namespace_of(obj: &impl ResourceExt) -> String {
        obj.namespace().unwrap_or_else(|| "default".to_string())
    }
}

/// Path of the k6 status endpoint reached through the API server pod proxy
pub fn unpause_path(namespace: &str, pod: &str) -> String {
    format!(
        "/api/v1/namespaces/{}/pods/{}:{}/proxy/v1/status",
        namespace, pod, CONTROL_PORT
    )
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BatchJob>, kube::Error> {
        self.jobs(namespace).get_opt(name).await
    }

    async fn apply_workload(&self, workload: &BatchJob) -> Result<BatchJob, kube::Error> {
        let name = workload.name_any();
        let applied = self
            .jobs(&Self::namespace_of(workload))
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(workload),
            )
            .await?;
        debug!(workload = %name, "workload applied");
        Ok(applied)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), kube::Error> {
        Api::<Secret>::namespaced(self.client.clone(), &Self::namespace_of(secret))
            .patch(
                &secret.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(secret),
            )
            .await?;
        Ok(())
    }

    async fn get_pdb(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodDisruptionBudget>, kube::Error> {
        Api::<PodDisruptionBudget>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn apply_pdb(&self, pdb: &PodDisruptionBudget) -> Result<(), kube::Error> {
        Api::<PodDisruptionBudget>::namespaced(self.client.clone(), &Self::namespace_of(pdb))
            .patch(
                &pdb.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(pdb),
            )
            .await?;
        Ok(())
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self.jobs(namespace).delete(name, &dp).await {
            Ok(_) => {
                info!(workload = %name, "workload deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn suspend_workload(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let jobs = self.jobs(namespace);
        let Some(workload) = jobs.get_opt(name).await? else {
            return Ok(());
        };
        if is_suspended(&workload) {
            return Ok(());
        }
        let patch = serde_json::json!({ "spec": { "suspend": true } });
        jobs.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(workload = %name, "workload suspended");
        Ok(())
    }

    async fn list_worker_pods(&self, namespace: &str, name: &str) -> Result<Vec<Pod>, kube::Error> {
        let selector = format!(
            "{}={},{}={}",
            LABEL_NAME, WORKLOAD_KIND, LABEL_INSTANCE, name
        );
        let pods = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(pods.items)
    }
}

#[async_trait]
impl WorkerControl for KubeWorkloadClient {
    async fn unpause(&self, namespace: &str, pod: &str) -> Result<(), kube::Error> {
        let body = serde_json::to_vec(&StatusRequest::unpause()).map_err(kube::Error::SerdeError)?;
        let request = http::Request::patch(unpause_path(namespace, pod))
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body)
            .map_err(kube::Error::HttpError)?;
        let response = self.client.request_text(request).await?;
        debug!(pod = %pod, response = %response, "worker unpaused");
        Ok(())
    }
}

/// Whether the workload has `spec.suspend` set
pub fn is_suspended(workload: &BatchJob) -> bool {
    workload
        .spec
        .as_ref()
        .and_then(|s| s.suspend)
        .unwrap_or(false)
}

/// Message of the workload's `Failed=True` condition, if it has one
pub fn failure_message(workload: &BatchJob) -> Option<String> {
    let conditions = workload.status.as_ref()?.conditions.as_deref();
    find_condition(conditions, CONDITION_FAILED).map(|c| {
        c.message
            .clone()
            .or_else(|| c.reason.clone())
            .unwrap_or_else(|| "workload failed".to_string())
    })
}

/// Pod counts reported in the workload status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkloadCounts {
    /// Pods still running
    pub active: u32,
    /// Pods that finished successfully
    pub succeeded: u32,
    /// Pods with a Ready condition
    pub ready: u32,
}

/// Read [`WorkloadCounts`] from the workload status
pub fn counts(workload: &BatchJob) -> WorkloadCounts {
    let Some(status) = workload.status.as_ref() else {
        return WorkloadCounts::default();
    };
    let clamp = |v: Option<i32>| v.map(|n| n.max(0) as u32).unwrap_or(0);
    WorkloadCounts {
        active: clamp(status.active),
        succeeded: clamp(status.succeeded),
        ready: clamp(status.ready),
    }
}

/// Whether the pod's Ready condition is true and has held for `window`
///
/// A pod whose readiness flipped less than `window` ago does not count, even
/// when it is currently ready.
pub fn is_pod_stable_ready(pod: &Pod, now: DateTime<Utc>, window: Duration) -> bool {
    let Some(ready) = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == CONDITION_READY))
    else {
        return false;
    };
    if ready.status != "True" {
        return false;
    }
    let Some(since) = ready.last_transition_time.as_ref() else {
        return false;
    };
    let Ok(window) = chrono::Duration::from_std(window) else {
        return false;
    };
    since.0 + window < now
}

/// Completion index of a worker pod
pub fn completion_index(pod: &Pod) -> Option<u32> {
    pod.labels()
        .get(COMPLETION_INDEX_LABEL)
        .or_else(|| pod.annotations().get(COMPLETION_INDEX_LABEL))
        .and_then(|v| v.parse().ok())
}

fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    ) || pod.metadata.deletion_timestamp.is_some()
}

/// Pod name for each ordinal `0..num_workers`, in ordinal order
///
/// Terminated or terminating pods are ignored. Fails with a readable reason
/// when any ordinal has no live pod.
pub fn pods_by_ordinal(pods: &[Pod], num_workers: u32) -> Result<Vec<String>, String> {
    let mut names: Vec<Option<String>> = vec![None; num_workers as usize];
    for pod in pods.iter().filter(|p| !is_terminated(p)) {
        if let Some(slot) = completion_index(pod).and_then(|i| names.get_mut(i as usize)) {
            slot.get_or_insert_with(|| pod.name_any());
        }
    }

    let missing: Vec<String> = names
        .iter()
        .enumerate()
        .filter(|(_, n)| n.is_none())
        .map(|(i, _)| i.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(format!("no live pod for ordinals {}", missing.join(", ")));
    }
    Ok(names.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobSpec, JobStatus};
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn pod(name: &str, index: Option<u32>, ready_since: Option<DateTime<Utc>>) -> Pod {
        let mut labels = BTreeMap::new();
        if let Some(i) = index {
            labels.insert(COMPLETION_INDEX_LABEL.to_string(), i.to_string());
        }
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: ready_since.map(|t| {
                    vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: "True".to_string(),
                        last_transition_time: Some(Time(t)),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[rstest]
    #[case::held_past_window(5_000, true)]
    #[case::just_flipped(200, false)]
    #[case::exactly_at_window(1_000, false)]
    fn stable_ready_respects_window(#[case] ready_for_ms: i64, #[case] expected: bool) {
        let now = Utc::now();
        let p = pod(
            "job-1-0",
            Some(0),
            Some(now - chrono::Duration::milliseconds(ready_for_ms)),
        );
        assert_eq!(
            is_pod_stable_ready(&p, now, Duration::from_secs(1)),
            expected
        );
    }

    #[test]
    fn not_ready_pods_never_count() {
        let now = Utc::now();
        assert!(!is_pod_stable_ready(&pod("p", Some(0), None), now, Duration::ZERO));

        let mut p = pod("p", Some(0), Some(now - chrono::Duration::hours(1)));
        p.status.as_mut().unwrap().conditions.as_mut().unwrap()[0].status = "False".to_string();
        assert!(!is_pod_stable_ready(&p, now, Duration::from_secs(1)));
    }

    #[test]
    fn pods_are_ordered_by_completion_index() {
        let pods = vec![
            pod("job-1-2-xyz", Some(2), None),
            pod("job-1-0-abc", Some(0), None),
            pod("job-1-1-def", Some(1), None),
            pod("stray", None, None),
        ];
        assert_eq!(
            pods_by_ordinal(&pods, 3).unwrap(),
            vec!["job-1-0-abc", "job-1-1-def", "job-1-2-xyz"]
        );
    }

    #[test]
    fn missing_or_terminated_ordinals_are_reported() {
        let mut failed = pod("job-1-1-old", Some(1), None);
        failed.status.as_mut().unwrap().phase = Some("Failed".to_string());
        let pods = vec![pod("job-1-0", Some(0), None), failed];
        let err = pods_by_ordinal(&pods, 3).unwrap_err();
        assert_eq!(err, "no live pod for ordinals 1, 2");
    }

    #[test]
    fn failure_message_prefers_condition_message() {
        let w = BatchJob {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: "Failed".to_string(),
                    status: "True".to_string(),
                    reason: Some("DeadlineExceeded".to_string()),
                    message: Some("Job was active longer than specified deadline".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            failure_message(&w).as_deref(),
            Some("Job was active longer than specified deadline")
        );
        assert_eq!(failure_message(&BatchJob::default()), None);
    }

    #[test]
    fn counts_and_suspension_read_status_and_spec() {
        let w = BatchJob {
            spec: Some(JobSpec {
                suspend: Some(true),
                ..Default::default()
            }),
            status: Some(JobStatus {
                active: Some(2),
                succeeded: Some(1),
                ready: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(is_suspended(&w));
        assert_eq!(
            counts(&w),
            WorkloadCounts {
                active: 2,
                succeeded: 1,
                ready: 2
            }
        );
        assert!(!is_suspended(&BatchJob::default()));
        assert_eq!(counts(&BatchJob::default()), WorkloadCounts::default());
    }

    #[test]
    fn unpause_goes_through_the_pod_proxy() {
        assert_eq!(
            unpause_path("loadtests", "job-1-0-abc"),
            "/api/v1/namespaces/loadtests/pods/job-1-0-abc:6565/proxy/v1/status"
        );
    }
}
