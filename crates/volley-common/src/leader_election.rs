//! Leader election using Kubernetes Leases
//!
//! Several operator replicas may run per region, but only one may poll the
//! tracking API and drive ignitions; two leaders would unpause the same
//! cohort twice. The holder of a `coordination.k8s.io/v1` Lease is the leader.
//!
//! # Atomicity
//!
//! Every write carries the resourceVersion that was read. If the lease
//! changed in between, the API server answers 409 Conflict and the attempt
//! counts as "not acquired".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::MANAGED_BY;

/// Lease name used by the operator
pub const LEADER_LEASE_NAME: &str = "volley-operator-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease read back from the API server has no resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// What to do with a lease observed at a given instant
#[derive(Debug, PartialEq, Eq)]
enum LeaseDecision {
    Renew,
    TakeOver { transitions: i32 },
    Wait,
}

/// Decide whether `identity` may hold `lease` at `now`
fn decide(lease: &Lease, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let spec = lease.spec.as_ref();
    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseDecision::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    let expired = match (holder, renew_time, duration_secs) {
        (None, _, _) => true,
        (_, Some(rt), Some(secs)) => now > rt.0 + chrono::Duration::seconds(secs as i64),
        _ => true,
    };

    if expired {
        LeaseDecision::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseDecision::Wait
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create a new leader elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this replica currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until leadership is acquired, then return a guard that keeps renewing
    pub async fn acquire(self: Arc<Self>) -> Result<LeaderGuard, LeaderElectionError> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "waiting for leadership"
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Ok(self.create_guard());
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "lease held by another replica");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "failed to acquire lease, retrying");
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get_opt(&self.lease_name).await? {
            Some(lease) => lease,
            None => return self.create_lease(&api, now).await,
        };

        match decide(&existing, &self.identity, now) {
            LeaseDecision::Renew => {
                let mut updated = existing.clone();
                if let Some(ref mut spec) = updated.spec {
                    spec.renew_time = Some(MicroTime(now));
                }
                self.replace_lease(&api, updated, "renew").await
            }
            LeaseDecision::TakeOver { transitions } => {
                let rv = existing
                    .metadata
                    .resource_version
                    .clone()
                    .ok_or_else(|| {
                        LeaderElectionError::MissingResourceVersion(self.lease_name.clone())
                    })?;
                let mut lease = self.desired_lease(now, transitions + 1);
                lease.metadata.resource_version = Some(rv);
                self.replace_lease(&api, lease, "take over").await
            }
            LeaseDecision::Wait => Ok(false),
        }
    }

    fn desired_lease(&self, now: DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        match api
            .create(&PostParams::default(), &self.desired_lease(now, 0))
            .await
        {
            Ok(_) => {
                info!(identity = %self.identity, "created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Compare-and-swap write of a lease; a conflict means someone else won
    async fn replace_lease(
        &self,
        api: &Api<Lease>,
        lease: Lease,
        action: &str,
    ) -> Result<bool, LeaderElectionError> {
        match api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                debug!(identity = %self.identity, action, "lease written");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, action, "lease conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.identity) {
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339()
            }
        });
        api.patch(
            &self.lease_name,
            &PatchParams::apply(MANAGED_BY),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.identity, "lease released");
        Ok(())
    }
}

/// Guard that maintains leadership while it lives
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership on graceful shutdown
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "leadership released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed_secs_ago: i64, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(30),
                renew_time: Some(MicroTime(
                    Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
                )),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn holder_renews_its_own_lease() {
        let l = lease(Some("pod-a"), 5, 2);
        assert_eq!(decide(&l, "pod-a", Utc::now()), LeaseDecision::Renew);
    }

    #[test]
    fn fresh_foreign_lease_is_respected() {
        let l = lease(Some("pod-a"), 5, 2);
        assert_eq!(decide(&l, "pod-b", Utc::now()), LeaseDecision::Wait);
    }

    #[test]
    fn expired_foreign_lease_is_taken_over() {
        let l = lease(Some("pod-a"), 45, 2);
        assert_eq!(
            decide(&l, "pod-b", Utc::now()),
            LeaseDecision::TakeOver { transitions: 2 }
        );
    }

    #[test]
    fn released_lease_is_immediately_available() {
        let l = lease(None, 0, 3);
        assert_eq!(
            decide(&l, "pod-b", Utc::now()),
            LeaseDecision::TakeOver { transitions: 3 }
        );
    }
}
