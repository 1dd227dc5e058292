//! Capability traits for entities served by the tracking API
//!
//! The remote client and the change bridge are entity-agnostic: they only
//! need to name an item, decode it, and map it to the Kubernetes object that
//! represents it. Each entity type opts in by implementing [`RemoteObject`].

use std::any::Any;

use kube::runtime::reflector::ObjectRef;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::Job;

/// The Kubernetes batch Job that backs a load-test job
pub type BatchJob = k8s_openapi::api::batch::v1::Job;

/// Orchestrator-native identifier fed to the reconcile queue
pub type WorkloadRef = ObjectRef<BatchJob>;

/// Entities addressable by name on the tracking API
pub trait Identifiable {
    /// Name used in item endpoints
    fn name(&self) -> &str;
}

/// Entities that map onto a Kubernetes object
pub trait Convertible {
    /// Reference to the workload representing this entity in `namespace`
    fn to_workload_ref(&self, namespace: &str) -> WorkloadRef;
}

/// Statically-typed entity the registry can hold
pub trait RemoteObject:
    Identifiable + Convertible + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Registry key and log label
    const KIND: &'static str;
}

/// Object-safe view of a [`RemoteObject`], used where items of several
/// types flow through one channel or filter
pub trait DynObject: Identifiable + Convertible + Send + Sync {
    /// The concrete type's [`RemoteObject::KIND`]
    fn kind(&self) -> &'static str;
    /// Downcasting hook for typed predicates
    fn as_any(&self) -> &dyn Any;
    /// Wire form, used to detect changes between polls
    fn to_json(&self) -> serde_json::Result<serde_json::Value>;
}

impl<T: RemoteObject> DynObject for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

impl Identifiable for Job {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Convertible for Job {
    fn to_workload_ref(&self, namespace: &str) -> WorkloadRef {
        ObjectRef::new(&self.name).within(namespace)
    }
}

impl RemoteObject for Job {
    const KIND: &'static str = "Job";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_maps_to_namespaced_batch_job() {
        let job = Job {
            name: "job-1".to_string(),
            ..Default::default()
        };
        let r = job.to_workload_ref("loadtests");
        assert_eq!(r.name, "job-1");
        assert_eq!(r.namespace.as_deref(), Some("loadtests"));
    }

    #[test]
    fn dyn_object_downcasts_to_concrete_type() {
        let job = Job {
            name: "job-1".to_string(),
            ..Default::default()
        };
        let obj: &dyn DynObject = &job;
        assert_eq!(obj.kind(), "Job");
        assert_eq!(obj.name(), "job-1");
        assert!(obj.as_any().downcast_ref::<Job>().is_some());
        assert!(obj.as_any().downcast_ref::<String>().is_none());
    }
}
