//! Workload compilation
//!
//! Turns a job record into the Kubernetes objects that execute it:
//! - an Indexed batch Job with one paused k6 worker per assigned segment
//! - a Secret holding the metrics sidecar configuration
//! - a PodDisruptionBudget that keeps the cohort intact
//!
//! Every object carries a `volley.dev/spec-hash` annotation computed over the
//! rest of the object, so upserts can skip writes when nothing changed.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction,
    PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use serde::Serialize;

use volley_common::api::{Job, OutputConfig};
use volley_common::kube_utils::deterministic_hash;
use volley_common::{
    BatchJob, Error, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_NAME, MANAGED_BY,
    SPEC_HASH_ANNOTATION, WORKLOAD_KIND,
};

/// Load generator image
pub const WORKER_IMAGE: &str = "grafana/k6";
/// Image used to fetch the test script
pub const GIT_IMAGE: &str = "alpine/git";
/// Metrics sidecar image
pub const SIDECAR_IMAGE: &str = "telegraf:1.32";
/// Port of the k6 REST control API
pub const CONTROL_PORT: i32 = 6565;
/// Version of the sidecar configuration layout, part of the secret name
pub const METRICS_SCHEMA: u32 = 1;
/// Label Kubernetes sets on every pod of an Indexed Job
pub const COMPLETION_INDEX_LABEL: &str = "batch.kubernetes.io/job-completion-index";

const SCRIPTS_VOLUME: &str = "k6-script";
const SCRIPTS_PATH: &str = "/scripts";
const SIDECAR_VOLUME: &str = "telegraf-config";
const SIDECAR_CONFIG_PATH: &str = "/etc/telegraf";
const SIDECAR_CONFIG_KEY: &str = "telegraf.conf";
const SIDECAR_LISTEN_PORT: i32 = 1234;

/// Name of the metrics sidecar secret for a job
pub fn metrics_secret_name(job_name: &str) -> String {
    format!("{}-metrics-v{}", job_name, METRICS_SCHEMA)
}

/// Labels identifying every object belonging to a job; used as selectors
pub fn selector_labels(job_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), WORKLOAD_KIND.to_string()),
        (LABEL_INSTANCE.to_string(), job_name.to_string()),
    ])
}

/// Full label set: user labels first, the fixed ones win on conflict
pub fn labels(job: &Job) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = job
        .test_run
        .labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    labels.extend(selector_labels(&job.name));
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels
}

/// Spec hash recorded on an object, if any
pub fn stored_hash(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(SPEC_HASH_ANNOTATION))
        .map(String::as_str)
}

/// Compute the hash of `obj` and record it in its annotations
fn stamp<K: ResourceExt + Serialize>(mut obj: K) -> Result<K, Error> {
    let json = serde_json::to_string(&obj)
        .map_err(|e| Error::serialization(format!("failed to hash object: {}", e)))?;
    obj.annotations_mut()
        .insert(SPEC_HASH_ANNOTATION.to_string(), deterministic_hash(&json));
    Ok(obj)
}

/// Controller owner reference pointing at an applied workload
///
/// `None` until the workload has a UID, i.e. before it exists server-side.
pub fn owner_reference(workload: &BatchJob) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: "batch/v1".to_string(),
        kind: "Job".to_string(),
        name: workload.name_any(),
        uid: workload.uid()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Shell entrypoint for the worker container
///
/// Each pod picks its execution segment from `$JOB_COMPLETION_INDEX`; an index
/// without a segment exits non-zero so the Job fails instead of running an
/// unsegmented copy of the test.
pub fn worker_script(job: &Job, location: &str, metrics: bool) -> String {
    let spec = &job.test_run;
    let mut lines = vec!["set -e".to_string()];

    let segmented = spec.segments.len() > 1;
    if segmented {
        lines.push(r#"case "$JOB_COMPLETION_INDEX" in"#.to_string());
        for (idx, assigned) in job.assigned_segments.iter().enumerate() {
            lines.push(format!(
                "  {}) SEGMENT={} ;;",
                idx,
                shell_quote(&assigned.segment)
            ));
        }
        lines.push(
            r#"  *) echo "no segment assigned to index $JOB_COMPLETION_INDEX" >&2; exit 1 ;;"#
                .to_string(),
        );
        lines.push("esac".to_string());
    }

    let mut command = vec![
        "exec k6 run --paused".to_string(),
        format!("--address 0.0.0.0:{}", CONTROL_PORT),
        format!("--tag {}", shell_quote(&format!("job_name={}", job.name))),
        r#"--tag "instance_id=$JOB_COMPLETION_INDEX""#.to_string(),
        format!("--tag {}", shell_quote(&format!("location={}", location))),
    ];
    if segmented {
        command.push(format!(
            "--execution-segment-sequence {}",
            shell_quote(&spec.segments.join(","))
        ));
        command.push(r#"--execution-segment "$SEGMENT""#.to_string());
    }
    if metrics {
        command.push("--out experimental-prometheus-rw".to_string());
    }
    command.push(shell_quote(&format!(
        "{}/{}",
        SCRIPTS_PATH,
        spec.source_script.trim_start_matches('/')
    )));
    lines.push(command.join(" "));

    lines.join("\n")
}

fn git_container(job: &Job) -> Container {
    let spec = &job.test_run;
    let script = [
        "set -eo pipefail".to_string(),
        "git init".to_string(),
        format!(
            "git remote add origin {}",
            shell_quote(&format!("https://{}", spec.source_repo))
        ),
        format!("git fetch --depth=1 origin {}", shell_quote(&spec.source_ref)),
        "git checkout FETCH_HEAD".to_string(),
    ]
    .join("\n");

    Container {
        name: "git".to_string(),
        image: Some(GIT_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        working_dir: Some(SCRIPTS_PATH.to_string()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
        volume_mounts: Some(vec![VolumeMount {
            name: SCRIPTS_VOLUME.to_string(),
            mount_path: SCRIPTS_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Native sidecar: an init container that keeps running alongside k6 and
/// does not block Job completion
fn sidecar_container() -> Container {
    Container {
        name: "telegraf".to_string(),
        image: Some(SIDECAR_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        restart_policy: Some("Always".to_string()),
        args: Some(vec![
            "--config".to_string(),
            format!("{}/{}", SIDECAR_CONFIG_PATH, SIDECAR_CONFIG_KEY),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: SIDECAR_VOLUME.to_string(),
            mount_path: SIDECAR_CONFIG_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn worker_container(job: &Job, location: &str, metrics: bool) -> Container {
    let spec = &job.test_run;

    let mut env = vec![EnvVar {
        name: "TARGET".to_string(),
        value: Some(spec.target.clone()),
        ..Default::default()
    }];
    if metrics {
        env.push(EnvVar {
            name: "K6_PROMETHEUS_RW_SERVER_URL".to_string(),
            value: Some(format!("http://localhost:{}/receive", SIDECAR_LISTEN_PORT)),
            ..Default::default()
        });
    }
    env.extend(spec.env_vars.iter().map(|(name, value)| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }));

    let resources = BTreeMap::from([
        ("cpu".to_string(), Quantity(spec.resources_cpu.clone())),
        ("memory".to_string(), Quantity(spec.resources_memory.clone())),
    ]);

    let probe = Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/v1/status".to_string()),
            port: IntOrString::Int(CONTROL_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    Container {
        name: WORKLOAD_KIND.to_string(),
        image: Some(WORKER_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        working_dir: Some(SCRIPTS_PATH.to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            worker_script(job, location, metrics),
        ]),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            name: Some("http-api".to_string()),
            container_port: CONTROL_PORT,
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(resources.clone()),
            limits: Some(resources),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: SCRIPTS_VOLUME.to_string(),
            mount_path: SCRIPTS_PATH.to_string(),
            ..Default::default()
        }]),
        liveness_probe: Some(probe.clone()),
        readiness_probe: Some(probe),
        ..Default::default()
    }
}

fn anti_affinity(job_name: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        LABEL_INSTANCE.to_string(),
                        job_name.to_string(),
                    )])),
                    ..Default::default()
                }),
                topology_key: "kubernetes.io/hostname".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the Indexed batch Job running one paused k6 worker per segment
///
/// `output` is the resolved metrics sink; without one the workers run
/// without the sidecar. Fails when the assigned segments don't match the
/// worker count.
pub fn build_workload(
    job: &Job,
    namespace: &str,
    location: &str,
    output: Option<&OutputConfig>,
) -> Result<BatchJob, Error> {
    job.validate_segments()?;

    let spec = &job.test_run;
    let labels = labels(job);
    let workers = i32::try_from(job.num_workers).map_err(|_| {
        Error::validation_for_field(&job.name, "num_workers", "worker count out of range")
    })?;

    let mut init_containers = vec![git_container(job)];
    let mut volumes = vec![Volume {
        name: SCRIPTS_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    let metrics = output.is_some();
    if metrics {
        init_containers.push(sidecar_container());
        volumes.push(Volume {
            name: SIDECAR_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(metrics_secret_name(&job.name)),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let node_selector = (!spec.node_selector.is_empty()).then(|| spec.node_selector.0.clone());

    let workload = BatchJob {
        metadata: ObjectMeta {
            name: Some(job.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            completion_mode: Some("Indexed".to_string()),
            completions: Some(workers),
            parallelism: Some(workers),
            backoff_limit: Some(0),
            active_deadline_seconds: job
                .deadline()
                .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(init_containers),
                    containers: vec![worker_container(job, location, metrics)],
                    volumes: Some(volumes),
                    restart_policy: Some("Never".to_string()),
                    termination_grace_period_seconds: Some(0),
                    node_selector,
                    affinity: spec.dedicated_nodes.then(|| anti_affinity(&job.name)),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    stamp(workload)
}

/// Sidecar configuration: receive k6 remote-write and ship to InfluxDB v2
pub fn sidecar_config(job: &Job, location: &str, output: &OutputConfig) -> String {
    format!(
        r#"[agent]
  interval = "1s"
  flush_interval = "5s"
  omit_hostname = true

[global_tags]
  job_name = "{job}"
  location = "{location}"

[[inputs.http_listener_v2]]
  service_address = ":{port}"
  paths = ["/receive"]
  data_format = "prometheusremotewrite"

[[outputs.influxdb_v2]]
  urls = ["{url}"]
  token = "{token}"
  organization = "{org}"
  bucket = "{bucket}"
  insecure_skip_verify = {insecure}
"#,
        job = toml_escape(&job.name),
        location = toml_escape(location),
        port = SIDECAR_LISTEN_PORT,
        url = toml_escape(&output.url),
        token = toml_escape(&output.token),
        org = toml_escape(&output.org),
        bucket = toml_escape(&output.bucket),
        insecure = output.insecure_skip_verify,
    )
}

fn toml_escape(value: &str) -> String {
    value.replace('\\', r"\\").replace('"', r#"\""#)
}

/// Build the metrics sidecar secret, owned by the workload when known
pub fn build_metrics_secret(
    job: &Job,
    namespace: &str,
    location: &str,
    output: &OutputConfig,
    owner: Option<OwnerReference>,
) -> Result<Secret, Error> {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(metrics_secret_name(&job.name)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(job)),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([(
            SIDECAR_CONFIG_KEY.to_string(),
            sidecar_config(job, location, output),
        )])),
        ..Default::default()
    };
    stamp(secret)
}

/// Build the disruption budget keeping every worker scheduled
pub fn build_pdb(
    job: &Job,
    namespace: &str,
    owner: Option<OwnerReference>,
) -> Result<PodDisruptionBudget, Error> {
    let min_available = i32::try_from(job.num_workers).map_err(|_| {
        Error::validation_for_field(&job.name, "num_workers", "worker count out of range")
    })?;
    let pdb = PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(job.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(job)),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(min_available)),
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(&job.name)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    stamp(pdb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use volley_common::api::{AssignedSegment, NamedValue, NamedValues, Status};

    fn sample_job() -> Job {
        let mut job = Job {
            name: "job-1".to_string(),
            status: Status::Pending,
            num_workers: 3,
            assigned_segments: ["0:1/3", "1/3:2/3", "2/3:1"]
                .iter()
                .enumerate()
                .map(|(i, s)| AssignedSegment {
                    segment_id: i.to_string(),
                    segment: s.to_string(),
                })
                .collect(),
            ..Default::default()
        };
        job.test_run.target = "https://wp.example.com".to_string();
        job.test_run.segments = ["0", "1/3", "2/3", "1"].map(String::from).to_vec();
        job.test_run.env_vars = NamedValues(vec![NamedValue {
            name: "VUS".to_string(),
            value: "50".to_string(),
        }]);
        job
    }

    fn sink() -> OutputConfig {
        OutputConfig {
            url: "https://influx.example.com".to_string(),
            token: "tok".to_string(),
            org: "perf".to_string(),
            bucket: "k6".to_string(),
            insecure_skip_verify: false,
        }
    }

    fn pod_spec(w: &BatchJob) -> &PodSpec {
        w.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    #[test]
    fn workload_is_indexed_with_one_completion_per_worker() {
        let w = build_workload(&sample_job(), "loadtests", "eu-west", None).unwrap();
        let spec = w.spec.as_ref().unwrap();
        assert_eq!(spec.completion_mode.as_deref(), Some("Indexed"));
        assert_eq!(spec.completions, Some(3));
        assert_eq!(spec.parallelism, Some(3));
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.active_deadline_seconds, Some(3600));
        assert_eq!(w.metadata.name.as_deref(), Some("job-1"));
        assert_eq!(w.metadata.namespace.as_deref(), Some("loadtests"));

        let pod = pod_spec(&w);
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.termination_grace_period_seconds, Some(0));
    }

    #[test]
    fn segment_mismatch_fails_before_building() {
        let mut job = sample_job();
        job.assigned_segments.pop();
        let err = build_workload(&job, "loadtests", "eu-west", None).unwrap_err();
        assert!(err.to_string().contains("expected 3 assigned segments"));
    }

    #[test]
    fn fixed_labels_override_user_labels() {
        let mut job = sample_job();
        job.test_run.labels = NamedValues(vec![
            NamedValue {
                name: "team".to_string(),
                value: "perf".to_string(),
            },
            NamedValue {
                name: LABEL_INSTANCE.to_string(),
                value: "spoofed".to_string(),
            },
        ]);
        let l = labels(&job);
        assert_eq!(l.get("team").map(String::as_str), Some("perf"));
        assert_eq!(l.get(LABEL_INSTANCE).map(String::as_str), Some("job-1"));
        assert_eq!(l.get(LABEL_NAME).map(String::as_str), Some("k6"));
        assert_eq!(
            l.get(LABEL_MANAGED_BY).map(String::as_str),
            Some("volley-operator")
        );
    }

    #[test]
    fn worker_script_selects_segment_by_index() {
        let script = worker_script(&sample_job(), "eu-west", false);
        assert!(script.contains(r#"case "$JOB_COMPLETION_INDEX" in"#));
        assert!(script.contains("  0) SEGMENT='0:1/3' ;;"));
        assert!(script.contains("  2) SEGMENT='2/3:1' ;;"));
        assert!(script.contains("--execution-segment-sequence '0,1/3,2/3,1'"));
        assert!(script.contains("--tag 'location=eu-west'"));
        assert!(script.contains("--paused --address 0.0.0.0:6565"));
        assert!(script.ends_with("'/scripts/loadtest.js'"));
        assert!(!script.contains("--out"));
    }

    #[test]
    fn single_segment_runs_unsegmented() {
        let mut job = sample_job();
        job.num_workers = 1;
        job.assigned_segments.truncate(1);
        job.test_run.segments = vec!["0".to_string(), "1".to_string()];
        // two boundaries still describe one segment
        let script = worker_script(&job, "eu-west", false);
        assert!(script.contains("--execution-segment"));

        job.test_run.segments.clear();
        let script = worker_script(&job, "eu-west", false);
        assert!(!script.contains("case"));
        assert!(!script.contains("--execution-segment"));
    }

    #[test]
    fn shell_values_are_quoted() {
        let mut job = sample_job();
        job.name = "it's".to_string();
        let script = worker_script(&job, "eu", false);
        assert!(script.contains(r"--tag 'job_name=it'\''s'"));
    }

    #[test]
    fn worker_container_carries_env_resources_and_probes() {
        let w = build_workload(&sample_job(), "loadtests", "eu-west", None).unwrap();
        let k6 = &pod_spec(&w).containers[0];
        assert_eq!(k6.name, "k6");
        assert_eq!(k6.image.as_deref(), Some(WORKER_IMAGE));

        let env = k6.env.as_ref().unwrap();
        assert_eq!(env[0].name, "TARGET");
        assert_eq!(env[0].value.as_deref(), Some("https://wp.example.com"));
        assert!(env.iter().any(|e| e.name == "VUS"));

        let requests = k6.resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(requests.get("cpu"), Some(&Quantity("1".to_string())));
        assert_eq!(requests.get("memory"), Some(&Quantity("2G".to_string())));

        let probe = k6.readiness_probe.as_ref().unwrap().http_get.as_ref().unwrap();
        assert_eq!(probe.path.as_deref(), Some("/v1/status"));
        assert_eq!(probe.port, IntOrString::Int(6565));
    }

    #[test]
    fn git_init_container_fetches_configured_ref() {
        let mut job = sample_job();
        job.test_run.source_ref = "v2".to_string();
        let w = build_workload(&job, "loadtests", "eu-west", None).unwrap();
        let inits = pod_spec(&w).init_containers.as_ref().unwrap();
        assert_eq!(inits.len(), 1);
        let script = &inits[0].command.as_ref().unwrap()[2];
        assert!(script.contains(
            "git remote add origin 'https://github.com/ReviewSignal/k6-WordPress-benchmarks'"
        ));
        assert!(script.contains("git fetch --depth=1 origin 'v2'"));
    }

    #[test]
    fn sidecar_is_added_only_with_an_output() {
        let job = sample_job();
        let plain = build_workload(&job, "loadtests", "eu-west", None).unwrap();
        assert_eq!(pod_spec(&plain).init_containers.as_ref().unwrap().len(), 1);

        let w = build_workload(&job, "loadtests", "eu-west", Some(&sink())).unwrap();
        let pod = pod_spec(&w);
        let inits = pod.init_containers.as_ref().unwrap();
        assert_eq!(inits.len(), 2);
        assert_eq!(inits[1].restart_policy.as_deref(), Some("Always"));
        let secret_volume = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find_map(|v| v.secret.as_ref())
            .unwrap();
        assert_eq!(secret_volume.secret_name.as_deref(), Some("job-1-metrics-v1"));
        assert!(worker_script(&job, "eu", true).contains("--out experimental-prometheus-rw"));
        let k6 = &pod.containers[0];
        assert!(k6
            .env
            .as_ref()
            .unwrap()
            .iter()
            .any(|e| e.name == "K6_PROMETHEUS_RW_SERVER_URL"));
    }

    #[test]
    fn placement_follows_selector_and_dedicated_flag() {
        let mut job = sample_job();
        job.test_run.node_selector = "pool=loadgen zone=a".parse().unwrap();
        let w = build_workload(&job, "loadtests", "eu-west", None).unwrap();
        let pod = pod_spec(&w);
        let selector = pod.node_selector.as_ref().unwrap();
        assert_eq!(selector.get("pool").map(String::as_str), Some("loadgen"));
        let terms = pod
            .affinity
            .as_ref()
            .unwrap()
            .pod_anti_affinity
            .as_ref()
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap();
        assert_eq!(terms[0].topology_key, "kubernetes.io/hostname");

        job.test_run.dedicated_nodes = false;
        job.test_run.node_selector = Default::default();
        let w = build_workload(&job, "loadtests", "eu-west", None).unwrap();
        assert!(pod_spec(&w).affinity.is_none());
        assert!(pod_spec(&w).node_selector.is_none());
    }

    #[test]
    fn spec_hash_is_stable_and_tracks_changes() {
        let job = sample_job();
        let a = build_workload(&job, "loadtests", "eu-west", None).unwrap();
        let b = build_workload(&job, "loadtests", "eu-west", None).unwrap();
        assert!(stored_hash(&a.metadata).is_some());
        assert_eq!(stored_hash(&a.metadata), stored_hash(&b.metadata));

        let mut changed = job.clone();
        changed.test_run.target = "https://other.example.com".to_string();
        let c = build_workload(&changed, "loadtests", "eu-west", None).unwrap();
        assert_ne!(stored_hash(&a.metadata), stored_hash(&c.metadata));
    }

    #[test]
    fn companions_select_the_cohort_and_follow_the_owner() {
        let job = sample_job();
        let mut applied = build_workload(&job, "loadtests", "eu-west", None).unwrap();
        assert!(owner_reference(&applied).is_none());
        applied.metadata.uid = Some("uid-1".to_string());
        let owner = owner_reference(&applied).unwrap();
        assert_eq!(owner.kind, "Job");
        assert_eq!(owner.uid, "uid-1");

        let pdb = build_pdb(&job, "loadtests", Some(owner.clone())).unwrap();
        let spec = pdb.spec.as_ref().unwrap();
        assert_eq!(spec.min_available, Some(IntOrString::Int(3)));
        assert_eq!(
            spec.selector.as_ref().unwrap().match_labels,
            Some(selector_labels("job-1"))
        );
        assert_eq!(pdb.metadata.owner_references.as_ref().unwrap()[0].uid, "uid-1");

        let secret =
            build_metrics_secret(&job, "loadtests", "eu-west", &sink(), Some(owner)).unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("job-1-metrics-v1"));
        let conf = &secret.string_data.as_ref().unwrap()["telegraf.conf"];
        assert!(conf.contains(r#"job_name = "job-1""#));
        assert!(conf.contains(r#"urls = ["https://influx.example.com"]"#));
        assert!(conf.contains(r#"bucket = "k6""#));
        assert!(conf.contains("insecure_skip_verify = false"));
    }
}
