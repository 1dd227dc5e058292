//! Job and test-run records served by the tracking service

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::codec::{go_duration, string_or_number, NodeSelector};
use super::status::Status;
use crate::Error;

/// Default script repository when a test run doesn't name one
pub const DEFAULT_SOURCE_REPO: &str = "github.com/ReviewSignal/k6-WordPress-benchmarks";
/// Default git ref
pub const DEFAULT_SOURCE_REF: &str = "main";
/// Default script path inside the repository
pub const DEFAULT_SOURCE_SCRIPT: &str = "loadtest.js";
/// Default CPU request per worker
pub const DEFAULT_RESOURCES_CPU: &str = "1";
/// Default memory request per worker
pub const DEFAULT_RESOURCES_MEMORY: &str = "2G";
/// Default hard deadline for a run
pub const DEFAULT_JOB_DEADLINE: Duration = Duration::from_secs(3600);

/// One job as seen by a single location's workers
///
/// A test run fans out into one job per location; this operator only ever
/// sees the jobs for its own region.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job name, also used as the name of every Kubernetes object created for it
    pub name: String,

    /// Self link; informational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Location slug this job belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Lifecycle status
    #[serde(default)]
    pub status: Status,

    /// Human-readable explanation of the current status
    #[serde(default)]
    pub status_description: String,

    /// Number of worker pods the run needs at this location
    #[serde(default)]
    pub num_workers: u32,

    /// Number of workers currently stably ready
    #[serde(default)]
    pub online_workers: u32,

    /// Execution segment for each worker ordinal, in ordinal order
    #[serde(default)]
    pub assigned_segments: Vec<AssignedSegment>,

    /// The run definition shared by every location
    #[serde(default)]
    pub test_run: TestRunSpec,
}

/// Execution segment assigned to one worker ordinal
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedSegment {
    /// Stable identifier of the segment within the run
    #[serde(deserialize_with = "string_or_number")]
    pub segment_id: String,
    /// Segment range expression, e.g. `"0:1/3"`
    pub segment: String,
}

/// Test run definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestRunSpec {
    /// Run name
    pub name: String,
    /// Target URL handed to the script as `TARGET`
    pub target: String,
    /// Git repository holding the script, without scheme
    pub source_repo: String,
    /// Git ref to check out
    pub source_ref: String,
    /// Script path inside the repository
    pub source_script: String,
    /// Full execution segment sequence, e.g. `["0", "1/3", "2/3", "1"]`
    pub segments: Vec<String>,
    /// Extra environment for the load generator
    pub env_vars: NamedValues,
    /// Extra labels for worker pods
    pub labels: NamedValues,
    /// Scheduled start; workers are unpaused at this instant
    #[serde(alias = "start_test_at", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// CPU request per worker (Kubernetes quantity)
    pub resources_cpu: String,
    /// Memory request per worker (Kubernetes quantity)
    pub resources_memory: String,
    /// Node placement constraints
    pub node_selector: NodeSelector,
    /// Spread workers so no two share a node
    pub dedicated_nodes: bool,
    /// Hard deadline for the whole run
    #[serde(with = "go_duration")]
    pub job_deadline: Option<Duration>,
    /// Metrics sink for the sidecar
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_output: Option<OutputRef>,
    /// Every location reported ready
    pub ready: bool,
    /// Every location finished
    pub completed: bool,
    /// Draft runs are never dispatched
    pub draft: bool,
    /// Creation time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last modification time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for TestRunSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            target: String::new(),
            source_repo: DEFAULT_SOURCE_REPO.to_string(),
            source_ref: DEFAULT_SOURCE_REF.to_string(),
            source_script: DEFAULT_SOURCE_SCRIPT.to_string(),
            segments: Vec::new(),
            env_vars: NamedValues::default(),
            labels: NamedValues::default(),
            started_at: None,
            resources_cpu: DEFAULT_RESOURCES_CPU.to_string(),
            resources_memory: DEFAULT_RESOURCES_MEMORY.to_string(),
            node_selector: NodeSelector::default(),
            dedicated_nodes: true,
            job_deadline: Some(DEFAULT_JOB_DEADLINE),
            test_output: None,
            ready: false,
            completed: false,
            draft: false,
            created_at: None,
            updated_at: None,
        }
    }
}

/// Metrics sink of a test run
///
/// The tracking service usually sends only the sink's name; the settings for
/// a name come from the operator's [`OutputCatalog`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputRef {
    /// Name of a sink in the catalog
    Named(String),
    /// Sink settings carried on the record itself
    Inline(OutputConfig),
}

impl OutputRef {
    /// Settings for this sink; `None` for a name the catalog doesn't know
    pub fn resolve<'a>(&'a self, catalog: &'a OutputCatalog) -> Option<&'a OutputConfig> {
        match self {
            Self::Named(name) => catalog.get(name),
            Self::Inline(config) => Some(config),
        }
    }
}

/// Sink settings by name
pub type OutputCatalog = BTreeMap<String, OutputConfig>;

/// InfluxDB v2 sink the metrics sidecar ships results to
///
/// Accepts the tracking service's `influxdb_*` field names as well.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Server URL
    #[serde(alias = "influxdb_url")]
    pub url: String,
    /// API token
    #[serde(default, alias = "influxdb_token")]
    pub token: String,
    /// Organization
    #[serde(default, alias = "influxdb_org")]
    pub org: String,
    /// Bucket
    #[serde(default, alias = "influxdb_bucket")]
    pub bucket: String,
    /// Skip TLS verification
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// A `{name, value}` pair
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedValue {
    /// Key
    pub name: String,
    /// Value
    #[serde(default)]
    pub value: String,
}

/// Ordered `{name, value}` pairs; decodes from a list of pairs or from an object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct NamedValues(pub Vec<NamedValue>);

impl NamedValues {
    /// Iterate `(name, value)` pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|nv| (nv.name.as_str(), nv.value.as_str()))
    }

    /// True when there are no pairs
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for NamedValues {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            List(Vec<NamedValue>),
            Map(BTreeMap<String, String>),
        }

        Ok(match Option::<Repr>::deserialize(deserializer)? {
            None => Self::default(),
            Some(Repr::List(list)) => Self(list),
            Some(Repr::Map(map)) => Self(
                map.into_iter()
                    .map(|(name, value)| NamedValue { name, value })
                    .collect(),
            ),
        })
    }
}

impl Job {
    /// Move the job to `next`, recording why
    ///
    /// Refuses backward edges and exits from terminal states.
    pub fn transition(&mut self, next: Status, description: impl Into<String>) -> Result<(), Error> {
        self.status = self.status.transition(next)?;
        self.status_description = description.into();
        Ok(())
    }

    /// Check that every worker ordinal has exactly one segment
    pub fn validate_segments(&self) -> Result<(), Error> {
        let assigned = self.assigned_segments.len();
        if assigned != self.num_workers as usize {
            return Err(Error::validation_for_field(
                &self.name,
                "assigned_segments",
                format!(
                    "expected {} assigned segments for {} workers, got {}",
                    self.num_workers, self.num_workers, assigned
                ),
            ));
        }
        Ok(())
    }

    /// Scheduled start, if the tracking service has set one
    pub fn start_at(&self) -> Option<DateTime<Utc>> {
        self.test_run.started_at
    }

    /// Hard deadline for the run
    pub fn deadline(&self) -> Option<Duration> {
        self.test_run.job_deadline
    }
}
