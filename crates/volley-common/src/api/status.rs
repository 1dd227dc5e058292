//! Job status state machine

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle status of a job in the tracking service
///
/// Forward edges: `pending → queued → ready → running → completed`.
/// Any non-terminal status may move to `failed` or `canceled`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Accepted by the tracking service, nothing created yet
    #[default]
    Pending,
    /// Workload created, waiting for workers to become ready
    Queued,
    /// Every worker is stably ready and paused
    Ready,
    /// Workers have been unpaused
    Running,
    /// Every worker finished successfully
    Completed,
    /// The run failed; `status_description` says why
    Failed,
    /// Canceled by a user
    Canceled,
}

impl Status {
    /// Label value for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// `completed`, `failed`, or `canceled`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Whether `next` is reachable from `self` along a defined edge
    ///
    /// Staying in the same status is always allowed so that counters such
    /// as `online_workers` can be written without moving the job.
    pub fn can_transition_to(&self, next: Status) -> bool {
        if *self == next {
            return true;
        }
        match (self, next) {
            (from, Self::Failed | Self::Canceled) => !from.is_terminal(),
            (Self::Pending, Self::Queued)
            | (Self::Queued, Self::Ready)
            | (Self::Ready, Self::Running)
            | (Self::Running, Self::Completed) => true,
            _ => false,
        }
    }

    /// Validate a transition, returning the new status
    pub fn transition(self, next: Status) -> Result<Status, Error> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(Error::parse("status", other, "unknown status")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ALL: [Status; 7] = [
        Status::Pending,
        Status::Queued,
        Status::Ready,
        Status::Running,
        Status::Completed,
        Status::Failed,
        Status::Canceled,
    ];

    fn rank(s: Status) -> u8 {
        match s {
            Status::Pending => 0,
            Status::Queued => 1,
            Status::Ready => 2,
            Status::Running => 3,
            Status::Completed | Status::Failed | Status::Canceled => 4,
        }
    }

    #[rstest]
    #[case(Status::Pending, Status::Queued)]
    #[case(Status::Queued, Status::Ready)]
    #[case(Status::Ready, Status::Running)]
    #[case(Status::Running, Status::Completed)]
    #[case(Status::Pending, Status::Failed)]
    #[case(Status::Queued, Status::Failed)]
    #[case(Status::Ready, Status::Failed)]
    #[case(Status::Running, Status::Failed)]
    #[case(Status::Pending, Status::Canceled)]
    #[case(Status::Running, Status::Canceled)]
    fn forward_edges_are_allowed(#[case] from: Status, #[case] to: Status) {
        assert!(from.can_transition_to(to));
        assert_eq!(from.transition(to).unwrap(), to);
    }

    #[rstest]
    #[case(Status::Ready, Status::Pending)]
    #[case(Status::Running, Status::Queued)]
    #[case(Status::Queued, Status::Pending)]
    #[case(Status::Pending, Status::Ready)]
    #[case(Status::Queued, Status::Running)]
    #[case(Status::Pending, Status::Completed)]
    #[case(Status::Completed, Status::Failed)]
    #[case(Status::Failed, Status::Canceled)]
    #[case(Status::Canceled, Status::Running)]
    fn backward_and_skipping_edges_are_rejected(#[case] from: Status, #[case] to: Status) {
        assert!(!from.can_transition_to(to));
        assert!(matches!(
            from.transition(to),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn no_allowed_edge_moves_backwards() {
        for from in ALL {
            for to in ALL {
                if from != to && from.can_transition_to(to) {
                    assert!(
                        rank(to) > rank(from),
                        "{from} -> {to} must move forward"
                    );
                }
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for from in ALL.into_iter().filter(Status::is_terminal) {
            for to in ALL.into_iter().filter(|to| *to != from) {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn wire_format_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&Status::Canceled).unwrap(),
            "\"canceled\""
        );
        let s: Status = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(s, Status::Running);
        assert!(serde_json::from_str::<Status>("\"paused\"").is_err());
    }

    #[test]
    fn from_str_matches_display() {
        for s in ALL {
            assert_eq!(s.to_string().parse::<Status>().unwrap(), s);
        }
        assert!("Running".parse::<Status>().is_err());
    }
}
