//! k6 REST API payloads
//!
//! Workers start with `--paused`; the igniter flips them with a single
//! `PATCH /v1/status` carrying `{"paused": false}`.

use serde::{Deserialize, Serialize};

/// Body of `PATCH /v1/status`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {
    /// JSON:API resource object
    pub data: StatusData,
}

/// JSON:API envelope for the k6 status resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusData {
    /// Always `"default"`
    pub id: String,
    /// Always `"status"`
    #[serde(rename = "type")]
    pub type_: String,
    /// Fields to change; absent fields are left alone
    pub attributes: StatusAttributes,
}

/// Mutable attributes of a k6 run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusAttributes {
    /// Pause or resume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    /// Stop the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<bool>,
    /// Active virtual users
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vus: Option<i64>,
    /// Upper bound on virtual users
    #[serde(rename = "vus-max", skip_serializing_if = "Option::is_none")]
    pub vus_max: Option<i64>,
}

impl StatusRequest {
    /// Build a request that only sets the given attributes
    pub fn with_attributes(attributes: StatusAttributes) -> Self {
        Self {
            data: StatusData {
                id: "default".to_string(),
                type_: "status".to_string(),
                attributes,
            },
        }
    }

    /// The ignition command: resume a paused run
    pub fn unpause() -> Self {
        Self::with_attributes(StatusAttributes {
            paused: Some(false),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpause_body_is_exact() {
        let body = serde_json::to_string(&StatusRequest::unpause()).unwrap();
        assert_eq!(
            body,
            r#"{"data":{"id":"default","type":"status","attributes":{"paused":false}}}"#
        );
    }

    #[test]
    fn vus_max_uses_dashed_name() {
        let req = StatusRequest::with_attributes(StatusAttributes {
            vus_max: Some(100),
            ..Default::default()
        });
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["data"]["attributes"]["vus-max"], 100);
        assert!(value["data"]["attributes"].get("paused").is_none());
    }
}
