use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Lifecycle status of a microservice instance as seen by peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    Starting,
    Up,
    Down,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "STARTING",
            Self::Up => "UP",
            Self::Down => "DOWN",
        })
    }
}

/// Identity and contract of a microservice.
///
/// `service_id` is the registry key; `schemas` lists the schema ids the
/// microservice exposes. Contract bodies travel separately in
/// [`MicroserviceInfo::schemas_by_id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Microservice {
    pub app_id: String,
    pub service_id: String,
    pub service_name: String,
    pub version: Version,
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl Microservice {
    /// Builds a microservice whose id is derived from `app_id`, name and version.
    #[must_use]
    pub fn new(app_id: impl Into<String>, service_name: impl Into<String>, version: Version) -> Self {
        let app_id = app_id.into();
        let service_name = service_name.into();
        let service_id = format!("{app_id}:{service_name}:{version}");
        Self {
            app_id,
            service_id,
            service_name,
            version,
            schemas: Vec::new(),
            properties: BTreeMap::new(),
        }
    }
}

/// A single running process of a microservice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceInstance {
    pub service_id: String,
    pub instance_id: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// Everything a peer needs to add a microservice it has never seen before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceInfo {
    pub microservice: Microservice,
    #[serde(default)]
    pub schemas_by_id: BTreeMap<String, String>,
    pub instance: MicroserviceInstance,
}
