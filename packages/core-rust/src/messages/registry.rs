//! Registry payloads exchanged between peer instances.

use serde::{Deserialize, Serialize};

use crate::types::{InstanceStatus, MicroserviceInstance};

/// Register / heartbeat announcement from a peer instance.
///
/// The same message is used for the first registration, for status
/// changes, and for periodic heartbeats: the receiver decides which applies
/// by looking up `instance_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub app_id: String,
    pub service_id: String,
    pub instance_id: String,
    #[serde(default)]
    pub cross_app_allowed: bool,
    pub schemas_summary: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl RegisterRequest {
    /// The endpoint used to fetch full metadata from the reporting peer.
    #[must_use]
    pub fn select_first_endpoint(&self) -> Option<&str> {
        self.endpoints.first().map(String::as_str)
    }

    /// Minimal instance record derived from the request alone.
    #[must_use]
    pub fn to_instance(&self) -> MicroserviceInstance {
        MicroserviceInstance {
            service_id: self.service_id.clone(),
            instance_id: self.instance_id.clone(),
            status: self.status,
            endpoints: self.endpoints.clone(),
            host_name: String::new(),
            properties: std::collections::BTreeMap::new(),
        }
    }
}

/// Graceful departure of a peer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterRequest {
    pub service_id: String,
    pub instance_id: String,
}
