//! Ephemeral session state replicated across windows.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use tandem_common::ResourceId;

/// A running `serve` process exposing a resource over some protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    /// Operating system process id of the service.
    pub process_id: u32,
    /// Protocol name (e.g. "webdav", "sftp").
    pub protocol: String,
    /// Resource being served.
    pub resource_id: ResourceId,
}

impl ServiceEntry {
    pub fn new(process_id: u32, protocol: impl Into<String>, resource_id: ResourceId) -> Self {
        Self {
            process_id,
            protocol: protocol.into(),
            resource_id,
        }
    }
}

/// State shared by every window of one session.
///
/// Each window holds its own replica. Replicas converge once every
/// broadcast mutation has been delivered to every window.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedState {
    /// True only for the window that initializes the session.
    pub first_window: bool,
    /// Whether the remote-storage backend process is up.
    pub backend_ready: bool,
    /// Credentials for the backend's control API.
    pub auth_token: String,
    /// Ready-made `Authorization` header value.
    pub auth_header: String,
    /// Active mounts by resource.
    pub mounted_resources: BTreeMap<ResourceId, PathBuf>,
    /// Running services in start order.
    pub active_services: Vec<ServiceEntry>,
    /// Known resources in insertion order.
    pub known_resources: Vec<ResourceId>,
}

impl SharedState {
    /// Create the initial state of a fresh session.
    pub fn new() -> Self {
        Self {
            first_window: true,
            backend_ready: false,
            auth_token: String::new(),
            auth_header: String::new(),
            mounted_resources: BTreeMap::new(),
            active_services: Vec::new(),
            known_resources: Vec::new(),
        }
    }

    /// Mount point of `resource`, if mounted.
    pub fn mount_point(&self, resource: &ResourceId) -> Option<&PathBuf> {
        self.mounted_resources.get(resource)
    }

    /// Services currently exposing `resource`.
    pub fn services_for<'a>(
        &'a self,
        resource: &'a ResourceId,
    ) -> impl Iterator<Item = &'a ServiceEntry> + 'a {
        self.active_services
            .iter()
            .filter(move |s| &s.resource_id == resource)
    }

    /// Whether `resource` is in the known resource list.
    pub fn knows(&self, resource: &ResourceId) -> bool {
        self.known_resources.contains(resource)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> tandem_common::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> tandem_common::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedState")
            .field("first_window", &self.first_window)
            .field("backend_ready", &self.backend_ready)
            .field("auth_token", &"[REDACTED]")
            .field("auth_header", &"[REDACTED]")
            .field("mounted_resources", &self.mounted_resources)
            .field("active_services", &self.active_services)
            .field("known_resources", &self.known_resources)
            .finish()
    }
}
