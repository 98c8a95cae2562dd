//! Self-describing mutations of [`SharedState`] and the reducer applying them.
//!
//! Every mutation is a total function from old state to new state. Local and
//! remote mutations go through the same [`Mutation::apply`], so replicas that
//! see the same mutations in the same order end in the same state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use tandem_common::ResourceId;

use crate::state::{ServiceEntry, SharedState};

/// One change to the shared state, carrying the field and its new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Mutation {
    SetFirstWindow(bool),
    SetBackendReady(bool),
    SetAuthToken(String),
    SetAuthHeader(String),
    /// Append a running service.
    AddService(ServiceEntry),
    /// Remove every service with this process id.
    RemoveService(u32),
    /// Replace the whole known resource list.
    ReplaceResourceList(Vec<ResourceId>),
    /// Append a resource to the known list.
    AddResource(ResourceId),
    /// Remove every occurrence of a resource from the known list.
    RemoveResource(ResourceId),
    /// Record an active mount, replacing any previous mount point.
    #[serde(rename_all = "camelCase")]
    MountResource {
        resource_id: ResourceId,
        mount_point: PathBuf,
    },
    /// Forget an active mount.
    UnmountResource(ResourceId),
}

impl Mutation {
    /// Apply this mutation to `state`.
    pub fn apply(&self, state: &mut SharedState) {
        match self {
            Mutation::SetFirstWindow(value) => state.first_window = *value,
            Mutation::SetBackendReady(value) => state.backend_ready = *value,
            Mutation::SetAuthToken(value) => state.auth_token = value.clone(),
            Mutation::SetAuthHeader(value) => state.auth_header = value.clone(),
            Mutation::AddService(entry) => state.active_services.push(entry.clone()),
            Mutation::RemoveService(pid) => {
                state.active_services.retain(|s| s.process_id != *pid);
            }
            Mutation::ReplaceResourceList(list) => state.known_resources = list.clone(),
            Mutation::AddResource(id) => state.known_resources.push(id.clone()),
            Mutation::RemoveResource(id) => state.known_resources.retain(|r| r != id),
            Mutation::MountResource {
                resource_id,
                mount_point,
            } => {
                state
                    .mounted_resources
                    .insert(resource_id.clone(), mount_point.clone());
            }
            Mutation::UnmountResource(id) => {
                state.mounted_resources.remove(id);
            }
        }
    }

    /// Short name for logging; never includes the payload.
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::SetFirstWindow(_) => "setFirstWindow",
            Mutation::SetBackendReady(_) => "setBackendReady",
            Mutation::SetAuthToken(_) => "setAuthToken",
            Mutation::SetAuthHeader(_) => "setAuthHeader",
            Mutation::AddService(_) => "addService",
            Mutation::RemoveService(_) => "removeService",
            Mutation::ReplaceResourceList(_) => "replaceResourceList",
            Mutation::AddResource(_) => "addResource",
            Mutation::RemoveResource(_) => "removeResource",
            Mutation::MountResource { .. } => "mountResource",
            Mutation::UnmountResource(_) => "unmountResource",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rid(s: &str) -> ResourceId {
        ResourceId::new(s).unwrap()
    }

    fn apply_all(mutations: &[Mutation]) -> SharedState {
        let mut state = SharedState::new();
        for m in mutations {
            m.apply(&mut state);
        }
        state
    }

    #[test]
    fn test_field_setters_last_write_wins() {
        let state = apply_all(&[
            Mutation::SetFirstWindow(false),
            Mutation::SetBackendReady(true),
            Mutation::SetAuthToken("a".into()),
            Mutation::SetAuthToken("b".into()),
            Mutation::SetAuthHeader("Basic xyz".into()),
        ]);

        assert!(!state.first_window);
        assert!(state.backend_ready);
        assert_eq!(state.auth_token, "b");
        assert_eq!(state.auth_header, "Basic xyz");
    }

    #[test]
    fn test_remove_service_removes_all_matches_in_order() {
        let state = apply_all(&[
            Mutation::AddService(ServiceEntry::new(1, "webdav", rid("a"))),
            Mutation::AddService(ServiceEntry::new(2, "sftp", rid("b"))),
            Mutation::AddService(ServiceEntry::new(1, "http", rid("c"))),
            Mutation::AddService(ServiceEntry::new(3, "ftp", rid("d"))),
            Mutation::RemoveService(1),
        ]);

        let remaining: Vec<(u32, &str)> = state
            .active_services
            .iter()
            .map(|s| (s.process_id, s.protocol.as_str()))
            .collect();
        assert_eq!(remaining, vec![(2, "sftp"), (3, "ftp")]);
    }

    #[test]
    fn test_remove_unknown_service_is_noop() {
        let mut state = apply_all(&[Mutation::AddService(ServiceEntry::new(1, "webdav", rid("a")))]);
        let before = state.clone();
        Mutation::RemoveService(42).apply(&mut state);
        assert_eq!(state, before);
    }

    #[test]
    fn test_resource_list_mutations() {
        let state = apply_all(&[
            Mutation::ReplaceResourceList(vec![rid("a"), rid("b"), rid("a")]),
            Mutation::AddResource(rid("c")),
            Mutation::RemoveResource(rid("a")),
        ]);
        assert_eq!(state.known_resources, vec![rid("b"), rid("c")]);
    }

    #[test]
    fn test_mount_and_unmount() {
        let state = apply_all(&[
            Mutation::MountResource {
                resource_id: rid("gdrive"),
                mount_point: PathBuf::from("/mnt/a"),
            },
            Mutation::MountResource {
                resource_id: rid("gdrive"),
                mount_point: PathBuf::from("/mnt/b"),
            },
        ]);
        assert_eq!(state.mount_point(&rid("gdrive")), Some(&PathBuf::from("/mnt/b")));

        let mut state = state;
        Mutation::UnmountResource(rid("gdrive")).apply(&mut state);
        assert!(state.mounted_resources.is_empty());
    }

    #[test]
    fn test_wire_format_is_self_describing() {
        let json = serde_json::to_value(Mutation::AddResource(rid("gdrive"))).unwrap();
        assert_eq!(json, serde_json::json!({"type": "addResource", "value": "gdrive"}));

        let json = serde_json::to_value(Mutation::MountResource {
            resource_id: rid("gdrive"),
            mount_point: PathBuf::from("/mnt/g"),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "mountResource",
                "value": {"resourceId": "gdrive", "mountPoint": "/mnt/g"}
            })
        );
    }

    #[test]
    fn test_name_hides_payload() {
        let m = Mutation::SetAuthToken("secret".into());
        assert_eq!(m.name(), "setAuthToken");
    }

    fn arb_mutation() -> impl Strategy<Value = Mutation> {
        let id = prop::sample::select(vec!["a", "b", "c"]).prop_map(rid);
        prop_oneof![
            any::<bool>().prop_map(Mutation::SetBackendReady),
            (1u32..4, id.clone())
                .prop_map(|(pid, r)| Mutation::AddService(ServiceEntry::new(pid, "webdav", r))),
            (1u32..4).prop_map(Mutation::RemoveService),
            id.clone().prop_map(Mutation::AddResource),
            id.prop_map(Mutation::RemoveResource),
        ]
    }

    proptest! {
        #[test]
        fn prop_remove_service_leaves_no_match(mutations in prop::collection::vec(arb_mutation(), 0..40), pid in 1u32..4) {
            let mut state = apply_all(&mutations);
            let others: Vec<ServiceEntry> = state
                .active_services
                .iter()
                .filter(|s| s.process_id != pid)
                .cloned()
                .collect();
            Mutation::RemoveService(pid).apply(&mut state);
            prop_assert_eq!(state.active_services, others);
        }
    }
}
