//! The per-parent reconciliation pass
//!
//! One pass takes a parent from observation to convergence: claim the
//! children it owns, report them to the sync webhook, diff the webhook's
//! desired set against the observed set, apply the difference, and write the
//! parent's status back. The diff itself is a pure function over the two
//! child maps; all I/O happens when the resulting operations are applied.
//!
//! Apply failures accumulate rather than abort, so one stuck child never
//! blocks recovery of its siblings, and status is written even when apply
//! failed so the parent's observable state can advance.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::core::Selector;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::children::{parse_group_key, ChildMap};
use crate::claim::{controller_owner_reference, parent_selector, ClaimManager};
use crate::crd::{MetaController, MetaControllerSpec};
use crate::dynamic::{Clientset, ResourceClient};
use crate::hook::SyncHook;
use crate::{Error, Result};

/// One mutation the diff decided on
#[derive(Clone, Debug)]
pub(crate) enum ChildOp {
    /// Delete an observed child absent from the desired set
    Delete {
        /// Child-map group key
        key: String,
        /// Object name
        name: String,
        /// UID observed at claim time, enforced as a delete precondition
        uid: String,
    },
    /// Create a desired child absent from the observed set
    Create {
        /// Child-map group key
        key: String,
        /// The desired object
        child: DynamicObject,
    },
    /// Replace an observed child whose content differs from the desired one
    Update {
        /// Child-map group key
        key: String,
        /// The desired object
        child: DynamicObject,
    },
}

impl ChildOp {
    fn key(&self) -> &str {
        match self {
            ChildOp::Delete { key, .. } | ChildOp::Create { key, .. } | ChildOp::Update { key, .. } => key,
        }
    }
}

fn object_tree(obj: &DynamicObject) -> Value {
    serde_json::to_value(obj).unwrap_or(Value::Null)
}

/// Diff desired against observed into an ordered operation list
///
/// Deletes come first, across all groups, so an undesired namesake is gone
/// before its replacement is created. Observed children already terminating
/// are left alone. An update is emitted only when the serialized trees
/// differ, so a pass over converged state plans nothing.
pub(crate) fn plan_children(observed: &ChildMap, desired: &ChildMap) -> Vec<ChildOp> {
    let mut ops = Vec::new();

    for (key, group) in observed.iter() {
        for (name, obj) in group {
            if obj.metadata.deletion_timestamp.is_some() {
                continue;
            }
            if !desired.contains(key, name) {
                ops.push(ChildOp::Delete {
                    key: key.clone(),
                    name: name.clone(),
                    uid: obj.uid().unwrap_or_default(),
                });
            }
        }
    }

    for (key, group) in desired.iter() {
        for (name, obj) in group {
            match observed.group(key).and_then(|g| g.get(name)) {
                Some(old) => {
                    if object_tree(obj) != object_tree(old) {
                        ops.push(ChildOp::Update {
                            key: key.clone(),
                            child: obj.clone(),
                        });
                    }
                }
                None => ops.push(ChildOp::Create {
                    key: key.clone(),
                    child: obj.clone(),
                }),
            }
        }
    }

    ops
}

/// Copy of `child` with the parent's controller reference appended
///
/// The amended list is written back whole; any references the webhook put on
/// the child survive.
pub(crate) fn with_controller_ref(
    child: &DynamicObject,
    owner_ref: &k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
) -> DynamicObject {
    let mut child = child.clone();
    child
        .metadata
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(owner_ref.clone());
    child
}

/// True when the object's current `.status` differs from the desired one
///
/// A missing status compares as JSON null, so a webhook that returns no
/// status never triggers a write on a parent that has none.
pub(crate) fn status_differs(obj: &DynamicObject, status: &Value) -> bool {
    obj.data.get("status").unwrap_or(&Value::Null) != status
}

/// Overwrite the object's `.status` wholesale, leaving everything else alone
pub(crate) fn set_status(obj: &mut DynamicObject, status: Value) {
    match obj.data.as_object_mut() {
        Some(map) => {
            map.insert("status".to_string(), status);
        }
        None => obj.data = json!({ "status": status }),
    }
}

/// Drives one parent through a full reconcile pass
pub struct Reconciler<'a, H> {
    clientset: &'a Clientset,
    hook: &'a H,
}

impl<'a, H: SyncHook> Reconciler<'a, H> {
    /// Create a reconciler over one discovery snapshot and one hook caller
    pub fn new(clientset: &'a Clientset, hook: &'a H) -> Self {
        Self { clientset, hook }
    }

    /// Run a full pass for one parent
    ///
    /// Claim, sync hook, child reconciliation, status write-back, in that
    /// order. A terminating parent skips child reconciliation but still gets
    /// its status written. When both apply and the status write fail, the
    /// apply error is returned and the status failure logged.
    pub async fn reconcile_parent(
        &self,
        ctrl: &MetaController,
        parent: &DynamicObject,
    ) -> Result<()> {
        let spec = &ctrl.spec;
        let namespace = parent.namespace();
        let parent_client = self.clientset.resource(
            &spec.parent_resource.api_version,
            &spec.parent_resource.resource,
            namespace.as_deref(),
        )?;

        let selector = parent_selector(parent)?;
        let observed = self
            .claim_children(spec, &parent_client, parent, &selector)
            .await?;

        let response = self.hook.sync(&spec.hook.url, parent, &observed).await?;
        let desired = ChildMap::from_list(response.children)?;

        let mut manage_err = None;
        if parent.metadata.deletion_timestamp.is_none() {
            if let Err(e) = self.manage_children(parent, &observed, &desired).await {
                manage_err = Some(e);
            }
        } else {
            debug!(
                kind = %parent_client.kind(),
                namespace = namespace.as_deref().unwrap_or(""),
                name = %parent.name_any(),
                "Parent is terminating, skipping child reconciliation"
            );
        }

        let status_result = self
            .update_parent_status(&parent_client, parent, &response.status)
            .await;

        match manage_err {
            Some(e) => {
                if let Err(status_err) = status_result {
                    warn!(
                        kind = %parent_client.kind(),
                        name = %parent.name_any(),
                        error = %status_err,
                        "Status update failed after apply errors"
                    );
                }
                Err(e)
            }
            None => status_result,
        }
    }

    /// Observe and claim every declared child kind for this parent
    async fn claim_children(
        &self,
        spec: &MetaControllerSpec,
        parent_client: &ResourceClient,
        parent: &DynamicObject,
        selector: &Selector,
    ) -> Result<ChildMap> {
        let namespace = parent.namespace();
        let mut observed = ChildMap::new();
        for group in &spec.child_resources {
            for resource in &group.resources {
                let child_client =
                    self.clientset
                        .resource(&group.api_version, resource, namespace.as_deref())?;
                let candidates = child_client.list().await?;
                let manager = ClaimManager::new(&child_client, parent_client, parent, selector);
                let claimed = manager.claim(candidates).await?;
                observed.insert_group(child_client.kind(), child_client.api_version(), claimed);
            }
        }
        Ok(observed)
    }

    /// Apply the diff between observed and desired children
    ///
    /// Operations run one at a time; failures are collected and returned as
    /// one aggregate at the end so no child blocks another.
    async fn manage_children(
        &self,
        parent: &DynamicObject,
        observed: &ChildMap,
        desired: &ChildMap,
    ) -> Result<()> {
        let namespace = parent.namespace();
        let owner_ref = controller_owner_reference(parent)?;

        let mut errs: Vec<Error> = Vec::new();
        let mut clients: BTreeMap<String, ResourceClient> = BTreeMap::new();

        for op in plan_children(observed, desired) {
            let client = match clients.entry(op.key().to_string()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    let resolved = parse_group_key(op.key()).and_then(|(api_version, kind)| {
                        self.clientset
                            .kind(&api_version, &kind, namespace.as_deref())
                    });
                    match resolved {
                        Ok(client) => entry.insert(client).clone(),
                        Err(e) => {
                            errs.push(e);
                            continue;
                        }
                    }
                }
            };

            let parent_name = parent.name_any();
            let result = match op {
                ChildOp::Delete { name, uid, .. } => {
                    info!(
                        parent = %parent_name,
                        kind = %client.kind(),
                        name = %name,
                        "Deleting child"
                    );
                    client.delete(&name, &uid).await.map_err(|e| {
                        Error::apply(format!("can't delete {} {name}: {e}", client.kind()))
                    })
                }
                ChildOp::Create { child, .. } => {
                    let name = child.name_any();
                    info!(
                        parent = %parent_name,
                        kind = %client.kind(),
                        name = %name,
                        "Creating child"
                    );
                    client
                        .create(&with_controller_ref(&child, &owner_ref))
                        .await
                        .map(|_| ())
                        .map_err(|e| {
                            Error::apply(format!("can't create {} {name}: {e}", client.kind()))
                        })
                }
                ChildOp::Update { child, .. } => {
                    let name = child.name_any();
                    info!(
                        parent = %parent_name,
                        kind = %client.kind(),
                        name = %name,
                        "Updating child"
                    );
                    client.update(&child).await.map(|_| ()).map_err(|e| {
                        Error::apply(format!("can't update {} {name}: {e}", client.kind()))
                    })
                }
            };

            if let Err(e) = result {
                errs.push(e);
            }
        }

        Error::aggregate(errs)
    }

    /// Overwrite the parent's `.status` with what the webhook returned
    ///
    /// Re-reads the parent and skips the write when status already matches;
    /// conflicts re-read and retry. A parent deleted mid-pass surfaces as
    /// not-found from the retry loop.
    async fn update_parent_status(
        &self,
        parent_client: &ResourceClient,
        parent: &DynamicObject,
        status: &Value,
    ) -> Result<()> {
        parent_client
            .update_with_retries(parent, |fresh| {
                if !status_differs(fresh, status) {
                    return false;
                }
                set_status(fresh, status.clone());
                true
            })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::children::group_key;

    fn child(kind: &str, api_version: &str, name: &str, spec: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": {"name": name},
            "spec": spec,
        }))
        .unwrap()
    }

    fn observed_child(
        kind: &str,
        api_version: &str,
        name: &str,
        uid: &str,
        spec: Value,
    ) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": {"name": name, "namespace": "default", "uid": uid},
            "spec": spec,
        }))
        .unwrap()
    }

    fn map_of(children: Vec<DynamicObject>) -> ChildMap {
        ChildMap::from_list(children).unwrap()
    }

    #[test]
    fn test_plan_creates_desired_children_missing_from_observed() {
        let observed = ChildMap::new();
        let desired = map_of(vec![child("Pod", "v1", "p-1", json!({}))]);

        let ops = plan_children(&observed, &desired);
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            ChildOp::Create { key, child } => {
                assert_eq!(key, &group_key("Pod", "v1"));
                assert_eq!(child.name_any(), "p-1");
            }
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_deletes_observed_children_missing_from_desired() {
        let observed = map_of(vec![observed_child("Pod", "v1", "p-1", "uid-1", json!({}))]);
        let desired = ChildMap::new();

        let ops = plan_children(&observed, &desired);
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            ChildOp::Delete { key, name, uid } => {
                assert_eq!(key, &group_key("Pod", "v1"));
                assert_eq!(name, "p-1");
                assert_eq!(uid, "uid-1");
            }
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_skips_children_already_terminating() {
        let mut doomed = observed_child("Pod", "v1", "p-1", "uid-1", json!({}));
        doomed.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                k8s_openapi::chrono::Utc::now(),
            ));
        let observed = map_of(vec![doomed]);

        let ops = plan_children(&observed, &ChildMap::new());
        assert!(ops.is_empty());
    }

    #[test]
    fn test_plan_updates_only_when_content_differs() {
        let observed = map_of(vec![child("Pod", "v1", "p-1", json!({"replicas": 1}))]);
        let desired = map_of(vec![child("Pod", "v1", "p-1", json!({"replicas": 2}))]);

        let ops = plan_children(&observed, &desired);
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            ChildOp::Update { child, .. } => {
                assert_eq!(child.data["spec"]["replicas"], 2);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_of_converged_state_is_empty() {
        let observed = map_of(vec![
            child("Pod", "v1", "p-1", json!({"replicas": 1})),
            child("ConfigMap", "v1", "cm-1", json!({})),
        ]);
        let desired = map_of(vec![
            child("Pod", "v1", "p-1", json!({"replicas": 1})),
            child("ConfigMap", "v1", "cm-1", json!({})),
        ]);

        assert!(plan_children(&observed, &desired).is_empty());
    }

    #[test]
    fn test_plan_orders_deletes_before_creates() {
        // Replacing a child under a different name: the old one must be
        // deleted before the new one is created.
        let observed = map_of(vec![observed_child("Pod", "v1", "p-old", "uid-old", json!({}))]);
        let desired = map_of(vec![child("Pod", "v1", "p-new", json!({}))]);

        let ops = plan_children(&observed, &desired);
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], ChildOp::Delete { name, .. } if name == "p-old"));
        assert!(matches!(&ops[1], ChildOp::Create { child, .. } if child.name_any() == "p-new"));
    }

    #[test]
    fn test_plan_keys_stay_independent() {
        // A Pod and a ConfigMap sharing the name "x" are different children.
        let observed = map_of(vec![observed_child("Pod", "v1", "x", "uid-1", json!({}))]);
        let desired = map_of(vec![child("ConfigMap", "v1", "x", json!({}))]);

        let ops = plan_children(&observed, &desired);
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], ChildOp::Delete { key, .. } if key == "Pod.v1"));
        assert!(matches!(&ops[1], ChildOp::Create { key, .. } if key == "ConfigMap.v1"));
    }

    #[test]
    fn test_with_controller_ref_appends_to_existing_references() {
        let parent: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "w-1", "uid": "parent-uid"},
        }))
        .unwrap();
        let owner_ref = controller_owner_reference(&parent).unwrap();

        let mut desired = child("Pod", "v1", "p-1", json!({}));
        desired.metadata.owner_references = Some(vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: "v1".into(),
                kind: "ConfigMap".into(),
                name: "cm-1".into(),
                uid: "cm-uid".into(),
                controller: None,
                block_owner_deletion: None,
            },
        ]);

        let stamped = with_controller_ref(&desired, &owner_ref);
        let refs = stamped.metadata.owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 2);

        let controllers: Vec<_> = refs.iter().filter(|r| r.controller == Some(true)).collect();
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0].uid, "parent-uid");
        assert_eq!(controllers[0].block_owner_deletion, Some(true));

        // The input object is untouched.
        assert_eq!(desired.metadata.owner_references.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_status_differs_treats_missing_as_null() {
        let obj = child("Widget", "example.com/v1", "w-1", json!({}));
        assert!(!status_differs(&obj, &Value::Null));
        assert!(status_differs(&obj, &json!({"phase": "Ready"})));
    }

    #[test]
    fn test_status_round_trip_reaches_stability() {
        let mut obj = child("Widget", "example.com/v1", "w-1", json!({}));
        let status = json!({"phase": "Ready", "replicas": 3});

        assert!(status_differs(&obj, &status));
        set_status(&mut obj, status.clone());
        assert!(!status_differs(&obj, &status));
        assert_eq!(obj.data["status"]["phase"], "Ready");
        // Other fields survive the overwrite.
        assert!(obj.data.get("spec").is_some());
    }
}
