//! MetaController Custom Resource Definition
//!
//! A MetaController declares one controller: the parent kind it reconciles,
//! the child kinds that parent may own, and the webhook that computes desired
//! state from observed state. The runtime only ever reads these objects.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a MetaController
///
/// Names a parent resource, the child resources instances of that parent may
/// own, and the sync webhook endpoint. All resources are referred to by their
/// plural name plus apiVersion, the same coordinates `kubectl api-resources`
/// shows.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "marionette.dev",
    version = "v1alpha1",
    kind = "MetaController",
    plural = "metacontrollers",
    shortname = "mc",
    namespaced = false,
    printcolumn = r#"{"name":"Parent","type":"string","jsonPath":".spec.parentResource.resource"}"#,
    printcolumn = r#"{"name":"Hook","type":"string","jsonPath":".spec.hook.url"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MetaControllerSpec {
    /// The parent resource this controller reconciles
    pub parent_resource: ResourceRule,

    /// Child resources a parent may own, grouped by apiVersion
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_resources: Vec<ChildResourceRule>,

    /// The sync webhook endpoint
    pub hook: HookSpec,
}

/// A single resource reference by apiVersion and plural name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRule {
    /// apiVersion of the resource (e.g. "apps/v1" or "v1")
    pub api_version: String,

    /// Plural resource name (e.g. "deployments")
    pub resource: String,
}

/// A group of child resources sharing one apiVersion
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChildResourceRule {
    /// apiVersion shared by every resource in this group
    pub api_version: String,

    /// Plural resource names within this apiVersion
    #[serde(default)]
    pub resources: Vec<String>,
}

/// Sync webhook configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookSpec {
    /// URL the sync request is POSTed to
    pub url: String,
}

impl MetaControllerSpec {
    /// Validate the declaration before a sweep acts on it
    ///
    /// Catches structurally present but empty fields; references to kinds the
    /// cluster does not serve surface later, when discovery resolution fails.
    pub fn validate(&self) -> crate::Result<()> {
        if self.parent_resource.api_version.is_empty() {
            return Err(crate::Error::configuration(
                "spec.parentResource.apiVersion must not be empty",
            ));
        }
        if self.parent_resource.resource.is_empty() {
            return Err(crate::Error::configuration(
                "spec.parentResource.resource must not be empty",
            ));
        }
        if self.hook.url.is_empty() {
            return Err(crate::Error::configuration(
                "spec.hook.url must not be empty",
            ));
        }
        for group in &self.child_resources {
            if group.api_version.is_empty() {
                return Err(crate::Error::configuration(
                    "spec.childResources[].apiVersion must not be empty",
                ));
            }
        }
        Ok(())
    }
}
