//! Discovery-backed clients over arbitrary kinds
//!
//! The runtime never knows the types it manages at compile time; parents and
//! children are whatever the MetaController names. This module wraps
//! [`kube::Discovery`] and [`DynamicObject`] into a small capability set: a
//! [`Clientset`] resolves `(apiVersion, resource)` or `(apiVersion, kind)`
//! coordinates into a [`ResourceClient`] scoped to one namespace (or all), and
//! the client exposes the list/get/create/update/delete surface the
//! reconciler needs, plus a conflict-retrying update loop.

use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams,
    Preconditions, TypeMeta,
};
use kube::discovery::{ApiCapabilities, Scope};
use kube::{Client, Discovery, ResourceExt};
use tracing::warn;

use crate::retry::RetryConfig;
use crate::{Error, Result};

/// Split an apiVersion into `(group, version)`
///
/// Core-group apiVersions carry no slash: `"v1"` is `("", "v1")`.
pub(crate) fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Factory for [`ResourceClient`]s, backed by one discovery snapshot
///
/// A fresh `Clientset` is built per sweep so newly installed CRDs are picked
/// up on the next pass without restarting.
#[derive(Clone)]
pub struct Clientset {
    client: Client,
    discovery: std::sync::Arc<Discovery>,
}

impl Clientset {
    /// Run API discovery and build a clientset over the result
    pub async fn discover(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        Ok(Self {
            client,
            discovery: std::sync::Arc::new(discovery),
        })
    }

    /// Client for `(apiVersion, resource)` scoped to `namespace`
    ///
    /// `None` scopes the client to all namespaces; that mode only supports
    /// `list`, and `get` for cluster-scoped kinds.
    pub fn resource(
        &self,
        api_version: &str,
        resource: &str,
        namespace: Option<&str>,
    ) -> Result<ResourceClient> {
        let (ar, caps) = self
            .find(api_version, |ar| ar.plural == resource)
            .ok_or_else(|| {
                Error::configuration(format!("no resource {resource:?} in {api_version:?}"))
            })?;
        ResourceClient::new(self.client.clone(), ar, &caps, namespace)
    }

    /// Client for `(apiVersion, kind)` scoped to `namespace`
    ///
    /// Used where the runtime holds a kind from a child-map key rather than a
    /// plural resource name.
    pub fn kind(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<ResourceClient> {
        let (ar, caps) = self.find(api_version, |ar| ar.kind == kind).ok_or_else(|| {
            Error::configuration(format!("no kind {kind:?} in {api_version:?}"))
        })?;
        ResourceClient::new(self.client.clone(), ar, &caps, namespace)
    }

    fn find(
        &self,
        api_version: &str,
        matches: impl Fn(&ApiResource) -> bool,
    ) -> Option<(ApiResource, ApiCapabilities)> {
        let (group, version) = split_api_version(api_version);
        self.discovery
            .groups()
            .find(|g| g.name() == group)?
            .versioned_resources(version)
            .into_iter()
            .find(|(ar, _)| matches(ar))
    }
}

/// Typed-agnostic access to one kind in one namespace
#[derive(Clone)]
pub struct ResourceClient {
    api: Api<DynamicObject>,
    resource: ApiResource,
    namespaced: bool,
    namespace: Option<String>,
    retry: RetryConfig,
}

impl ResourceClient {
    fn new(
        client: Client,
        resource: ApiResource,
        caps: &ApiCapabilities,
        namespace: Option<&str>,
    ) -> Result<Self> {
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        let api = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &resource),
            (true, None) => Api::all_with(client, &resource),
            (false, None) => Api::all_with(client, &resource),
            (false, Some(ns)) => {
                return Err(Error::configuration(format!(
                    "{} is cluster-scoped and cannot be managed in namespace {ns:?}",
                    resource.kind
                )))
            }
        };
        Ok(Self {
            api,
            resource,
            namespaced,
            namespace: namespace.map(String::from),
            retry: RetryConfig::default(),
        })
    }

    /// Kind of the objects this client serves
    pub fn kind(&self) -> &str {
        &self.resource.kind
    }

    /// apiVersion of the objects this client serves
    pub fn api_version(&self) -> &str {
        &self.resource.api_version
    }

    /// Plural resource name
    pub fn plural(&self) -> &str {
        &self.resource.plural
    }

    /// Group/version/kind coordinates
    pub fn group_version_kind(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(
            &self.resource.group,
            &self.resource.version,
            &self.resource.kind,
        )
    }

    /// True if the kind is namespaced
    pub fn namespaced(&self) -> bool {
        self.namespaced
    }

    /// Namespace this client is scoped to, if any
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// List all objects of this kind in the client's scope
    ///
    /// List responses omit `apiVersion`/`kind` on items; they are stamped back
    /// from the resolved resource so every object downstream carries its
    /// identity.
    pub async fn list(&self) -> Result<Vec<DynamicObject>> {
        let mut items = self.api.list(&ListParams::default()).await?.items;
        for obj in &mut items {
            if obj.types.is_none() {
                obj.types = Some(TypeMeta {
                    api_version: self.resource.api_version.clone(),
                    kind: self.resource.kind.clone(),
                });
            }
        }
        Ok(items)
    }

    /// Fetch one object by name, uncached
    pub async fn get(&self, name: &str) -> Result<DynamicObject> {
        let mut obj = self.api.get(name).await?;
        if obj.types.is_none() {
            obj.types = Some(TypeMeta {
                api_version: self.resource.api_version.clone(),
                kind: self.resource.kind.clone(),
            });
        }
        Ok(obj)
    }

    /// Create an object
    pub async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    /// Replace an object
    ///
    /// Carries whatever `metadata.resourceVersion` the object holds; a stale
    /// version is rejected by the server as a conflict.
    pub async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        Ok(self
            .api
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    /// Delete an object by name, guarded by a UID precondition
    ///
    /// The precondition keeps a delete aimed at an observed object from
    /// taking out a namesake created after the observation.
    pub async fn delete(&self, name: &str, uid: &str) -> Result<()> {
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..Default::default()
        };
        self.api.delete(name, &params).await?;
        Ok(())
    }

    /// Read-modify-write with bounded conflict retries
    ///
    /// Re-reads the object by name, applies `mutate`, and submits an update.
    /// `mutate` returns whether it changed anything; reporting no change ends
    /// the loop without a write. A conflict re-reads and retries with
    /// backoff; any other error is returned as-is, including not-found when
    /// the object has disappeared.
    pub async fn update_with_retries<F>(
        &self,
        obj: &DynamicObject,
        mut mutate: F,
    ) -> Result<Option<DynamicObject>>
    where
        F: FnMut(&mut DynamicObject) -> bool,
    {
        let name = obj.name_any();
        let mut delay = self.retry.initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut fresh = self.get(&name).await?;
            if !mutate(&mut fresh) {
                return Ok(None);
            }
            match self.update(&fresh).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(e) if e.is_conflict() && self.retry.allows_retry(attempt) => {
                    warn!(
                        kind = %self.kind(),
                        name = %name,
                        attempt = attempt,
                        "Update conflict, retrying"
                    );
                    tokio::time::sleep(self.retry.jittered(delay)).await;
                    delay = self.retry.next_delay(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_api_version() {
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(
            split_api_version("example.com/v1alpha1"),
            ("example.com", "v1alpha1")
        );
    }

    #[test]
    fn test_group_version_kind_from_api_resource() {
        let gvk = GroupVersionKind::gvk("example.com", "v1", "Widget");
        let ar = ApiResource::from_gvk_with_plural(&gvk, "widgets");
        assert_eq!(ar.api_version, "example.com/v1");
        assert_eq!(ar.kind, "Widget");
        assert_eq!(ar.plural, "widgets");
    }
}
