//! Child ownership: adoption, release, and the claim pass
//!
//! Before a parent's state is reported to its sync webhook, every candidate
//! child in the namespace is classified against that parent: children it
//! controls and that still match its selector are kept, controlled children
//! that stopped matching are released, matching orphans are adopted, and
//! everything else is ignored. Adoption is guarded by a fresh read of the
//! parent so a deleted-and-recreated namesake never inherits children.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::DynamicObject;
use kube::core::Selector;
use kube::core::SelectorExt;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::dynamic::ResourceClient;
use crate::{Error, Result};

/// Read `spec.selector` off a parent as a label selector
///
/// A parent without a selector, or with one that does not parse, fails its
/// reconcile pass.
pub fn parent_selector(parent: &DynamicObject) -> Result<Selector> {
    let name = parent.name_any();
    let raw = parent
        .data
        .pointer("/spec/selector")
        .cloned()
        .ok_or_else(|| Error::selector(format!("{name} has no spec.selector")))?;
    let selector: LabelSelector = serde_json::from_value(raw)
        .map_err(|e| Error::selector(format!("invalid spec.selector on {name}: {e}")))?;
    Selector::try_from(selector)
        .map_err(|e| Error::selector(format!("invalid spec.selector on {name}: {e}")))
}

/// The owner reference with `controller=true`, if the object has one
pub fn controller_owner_of(obj: &DynamicObject) -> Option<&OwnerReference> {
    obj.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Build the controller owner reference children of `parent` carry
pub fn controller_owner_reference(parent: &DynamicObject) -> Result<OwnerReference> {
    let name = parent.name_any();
    let types = parent
        .types
        .as_ref()
        .ok_or_else(|| Error::claim(format!("parent {name} has no apiVersion/kind")))?;
    Ok(OwnerReference {
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        name,
        uid: parent
            .uid()
            .ok_or_else(|| Error::claim("parent has no uid".to_string()))?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// What the claim pass does with one candidate child
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claim {
    /// Controlled by this parent and matching its selector
    Keep,
    /// Controlled by this parent but no longer matching: strip the reference
    Release,
    /// An orphan matching the selector: take ownership
    Adopt,
    /// Someone else's child, or an orphan outside the selector
    Ignore,
}

/// Classify one candidate against a parent's uid and selector
pub fn classify(child: &DynamicObject, parent_uid: &str, selector: &Selector) -> Claim {
    let matches = selector.matches(child.labels());
    match controller_owner_of(child) {
        Some(owner) if owner.uid == parent_uid => {
            if matches {
                Claim::Keep
            } else {
                Claim::Release
            }
        }
        Some(_) => Claim::Ignore,
        None => {
            if matches {
                Claim::Adopt
            } else {
                Claim::Ignore
            }
        }
    }
}

/// Check a freshly read parent against the one being reconciled
///
/// Refuses when the uid changed (the original object is gone and a namesake
/// took its place) or when the parent is terminating.
fn verify_fresh_parent(parent: &DynamicObject, fresh: &DynamicObject) -> Result<()> {
    let name = parent.name_any();
    let wanted = parent.uid().unwrap_or_default();
    let got = fresh.uid().unwrap_or_default();
    if got != wanted {
        return Err(Error::claim(format!(
            "original {name} is gone: got uid {got}, wanted {wanted}"
        )));
    }
    if fresh.metadata.deletion_timestamp.is_some() {
        return Err(Error::claim(format!(
            "{name} is terminating, refusing to adopt"
        )));
    }
    Ok(())
}

/// Claims candidates of one child kind on behalf of one parent
pub struct ClaimManager<'a> {
    child_client: &'a ResourceClient,
    parent_client: &'a ResourceClient,
    parent: &'a DynamicObject,
    selector: &'a Selector,
}

impl<'a> ClaimManager<'a> {
    /// Create a manager for one `(parent, child kind)` pair
    ///
    /// `parent_client` must be able to `get` the parent by name; it backs the
    /// pre-adoption freshness check.
    pub fn new(
        child_client: &'a ResourceClient,
        parent_client: &'a ResourceClient,
        parent: &'a DynamicObject,
        selector: &'a Selector,
    ) -> Self {
        Self {
            child_client,
            parent_client,
            parent,
            selector,
        }
    }

    /// Run the claim pass over every candidate of this kind
    ///
    /// Returns the children this parent owns after the pass. Adoption and
    /// release failures are logged and the child left out; they do not abort
    /// the pass.
    pub async fn claim(&self, candidates: Vec<DynamicObject>) -> Result<Vec<DynamicObject>> {
        let parent_uid = self.parent.uid().ok_or_else(|| {
            Error::claim(format!("parent {} has no uid", self.parent.name_any()))
        })?;

        let mut claimed = Vec::new();
        for child in candidates {
            match classify(&child, &parent_uid, self.selector) {
                Claim::Keep => claimed.push(child),
                Claim::Ignore => {}
                Claim::Adopt => match self.adopt(&child).await {
                    Ok(Some(adopted)) => {
                        info!(
                            kind = %self.child_client.kind(),
                            name = %adopted.name_any(),
                            parent = %self.parent.name_any(),
                            "Adopted child"
                        );
                        claimed.push(adopted);
                    }
                    Ok(None) => {
                        debug!(
                            kind = %self.child_client.kind(),
                            name = %child.name_any(),
                            "Adoption lost a race, skipping"
                        );
                    }
                    Err(e) => {
                        warn!(
                            kind = %self.child_client.kind(),
                            name = %child.name_any(),
                            error = %e,
                            "Can't adopt child"
                        );
                    }
                },
                Claim::Release => {
                    if let Err(e) = self.release(&child).await {
                        warn!(
                            kind = %self.child_client.kind(),
                            name = %child.name_any(),
                            error = %e,
                            "Can't release child"
                        );
                    } else {
                        info!(
                            kind = %self.child_client.kind(),
                            name = %child.name_any(),
                            parent = %self.parent.name_any(),
                            "Released child that no longer matches"
                        );
                    }
                }
            }
        }
        Ok(claimed)
    }

    /// Take ownership of an orphan by appending a controller owner reference
    ///
    /// Returns `Ok(None)` when the adoption was abandoned: the candidate was
    /// replaced by a namesake, or another controller claimed it first.
    async fn adopt(&self, child: &DynamicObject) -> Result<Option<DynamicObject>> {
        self.can_adopt().await?;
        let owner_ref = controller_owner_reference(self.parent)?;
        let child_uid = child.uid();
        self.child_client
            .update_with_retries(child, |fresh| {
                if fresh.uid() != child_uid {
                    return false;
                }
                if controller_owner_of(fresh).is_some() {
                    return false;
                }
                fresh
                    .metadata
                    .owner_references
                    .get_or_insert_with(Vec::new)
                    .push(owner_ref.clone());
                true
            })
            .await
    }

    /// Strip this parent's controller owner reference from a child
    ///
    /// A child that is already gone counts as released.
    async fn release(&self, child: &DynamicObject) -> Result<()> {
        let parent_uid = self.parent.uid().unwrap_or_default();
        let result = self
            .child_client
            .update_with_retries(child, |fresh| {
                let Some(refs) = fresh.metadata.owner_references.as_mut() else {
                    return false;
                };
                let before = refs.len();
                refs.retain(|r| !(r.controller == Some(true) && r.uid == parent_uid));
                refs.len() != before
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Freshness check before every adoption attempt
    ///
    /// Always an uncached read; the parent seen at the start of the pass may
    /// have been deleted, recreated, or marked for deletion since.
    async fn can_adopt(&self) -> Result<()> {
        let fresh = self.parent_client.get(&self.parent.name_any()).await?;
        verify_fresh_parent(self.parent, &fresh)
    }
}
