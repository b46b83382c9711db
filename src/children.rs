//! Canonical grouping of children by kind and apiVersion
//!
//! Both sides of the reconciliation diff use the same shape: children grouped
//! under a `"<Kind>.<apiVersion>"` key, then keyed by name. The key carries
//! `kind` rather than the plural resource name so webhook responses, which
//! carry `kind` and `apiVersion` only, map onto observed groups without a
//! discovery round-trip.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Build the group key for a child kind
///
/// Kind names cannot contain dots, so the first `.` always separates kind from
/// apiVersion even when the apiVersion carries a dotted group
/// (`"Widget.example.com/v1"`).
pub fn group_key(kind: &str, api_version: &str) -> String {
    format!("{kind}.{api_version}")
}

/// Recover `(apiVersion, kind)` from a group key
///
/// An empty or malformed key is an input error.
pub fn parse_group_key(key: &str) -> Result<(String, String)> {
    match key.split_once('.') {
        Some((kind, api_version)) if !kind.is_empty() && !api_version.is_empty() => {
            Ok((api_version.to_string(), kind.to_string()))
        }
        _ => Err(Error::configuration(format!(
            "malformed child group key {key:?}, want \"<Kind>.<apiVersion>\""
        ))),
    }
}

/// Children grouped by `"<Kind>.<apiVersion>"`, then by name
///
/// Within one group, names are unique; a later child with the same name
/// replaces an earlier one. Serializes as the nested mapping the sync webhook
/// sees in its request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildMap(BTreeMap<String, BTreeMap<String, DynamicObject>>);

impl ChildMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a batch of children of one kind
    ///
    /// Children without a name are dropped; everything the claim pass hands
    /// over is named.
    pub fn insert_group(&mut self, kind: &str, api_version: &str, children: Vec<DynamicObject>) {
        let group = self.0.entry(group_key(kind, api_version)).or_default();
        for child in children {
            let name = child.name_any();
            if name.is_empty() {
                continue;
            }
            group.insert(name, child);
        }
    }

    /// Group a flat list of children, validating identity fields
    ///
    /// Every child must carry `apiVersion`, `kind`, and `metadata.name`; this
    /// is the contract on sync webhook responses.
    pub fn from_list(children: Vec<DynamicObject>) -> Result<Self> {
        let mut map = Self::new();
        for child in children {
            let (api_version, kind) = match child.types.as_ref() {
                Some(t) if !t.api_version.is_empty() && !t.kind.is_empty() => {
                    (t.api_version.clone(), t.kind.clone())
                }
                _ => {
                    return Err(Error::hook(
                        "desired child is missing apiVersion or kind".to_string(),
                    ))
                }
            };
            let name = child.name_any();
            if name.is_empty() {
                return Err(Error::hook(format!(
                    "desired {kind} child is missing metadata.name"
                )));
            }
            map.0.entry(group_key(&kind, &api_version)).or_default().insert(name, child);
        }
        Ok(map)
    }

    /// Look up one group by its key
    pub fn group(&self, key: &str) -> Option<&BTreeMap<String, DynamicObject>> {
        self.0.get(key)
    }

    /// True if a child with this key and name is present
    pub fn contains(&self, key: &str, name: &str) -> bool {
        self.0.get(key).is_some_and(|group| group.contains_key(name))
    }

    /// Iterate groups in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, DynamicObject>)> {
        self.0.iter()
    }

    /// True if no children are present
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|group| group.is_empty())
    }
}
