//! The sync webhook caller and its wire types
//!
//! The webhook is the controller's brain: it receives the parent and the
//! children it currently owns, and answers with the desired child set and the
//! parent's status. The runtime relays object trees verbatim in both
//! directions; whatever fields the webhook embeds survive the round trip.
//!
//! A failed call (transport, non-2xx, undecodable body) fails the parent's
//! pass for this sweep. The caller never retries; the next sweep is the
//! retry.

use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use crate::children::ChildMap;
use crate::{Error, Result};

/// The observed state posted to the sync webhook
#[derive(Debug, Serialize)]
pub struct SyncRequest<'a> {
    /// The parent object, verbatim
    pub parent: &'a DynamicObject,
    /// Children currently owned by the parent, grouped by kind and name
    pub children: &'a ChildMap,
}

/// The desired state returned by the sync webhook
#[derive(Debug, Default, Deserialize)]
pub struct SyncResponse {
    /// Desired parent status, owned entirely by the webhook
    #[serde(default)]
    pub status: Value,
    /// Desired children as a flat list
    ///
    /// Each entry must carry `apiVersion`, `kind`, and `metadata.name`.
    #[serde(default)]
    pub children: Vec<DynamicObject>,
}

/// Seam for invoking a parent's sync webhook
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SyncHook: Send + Sync {
    /// Post observed state to `url` and parse the desired state it returns
    async fn sync(
        &self,
        url: &str,
        parent: &DynamicObject,
        children: &ChildMap,
    ) -> Result<SyncResponse>;
}

/// HTTP implementation of [`SyncHook`]
pub struct WebhookClient {
    http: reqwest::Client,
}

impl WebhookClient {
    /// Create a caller with the default per-request timeout
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(crate::DEFAULT_HOOK_TIMEOUT_SECS))
    }

    /// Create a caller with an explicit per-request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::hook(format!("can't build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl SyncHook for WebhookClient {
    async fn sync(
        &self,
        url: &str,
        parent: &DynamicObject,
        children: &ChildMap,
    ) -> Result<SyncResponse> {
        let request = SyncRequest { parent, children };
        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::hook(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::hook(format!("{url} returned {status}")));
        }

        response
            .json::<SyncResponse>()
            .await
            .map_err(|e| Error::hook(format!("can't decode response from {url}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parent() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"namespace": "default", "name": "w-1", "uid": "parent-uid"},
            "spec": {"selector": {"matchLabels": {"app": "w-1"}}},
        }))
        .unwrap()
    }

    #[test]
    fn test_request_wire_shape() {
        let parent = parent();
        let mut children = ChildMap::new();
        children.insert_group(
            "Pod",
            "v1",
            vec![serde_json::from_value(json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "p-1"},
                "spec": {"restartPolicy": "Never"},
            }))
            .unwrap()],
        );

        let wire = serde_json::to_value(SyncRequest {
            parent: &parent,
            children: &children,
        })
        .unwrap();

        // Parent relayed verbatim, children as the two-level mapping.
        assert_eq!(wire["parent"]["metadata"]["name"], "w-1");
        assert_eq!(wire["parent"]["spec"]["selector"]["matchLabels"]["app"], "w-1");
        assert_eq!(
            wire["children"]["Pod.v1"]["p-1"]["spec"]["restartPolicy"],
            "Never"
        );
    }

    #[test]
    fn test_response_decodes_with_defaults() {
        let response: SyncResponse = serde_json::from_value(json!({})).unwrap();
        assert!(response.status.is_null());
        assert!(response.children.is_empty());

        let response: SyncResponse = serde_json::from_value(json!({
            "status": {"observedReplicas": 3},
            "children": [
                {"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p-1"}},
            ],
        }))
        .unwrap();
        assert_eq!(response.status["observedReplicas"], 3);
        assert_eq!(response.children.len(), 1);
    }

    #[test]
    fn test_response_children_validate_through_child_map() {
        let response: SyncResponse = serde_json::from_value(json!({
            "children": [{"apiVersion": "v1", "metadata": {"name": "p-1"}}],
        }))
        .unwrap();
        let err = ChildMap::from_list(response.children).unwrap_err();
        assert!(err.to_string().contains("hook failed"));
    }

    #[tokio::test]
    async fn test_mocked_hook_drives_the_seam() {
        let mut hook = MockSyncHook::new();
        hook.expect_sync().times(1).returning(|_, _, _| {
            Ok(SyncResponse {
                status: json!({"phase": "Ready"}),
                children: Vec::new(),
            })
        });

        let response = hook
            .sync("http://hook/sync", &parent(), &ChildMap::new())
            .await
            .unwrap();
        assert_eq!(response.status["phase"], "Ready");
    }
}
