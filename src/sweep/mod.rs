//! The top-level sweep over all MetaControllers
//!
//! One sweep lists every MetaController in the cluster, and for each one
//! lists every instance of its parent resource and runs the reconciler. The
//! sweep is level-triggered and isolation is per item: a MetaController that
//! fails to decode, validate, or resolve is logged and skipped, and a parent
//! whose pass fails never stops its neighbors. Anything missed this sweep is
//! picked up by the next.

use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, error, info};

use crate::crd::MetaController;
use crate::dynamic::Clientset;
use crate::hook::SyncHook;
use crate::reconcile::Reconciler;
use crate::Result;

/// Runs whole-cluster reconciliation sweeps
pub struct Sweeper<H> {
    client: Client,
    hook: H,
}

impl<H: SyncHook> Sweeper<H> {
    /// Create a sweeper over a cluster connection and a hook caller
    pub fn new(client: Client, hook: H) -> Self {
        Self { client, hook }
    }

    /// Run one full sweep
    ///
    /// Discovery runs fresh at the start of every sweep, so resources
    /// installed since the last one resolve without a restart. Returns an
    /// error only when the sweep itself cannot run (discovery or the
    /// MetaController list failed); per-item failures are logged and skipped.
    pub async fn sweep(&self) -> Result<()> {
        let clientset = Clientset::discover(self.client.clone()).await?;

        let resource = ApiResource::erase::<MetaController>(&());
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let list = api.list(&ListParams::default()).await?;

        info!(count = list.items.len(), "Sweeping MetaControllers");
        for item in list.items {
            let name = item.name_any();
            // Items decode one at a time so a malformed MetaController can't
            // poison the whole sweep.
            let ctrl: MetaController = match serde_json::to_value(&item)
                .and_then(serde_json::from_value)
            {
                Ok(ctrl) => ctrl,
                Err(e) => {
                    error!(
                        metacontroller = %name,
                        error = %e,
                        "Can't decode MetaController, skipping"
                    );
                    continue;
                }
            };
            if let Err(e) = ctrl.spec.validate() {
                error!(
                    metacontroller = %name,
                    error = %e,
                    "Invalid MetaController, skipping"
                );
                continue;
            }
            if let Err(e) = self.sync_meta_controller(&clientset, &ctrl).await {
                error!(
                    metacontroller = %name,
                    error = %e,
                    "Sweep of MetaController failed"
                );
            }
        }
        Ok(())
    }

    /// Reconcile every parent a MetaController declares
    async fn sync_meta_controller(
        &self,
        clientset: &Clientset,
        ctrl: &MetaController,
    ) -> Result<()> {
        let spec = &ctrl.spec;
        let parent_lister = clientset.resource(
            &spec.parent_resource.api_version,
            &spec.parent_resource.resource,
            None,
        )?;
        let parents = parent_lister.list().await?;
        debug!(
            kind = %parent_lister.kind(),
            count = parents.len(),
            "Reconciling parents"
        );

        let reconciler = Reconciler::new(clientset, &self.hook);
        for parent in parents {
            let namespace = parent.namespace().unwrap_or_default();
            let name = parent.name_any();
            if let Err(e) = reconciler.reconcile_parent(ctrl, &parent).await {
                error!(
                    kind = %parent_lister.kind(),
                    namespace = %namespace,
                    name = %name,
                    error = %e,
                    "Can't sync parent"
                );
            }
        }
        Ok(())
    }
}
