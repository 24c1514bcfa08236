use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{
    Api, DeleteParams, ListParams, Patch, PatchParams, PostParams,
};
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use kube::discovery::{self, Scope};
use kube::{Client, ResourceExt};
use tracing::{debug, trace};

use super::{
    ApplyParams, KindScope, ManagedKind, ObjectKey, ObjectStore, StoreError,
    split_api_version,
};

/// [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(
        &self,
        kind: &ManagedKind,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match (kind.scope, namespace) {
            (KindScope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &kind.resource)
            }
            _ => Api::all_with(self.client.clone(), &kind.resource),
        }
    }

    fn api_for_key(
        &self,
        kind: &ManagedKind,
        key: &ObjectKey,
    ) -> Api<DynamicObject> {
        self.api(kind, key.namespace.as_deref())
    }
}

fn with_types(kind: &ManagedKind, object: &DynamicObject) -> DynamicObject {
    let mut obj = object.clone();
    obj.types = Some(TypeMeta {
        api_version: kind.resource.api_version.clone(),
        kind: kind.resource.kind.clone(),
    });
    obj
}

/// A 404 on list means the kind itself is not served.
fn list_error(kind: &ManagedKind, e: kube::Error) -> StoreError {
    match StoreError::from(e) {
        StoreError::NotFound(_) => StoreError::UnsupportedKind(kind.to_string()),
        other => other,
    }
}

/// Apply creates missing objects, so its 404 names either an unserved kind or
/// a missing namespace. Only the former is reported as unsupported.
fn apply_error(kind: &ManagedKind, e: kube::Error) -> StoreError {
    match &e {
        kube::Error::Api(ae)
            if ae.code == 404
                && ae.message.contains("could not find the requested resource") =>
        {
            StoreError::UnsupportedKind(kind.to_string())
        }
        _ => e.into(),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        kind: &ManagedKind,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, StoreError> {
        let api = self.api_for_key(kind, key);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn apply(
        &self,
        kind: &ManagedKind,
        object: &DynamicObject,
        params: &ApplyParams,
    ) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::of(kind, object)?;
        let api = self.api_for_key(kind, &key);
        let mut pp = PatchParams::apply(&params.field_manager);
        if params.force {
            pp = pp.force();
        }
        let body = with_types(kind, object);
        trace!(object = %key, manager = %params.field_manager, "kube: server-side apply");
        api.patch(&key.name, &pp, &Patch::Apply(&body))
            .await
            .map_err(|e| apply_error(kind, e))
    }

    async fn create(
        &self,
        kind: &ManagedKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::of(kind, object)?;
        let api = self.api_for_key(kind, &key);
        let body = with_types(kind, object);
        Ok(api.create(&PostParams::default(), &body).await?)
    }

    async fn replace(
        &self,
        kind: &ManagedKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::of(kind, object)?;
        let api = self.api_for_key(kind, &key);
        let body = with_types(kind, object);
        Ok(api.replace(&key.name, &PostParams::default(), &body).await?)
    }

    async fn list(
        &self,
        kind: &ManagedKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let api = self.api(kind, namespace);
        let lp = ListParams::default().labels(label_selector);
        let list = api.list(&lp).await.map_err(|e| list_error(kind, e))?;
        Ok(list.items)
    }

    async fn delete(
        &self,
        kind: &ManagedKind,
        key: &ObjectKey,
    ) -> Result<(), StoreError> {
        let api = self.api_for_key(kind, key);
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => match StoreError::from(e) {
                StoreError::NotFound(_) => {
                    debug!(object = %key, "kube: delete target already gone");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    async fn owner_is_live(
        &self,
        owner: &OwnerReference,
        namespace: Option<&str>,
    ) -> Result<bool, StoreError> {
        let (group, version) = split_api_version(&owner.api_version);
        let gvk = GroupVersionKind::gvk(&group, &version, &owner.kind);
        let (ar, caps) = match discovery::pinned_kind(&self.client, &gvk).await
        {
            Ok(found) => found,
            // An owner whose kind is not even served cannot be live.
            Err(kube::Error::Discovery(e)) => {
                debug!(kind = %owner.kind, error = %e, "kube: owner kind not discoverable");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let api: Api<DynamicObject> = match (caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &ar)
            }
            (Scope::Namespaced, None) => return Ok(false),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &ar),
        };
        let found = api.get_opt(&owner.name).await?;
        Ok(found
            .map(|o| o.uid().as_deref() == Some(owner.uid.as_str()))
            .unwrap_or(false))
    }

    async fn patch_status(
        &self,
        kind: &ManagedKind,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let api = self.api_for_key(kind, key);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
