use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use kube::core::DynamicObject;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, trace, warn};

use super::{OwnerIdentity, foreign_controller, stamp};
use crate::error::ReconcileError;
use crate::store::{
    ApplyParams, ManagedKind, ObjectKey, ObjectStore, ScopeOf, StoreError,
};

/// Keys of every object applied during the current pass.
pub type TouchedSet = BTreeSet<ObjectKey>;

/// Apply client bound to one owner for one reconcile pass. Every successful
/// write (or confirmed no-op) is recorded in the touched set that the garbage
/// collector later diffs against.
pub struct TrackingClient {
    store: Arc<dyn ObjectStore>,
    owner: OwnerIdentity,
    params: ApplyParams,
    touched: TouchedSet,
}

pub(crate) fn to_dynamic<K: Serialize>(
    obj: &K,
) -> Result<DynamicObject, ReconcileError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub(crate) fn from_dynamic<K: DeserializeOwned>(
    obj: DynamicObject,
) -> Result<K, ReconcileError> {
    Ok(serde_json::from_value(serde_json::to_value(&obj)?)?)
}

fn key_of(
    kind: &ManagedKind,
    obj: &DynamicObject,
) -> Result<ObjectKey, ReconcileError> {
    ObjectKey::of(kind, obj).map_err(|e| {
        let name = obj.metadata.name.as_deref().unwrap_or("<unnamed>");
        let key = ObjectKey::new(kind, obj.metadata.namespace.as_deref(), name);
        ReconcileError::apply_failed(key, e)
    })
}

impl TrackingClient {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        owner: OwnerIdentity,
        params: ApplyParams,
    ) -> Self {
        Self {
            store,
            owner,
            params,
            touched: TouchedSet::new(),
        }
    }

    pub fn owner(&self) -> &OwnerIdentity {
        &self.owner
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn touched(&self) -> &TouchedSet {
        &self.touched
    }

    pub fn into_touched(self) -> TouchedSet {
        self.touched
    }

    /// Fails when a live foreign owner controls the object. Returns `true`
    /// when the object is controlled by an owner that no longer exists.
    async fn ensure_unclaimed(
        &self,
        key: &ObjectKey,
        meta: &ObjectMeta,
    ) -> Result<bool, ReconcileError> {
        let Some(foreign) = foreign_controller(meta, &self.owner) else {
            return Ok(false);
        };
        let live = self
            .store
            .owner_is_live(foreign, key.namespace.as_deref())
            .await
            .map_err(|e| ReconcileError::apply_failed(key.clone(), e))?;
        if live {
            warn!(object = %key, owner = %self.owner, claimed_by = %foreign.name, "ownership conflict: object is controlled by another live owner");
            return Err(ReconcileError::OwnershipConflict {
                object: key.clone(),
                current_owner: format!("{} {}", foreign.kind, foreign.name),
            });
        }
        debug!(object = %key, stale_owner = %foreign.name, "adopting object whose controller no longer exists");
        Ok(true)
    }

    /// Removes the dead controller references from the stored object. Apply
    /// merges owner references by uid, so it cannot drop another manager's
    /// entry itself.
    async fn release_stale_controllers(
        &self,
        kind: &ManagedKind,
        key: &ObjectKey,
        current: &DynamicObject,
    ) -> Result<(), ReconcileError> {
        let mut released = current.clone();
        let refs = released.metadata.owner_references.take().unwrap_or_default();
        let kept: Vec<_> = refs
            .into_iter()
            .filter(|r| r.controller != Some(true) || self.owner.is_referenced_by(r))
            .collect();
        released.metadata.owner_references = (!kept.is_empty()).then_some(kept);
        self.store
            .replace(kind, &released)
            .await
            .map_err(|e| ReconcileError::apply_failed(key.clone(), e))?;
        debug!(object = %key, "released stale controller reference");
        Ok(())
    }

    /// Stamps `object` with this client's owner. Fails with
    /// [`ReconcileError::OwnershipConflict`] when the object is controlled by a
    /// different owner that is still live.
    pub async fn stamp(
        &self,
        kind: &ManagedKind,
        component: &str,
        object: &mut DynamicObject,
    ) -> Result<(), ReconcileError> {
        let key = key_of(kind, object)?;
        self.ensure_unclaimed(&key, &object.metadata).await?;
        stamp(&mut object.metadata, kind.scope, &self.owner, component);
        Ok(())
    }

    /// Stamps and server-side applies `object`, returning the stored object.
    /// Nothing is written when another live owner controls the stored object.
    #[instrument(skip_all, fields(owner = %self.owner, component = %component, kind = %kind))]
    pub async fn apply_owned(
        &mut self,
        component: &str,
        kind: &ManagedKind,
        mut object: DynamicObject,
    ) -> Result<DynamicObject, ReconcileError> {
        let key = key_of(kind, &object)?;
        let current = self
            .store
            .get(kind, &key)
            .await
            .map_err(|e| ReconcileError::apply_failed(key.clone(), e))?;
        if let Some(current) = current.as_ref() {
            if self.ensure_unclaimed(&key, &current.metadata).await? {
                self.release_stale_controllers(kind, &key, current).await?;
            }
        }
        self.stamp(kind, component, &mut object).await?;
        let stored = self
            .store
            .apply(kind, &object, &self.params)
            .await
            .map_err(|e| ReconcileError::apply_failed(key.clone(), e))?;
        trace!(object = %key, "apply_owned: applied");
        self.touched.insert(key);
        Ok(stored)
    }

    /// Typed form of [`TrackingClient::apply_owned`].
    pub async fn apply_resource<K>(
        &mut self,
        component: &str,
        object: &K,
    ) -> Result<K, ReconcileError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
        K::Scope: ScopeOf,
    {
        let kind = ManagedKind::of::<K>();
        let stored = self
            .apply_owned(component, &kind, to_dynamic(object)?)
            .await?;
        from_dynamic(stored)
    }

    /// Fetches `name` (or starts from `K::default()`), hands it to `mutate`
    /// once, stamps the result and writes it only when it differs from what is
    /// stored. Fields `mutate` leaves alone keep their stored values.
    #[instrument(skip_all, fields(owner = %self.owner, component = %component, name = %name))]
    pub async fn create_or_update<K, F>(
        &mut self,
        component: &str,
        namespace: Option<&str>,
        name: &str,
        mutate: F,
    ) -> Result<K, ReconcileError>
    where
        K: Resource<DynamicType = ()>
            + Clone
            + Default
            + PartialEq
            + Serialize
            + DeserializeOwned,
        K::Scope: ScopeOf,
        F: FnOnce(K) -> K,
    {
        let kind = ManagedKind::of::<K>();
        let key = ObjectKey::new(&kind, namespace, name);
        if !kind.is_cluster_scoped() && key.namespace.is_none() {
            return Err(ReconcileError::apply_failed(
                key,
                StoreError::Invalid("namespace required".into()),
            ));
        }
        let current: Option<K> = self
            .store
            .get(&kind, &key)
            .await
            .map_err(|e| ReconcileError::apply_failed(key.clone(), e))?
            .map(from_dynamic)
            .transpose()?;
        if let Some(current) = current.as_ref() {
            self.ensure_unclaimed(&key, current.meta()).await?;
        }

        let base = current.clone().unwrap_or_else(|| {
            let mut fresh = K::default();
            fresh.meta_mut().name = Some(name.to_string());
            fresh.meta_mut().namespace = key.namespace.clone();
            fresh
        });
        let mut next = mutate(base);
        next.meta_mut().name = Some(name.to_string());
        next.meta_mut().namespace = key.namespace.clone();
        stamp(next.meta_mut(), kind.scope, &self.owner, component);

        let stored = match current {
            Some(current) if current == next => {
                trace!(object = %key, "create_or_update: unchanged");
                current
            }
            Some(_) => {
                debug!(object = %key, "create_or_update: updating");
                let out = self
                    .store
                    .replace(&kind, &to_dynamic(&next)?)
                    .await
                    .map_err(|e| ReconcileError::apply_failed(key.clone(), e))?;
                from_dynamic(out)?
            }
            None => {
                debug!(object = %key, "create_or_update: creating");
                let out = self
                    .store
                    .create(&kind, &to_dynamic(&next)?)
                    .await
                    .map_err(|e| ReconcileError::apply_failed(key.clone(), e))?;
                from_dynamic(out)?
            }
        };
        self.touched.insert(key);
        Ok(stored)
    }
}
