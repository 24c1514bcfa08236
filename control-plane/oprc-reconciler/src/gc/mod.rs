//! Orphan garbage collection.
//!
//! An orphan is an object carrying the owner's label that was not applied in
//! the current pass. Namespaced orphans are always deleted; cluster-scoped
//! ones only when their name is on the per-kind allow-list, so a forged
//! ownership label cannot get an arbitrary cluster-wide object removed.

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use kube::core::DynamicObject;
use tracing::{debug, info, instrument, warn};

use crate::error::ReconcileError;
use crate::ownership::{OWNER_LABEL, TouchedSet, TrackingClient};
use crate::store::{ManagedKind, ObjectKey, ObjectStore, StoreError};

/// Cluster-scoped names that may be deleted once orphaned, per `(group, kind)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowList {
    names: BTreeMap<(String, String), BTreeSet<String>>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow<I, S>(mut self, kind: &ManagedKind, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names
            .entry(kind.group_kind())
            .or_default()
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn permits(&self, key: &ObjectKey) -> bool {
        self.names
            .get(&(key.group.clone(), key.kind.clone()))
            .is_some_and(|names| names.contains(&key.name))
    }
}

/// Static cleanup configuration a controller hands to the collector.
#[derive(Clone, Debug)]
pub struct CleanupPolicy {
    pub owner_label_key: String,
    /// Kinds whose objects may be conditionally absent from a pass. Empty
    /// means nothing is ever pruned.
    pub candidate_kinds: Vec<ManagedKind>,
    pub allow_list: AllowList,
}

impl CleanupPolicy {
    pub fn new(candidate_kinds: Vec<ManagedKind>, allow_list: AllowList) -> Self {
        Self {
            owner_label_key: OWNER_LABEL.to_string(),
            candidate_kinds,
            allow_list,
        }
    }

    pub fn never_prune() -> Self {
        Self::new(Vec::new(), AllowList::new())
    }

    pub fn is_candidate(&self, key: &ObjectKey) -> bool {
        self.candidate_kinds.iter().any(|k| key.is_kind(k))
    }

    /// Desired objects this policy could never collect once they stop being
    /// rendered: kinds that are not candidates and cluster-scoped names that are
    /// not allow-listed. `cluster_scoped` tells which keys are cluster-scoped.
    pub fn uncovered<'a>(
        &self,
        desired: impl IntoIterator<Item = (&'a ObjectKey, bool)>,
    ) -> Vec<ObjectKey> {
        desired
            .into_iter()
            .filter(|(key, cluster_scoped)| {
                !self.is_candidate(key)
                    || (*cluster_scoped && !self.allow_list.permits(key))
            })
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<ObjectKey>,
    /// Cluster-scoped orphans kept because they are not allow-listed.
    pub retained: Vec<ObjectKey>,
    /// Orphans already being deleted by the store.
    pub pending: Vec<ObjectKey>,
}

/// Objects labelled for `owner_name`, per kind, from a fresh list query.
/// Kinds the store does not serve are reported as empty.
pub async fn list_owned(
    store: &dyn ObjectStore,
    owner_label_key: &str,
    owner_name: &str,
    kinds: &[ManagedKind],
) -> Result<Vec<(ManagedKind, Vec<DynamicObject>)>, StoreError> {
    let selector = format!("{}={}", owner_label_key, owner_name);
    let mut out = Vec::with_capacity(kinds.len());
    for kind in kinds {
        match store.list(kind, None, &selector).await {
            Ok(items) => out.push((kind.clone(), items)),
            Err(StoreError::UnsupportedKind(k)) => {
                debug!(kind = %k, "list_owned: kind not installed; treating as empty");
                out.push((kind.clone(), Vec::new()));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

/// Deletes every orphan of `owner_name` among `candidate_kinds`. Individual
/// failures do not stop the sweep; they are returned together as
/// [`ReconcileError::CleanupFailed`] once every candidate was attempted.
#[instrument(skip_all, fields(owner = %owner_name, kinds = candidate_kinds.len(), touched = touched.len()))]
pub async fn cleanup_orphans(
    store: &dyn ObjectStore,
    owner_label_key: &str,
    owner_name: &str,
    candidate_kinds: &[ManagedKind],
    allow_list: &AllowList,
    touched: &TouchedSet,
) -> Result<CleanupReport, ReconcileError> {
    let mut report = CleanupReport::default();
    let mut failures: Vec<(ObjectKey, StoreError)> = Vec::new();
    let selector = format!("{}={}", owner_label_key, owner_name);

    for kind in candidate_kinds {
        let items = match store.list(kind, None, &selector).await {
            Ok(items) => items,
            Err(StoreError::UnsupportedKind(k)) => {
                debug!(kind = %k, "cleanup: kind not installed; zero orphans");
                continue;
            }
            Err(e) => {
                warn!(%kind, error = %e, "cleanup: listing failed");
                let placeholder = ObjectKey::new(kind, None, "*");
                failures.push((placeholder, e));
                continue;
            }
        };
        for obj in items {
            let key = match ObjectKey::of(kind, &obj) {
                Ok(k) => k,
                Err(e) => {
                    warn!(%kind, name = %obj.name_any(), error = %e, "cleanup: skipping object without identity");
                    continue;
                }
            };
            if touched.contains(&key) {
                continue;
            }
            if kind.is_cluster_scoped() && !allow_list.permits(&key) {
                warn!(object = %key, "cleanup: retaining cluster-scoped orphan outside the allow-list");
                report.retained.push(key);
                continue;
            }
            if obj.metadata.deletion_timestamp.is_some() {
                debug!(object = %key, "cleanup: orphan already terminating");
                report.pending.push(key);
                continue;
            }
            match store.delete(kind, &key).await {
                Ok(()) => {
                    info!(object = %key, "cleanup: deleted orphan");
                    report.deleted.push(key);
                }
                Err(e) => {
                    warn!(object = %key, error = %e, "cleanup: failed to delete orphan");
                    failures.push((key, e));
                }
            }
        }
    }

    if failures.is_empty() {
        Ok(report)
    } else {
        Err(ReconcileError::CleanupFailed { failures })
    }
}

impl TrackingClient {
    /// Runs [`cleanup_orphans`] for this client's owner against everything it
    /// touched so far. Must only run after every apply of the pass succeeded.
    pub async fn cleanup_orphans(
        &self,
        policy: &CleanupPolicy,
    ) -> Result<CleanupReport, ReconcileError> {
        cleanup_orphans(
            self.store().as_ref(),
            &policy.owner_label_key,
            self.owner().label_value(),
            &policy.candidate_kinds,
            &policy.allow_list,
            self.touched(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::api::rbac::v1::ClusterRole;

    #[test]
    fn allow_list_is_keyed_by_group_and_kind() {
        let role = ManagedKind::of::<ClusterRole>();
        let allow = AllowList::new().allow(&role, ["shop-reader"]);
        assert!(allow.permits(&ObjectKey::new(&role, None, "shop-reader")));
        assert!(!allow.permits(&ObjectKey::new(&role, None, "cluster-admin")));

        let lookalike = ManagedKind::dynamic(
            "example.io",
            "v1",
            "ClusterRole",
            "clusterroles",
            crate::store::KindScope::Cluster,
        );
        assert!(!allow.permits(&ObjectKey::new(&lookalike, None, "shop-reader")));
    }

    #[test]
    fn uncovered_reports_unprunable_objects() {
        let role = ManagedKind::of::<ClusterRole>();
        let cm = ManagedKind::of::<ConfigMap>();
        let policy = CleanupPolicy::new(
            vec![role.clone()],
            AllowList::new().allow(&role, ["a"]),
        );
        let a = ObjectKey::new(&role, None, "a");
        let b = ObjectKey::new(&role, None, "b");
        let c = ObjectKey::new(&cm, Some("ns"), "c");
        let missing = policy.uncovered([(&a, true), (&b, true), (&c, false)]);
        assert_eq!(missing, vec![b, c]);
    }
}
