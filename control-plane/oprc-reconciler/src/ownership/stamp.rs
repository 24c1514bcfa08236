use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    ObjectMeta, OwnerReference,
};

use super::{COMPONENT_LABEL, OWNER_KIND_ANNOTATION, OWNER_LABEL, OwnerIdentity};
use crate::store::KindScope;

/// First controller reference on `meta` that points at someone other than `owner`.
pub fn foreign_controller<'a>(
    meta: &'a ObjectMeta,
    owner: &OwnerIdentity,
) -> Option<&'a OwnerReference> {
    meta.owner_references.as_ref().and_then(|refs| {
        refs.iter().find(|r| {
            r.controller == Some(true) && !owner.is_referenced_by(r)
        })
    })
}

/// Kubernetes only resolves owner references inside the dependent's namespace,
/// or to cluster-scoped owners.
fn can_reference(
    scope: KindScope,
    namespace: Option<&str>,
    owner: &OwnerIdentity,
) -> bool {
    match (&owner.namespace, scope) {
        (None, _) => true,
        (Some(_), KindScope::Cluster) => false,
        (Some(owner_ns), KindScope::Namespaced) => {
            namespace == Some(owner_ns.as_str())
        }
    }
}

/// Writes the ownership labels, the owner-kind annotation and the controller
/// reference onto `meta`. Calling it again with the same inputs changes
/// nothing. Other controller references are dropped from `meta`, so callers
/// must rule out a live foreign owner first (see [`foreign_controller`]). This
/// does not remove them from a stored object that is later server-side applied.
pub fn stamp(
    meta: &mut ObjectMeta,
    scope: KindScope,
    owner: &OwnerIdentity,
    component: &str,
) {
    let labels = meta.labels.get_or_insert_with(Default::default);
    labels.insert(OWNER_LABEL.to_string(), owner.label_value().to_string());
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());

    let annotations = meta.annotations.get_or_insert_with(Default::default);
    annotations.insert(OWNER_KIND_ANNOTATION.to_string(), owner.kind.clone());

    let Some(ours) = owner.owner_reference() else {
        return;
    };
    let allowed = can_reference(scope, meta.namespace.as_deref(), owner);
    let existing = meta.owner_references.take().unwrap_or_default();
    let mut refs: Vec<OwnerReference> = Vec::with_capacity(existing.len() + 1);
    let mut placed = false;
    for r in existing {
        if owner.is_referenced_by(&r) {
            if allowed && !placed {
                refs.push(ours.clone());
                placed = true;
            }
        } else if r.controller != Some(true) {
            refs.push(r);
        }
    }
    if allowed && !placed {
        refs.push(ours);
    }
    meta.owner_references = if refs.is_empty() { None } else { Some(refs) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerIdentity {
        OwnerIdentity::new("oaas.io/v1alpha1", "AppStack", "shop").with_uid("u-1")
    }

    fn meta(ns: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some("shop-web".into()),
            namespace: ns.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn stamping_twice_is_a_no_op() {
        let mut m = meta(Some("prod"));
        stamp(&mut m, KindScope::Namespaced, &owner(), "web");
        let once = m.clone();
        stamp(&mut m, KindScope::Namespaced, &owner(), "web");
        assert_eq!(once, m);
        let labels = m.labels.as_ref().unwrap();
        assert_eq!(labels.get(OWNER_LABEL).map(String::as_str), Some("shop"));
        assert_eq!(labels.get(COMPONENT_LABEL).map(String::as_str), Some("web"));
        let refs = m.owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "u-1");
        assert_eq!(refs[0].controller, Some(true));
    }

    #[test]
    fn keeps_unrelated_references_and_drops_stale_controllers() {
        let mut m = meta(Some("prod"));
        m.owner_references = Some(vec![
            OwnerReference {
                api_version: "v1".into(),
                kind: "ConfigMap".into(),
                name: "anchor".into(),
                uid: "u-anchor".into(),
                controller: None,
                block_owner_deletion: None,
            },
            OwnerReference {
                api_version: "oaas.io/v1alpha1".into(),
                kind: "AppStack".into(),
                name: "gone".into(),
                uid: "u-dead".into(),
                controller: Some(true),
                block_owner_deletion: None,
            },
        ]);
        assert!(foreign_controller(&m, &owner()).is_some());
        stamp(&mut m, KindScope::Namespaced, &owner(), "web");
        let uids: Vec<_> = m
            .owner_references
            .unwrap()
            .into_iter()
            .map(|r| r.uid)
            .collect();
        assert_eq!(uids, vec!["u-anchor".to_string(), "u-1".to_string()]);
    }

    #[test]
    fn namespaced_owner_never_references_cluster_dependents() {
        let ns_owner = owner().within("team-a");
        let mut m = meta(None);
        stamp(&mut m, KindScope::Cluster, &ns_owner, "issuer");
        assert!(m.owner_references.is_none());
        assert!(m.labels.unwrap().contains_key(OWNER_LABEL));

        let mut other_ns = meta(Some("team-b"));
        stamp(&mut other_ns, KindScope::Namespaced, &ns_owner, "web");
        assert!(other_ns.owner_references.is_none());
    }

    #[test]
    fn owner_without_uid_only_labels() {
        let mut m = meta(Some("prod"));
        let no_uid = OwnerIdentity::new("oaas.io/v1alpha1", "AppStack", "shop");
        stamp(&mut m, KindScope::Namespaced, &no_uid, "web");
        assert!(m.owner_references.is_none());
        assert_eq!(
            m.annotations.unwrap().get(OWNER_KIND_ANNOTATION).map(String::as_str),
            Some("AppStack")
        );
    }
}
