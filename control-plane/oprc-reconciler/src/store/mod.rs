//! Object store abstraction shared by every part of the engine.
//!
//! The engine never talks to the Kubernetes API directly; each controller hands
//! it an [`ObjectStore`] handle. [`KubeStore`] is the production implementation,
//! [`MemoryStore`] an in-process one for tests.

mod kube_store;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KindScope {
    Namespaced,
    Cluster,
}

/// Maps the static scope marker of a k8s-openapi / kube-derive type to [`KindScope`].
pub trait ScopeOf {
    const SCOPE: KindScope;
}

impl ScopeOf for k8s_openapi::NamespaceResourceScope {
    const SCOPE: KindScope = KindScope::Namespaced;
}

impl ScopeOf for k8s_openapi::ClusterResourceScope {
    const SCOPE: KindScope = KindScope::Cluster;
}

/// A kind the engine is allowed to read, write or prune.
#[derive(Clone, Debug)]
pub struct ManagedKind {
    pub resource: ApiResource,
    pub scope: KindScope,
}

impl ManagedKind {
    pub fn of<K>() -> Self
    where
        K: Resource<DynamicType = ()>,
        K::Scope: ScopeOf,
    {
        Self {
            resource: ApiResource::erase::<K>(&()),
            scope: <K::Scope as ScopeOf>::SCOPE,
        }
    }

    /// Kind that has no compiled-in type, e.g. a third-party CRD.
    pub fn dynamic(
        group: &str,
        version: &str,
        kind: &str,
        plural: &str,
        scope: KindScope,
    ) -> Self {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        Self {
            resource: ApiResource::from_gvk_with_plural(&gvk, plural),
            scope,
        }
    }

    pub fn group(&self) -> &str {
        &self.resource.group
    }

    pub fn kind(&self) -> &str {
        &self.resource.kind
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.scope == KindScope::Cluster
    }

    /// `(group, kind)` pair identifying the kind independent of API version.
    pub fn group_kind(&self) -> (String, String) {
        (self.resource.group.clone(), self.resource.kind.clone())
    }

    pub fn same_kind(&self, other: &ManagedKind) -> bool {
        self.resource.group == other.resource.group
            && self.resource.kind == other.resource.kind
    }
}

impl fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.resource.group.is_empty() {
            write!(f, "{}", self.resource.kind)
        } else {
            write!(f, "{}.{}", self.resource.kind, self.resource.group)
        }
    }
}

/// Identity of one stored object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        kind: &ManagedKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Self {
        let namespace = match kind.scope {
            KindScope::Namespaced => namespace.map(str::to_string),
            KindScope::Cluster => None,
        };
        Self {
            group: kind.resource.group.clone(),
            kind: kind.resource.kind.clone(),
            namespace,
            name: name.to_string(),
        }
    }

    /// Key of `obj` as a `kind` object. Fails when the object has no name or
    /// a namespaced object has no namespace.
    pub fn of(
        kind: &ManagedKind,
        obj: &DynamicObject,
    ) -> Result<Self, StoreError> {
        let name = obj.metadata.name.as_deref().ok_or_else(|| {
            StoreError::Invalid(format!("{kind} object without a name"))
        })?;
        let namespace = obj.metadata.namespace.as_deref();
        if kind.scope == KindScope::Namespaced && namespace.is_none() {
            return Err(StoreError::Invalid(format!(
                "namespaced {kind} {name} has no namespace"
            )));
        }
        Ok(Self::new(kind, namespace, name))
    }

    pub fn is_kind(&self, kind: &ManagedKind) -> bool {
        self.group == kind.resource.group && self.kind == kind.resource.kind
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)?;
        } else {
            write!(f, "{}.{}", self.kind, self.group)?;
        }
        match &self.namespace {
            Some(ns) => write!(f, " {}/{}", ns, self.name),
            None => write!(f, " {}", self.name),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("kind {0} is not served by the store")]
    UnsupportedKind(String),
    #[error("transient store error: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(ae) => match ae.code {
                404 => StoreError::NotFound(ae.message.clone()),
                409 => StoreError::Conflict(ae.message.clone()),
                401 | 403 => StoreError::Forbidden(ae.message.clone()),
                400 | 422 => StoreError::Invalid(ae.message.clone()),
                _ => StoreError::Transient(ae.message.clone()),
            },
            _ => StoreError::Transient(e.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ApplyParams {
    pub field_manager: String,
    pub force: bool,
}

impl ApplyParams {
    pub fn new(field_manager: impl Into<String>, force: bool) -> Self {
        Self {
            field_manager: field_manager.into(),
            force,
        }
    }
}

/// Blocking-per-call access to the cluster object store. Implementations do
/// not retry; callers receive typed errors.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(
        &self,
        kind: &ManagedKind,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, StoreError>;

    /// Server-side apply of `object` under `params.field_manager`.
    async fn apply(
        &self,
        kind: &ManagedKind,
        object: &DynamicObject,
        params: &ApplyParams,
    ) -> Result<DynamicObject, StoreError>;

    async fn create(
        &self,
        kind: &ManagedKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Full update guarded by `metadata.resourceVersion`.
    async fn replace(
        &self,
        kind: &ManagedKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Lists objects matching `label_selector`; `namespace = None` lists all
    /// namespaces (or the cluster scope). Returns
    /// [`StoreError::UnsupportedKind`] when the kind is not installed.
    async fn list(
        &self,
        kind: &ManagedKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    async fn delete(
        &self,
        kind: &ManagedKind,
        key: &ObjectKey,
    ) -> Result<(), StoreError>;

    /// Whether the object an owner reference points at still exists with the
    /// same uid. `namespace` is the dependent's namespace.
    async fn owner_is_live(
        &self,
        owner: &OwnerReference,
        namespace: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Merge-patches the status subresource.
    async fn patch_status(
        &self,
        kind: &ManagedKind,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<(), StoreError>;
}

pub(crate) fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::rbac::v1::ClusterRole;

    #[test]
    fn typed_kinds_carry_scope() {
        let dep = ManagedKind::of::<Deployment>();
        assert_eq!(dep.scope, KindScope::Namespaced);
        assert_eq!(dep.group(), "apps");
        assert_eq!(dep.resource.plural, "deployments");
        let role = ManagedKind::of::<ClusterRole>();
        assert!(role.is_cluster_scoped());
    }

    #[test]
    fn cluster_keys_drop_namespace() {
        let role = ManagedKind::of::<ClusterRole>();
        let key = ObjectKey::new(&role, Some("default"), "reader");
        assert_eq!(key.namespace, None);
        assert_eq!(key.to_string(), "ClusterRole.rbac.authorization.k8s.io reader");
    }

    #[test]
    fn namespaced_object_without_namespace_is_invalid() {
        let dep = ManagedKind::of::<Deployment>();
        let obj = DynamicObject::new("web", &dep.resource);
        assert!(matches!(
            ObjectKey::of(&dep, &obj),
            Err(StoreError::Invalid(_))
        ));
        let obj = obj.within("apps");
        let key = ObjectKey::of(&dep, &obj).unwrap();
        assert_eq!(key.to_string(), "Deployment.apps apps/web");
    }

    #[test]
    fn core_group_api_version_splits() {
        assert_eq!(split_api_version("v1"), ("".into(), "v1".into()));
        assert_eq!(
            split_api_version("cert-manager.io/v1"),
            ("cert-manager.io".into(), "v1".into())
        );
    }
}
