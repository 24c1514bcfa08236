mod stamp;
mod tracking;

pub use stamp::{foreign_controller, stamp};
pub use tracking::{TouchedSet, TrackingClient};

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

pub const OWNER_LABEL: &str = "oaas.io/owner";
pub const COMPONENT_LABEL: &str = "oaas.io/component";
pub const OWNER_KIND_ANNOTATION: &str = "oaas.io/owner-kind";

pub fn owner_label_selector(name: &str) -> String {
    format!("{}={}", OWNER_LABEL, name)
}

/// The desired-state resource that causes managed objects to exist. Derived
/// from the live resource on every pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerIdentity {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Present for namespaced owners only.
    pub namespace: Option<String>,
    pub uid: Option<String>,
}

impl OwnerIdentity {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: None,
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn within(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn from_resource<K>(obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            name: obj.name_any(),
            namespace: obj.namespace(),
            uid: obj.uid(),
        }
    }

    pub fn label_value(&self) -> &str {
        &self.name
    }

    /// Controller reference to this owner; `None` until the owner has a uid.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        self.uid.as_ref().map(|uid| OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }

    /// Whether `reference` points at this owner. Compares uids when both are
    /// known, otherwise falls back to kind and name.
    pub fn is_referenced_by(&self, reference: &OwnerReference) -> bool {
        match &self.uid {
            Some(uid) => &reference.uid == uid,
            None => reference.kind == self.kind && reference.name == self.name,
        }
    }
}

impl fmt::Display for OwnerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}
