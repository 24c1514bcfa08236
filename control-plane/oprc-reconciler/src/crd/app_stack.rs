use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::Condition;

/// A small web application: one Deployment behind a Service, its settings in a
/// content-versioned ConfigMap and generated credentials in a Secret.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "oaas.io",
    version = "v1alpha1",
    kind = "AppStack",
    plural = "appstacks",
    shortname = "ast",
    status = "AppStackStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
pub struct AppStackSpec {
    /// Namespace every namespaced child is created in
    pub namespace: String,
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default = "default_port")]
    pub port: i32,
    /// Application settings, mounted under /etc/app and exposed as env vars
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,
}

fn default_replicas() -> i32 {
    1
}

fn default_port() -> i32 {
    8080
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct IngressSpec {
    pub host: String,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/".into()
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
pub struct TlsSpec {
    /// Issue the ingress certificate from a dedicated self-signed ClusterIssuer
    /// (requires cert-manager).
    #[serde(default)]
    pub self_signed: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct AppStackStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    /// Concrete name of the current config version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_name: Option<String>,
    /// Children applied by the latest pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied: Option<Vec<ResourceRef>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::CustomResourceExt;

    #[test]
    fn crd_is_cluster_scoped_with_status() {
        let crd = AppStack::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.kind, "AppStack");
        let version = &crd.spec.versions[0];
        assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
    }

    #[test]
    fn spec_defaults_apply() {
        let spec: AppStackSpec = serde_json::from_value(serde_json::json!({
            "namespace": "prod",
            "image": "nginx:1.27",
            "ingress": {"host": "shop.example.com"}
        }))
        .unwrap();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.port, 8080);
        assert_eq!(spec.ingress.unwrap().path, "/");
        assert!(spec.tls.is_none());
    }
}
