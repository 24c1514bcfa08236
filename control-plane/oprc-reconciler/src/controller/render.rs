//! Desired children of an [`AppStack`] and the cleanup policy covering them.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvFromSource,
    PodSpec, PodTemplateSpec, SecretEnvSource, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount, ConfigMapEnvSource,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend,
    IngressRule, IngressServiceBackend, IngressSpec, IngressTLS,
    ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::DynamicObject;
use serde_json::json;

use crate::crd::AppStack;
use crate::error::ReconcileError;
use crate::gc::{AllowList, CleanupPolicy};
use crate::store::{KindScope, ManagedKind, ObjectKey};
use crate::versioner::rewrite_config_refs;

pub const COMPONENT_WEB: &str = "web";
pub const COMPONENT_CONFIG: &str = "config";
pub const COMPONENT_CREDENTIALS: &str = "credentials";
pub const COMPONENT_INGRESS: &str = "ingress";
pub const COMPONENT_ISSUER: &str = "issuer";

const APP_LABEL: &str = "app";
const CONFIG_MOUNT: &str = "/etc/app";
pub const TOKEN_KEY: &str = "token";

pub fn config_logical_name(stack: &str) -> String {
    format!("{stack}-config")
}

pub fn secret_name(stack: &str) -> String {
    format!("{stack}-credentials")
}

pub fn issuer_name(stack: &str) -> String {
    format!("{stack}-selfsigned")
}

fn tls_secret_name(stack: &str) -> String {
    format!("{stack}-tls")
}

pub fn cluster_issuer_kind() -> ManagedKind {
    ManagedKind::dynamic(
        "cert-manager.io",
        "v1",
        "ClusterIssuer",
        "clusterissuers",
        KindScope::Cluster,
    )
}

/// Kinds that are rendered only under some specs, so objects of them may be
/// left behind by an earlier pass.
pub fn candidate_kinds() -> Vec<ManagedKind> {
    vec![
        ManagedKind::of::<Ingress>(),
        cluster_issuer_kind(),
        ManagedKind::of::<ConfigMap>(),
    ]
}

pub fn workload_kinds() -> Vec<ManagedKind> {
    vec![ManagedKind::of::<Deployment>()]
}

pub fn cleanup_policy(stack: &str) -> CleanupPolicy {
    let allow = AllowList::new().allow(&cluster_issuer_kind(), [issuer_name(stack)]);
    CleanupPolicy::new(candidate_kinds(), allow)
}

#[derive(Clone, Debug)]
pub enum RenderedResource {
    Deployment(Deployment),
    Service(Service),
    Ingress(Ingress),
    Other {
        kind: ManagedKind,
        manifest: DynamicObject,
    },
}

impl RenderedResource {
    pub fn component(&self) -> &'static str {
        match self {
            RenderedResource::Deployment(_) | RenderedResource::Service(_) => {
                COMPONENT_WEB
            }
            RenderedResource::Ingress(_) => COMPONENT_INGRESS,
            RenderedResource::Other { .. } => COMPONENT_ISSUER,
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            RenderedResource::Deployment(d) => ObjectKey::new(
                &ManagedKind::of::<Deployment>(),
                d.metadata.namespace.as_deref(),
                &d.name_any(),
            ),
            RenderedResource::Service(s) => ObjectKey::new(
                &ManagedKind::of::<Service>(),
                s.metadata.namespace.as_deref(),
                &s.name_any(),
            ),
            RenderedResource::Ingress(i) => ObjectKey::new(
                &ManagedKind::of::<Ingress>(),
                i.metadata.namespace.as_deref(),
                &i.name_any(),
            ),
            RenderedResource::Other { kind, manifest } => ObjectKey::new(
                kind,
                manifest.metadata.namespace.as_deref(),
                &manifest.name_any(),
            ),
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        match self {
            RenderedResource::Other { kind, .. } => kind.is_cluster_scoped(),
            _ => false,
        }
    }
}

fn meta(stack: &AppStack, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(stack.spec.namespace.clone()),
        labels: Some(selector_labels(stack)),
        ..Default::default()
    }
}

fn selector_labels(stack: &AppStack) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), stack.name_any())])
}

/// Everything the stack needs besides its config and credentials. Config
/// references are wired to `config_name`, the current concrete version.
pub fn render(
    stack: &AppStack,
    config_name: &str,
) -> Result<Vec<RenderedResource>, ReconcileError> {
    let name = stack.name_any();
    let mut out = vec![
        RenderedResource::Deployment(deployment(stack, config_name)?),
        RenderedResource::Service(service(stack)),
    ];
    if let Some(ing) = ingress(stack) {
        out.push(RenderedResource::Ingress(ing));
        if wants_self_signed(stack) {
            out.push(RenderedResource::Other {
                kind: cluster_issuer_kind(),
                manifest: self_signed_issuer(&name),
            });
        }
    }
    Ok(out)
}

fn wants_self_signed(stack: &AppStack) -> bool {
    stack.spec.tls.as_ref().is_some_and(|t| t.self_signed)
}

fn deployment(
    stack: &AppStack,
    config_name: &str,
) -> Result<Deployment, ReconcileError> {
    let name = stack.name_any();
    let logical = config_logical_name(&name);
    let labels = selector_labels(stack);
    let container = Container {
        name: "app".into(),
        image: Some(stack.spec.image.clone()),
        ports: Some(vec![ContainerPort {
            container_port: stack.spec.port,
            name: Some("http".into()),
            ..Default::default()
        }]),
        env_from: Some(vec![
            EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: logical.clone(),
                    optional: None,
                }),
                ..Default::default()
            },
            EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: secret_name(&name),
                    optional: None,
                }),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "config".into(),
            mount_path: CONFIG_MOUNT.into(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };
    let dep = Deployment {
        metadata: meta(stack, &name),
        spec: Some(DeploymentSpec {
            replicas: Some(stack.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "config".into(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: logical.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut manifest = serde_json::to_value(&dep)?;
    rewrite_config_refs(&mut manifest, &logical, config_name);
    Ok(serde_json::from_value(manifest)?)
}

fn service(stack: &AppStack) -> Service {
    let name = stack.name_any();
    Service {
        metadata: meta(stack, &name),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(stack)),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port: 80,
                target_port: Some(IntOrString::Int(stack.spec.port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn ingress(stack: &AppStack) -> Option<Ingress> {
    let spec = stack.spec.ingress.as_ref()?;
    let name = stack.name_any();
    let mut metadata = meta(stack, &name);
    let tls = wants_self_signed(stack).then(|| {
        metadata.annotations = Some(BTreeMap::from([(
            "cert-manager.io/cluster-issuer".to_string(),
            issuer_name(&name),
        )]));
        vec![IngressTLS {
            hosts: Some(vec![spec.host.clone()]),
            secret_name: Some(tls_secret_name(&name)),
        }]
    });
    Some(Ingress {
        metadata,
        spec: Some(IngressSpec {
            tls,
            rules: Some(vec![IngressRule {
                host: Some(spec.host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(spec.path.clone()),
                        path_type: "Prefix".into(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: name.clone(),
                                port: Some(ServiceBackendPort {
                                    name: Some("http".into()),
                                    number: None,
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn self_signed_issuer(stack: &str) -> DynamicObject {
    DynamicObject::new(&issuer_name(stack), &cluster_issuer_kind().resource)
        .data(json!({ "spec": { "selfSigned": {} } }))
}
