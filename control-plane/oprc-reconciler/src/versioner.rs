//! Content-addressed ConfigMaps.
//!
//! A logical config name maps to a ConfigMap named `<logical>-<digest>`; any
//! content change yields a new object, and superseded versions are pruned only
//! after the new one was applied.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::error::ReconcileError;
use crate::ownership::TrackingClient;
use crate::store::{ManagedKind, ObjectKey, StoreError};

pub const VERSIONED_CONFIG_LABEL: &str = "oaas.io/versioned-config";
pub const CONTENT_DIGEST_ANNOTATION: &str = "oaas.io/content-digest";
pub const DIGEST_SUFFIX_LEN: usize = 10;

/// Lowercase hex SHA-256 of `content`.
pub fn content_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

pub fn versioned_name(logical_name: &str, digest: &str) -> String {
    let end = digest.len().min(DIGEST_SUFFIX_LEN);
    format!("{}-{}", logical_name, &digest[..end])
}

/// Canonical byte encoding of config data: JSON of the key-sorted map.
pub fn canonical_bytes(data: &BTreeMap<String, String>) -> Vec<u8> {
    serde_json::to_vec(data).unwrap_or_default()
}

fn validate_logical_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 63 {
        return Err(format!(
            "logical config name {name:?} must be 1-63 characters"
        ));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = !name.starts_with('-') && !name.ends_with('-');
    if valid_chars && valid_edges {
        Ok(())
    } else {
        Err(format!(
            "logical config name {name:?} must be a lowercase DNS label"
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedConfig {
    pub name: String,
    pub digest: String,
    pub pruned: Vec<ObjectKey>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigVersioner;

impl ConfigVersioner {
    /// Applies `data` as the current version of `logical_name` in `namespace`
    /// and prunes older versions. Returns the concrete ConfigMap name to wire
    /// into referencing objects.
    #[instrument(skip_all, fields(owner = %client.owner(), ns = %namespace, config = %logical_name))]
    pub async fn apply(
        &self,
        client: &mut TrackingClient,
        component: &str,
        namespace: &str,
        logical_name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<AppliedConfig, ReconcileError> {
        let kind = ManagedKind::of::<ConfigMap>();
        if let Err(msg) = validate_logical_name(logical_name) {
            return Err(ReconcileError::apply_failed(
                ObjectKey::new(&kind, Some(namespace), logical_name),
                StoreError::Invalid(msg),
            ));
        }
        let digest = content_digest(&canonical_bytes(data));
        let name = versioned_name(logical_name, &digest);

        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    VERSIONED_CONFIG_LABEL.to_string(),
                    logical_name.to_string(),
                )])),
                annotations: Some(BTreeMap::from([(
                    CONTENT_DIGEST_ANNOTATION.to_string(),
                    digest.clone(),
                )])),
                ..Default::default()
            },
            data: Some(data.clone()),
            ..Default::default()
        };
        client.apply_resource(component, &cm).await?;
        debug!(config = %name, "versioner: applied current version");

        let pruned = self.prune(client, &kind, namespace, logical_name, &name).await?;
        Ok(AppliedConfig {
            name,
            digest,
            pruned,
        })
    }

    async fn prune(
        &self,
        client: &TrackingClient,
        kind: &ManagedKind,
        namespace: &str,
        logical_name: &str,
        keep: &str,
    ) -> Result<Vec<ObjectKey>, ReconcileError> {
        let selector = format!(
            "{}={},{}={}",
            crate::ownership::OWNER_LABEL,
            client.owner().label_value(),
            VERSIONED_CONFIG_LABEL,
            logical_name
        );
        let prefix = format!("{}-", logical_name);
        let store = client.store();
        let listed = store
            .list(kind, Some(namespace), &selector)
            .await
            .map_err(|e| ReconcileError::CleanupFailed {
                failures: vec![(ObjectKey::new(kind, Some(namespace), &prefix), e)],
            })?;

        let mut pruned = Vec::new();
        let mut failures = Vec::new();
        for old in listed {
            let old_name = old.name_any();
            if old_name == keep || !is_version_of(&old_name, &prefix) {
                continue;
            }
            let key = ObjectKey::new(kind, Some(namespace), &old_name);
            match store.delete(kind, &key).await {
                Ok(()) => {
                    info!(config = %key, "versioner: pruned superseded version");
                    pruned.push(key);
                }
                Err(e) => {
                    warn!(config = %key, error = %e, "versioner: failed to prune superseded version");
                    failures.push((key, e));
                }
            }
        }
        if failures.is_empty() {
            Ok(pruned)
        } else {
            Err(ReconcileError::CleanupFailed { failures })
        }
    }
}

fn is_version_of(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix).is_some_and(|suffix| {
        suffix.len() == DIGEST_SUFFIX_LEN
            && suffix.chars().all(|c| c.is_ascii_hexdigit())
    })
}

/// Points every ConfigMap reference to `logical_name` inside `manifest` at
/// `concrete_name`: volume `configMap.name`, `envFrom[].configMapRef.name` and
/// `env[].valueFrom.configMapKeyRef.name`. Returns how many were rewritten.
pub fn rewrite_config_refs(
    manifest: &mut Value,
    logical_name: &str,
    concrete_name: &str,
) -> usize {
    match manifest {
        Value::Object(map) => {
            let mut count = 0;
            for (key, child) in map.iter_mut() {
                let is_ref = matches!(
                    key.as_str(),
                    "configMap" | "configMapRef" | "configMapKeyRef"
                );
                if is_ref {
                    if let Some(name) = child.get_mut("name") {
                        if name.as_str() == Some(logical_name) {
                            *name = Value::String(concrete_name.to_string());
                            count += 1;
                        }
                    }
                }
                count += rewrite_config_refs(child, logical_name, concrete_name);
            }
            count
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|v| rewrite_config_refs(v, logical_name, concrete_name))
            .sum(),
        _ => 0,
    }
}
