#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::core::DynamicObject;
use oprc_reconciler::controller::render::cluster_issuer_kind;
use oprc_reconciler::crd::{AppStack, AppStackSpec};
use oprc_reconciler::ownership::OWNER_LABEL;
use oprc_reconciler::store::{ApplyParams, MemoryStore};
use oprc_reconciler::{ManagedKind, ObjectKey, ObjectStore, OwnerIdentity};
use serde_json::json;

// DNS-1123 safe numeric suffix for unique names
pub const DIGITS: [char; 10] =
    ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];
pub fn uniq(prefix: &str) -> String {
    format!("{prefix}-{}", nanoid::nanoid!(6, &DIGITS))
}

const ENV_PREFIX: &str = "OPRC_RECONCILER_";
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn reconciler_vars() -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .collect()
}

/// Replaces every `OPRC_RECONCILER_*` variable with `vars` for the guard's
/// lifetime and restores the previous environment on drop. Holding the guard
/// serializes env access across the tests of one binary.
pub struct ScopedEnv {
    saved: Vec<(String, String)>,
    _lock: MutexGuard<'static, ()>,
}

impl ScopedEnv {
    pub fn new(vars: &[(&str, &str)]) -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let saved = reconciler_vars();
        // SAFETY: ENV_LOCK is held, no other test thread touches the env.
        unsafe {
            for (key, _) in &saved {
                std::env::remove_var(key);
            }
            for (key, val) in vars {
                std::env::set_var(key, val);
            }
        }
        Self { saved, _lock: lock }
    }
}

impl Drop for ScopedEnv {
    fn drop(&mut self) {
        // SAFETY: still under ENV_LOCK.
        unsafe {
            for (key, _) in reconciler_vars() {
                std::env::remove_var(key);
            }
            for (key, val) in self.saved.drain(..) {
                std::env::set_var(key, val);
            }
        }
    }
}

pub fn all_kinds() -> Vec<ManagedKind> {
    vec![
        ManagedKind::of::<Deployment>(),
        ManagedKind::of::<Service>(),
        ManagedKind::of::<ConfigMap>(),
        ManagedKind::of::<Secret>(),
        ManagedKind::of::<Ingress>(),
        ManagedKind::of::<AppStack>(),
        cluster_issuer_kind(),
    ]
}

pub fn memory_store() -> MemoryStore {
    MemoryStore::new(all_kinds())
}

pub fn params() -> ApplyParams {
    ApplyParams::new("oprc-reconciler", true)
}

pub fn arc(store: &MemoryStore) -> Arc<dyn ObjectStore> {
    Arc::new(store.clone())
}

/// A cluster-scoped owner object stored in `store`, so it counts as live.
pub async fn seed_owner(store: &MemoryStore, name: &str) -> OwnerIdentity {
    let kind = ManagedKind::of::<AppStack>();
    let stored = store
        .insert(&kind, DynamicObject::new(name, &kind.resource))
        .await;
    OwnerIdentity::new("oaas.io/v1alpha1", "AppStack", name)
        .with_uid(stored.metadata.uid.expect("seeded uid"))
}

pub fn stack_spec(namespace: &str) -> AppStackSpec {
    AppStackSpec {
        namespace: namespace.to_string(),
        image: "nginx:1.27".into(),
        replicas: 2,
        port: 8080,
        config: BTreeMap::from([("MODE".to_string(), "v1".to_string())]),
        ingress: None,
        tls: None,
    }
}

/// Stores `spec` as an AppStack and returns it as the API server would hand
/// it to the controller (uid and generation filled in).
pub async fn seed_stack(
    store: &MemoryStore,
    name: &str,
    spec: AppStackSpec,
) -> AppStack {
    let kind = ManagedKind::of::<AppStack>();
    let obj = serde_json::from_value(serde_json::to_value(AppStack::new(name, spec)).unwrap())
        .unwrap();
    let stored = store.insert(&kind, obj).await;
    serde_json::from_value(serde_json::to_value(stored).unwrap()).unwrap()
}

/// Re-reads the stack with its latest status.
pub async fn reload_stack(store: &MemoryStore, name: &str) -> AppStack {
    let kind = ManagedKind::of::<AppStack>();
    let obj = store
        .fetch(&ObjectKey::new(&kind, None, name))
        .await
        .expect("stack exists");
    serde_json::from_value(serde_json::to_value(obj).unwrap()).unwrap()
}

/// An object of `kind` carrying only the owner label, as an earlier pass
/// would have left it.
pub fn labelled(
    kind: &ManagedKind,
    namespace: Option<&str>,
    name: &str,
    owner: &str,
) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &kind.resource);
    if let Some(ns) = namespace {
        obj = obj.within(ns);
    }
    obj.metadata.labels =
        Some(BTreeMap::from([(OWNER_LABEL.to_string(), owner.to_string())]));
    obj
}

/// Marks a Deployment as having `ready` ready and available replicas.
pub async fn set_ready(store: &MemoryStore, namespace: &str, name: &str, ready: i64) {
    let key = ObjectKey::new(&ManagedKind::of::<Deployment>(), Some(namespace), name);
    store
        .set_status(
            &key,
            json!({"readyReplicas": ready, "availableReplicas": ready, "replicas": ready}),
        )
        .await;
}

pub async fn snapshot(store: &MemoryStore) -> Vec<(ObjectKey, serde_json::Value)> {
    let mut out = Vec::new();
    for kind in all_kinds() {
        for key in store.keys_of(&kind).await {
            let obj = store.fetch(&key).await.unwrap();
            out.push((key, serde_json::to_value(obj).unwrap()));
        }
    }
    out
}
