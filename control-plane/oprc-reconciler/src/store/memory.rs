//! In-process [`ObjectStore`] with API-server-like bookkeeping.
//!
//! Apply is a recursive JSON merge of the applied object into the stored one
//! (arrays replace, `null` removes), which is close enough to server-side apply
//! for a single field manager. `ownerReferences` merge by uid as on the API
//! server, and a second controller reference is rejected. Every write that changes content bumps
//! `resourceVersion`; payload changes also bump `generation`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{DynamicObject, TypeMeta};
use serde_json::{Value, json};
use tokio::sync::RwLock;

use super::{
    ApplyParams, ManagedKind, ObjectKey, ObjectStore, StoreError,
    split_api_version,
};

#[derive(Default)]
struct State {
    kinds: Vec<ManagedKind>,
    objects: BTreeMap<ObjectKey, Value>,
    next_version: u64,
    writes: u64,
    status_writes: u64,
    deleted: Vec<ObjectKey>,
    failing_deletes: BTreeSet<ObjectKey>,
    failing_applies: BTreeSet<ObjectKey>,
    fail_status: bool,
}

impl State {
    fn served(&self, kind: &ManagedKind) -> Result<(), StoreError> {
        if self.kinds.iter().any(|k| k.same_kind(kind)) {
            Ok(())
        } else {
            Err(StoreError::UnsupportedKind(kind.to_string()))
        }
    }

    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    /// Store serving exactly `kinds`; every other kind is reported as not installed.
    pub fn new(kinds: impl IntoIterator<Item = ManagedKind>) -> Self {
        let state = State {
            kinds: kinds.into_iter().collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Seeds an object as if another actor had created it. Server fields
    /// (uid, resourceVersion, generation) are filled in when absent.
    pub async fn insert(
        &self,
        kind: &ManagedKind,
        object: DynamicObject,
    ) -> DynamicObject {
        let mut st = self.state.write().await;
        let key = ObjectKey::of(kind, &object)
            .unwrap_or_else(|e| panic!("seeding invalid object: {e}"));
        let mut value = to_value(kind, &object);
        let rv = st.bump();
        let meta = value
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
            .expect("metadata object");
        meta.entry("uid")
            .or_insert_with(|| json!(format!("uid-{rv}")));
        meta.entry("generation").or_insert_with(|| json!(1));
        meta.insert("resourceVersion".into(), json!(rv));
        st.objects.insert(key, value.clone());
        from_value(value)
    }

    pub async fn fetch(&self, key: &ObjectKey) -> Option<DynamicObject> {
        let st = self.state.read().await;
        st.objects.get(key).cloned().map(from_value)
    }

    pub async fn contains(&self, key: &ObjectKey) -> bool {
        self.state.read().await.objects.contains_key(key)
    }

    pub async fn keys_of(&self, kind: &ManagedKind) -> Vec<ObjectKey> {
        let st = self.state.read().await;
        st.objects.keys().filter(|k| k.is_kind(kind)).cloned().collect()
    }

    /// Number of content-changing writes (apply, create, replace, delete).
    pub async fn writes(&self) -> u64 {
        self.state.read().await.writes
    }

    pub async fn status_writes(&self) -> u64 {
        self.state.read().await.status_writes
    }

    pub async fn deleted(&self) -> Vec<ObjectKey> {
        self.state.read().await.deleted.clone()
    }

    pub async fn fail_deletes_of(&self, key: ObjectKey) {
        self.state.write().await.failing_deletes.insert(key);
    }

    pub async fn fail_applies_of(&self, key: ObjectKey) {
        self.state.write().await.failing_applies.insert(key);
    }

    pub async fn fail_status_updates(&self, fail: bool) {
        self.state.write().await.fail_status = fail;
    }

    /// Overwrites the `status` of a stored object, as a kubelet or workload
    /// controller would.
    pub async fn set_status(&self, key: &ObjectKey, status: Value) {
        let mut st = self.state.write().await;
        if let Some(obj) = st.objects.get_mut(key).and_then(Value::as_object_mut)
        {
            obj.insert("status".into(), status);
        }
    }
}

fn to_value(kind: &ManagedKind, object: &DynamicObject) -> Value {
    let mut obj = object.clone();
    obj.types = Some(TypeMeta {
        api_version: kind.resource.api_version.clone(),
        kind: kind.resource.kind.clone(),
    });
    serde_json::to_value(&obj).unwrap_or_else(|_| json!({}))
}

fn from_value(value: Value) -> DynamicObject {
    serde_json::from_value(value).expect("stored objects are valid")
}

fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(&k);
                } else {
                    merge(t.entry(k).or_insert(Value::Null), v);
                }
            }
        }
        (t, p) => *t = p,
    }
}

/// Server-side apply treats `ownerReferences` as a list keyed by `uid`:
/// applied entries replace their namesakes, every other stored entry stays.
fn merge_owner_refs(current: &Value, applied: &Value) -> Option<Value> {
    let incoming = applied.pointer("/metadata/ownerReferences")?.as_array()?;
    let mut merged = current
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for r in incoming {
        match merged.iter_mut().find(|m| m.get("uid") == r.get("uid")) {
            Some(slot) => *slot = r.clone(),
            None => merged.push(r.clone()),
        }
    }
    Some(Value::Array(merged))
}

fn controller_refs(value: &Value) -> usize {
    value
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter(|r| r.get("controller") == Some(&Value::Bool(true)))
                .count()
        })
        .unwrap_or(0)
}

/// Everything except metadata and status: the part whose change bumps `generation`.
fn payload(value: &Value) -> Value {
    let mut v = value.clone();
    if let Some(map) = v.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    v
}

fn meta_mut(value: &mut Value) -> &mut serde_json::Map<String, Value> {
    if !value.get("metadata").is_some_and(Value::is_object) {
        value["metadata"] = json!({});
    }
    value
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
        .expect("metadata was just ensured")
}

fn generation(value: &Value) -> i64 {
    value
        .pointer("/metadata/generation")
        .and_then(Value::as_i64)
        .unwrap_or(1)
}

fn selector_matches(selector: &str, value: &Value) -> bool {
    let labels = value.pointer("/metadata/labels").and_then(Value::as_object);
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, want)) => labels
                .and_then(|l| l.get(k))
                .and_then(Value::as_str)
                .is_some_and(|have| have == want),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        kind: &ManagedKind,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, StoreError> {
        let st = self.state.read().await;
        st.served(kind)?;
        Ok(st.objects.get(key).cloned().map(from_value))
    }

    async fn apply(
        &self,
        kind: &ManagedKind,
        object: &DynamicObject,
        _params: &ApplyParams,
    ) -> Result<DynamicObject, StoreError> {
        let mut st = self.state.write().await;
        st.served(kind)?;
        let key = ObjectKey::of(kind, object)?;
        if st.failing_applies.contains(&key) {
            return Err(StoreError::Forbidden(format!("cannot apply {key}")));
        }
        let mut applied = to_value(kind, object);
        if let Some(map) = applied.as_object_mut() {
            map.remove("status");
        }
        let previous = st.objects.get(&key).cloned();
        let mut next = match previous.clone() {
            Some(mut current) => {
                let refs = merge_owner_refs(&current, &applied);
                merge(&mut current, applied);
                if let Some(refs) = refs {
                    meta_mut(&mut current).insert("ownerReferences".into(), refs);
                }
                current
            }
            None => applied,
        };
        if controller_refs(&next) > 1 {
            return Err(StoreError::Invalid(format!(
                "{key}: only one owner reference can have controller set to true"
            )));
        }
        if previous.as_ref() == Some(&next) {
            return Ok(from_value(next));
        }
        let rv = st.bump();
        let gen_bump = previous
            .as_ref()
            .is_some_and(|p| payload(p) != payload(&next));
        let prev_gen = previous.as_ref().map(generation).unwrap_or(0);
        let meta = meta_mut(&mut next);
        meta.insert("resourceVersion".into(), json!(rv));
        meta.entry("uid")
            .or_insert_with(|| json!(format!("uid-{rv}")));
        let gen_value = match previous {
            None => 1,
            Some(_) if gen_bump => prev_gen + 1,
            Some(_) => prev_gen,
        };
        meta.insert("generation".into(), json!(gen_value));
        st.writes += 1;
        st.objects.insert(key, next.clone());
        Ok(from_value(next))
    }

    async fn create(
        &self,
        kind: &ManagedKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let mut st = self.state.write().await;
        st.served(kind)?;
        let key = ObjectKey::of(kind, object)?;
        if st.failing_applies.contains(&key) {
            return Err(StoreError::Forbidden(format!("cannot create {key}")));
        }
        if st.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{key} already exists")));
        }
        let mut value = to_value(kind, object);
        let rv = st.bump();
        let meta = meta_mut(&mut value);
        meta.insert("resourceVersion".into(), json!(rv));
        meta.insert("uid".into(), json!(format!("uid-{rv}")));
        meta.insert("generation".into(), json!(1));
        st.writes += 1;
        st.objects.insert(key, value.clone());
        Ok(from_value(value))
    }

    async fn replace(
        &self,
        kind: &ManagedKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let mut st = self.state.write().await;
        st.served(kind)?;
        let key = ObjectKey::of(kind, object)?;
        if st.failing_applies.contains(&key) {
            return Err(StoreError::Forbidden(format!("cannot replace {key}")));
        }
        let current = st
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let current_rv = current
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(rv) = object.metadata.resource_version.as_ref() {
            if current_rv.as_ref() != Some(rv) {
                return Err(StoreError::Conflict(format!(
                    "{key} was modified concurrently"
                )));
            }
        }
        let mut value = to_value(kind, object);
        if let Some(status) = current.get("status") {
            value["status"] = status.clone();
        }
        let gen_bump = payload(&current) != payload(&value);
        let next_gen = generation(&current) + i64::from(gen_bump);
        let uid = current
            .pointer("/metadata/uid")
            .cloned()
            .unwrap_or(Value::Null);
        let rv = st.bump();
        let meta = meta_mut(&mut value);
        meta.insert("resourceVersion".into(), json!(rv));
        meta.insert("uid".into(), uid);
        meta.insert("generation".into(), json!(next_gen));
        st.writes += 1;
        st.objects.insert(key, value.clone());
        Ok(from_value(value))
    }

    async fn list(
        &self,
        kind: &ManagedKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let st = self.state.read().await;
        st.served(kind)?;
        Ok(st
            .objects
            .iter()
            .filter(|(k, _)| k.is_kind(kind))
            .filter(|(k, _)| {
                namespace.is_none() || k.namespace.as_deref() == namespace
            })
            .filter(|(_, v)| selector_matches(label_selector, v))
            .map(|(_, v)| from_value(v.clone()))
            .collect())
    }

    async fn delete(
        &self,
        kind: &ManagedKind,
        key: &ObjectKey,
    ) -> Result<(), StoreError> {
        let mut st = self.state.write().await;
        st.served(kind)?;
        if st.failing_deletes.contains(key) {
            return Err(StoreError::Transient(format!("cannot delete {key}")));
        }
        if st.objects.remove(key).is_some() {
            st.writes += 1;
            st.deleted.push(key.clone());
        }
        Ok(())
    }

    async fn owner_is_live(
        &self,
        owner: &OwnerReference,
        namespace: Option<&str>,
    ) -> Result<bool, StoreError> {
        let (group, _) = split_api_version(&owner.api_version);
        let st = self.state.read().await;
        Ok(st.objects.iter().any(|(k, v)| {
            k.group == group
                && k.kind == owner.kind
                && k.name == owner.name
                && (k.namespace.is_none() || k.namespace.as_deref() == namespace)
                && v.pointer("/metadata/uid").and_then(Value::as_str)
                    == Some(owner.uid.as_str())
        }))
    }

    async fn patch_status(
        &self,
        kind: &ManagedKind,
        key: &ObjectKey,
        status: &Value,
    ) -> Result<(), StoreError> {
        let mut st = self.state.write().await;
        st.served(kind)?;
        if st.fail_status {
            return Err(StoreError::Transient(format!(
                "status of {key} unavailable"
            )));
        }
        let obj = st
            .objects
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        merge(obj, json!({ "status": status }));
        st.status_writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn cm(ns: &str, name: &str, data: Value) -> DynamicObject {
        let kind = ManagedKind::of::<ConfigMap>();
        DynamicObject::new(name, &kind.resource)
            .within(ns)
            .data(json!({ "data": data }))
    }

    #[tokio::test]
    async fn apply_keeps_stored_owner_references_of_other_uids() {
        let kind = ManagedKind::of::<ConfigMap>();
        let store = MemoryStore::new([kind.clone()]);
        let params = ApplyParams::new("test", true);
        let with_refs = |refs: Value| {
            let mut obj = cm("ns", "a", json!({"k": "v"}));
            obj.metadata.owner_references = serde_json::from_value(refs).unwrap();
            obj
        };
        let dead = json!({"apiVersion": "v1", "kind": "Pod", "name": "old", "uid": "u-dead", "controller": true});
        let anchor = json!({"apiVersion": "v1", "kind": "Pod", "name": "anchor", "uid": "u-anchor"});
        let ours = json!({"apiVersion": "v1", "kind": "Pod", "name": "new", "uid": "u-new", "controller": true});
        store.insert(&kind, with_refs(json!([dead, anchor]))).await;

        let err = store
            .apply(&kind, &with_refs(json!([ours])), &params)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)), "{err}");

        let stored = store
            .apply(&kind, &with_refs(json!([{"apiVersion": "v1", "kind": "Pod", "name": "extra", "uid": "u-extra"}])), &params)
            .await
            .unwrap();
        let uids: Vec<_> = stored
            .metadata
            .owner_references
            .unwrap()
            .into_iter()
            .map(|r| r.uid)
            .collect();
        assert_eq!(uids, vec!["u-dead", "u-anchor", "u-extra"]);
    }

    #[tokio::test]
    async fn apply_identical_content_is_not_a_write() {
        let kind = ManagedKind::of::<ConfigMap>();
        let store = MemoryStore::new([kind.clone()]);
        let params = ApplyParams::new("test", true);
        let first = store
            .apply(&kind, &cm("ns", "a", json!({"k": "v"})), &params)
            .await
            .unwrap();
        let second = store
            .apply(&kind, &cm("ns", "a", json!({"k": "v"})), &params)
            .await
            .unwrap();
        assert_eq!(store.writes().await, 1);
        assert_eq!(
            first.metadata.resource_version,
            second.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn apply_merges_and_bumps_generation_on_payload_change() {
        let kind = ManagedKind::of::<ConfigMap>();
        let store = MemoryStore::new([kind.clone()]);
        let params = ApplyParams::new("test", true);
        store
            .apply(&kind, &cm("ns", "a", json!({"k": "v"})), &params)
            .await
            .unwrap();
        let out = store
            .apply(&kind, &cm("ns", "a", json!({"other": "x"})), &params)
            .await
            .unwrap();
        assert_eq!(out.metadata.generation, Some(2));
        assert_eq!(out.data["data"]["k"], "v");
        assert_eq!(out.data["data"]["other"], "x");
    }

    #[tokio::test]
    async fn replace_rejects_stale_resource_version() {
        let kind = ManagedKind::of::<ConfigMap>();
        let store = MemoryStore::new([kind.clone()]);
        let created = store.create(&kind, &cm("ns", "a", json!({}))).await.unwrap();
        let mut stale = created.clone();
        stale.metadata.resource_version = Some("0".into());
        assert!(matches!(
            store.replace(&kind, &stale).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(store.replace(&kind, &created).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_kinds_are_unsupported() {
        let store = MemoryStore::new([]);
        let kind = ManagedKind::of::<ConfigMap>();
        assert!(matches!(
            store.list(&kind, None, "a=b").await,
            Err(StoreError::UnsupportedKind(_))
        ));
    }

    #[test]
    fn selector_requires_every_term() {
        let v = json!({"metadata": {"labels": {"a": "1", "b": "2"}}});
        assert!(selector_matches("a=1,b=2", &v));
        assert!(selector_matches("a", &v));
        assert!(!selector_matches("a=1,b=3", &v));
        assert!(!selector_matches("c", &v));
    }
}
