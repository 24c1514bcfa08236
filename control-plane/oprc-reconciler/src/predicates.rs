//! Watch-event predicates.
//!
//! Each predicate compares the previous and the new version of an object and
//! answers whether a reconcile is worth triggering. A missing side always
//! counts as a change so creations and deletions are never swallowed.

use std::collections::HashMap;

use futures_util::{Stream, StreamExt, stream};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};

pub fn generation_changed<K: Resource>(old: Option<&K>, new: Option<&K>) -> bool {
    match (old, new) {
        (Some(o), Some(n)) => o.meta().generation != n.meta().generation,
        _ => true,
    }
}

/// Status counters watched on workloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicaCounts {
    pub ready: i32,
    pub available: i32,
    pub unavailable: i32,
    pub updated: i32,
    pub total: i32,
}

pub trait ReplicaCounters {
    fn replica_counts(&self) -> ReplicaCounts;
}

impl ReplicaCounters for Deployment {
    fn replica_counts(&self) -> ReplicaCounts {
        self.status
            .as_ref()
            .map(|s| ReplicaCounts {
                ready: s.ready_replicas.unwrap_or(0),
                available: s.available_replicas.unwrap_or(0),
                unavailable: s.unavailable_replicas.unwrap_or(0),
                updated: s.updated_replicas.unwrap_or(0),
                total: s.replicas.unwrap_or(0),
            })
            .unwrap_or_default()
    }
}

impl ReplicaCounters for StatefulSet {
    fn replica_counts(&self) -> ReplicaCounts {
        self.status
            .as_ref()
            .map(|s| ReplicaCounts {
                ready: s.ready_replicas.unwrap_or(0),
                available: s.available_replicas.unwrap_or(0),
                unavailable: 0,
                updated: s.updated_replicas.unwrap_or(0),
                total: s.replicas,
            })
            .unwrap_or_default()
    }
}

impl ReplicaCounters for DaemonSet {
    fn replica_counts(&self) -> ReplicaCounts {
        self.status
            .as_ref()
            .map(|s| ReplicaCounts {
                ready: s.number_ready,
                available: s.number_available.unwrap_or(0),
                unavailable: s.number_unavailable.unwrap_or(0),
                updated: s.updated_number_scheduled.unwrap_or(0),
                total: s.desired_number_scheduled,
            })
            .unwrap_or_default()
    }
}

impl ReplicaCounters for ReplicaSet {
    fn replica_counts(&self) -> ReplicaCounts {
        self.status
            .as_ref()
            .map(|s| ReplicaCounts {
                ready: s.ready_replicas.unwrap_or(0),
                available: s.available_replicas.unwrap_or(0),
                unavailable: 0,
                updated: s.fully_labeled_replicas.unwrap_or(0),
                total: s.replicas,
            })
            .unwrap_or_default()
    }
}

pub fn workload_readiness_changed<K>(old: Option<&K>, new: Option<&K>) -> bool
where
    K: Resource + ReplicaCounters,
{
    if generation_changed(old, new) {
        return true;
    }
    match (old, new) {
        (Some(o), Some(n)) => o.replica_counts() != n.replica_counts(),
        _ => true,
    }
}

pub fn labels_or_annotations_changed<K: Resource>(
    old: Option<&K>,
    new: Option<&K>,
) -> bool {
    if generation_changed(old, new) {
        return true;
    }
    match (old, new) {
        (Some(o), Some(n)) => {
            o.meta().labels != n.meta().labels
                || o.meta().annotations != n.meta().annotations
        }
        _ => true,
    }
}

fn identity<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Passes on only the watcher events `predicate` accepts, as trigger objects
/// for `Controller::for_stream` or `Controller::watches_stream`. The last seen
/// version of every object is kept to compare against and deletions are
/// compared against `None`. A relist replaces that memory once it completes,
/// and objects that vanished during the relist are passed on as deletions.
pub fn filter_events<S, K, P>(
    events: S,
    predicate: P,
) -> impl Stream<Item = Result<K, watcher::Error>> + Send
where
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    K: Resource + Clone + Send + 'static,
    P: Fn(Option<&K>, Option<&K>) -> bool + Send + 'static,
{
    let mut seen: HashMap<String, K> = HashMap::new();
    let mut relist: Option<HashMap<String, K>> = None;
    events.flat_map(move |event| {
        let mut out = Vec::new();
        match event {
            Ok(watcher::Event::Init) => relist = Some(HashMap::new()),
            Ok(watcher::Event::InitApply(obj)) => {
                let id = identity(&obj);
                if predicate(seen.get(&id), Some(&obj)) {
                    out.push(Ok(obj.clone()));
                }
                relist.get_or_insert_with(HashMap::new).insert(id, obj);
            }
            Ok(watcher::Event::InitDone) => {
                if let Some(fresh) = relist.take() {
                    for (id, gone) in seen.drain() {
                        if !fresh.contains_key(&id) && predicate(Some(&gone), None) {
                            out.push(Ok(gone));
                        }
                    }
                    seen = fresh;
                }
            }
            Ok(watcher::Event::Apply(obj)) => {
                let previous = seen.insert(identity(&obj), obj.clone());
                if predicate(previous.as_ref(), Some(&obj)) {
                    out.push(Ok(obj));
                }
            }
            Ok(watcher::Event::Delete(obj)) => {
                let previous = seen.remove(&identity(&obj));
                if predicate(previous.as_ref(), None) {
                    out.push(Ok(obj));
                }
            }
            Err(e) => out.push(Err(e)),
        }
        stream::iter(out)
    })
}
