//! Folds the readiness of every owned workload into one verdict.

use kube::core::DynamicObject;
use serde_json::Value;
use tracing::{debug, instrument, trace};

use crate::error::ReconcileError;
use crate::gc::list_owned;
use crate::store::{ManagedKind, ObjectKey, ObjectStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessState {
    Ready,
    Progressing,
    Failed,
    /// Nothing to track; reported as ready.
    Empty,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub state: ReadinessState,
    pub reason: String,
    pub message: String,
}

impl Verdict {
    fn new(
        state: ReadinessState,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            state,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn failed(err: &ReconcileError) -> Self {
        Self::new(ReadinessState::Failed, err.reason(), err.to_string())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ReadinessState::Ready | ReadinessState::Empty)
    }
}

/// Declared versus observed replica counts of one workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadReadiness {
    pub key: ObjectKey,
    pub desired: i64,
    pub ready: i64,
    pub available: i64,
}

impl WorkloadReadiness {
    /// Ready once the ready replicas reach the declared count. `available`
    /// lags behind `ready` under `minReadySeconds` and is informational.
    pub fn is_ready(&self) -> bool {
        self.ready >= self.desired
    }

    pub fn shortfall(&self) -> i64 {
        (self.desired - self.ready).max(0)
    }

    /// Reads the counters of a Deployment, StatefulSet or DaemonSet. Returns
    /// `None` for other kinds.
    pub fn from_object(key: ObjectKey, obj: &DynamicObject) -> Option<Self> {
        let int = |ptr: &str| obj.data.pointer(ptr).and_then(Value::as_i64);
        let (desired, ready, available) = match key.kind.as_str() {
            "Deployment" | "StatefulSet" => {
                let desired = int("/spec/replicas").unwrap_or(1);
                let ready = int("/status/readyReplicas").unwrap_or(0);
                let available = int("/status/availableReplicas").unwrap_or(ready);
                (desired, ready, available)
            }
            "DaemonSet" => {
                let desired = int("/status/desiredNumberScheduled").unwrap_or(0);
                let ready = int("/status/numberReady").unwrap_or(0);
                let available = int("/status/numberAvailable").unwrap_or(ready);
                (desired, ready, available)
            }
            _ => return None,
        };
        Some(Self {
            key,
            desired,
            ready,
            available,
        })
    }
}

/// Verdict over already collected workloads. `workloads` need not be sorted.
pub fn evaluate(mut workloads: Vec<WorkloadReadiness>) -> Verdict {
    if workloads.is_empty() {
        return Verdict::new(
            ReadinessState::Empty,
            "NoWorkloads",
            "no workloads to track",
        );
    }
    workloads.sort_by(|a, b| a.key.cmp(&b.key));
    match workloads.iter().find(|w| !w.is_ready()) {
        None => Verdict::new(
            ReadinessState::Ready,
            "AllWorkloadsReady",
            format!("{} workload(s) ready", workloads.len()),
        ),
        Some(w) => Verdict::new(
            ReadinessState::Progressing,
            "WorkloadsProgressing",
            format!(
                "{} has {}/{} ready ({} short)",
                w.key,
                w.ready,
                w.desired,
                w.shortfall()
            ),
        ),
    }
}

/// Computes the owner's readiness verdict from a fresh list of its workloads.
/// An apply failure in the same pass wins over any workload state and skips
/// the listing entirely.
#[instrument(skip_all, fields(owner = %owner_name, kinds = workload_kinds.len()))]
pub async fn update_component_statuses(
    store: &dyn ObjectStore,
    owner_label_key: &str,
    owner_name: &str,
    workload_kinds: &[ManagedKind],
    apply_failure: Option<&ReconcileError>,
) -> Result<Verdict, ReconcileError> {
    if let Some(err) = apply_failure {
        debug!(reason = err.reason(), "status: apply failed this pass");
        return Ok(Verdict::failed(err));
    }
    let owned = list_owned(store, owner_label_key, owner_name, workload_kinds)
        .await
        .map_err(|source| ReconcileError::StatusUpdateFailed {
            owner: owner_name.to_string(),
            source,
        })?;

    let mut workloads = Vec::new();
    for (kind, items) in owned {
        for obj in items {
            let Ok(key) = ObjectKey::of(&kind, &obj) else {
                continue;
            };
            match WorkloadReadiness::from_object(key, &obj) {
                Some(w) => {
                    trace!(workload = %w.key, ready = w.ready, desired = w.desired, "status: observed workload");
                    workloads.push(w);
                }
                None => debug!(%kind, "status: kind has no readiness counters; skipped"),
            }
        }
    }
    let verdict = evaluate(workloads);
    debug!(state = ?verdict.state, reason = %verdict.reason, "status: verdict");
    Ok(verdict)
}
