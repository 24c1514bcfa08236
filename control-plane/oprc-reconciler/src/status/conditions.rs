use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use super::aggregator::{ReadinessState, Verdict};
use crate::error::ReconcileError;

pub const READY_CONDITION: &str = "Ready";

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// `Ready` condition for the outcome of a status aggregation.
pub fn condition_for(verdict: &Result<Verdict, ReconcileError>) -> Condition {
    let (status, reason, message) = match verdict {
        Ok(v) => {
            let status = match v.state {
                ReadinessState::Ready | ReadinessState::Empty => {
                    ConditionStatus::True
                }
                ReadinessState::Progressing | ReadinessState::Failed => {
                    ConditionStatus::False
                }
            };
            (status, v.reason.clone(), v.message.clone())
        }
        Err(e) => (ConditionStatus::Unknown, e.reason().to_string(), e.to_string()),
    };
    Condition {
        type_: READY_CONDITION.to_string(),
        status,
        reason: Some(reason),
        message: Some(message),
        last_transition_time: Some(Utc::now().to_rfc3339()),
    }
}

/// Upserts `incoming` into `existing` by condition type. A condition whose
/// status did not change keeps its previous `lastTransitionTime`.
pub fn upsert_conditions(
    existing: &[Condition],
    incoming: Vec<Condition>,
) -> Vec<Condition> {
    let mut out = existing.to_vec();
    for mut inc in incoming {
        match out.iter().position(|c| c.type_ == inc.type_) {
            Some(idx) => {
                if out[idx].status == inc.status {
                    inc.last_transition_time =
                        out[idx].last_transition_time.clone();
                }
                out[idx] = inc;
            }
            None => out.push(inc),
        }
    }
    out.sort_by(|a, b| a.type_.cmp(&b.type_));
    out
}

fn normalize_status(status: &Value) -> Value {
    let mut v = status.clone();
    if let Value::Object(ref mut map) = v {
        map.remove("last_updated");
        if let Some(Value::Array(conds)) = map.get_mut("conditions") {
            for c in conds.iter_mut() {
                if let Some(obj) = c.as_object_mut() {
                    obj.remove("lastTransitionTime");
                }
            }
        }
    }
    v
}

/// Whether writing `desired` would change anything besides timestamps.
pub fn should_patch_status(current: Option<&Value>, desired: &Value) -> bool {
    let Some(current) = current.filter(|c| !c.is_null()) else {
        debug!("should_patch_status: no current status, patching");
        return true;
    };
    let differs = normalize_status(current) != normalize_status(desired);
    if differs {
        debug!(
            current = %normalize_status(current),
            desired = %normalize_status(desired),
            "should_patch_status: status differs, patching"
        );
    } else {
        trace!("should_patch_status: status identical, skipping patch");
    }
    differs
}

impl Default for Condition {
    fn default() -> Self {
        Self {
            type_: READY_CONDITION.to_string(),
            status: ConditionStatus::Unknown,
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use serde_json::json;

    fn ready(ts: &str) -> Condition {
        Condition {
            status: ConditionStatus::True,
            reason: Some("AllWorkloadsReady".into()),
            last_transition_time: Some(ts.into()),
            ..Default::default()
        }
    }

    #[test]
    fn maps_verdicts_to_condition_status() {
        let empty = Verdict {
            state: ReadinessState::Empty,
            reason: "NoWorkloads".into(),
            message: "no workloads to track".into(),
        };
        assert_eq!(condition_for(&Ok(empty)).status, ConditionStatus::True);

        let err = ReconcileError::StatusUpdateFailed {
            owner: "shop".into(),
            source: StoreError::Transient("timeout".into()),
        };
        let c = condition_for(&Err(err));
        assert_eq!(c.status, ConditionStatus::Unknown);
        assert_eq!(c.reason.as_deref(), Some("StatusUpdateFailed"));
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let merged = upsert_conditions(&[ready("t0")], vec![ready("t1")]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].last_transition_time.as_deref(), Some("t0"));

        let flipped = Condition {
            status: ConditionStatus::False,
            ..ready("t2")
        };
        let merged = upsert_conditions(&merged, vec![flipped]);
        assert_eq!(merged[0].last_transition_time.as_deref(), Some("t2"));
    }

    #[test]
    fn timestamps_alone_do_not_trigger_a_patch() {
        let a = json!({"phase": "Ready", "last_updated": "t0",
            "conditions": [{"type": "Ready", "status": "True", "lastTransitionTime": "t0"}]});
        let b = json!({"phase": "Ready", "last_updated": "t9",
            "conditions": [{"type": "Ready", "status": "True", "lastTransitionTime": "t9"}]});
        assert!(!should_patch_status(Some(&a), &b));
        assert!(should_patch_status(None, &b));
        let c = json!({"phase": "Progressing", "last_updated": "t9"});
        assert!(should_patch_status(Some(&a), &c));
    }
}
