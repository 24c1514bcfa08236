pub mod aggregator;
pub mod conditions;


pub use aggregator::{
    ReadinessState, Verdict, WorkloadReadiness, update_component_statuses,
};
pub use conditions::{
    Condition, ConditionStatus, READY_CONDITION, condition_for,
    should_patch_status, upsert_conditions,
};
