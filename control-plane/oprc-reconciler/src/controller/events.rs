use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::debug;

use crate::crd::AppStack;
use crate::pass::PassOutcome;

pub const REASON_RECONCILED: &str = "Reconciled";
pub const REASON_ORPHANS_DELETED: &str = "OrphansDeleted";
pub const REASON_ORPHANS_RETAINED: &str = "OrphansRetained";

pub fn recorder(client: Client, controller: &str) -> Recorder {
    let reporter = Reporter {
        controller: controller.to_string(),
        instance: std::env::var("POD_NAME").ok(),
    };
    Recorder::new(client, reporter)
}

/// Events describing a finished pass; an empty list for a quiet no-op pass.
pub fn events_for(outcome: &PassOutcome) -> Vec<Event> {
    let mut out = Vec::new();
    if let Some(err) = outcome.error.as_ref() {
        out.push(Event {
            type_: EventType::Warning,
            reason: err.reason().into(),
            note: Some(err.to_string()),
            action: REASON_RECONCILED.into(),
            secondary: None,
        });
    }
    if let Some(report) = outcome.cleanup.as_ref() {
        if !report.deleted.is_empty() {
            let names: Vec<String> =
                report.deleted.iter().map(ToString::to_string).collect();
            out.push(Event {
                type_: EventType::Normal,
                reason: REASON_ORPHANS_DELETED.into(),
                note: Some(names.join(", ")),
                action: "Cleanup".into(),
                secondary: None,
            });
        }
        if !report.retained.is_empty() {
            out.push(Event {
                type_: EventType::Warning,
                reason: REASON_ORPHANS_RETAINED.into(),
                note: Some(format!(
                    "{} cluster-scoped orphan(s) outside the allow-list were kept",
                    report.retained.len()
                )),
                action: "Cleanup".into(),
                secondary: None,
            });
        }
    }
    out
}

pub async fn publish_outcome(
    recorder: &Recorder,
    stack: &AppStack,
    outcome: &PassOutcome,
) {
    let reference = stack.object_ref(&());
    for event in events_for(outcome) {
        if let Err(e) = recorder.publish(&event, &reference).await {
            debug!(error = %e, reason = %event.reason, "failed to publish event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReconcileError;
    use crate::gc::CleanupReport;
    use crate::status::{ReadinessState, Verdict};
    use crate::store::{ManagedKind, ObjectKey, StoreError};
    use k8s_openapi::api::networking::v1::Ingress;

    fn outcome() -> PassOutcome {
        PassOutcome {
            applied: Default::default(),
            cleanup: Some(CleanupReport::default()),
            verdict: Ok(Verdict {
                state: ReadinessState::Ready,
                reason: "AllWorkloadsReady".into(),
                message: "1 workload(s) ready".into(),
            }),
            error: None,
        }
    }

    #[test]
    fn quiet_pass_emits_nothing() {
        assert!(events_for(&outcome()).is_empty());
    }

    #[test]
    fn deletions_and_errors_are_reported() {
        let key = ObjectKey::new(&ManagedKind::of::<Ingress>(), Some("prod"), "shop");
        let mut o = outcome();
        o.cleanup.as_mut().unwrap().deleted.push(key.clone());
        o.error = Some(ReconcileError::CleanupFailed {
            failures: vec![(key, StoreError::Transient("timeout".into()))],
        });
        let events = events_for(&o);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason, "CleanupFailed");
        assert!(matches!(events[0].type_, EventType::Warning));
        assert_eq!(events[1].reason, REASON_ORPHANS_DELETED);
        assert!(events[1].note.as_deref().unwrap().contains("prod/shop"));
    }
}
