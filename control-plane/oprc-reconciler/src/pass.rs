//! One reconcile pass: apply everything, collect orphans once, then aggregate.

use std::sync::Arc;

use tracing::{instrument, warn};

use crate::error::ReconcileError;
use crate::gc::{CleanupPolicy, CleanupReport};
use crate::ownership::{OwnerIdentity, TouchedSet, TrackingClient};
use crate::status::{Verdict, update_component_statuses};
use crate::store::{ApplyParams, ManagedKind, ObjectStore};

pub struct ReconcilePass {
    client: TrackingClient,
}

/// What a finished pass did and concluded.
#[derive(Debug)]
pub struct PassOutcome {
    pub applied: TouchedSet,
    /// `None` when garbage collection was skipped or failed.
    pub cleanup: Option<CleanupReport>,
    pub verdict: Result<Verdict, ReconcileError>,
    /// First error of the apply or cleanup phase.
    pub error: Option<ReconcileError>,
}

impl PassOutcome {
    /// Adds a cleanup failure reported outside the collector (e.g. by config
    /// pruning). Two cleanup failures are folded into one.
    pub fn record_cleanup_failure(&mut self, err: ReconcileError) {
        self.error = match (self.error.take(), err) {
            (
                Some(ReconcileError::CleanupFailed { mut failures }),
                ReconcileError::CleanupFailed { failures: more },
            ) => {
                failures.extend(more);
                Some(ReconcileError::CleanupFailed { failures })
            }
            (Some(existing), _) => Some(existing),
            (None, err) => Some(err),
        };
    }

    pub fn into_result(self) -> Result<Verdict, ReconcileError> {
        match self.error {
            Some(e) => Err(e),
            None => self.verdict,
        }
    }
}

impl ReconcilePass {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        owner: OwnerIdentity,
        params: ApplyParams,
    ) -> Self {
        Self {
            client: TrackingClient::new(store, owner, params),
        }
    }

    pub fn client(&self) -> &TrackingClient {
        &self.client
    }

    /// Client for the apply phase.
    pub fn client_mut(&mut self) -> &mut TrackingClient {
        &mut self.client
    }

    /// Ends the pass. When `apply_result` is an error the touched set is
    /// incomplete, so no orphan is collected and the verdict is `Failed`.
    #[instrument(skip_all, fields(owner = %self.client.owner(), touched = self.client.touched().len()))]
    pub async fn finish(
        self,
        apply_result: Result<(), ReconcileError>,
        policy: &CleanupPolicy,
        workload_kinds: &[ManagedKind],
    ) -> PassOutcome {
        let apply_error = apply_result.err();
        let mut error = apply_error.clone();
        let mut cleanup = None;

        if apply_error.is_none() {
            match self.client.cleanup_orphans(policy).await {
                Ok(report) => cleanup = Some(report),
                Err(e) => {
                    warn!(error = %e, "pass: orphan cleanup incomplete");
                    error = Some(e);
                }
            }
        } else {
            warn!("pass: apply failed; skipping orphan cleanup");
        }

        let verdict = update_component_statuses(
            self.client.store().as_ref(),
            &policy.owner_label_key,
            self.client.owner().label_value(),
            workload_kinds,
            apply_error.as_ref(),
        )
        .await;

        PassOutcome {
            applied: self.client.into_touched(),
            cleanup,
            verdict,
            error,
        }
    }
}
