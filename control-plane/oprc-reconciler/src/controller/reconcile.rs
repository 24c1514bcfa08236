use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::{debug, info, instrument, warn};

use super::ControllerContext;
use super::events::publish_outcome;
use super::render::{
    self, COMPONENT_CONFIG, COMPONENT_CREDENTIALS, RenderedResource, TOKEN_KEY,
};
use crate::config::ReconcilerConfig;
use crate::crd::{AppStack, AppStackStatus, ResourceRef};
use crate::error::ReconcileError;
use crate::ownership::{OwnerIdentity, TrackingClient};
use crate::pass::{PassOutcome, ReconcilePass};
use crate::status::{
    Condition, ConditionStatus, ReadinessState, condition_for,
    should_patch_status, upsert_conditions,
};
use crate::store::{ManagedKind, ObjectKey, ObjectStore};
use crate::versioner::{ConfigVersioner, canonical_bytes, content_digest, versioned_name};

const CLEANUP_CONDITION: &str = "OrphansCollected";

pub async fn reconcile(
    obj: Arc<AppStack>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    // Children reference the stack as controller; the API server cascades.
    if obj.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let outcome = reconcile_app_stack(ctx.store.clone(), &ctx.cfg, &obj).await?;
    if let Some(recorder) = ctx.recorder.as_ref() {
        publish_outcome(recorder, &obj, &outcome).await;
    }
    let verdict = outcome.into_result()?;
    let action = match verdict.state {
        ReadinessState::Progressing => {
            Action::requeue(ctx.cfg.progressing_requeue())
        }
        _ => Action::requeue(ctx.cfg.requeue()),
    };
    Ok(action)
}

/// Runs one full pass for `stack` against `store` and writes its status.
/// Errors of the pass itself are reported in the returned outcome; only a
/// failed status write is returned as an error.
#[instrument(skip_all, fields(stack = %stack.name_any(), ns = %stack.spec.namespace))]
pub async fn reconcile_app_stack(
    store: Arc<dyn ObjectStore>,
    cfg: &ReconcilerConfig,
    stack: &AppStack,
) -> Result<PassOutcome, ReconcileError> {
    let name = stack.name_any();
    let owner = OwnerIdentity::from_resource(stack);
    let mut pass = ReconcilePass::new(store.clone(), owner, cfg.apply_params());

    let mut prune_error = None;
    let applied = apply_children(pass.client_mut(), stack, &mut prune_error).await;
    let config_name = applied.as_ref().ok().cloned();

    let mut outcome = pass
        .finish(
            applied.map(|_| ()),
            &render::cleanup_policy(&name),
            &render::workload_kinds(),
        )
        .await;
    if let Some(e) = prune_error {
        outcome.record_cleanup_failure(e);
    }
    match outcome.error.as_ref() {
        Some(e) => warn!(error = %e, "reconcile pass failed"),
        None => info!(touched = outcome.applied.len(), "reconcile pass complete"),
    }

    write_status(store.as_ref(), stack, &outcome, config_name).await?;
    Ok(outcome)
}

/// Applies every child of `stack`, returning the concrete config name. A
/// failure to prune old config versions does not stop the pass; it is handed
/// back through `prune_error`.
async fn apply_children(
    client: &mut TrackingClient,
    stack: &AppStack,
    prune_error: &mut Option<ReconcileError>,
) -> Result<String, ReconcileError> {
    let name = stack.name_any();
    let ns = stack.spec.namespace.as_str();
    let logical = render::config_logical_name(&name);

    let config_name = match ConfigVersioner
        .apply(client, COMPONENT_CONFIG, ns, &logical, &stack.spec.config)
        .await
    {
        Ok(applied) => applied.name,
        Err(e @ ReconcileError::CleanupFailed { .. }) => {
            *prune_error = Some(e);
            versioned_name(&logical, &content_digest(&canonical_bytes(&stack.spec.config)))
        }
        Err(e) => return Err(e),
    };

    client
        .create_or_update(
            COMPONENT_CREDENTIALS,
            Some(ns),
            &render::secret_name(&name),
            ensure_token,
        )
        .await
        .map(|_: Secret| ())?;

    for resource in render::render(stack, &config_name)? {
        let component = resource.component();
        match resource {
            RenderedResource::Deployment(d) => {
                client.apply_resource(component, &d).await?;
            }
            RenderedResource::Service(s) => {
                client.apply_resource(component, &s).await?;
            }
            RenderedResource::Ingress(i) => {
                client.apply_resource(component, &i).await?;
            }
            RenderedResource::Other { kind, manifest } => {
                client.apply_owned(component, &kind, manifest).await?;
            }
        }
    }
    debug!(config = %config_name, "applied all children");
    Ok(config_name)
}

/// Generates the access token once; an existing token is carried forward.
fn ensure_token(mut secret: Secret) -> Secret {
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.entry(TOKEN_KEY.to_string()).or_insert_with(|| {
        let token: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        ByteString(token.into_bytes())
    });
    secret
}

fn phase_of(outcome: &PassOutcome) -> &'static str {
    match &outcome.verdict {
        Ok(v) => match v.state {
            ReadinessState::Ready | ReadinessState::Empty => "Ready",
            ReadinessState::Progressing => "Progressing",
            ReadinessState::Failed => "Failed",
        },
        Err(_) => "Unknown",
    }
}

fn cleanup_condition(outcome: &PassOutcome) -> Condition {
    let now = Some(Utc::now().to_rfc3339());
    let (status, reason, message) = match (&outcome.cleanup, &outcome.error) {
        (_, Some(e @ ReconcileError::CleanupFailed { .. })) => {
            (ConditionStatus::False, e.reason().to_string(), e.to_string())
        }
        (Some(report), _) => (
            ConditionStatus::True,
            "Collected".to_string(),
            format!(
                "{} deleted, {} retained",
                report.deleted.len(),
                report.retained.len()
            ),
        ),
        (None, _) => (
            ConditionStatus::Unknown,
            "Skipped".to_string(),
            "apply failed; orphans not collected".to_string(),
        ),
    };
    Condition {
        type_: CLEANUP_CONDITION.to_string(),
        status,
        reason: Some(reason),
        message: Some(message),
        last_transition_time: now,
    }
}

fn desired_status(
    stack: &AppStack,
    outcome: &PassOutcome,
    config_name: Option<String>,
) -> AppStackStatus {
    let current = stack.status.as_ref();
    let existing = current
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    let conditions = upsert_conditions(
        &existing,
        vec![condition_for(&outcome.verdict), cleanup_condition(outcome)],
    );
    let message = match (&outcome.error, &outcome.verdict) {
        (Some(e), _) => e.to_string(),
        (None, Ok(v)) => v.message.clone(),
        (None, Err(e)) => e.to_string(),
    };
    let applied: Vec<ResourceRef> = outcome
        .applied
        .iter()
        .map(|k| ResourceRef {
            kind: k.kind.clone(),
            namespace: k.namespace.clone(),
            name: k.name.clone(),
        })
        .collect();
    AppStackStatus {
        phase: Some(phase_of(outcome).to_string()),
        message: Some(message),
        observed_generation: stack.meta().generation,
        last_updated: Some(Utc::now().to_rfc3339()),
        conditions: Some(conditions),
        config_name: config_name.or_else(|| current.and_then(|s| s.config_name.clone())),
        applied: if applied.is_empty() {
            current.and_then(|s| s.applied.clone())
        } else {
            Some(applied)
        },
    }
}

async fn write_status(
    store: &dyn ObjectStore,
    stack: &AppStack,
    outcome: &PassOutcome,
    config_name: Option<String>,
) -> Result<(), ReconcileError> {
    let name = stack.name_any();
    let desired = serde_json::to_value(desired_status(stack, outcome, config_name))?;
    let current = stack
        .status
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;
    if !should_patch_status(current.as_ref(), &desired) {
        return Ok(());
    }
    let kind = ManagedKind::of::<AppStack>();
    let key = ObjectKey::new(&kind, None, &name);
    store
        .patch_status(&kind, &key, &desired)
        .await
        .map_err(|source| {
            warn!(error = %source, "failed to write status");
            ReconcileError::StatusUpdateFailed {
                owner: format!("AppStack {name}"),
                source,
            }
        })
}

pub fn error_policy(
    obj: Arc<AppStack>,
    error: &ReconcileError,
    ctx: Arc<ControllerContext>,
) -> Action {
    warn!(stack = %obj.name_any(), reason = error.reason(), error = %error, "reconcile failed; requeueing");
    Action::requeue(ctx.cfg.error_requeue())
}
