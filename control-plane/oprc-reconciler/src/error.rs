use crate::store::{ObjectKey, StoreError};

#[derive(thiserror::Error, Debug, Clone)]
pub enum ReconcileError {
    /// Another live owner already controls the object. Never auto-resolved.
    #[error("{object} is already owned by {current_owner}")]
    OwnershipConflict {
        object: ObjectKey,
        current_owner: String,
    },
    #[error("failed to apply {object}: {source}")]
    ApplyFailed {
        object: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("{}", cleanup_message(.failures))]
    CleanupFailed { failures: Vec<(ObjectKey, StoreError)> },
    #[error("failed to update status of {owner}: {source}")]
    StatusUpdateFailed {
        owner: String,
        #[source]
        source: StoreError,
    },
    /// The object's kind is not served by the cluster, e.g. a missing CRD.
    #[error("cannot apply {object}: kind {kind} is not installed")]
    UnsupportedKind { object: ObjectKey, kind: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn cleanup_message(failures: &[(ObjectKey, StoreError)]) -> String {
    let parts: Vec<String> = failures
        .iter()
        .map(|(key, err)| format!("{key}: {err}"))
        .collect();
    format!(
        "failed to delete {} orphan(s): {}",
        failures.len(),
        parts.join("; ")
    )
}

impl ReconcileError {
    pub fn apply_failed(object: ObjectKey, source: StoreError) -> Self {
        match source {
            StoreError::UnsupportedKind(kind) => {
                ReconcileError::UnsupportedKind { object, kind }
            }
            source => ReconcileError::ApplyFailed { object, source },
        }
    }

    /// Reason code written into status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::OwnershipConflict { .. } => "OwnershipConflict",
            ReconcileError::ApplyFailed { .. } => "ApplyFailed",
            ReconcileError::CleanupFailed { .. } => "CleanupFailed",
            ReconcileError::StatusUpdateFailed { .. } => "StatusUpdateFailed",
            ReconcileError::UnsupportedKind { .. } => "UnsupportedKind",
            ReconcileError::Serialization(_) => "SerializationFailed",
        }
    }

    /// Object the failure points at, when there is exactly one.
    pub fn object(&self) -> Option<&ObjectKey> {
        match self {
            ReconcileError::OwnershipConflict { object, .. }
            | ReconcileError::ApplyFailed { object, .. }
            | ReconcileError::UnsupportedKind { object, .. } => Some(object),
            ReconcileError::CleanupFailed { failures } if failures.len() == 1 => {
                failures.first().map(|(k, _)| k)
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(e: serde_json::Error) -> Self {
        ReconcileError::Serialization(e.to_string())
    }
}
