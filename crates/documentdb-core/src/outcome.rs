use serde::Serialize;

use crate::error::DocumentDbError;
use crate::types::ClusterSnapshot;

/// Terminal result of one promotion invocation.
///
/// Every variant carries the last snapshot observed, so callers can show
/// exactly what state the cluster was left in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum PromotionOutcome {
    Succeeded {
        new_primary: String,
        snapshot: ClusterSnapshot,
        /// False when the target was already primary and nothing was written.
        mutated: bool,
    },
    Failed {
        #[serde(serialize_with = "reason::serialize")]
        reason: DocumentDbError,
        snapshot: ClusterSnapshot,
    },
    Aborted {
        #[serde(serialize_with = "reason::serialize")]
        reason: DocumentDbError,
        snapshot: ClusterSnapshot,
    },
}

impl PromotionOutcome {
    pub fn snapshot(&self) -> &ClusterSnapshot {
        match self {
            Self::Succeeded { snapshot, .. }
            | Self::Failed { snapshot, .. }
            | Self::Aborted { snapshot, .. } => snapshot,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn reason(&self) -> Option<&DocumentDbError> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Failed { reason, .. } | Self::Aborted { reason, .. } => Some(reason),
        }
    }
}

/// Errors serialize as `{ "code": ..., "message": ... }`.
mod reason {
    use serde::{Serialize, Serializer};

    use crate::error::DocumentDbError;

    #[derive(Serialize)]
    struct Reason {
        code: String,
        message: String,
    }

    pub fn serialize<S: Serializer>(err: &DocumentDbError, s: S) -> Result<S::Ok, S::Error> {
        Reason {
            code: err.code().to_string(),
            message: err.to_string(),
        }
        .serialize(s)
    }
}
