use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentDbError {
    // Reads
    #[error("DocumentDB cluster {0} not found")]
    NotFound(String),

    #[error("Malformed cluster resource: {0}")]
    Malformed(String),

    #[error("Transient API error: {0}")]
    Transient(String),

    // Planning
    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("Split-brain: members {} all report primary", .0.join(", "))]
    SplitBrain(Vec<String>),

    #[error("Target {member} is not ready for promotion (role={role}, ready={ready})")]
    TargetNotReady {
        member: String,
        role: String,
        ready: bool,
    },

    #[error("Replication lag of {member} is too high ({observed}, limit {limit})")]
    LagTooHigh {
        member: String,
        observed: String,
        limit: String,
    },

    #[error("Ambiguous primary: {0}")]
    AmbiguousPrimary(String),

    #[error("A promotion to {target} is already in progress")]
    PromotionInProgress { target: String },

    // Execution
    #[error("Stale state: {0}; re-read the cluster and plan again")]
    StaleState(String),

    #[error("Timed out after {0:?} waiting for the cluster to converge")]
    ConvergenceTimeout(Duration),

    #[error("Post-condition violated: {0}")]
    PostConditionViolated(String),

    #[error("Cancelled")]
    Cancelled,

    // Ambient
    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found at {0}")]
    ConfigNotFound(String),

    #[error("TOML deserialization error: {0}")]
    TomlDe(String),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),
}

/// Coarse grouping used to decide retry and reporting policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Cluster read failures. Only `Transient` is retried.
    Read,
    /// Unsafe preconditions. Never retried without operator action.
    Planning,
    /// Optimistic concurrency conflict; a fresh plan is required.
    Conflict,
    /// Raised after a mutation has been issued. Never retried blindly.
    Execution,
    Ambient,
}

impl DocumentDbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::Malformed(_) | Self::Transient(_) => ErrorKind::Read,
            Self::UnknownMember(_)
            | Self::SplitBrain(_)
            | Self::TargetNotReady { .. }
            | Self::LagTooHigh { .. }
            | Self::AmbiguousPrimary(_)
            | Self::PromotionInProgress { .. } => ErrorKind::Planning,
            Self::StaleState(_) => ErrorKind::Conflict,
            Self::ConvergenceTimeout(_) | Self::PostConditionViolated(_) | Self::Cancelled => {
                ErrorKind::Execution
            }
            Self::Io(_)
            | Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::TomlDe(_)
            | Self::TomlSer(_) => ErrorKind::Ambient,
        }
    }

    /// Whether the caller may retry the same call after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Stable short code, used in logs and JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::Malformed(_) => "Malformed",
            Self::Transient(_) => "Transient",
            Self::UnknownMember(_) => "UnknownMember",
            Self::SplitBrain(_) => "SplitBrain",
            Self::TargetNotReady { .. } => "TargetNotReady",
            Self::LagTooHigh { .. } => "LagTooHigh",
            Self::AmbiguousPrimary(_) => "AmbiguousPrimary",
            Self::PromotionInProgress { .. } => "PromotionInProgress",
            Self::StaleState(_) => "StaleState",
            Self::ConvergenceTimeout(_) => "ConvergenceTimeout",
            Self::PostConditionViolated(_) => "PostConditionViolated",
            Self::Cancelled => "Cancelled",
            Self::Io(_) => "Io",
            Self::Config(_) => "Config",
            Self::ConfigNotFound(_) => "ConfigNotFound",
            Self::TomlDe(_) => "TomlDe",
            Self::TomlSer(_) => "TomlSer",
        }
    }
}

impl From<std::io::Error> for DocumentDbError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DocumentDbError>;
