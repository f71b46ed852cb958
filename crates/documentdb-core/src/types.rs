use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Namespaced name of a DocumentDB cluster resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterRef {
    pub namespace: String,
    pub name: String,
}

impl ClusterRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Role assigned to a member by the control plane (pod labels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredRole {
    Primary,
    Replica,
    Unassigned,
}

impl fmt::Display for DeclaredRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclaredRole::Primary => write!(f, "primary"),
            DeclaredRole::Replica => write!(f, "replica"),
            DeclaredRole::Unassigned => write!(f, "-"),
        }
    }
}

impl std::str::FromStr for DeclaredRole {
    type Err = crate::error::DocumentDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(DeclaredRole::Primary),
            "replica" => Ok(DeclaredRole::Replica),
            "" => Ok(DeclaredRole::Unassigned),
            other => Err(crate::error::DocumentDbError::Malformed(format!(
                "unknown instance role label '{other}'"
            ))),
        }
    }
}

/// Role reported by the member's own health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedRole {
    Primary,
    Replica,
    Unreachable,
    Unknown,
}

impl fmt::Display for ObservedRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservedRole::Primary => write!(f, "primary"),
            ObservedRole::Replica => write!(f, "replica"),
            ObservedRole::Unreachable => write!(f, "unreachable"),
            ObservedRole::Unknown => write!(f, "unknown"),
        }
    }
}

/// One member of the cluster as seen at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberState {
    pub name: String,
    /// `host:port` of the member's status endpoint; `None` when the pod has no IP yet.
    pub endpoint: Option<String>,
    pub declared_role: DeclaredRole,
    pub observed_role: ObservedRole,
    /// Replay lag behind the primary, when the member reports it.
    pub lag: Option<Duration>,
    /// WAL distance behind the primary, in bytes.
    pub lag_bytes: Option<u64>,
    pub ready: bool,
    pub last_probe: Option<DateTime<Utc>>,
    pub probe_error: Option<String>,
}

impl MemberState {
    /// A member as read from the control plane, before any probe.
    pub fn unprobed(
        name: impl Into<String>,
        endpoint: Option<String>,
        declared_role: DeclaredRole,
        ready: bool,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            declared_role,
            observed_role: ObservedRole::Unknown,
            lag: None,
            lag_bytes: None,
            ready,
            last_probe: None,
            probe_error: None,
        }
    }

    pub fn is_observed_primary(&self) -> bool {
        self.observed_role == ObservedRole::Primary
    }
}

/// Promotion marker written on the cluster resource alongside the spec patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPromotion {
    pub id: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub forced: bool,
}

/// Point-in-time, immutable view of the cluster and its members.
///
/// A new snapshot is taken for every decision point; refreshing probe data
/// produces a new value rather than editing this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub cluster: ClusterRef,
    pub desired_members: usize,
    pub members: Vec<MemberState>,
    /// Primary named by the cluster resource (spec target, else status).
    pub declared_primary: Option<String>,
    /// Resource version of the cluster resource, used for optimistic concurrency.
    pub resource_version: String,
    pub pending_promotion: Option<PendingPromotion>,
    pub captured_at: DateTime<Utc>,
}

impl ClusterSnapshot {
    pub fn member(&self, name: &str) -> Option<&MemberState> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Names of every member currently reporting the primary role.
    pub fn observed_primaries(&self) -> Vec<&str> {
        self.members
            .iter()
            .filter(|m| m.is_observed_primary())
            .map(|m| m.name.as_str())
            .collect()
    }

    /// The single observed primary, if exactly one member reports it.
    pub fn observed_primary(&self) -> Option<&str> {
        let primaries = self.observed_primaries();
        if primaries.len() == 1 {
            Some(primaries[0])
        } else {
            None
        }
    }

    pub fn declared_primaries(&self) -> Vec<&str> {
        self.members
            .iter()
            .filter(|m| m.declared_role == DeclaredRole::Primary)
            .map(|m| m.name.as_str())
            .collect()
    }

    pub fn is_split_brain(&self) -> bool {
        self.observed_primaries().len() > 1
    }

    /// True when `name` is the one and only observed primary.
    pub fn is_sole_primary(&self, name: &str) -> bool {
        self.observed_primary() == Some(name)
    }

    /// The pending promotion marker if it is still converging.
    ///
    /// A marker whose target already reports primary is complete; one older
    /// than `timeout` is stalled. Neither blocks a new promotion.
    pub fn active_promotion(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Option<&PendingPromotion> {
        let pending = self.pending_promotion.as_ref()?;
        if self.is_sole_primary(&pending.target) {
            return None;
        }
        let elapsed = (now - pending.started_at).to_std().unwrap_or_default();
        (elapsed < timeout).then_some(pending)
    }

    /// Replace member states with probed ones, keeping everything else.
    pub fn with_members(&self, members: Vec<MemberState>) -> Self {
        Self {
            members,
            ..self.clone()
        }
    }

    /// One-line description for logs.
    pub fn summary(&self) -> String {
        let members: Vec<String> = self
            .members
            .iter()
            .map(|m| format!("{}={}", m.name, m.observed_role))
            .collect();
        format!(
            "{} rv={} declared={} [{}]",
            self.cluster,
            self.resource_version,
            self.declared_primary.as_deref().unwrap_or("-"),
            members.join(" ")
        )
    }
}

/// Human-readable duration, e.g. `1m30s`, `250ms`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.as_millis());
    }
    if secs < 60 {
        return format!("{secs}s");
    }
    let (m, s) = (secs / 60, secs % 60);
    if m < 60 {
        if s == 0 {
            format!("{m}m")
        } else {
            format!("{m}m{s}s")
        }
    } else {
        format!("{}h{}m", m / 60, m % 60)
    }
}
