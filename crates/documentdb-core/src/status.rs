//! Cluster status rendering.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::types::{format_duration, ClusterSnapshot, DeclaredRole, ObservedRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClusterCondition {
    Healthy,
    Degraded,
    SplitBrain,
    PromotionInProgress,
}

impl fmt::Display for ClusterCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterCondition::Healthy => "Healthy",
            ClusterCondition::Degraded => "Degraded",
            ClusterCondition::SplitBrain => "SplitBrain",
            ClusterCondition::PromotionInProgress => "PromotionInProgress",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionState {
    InProgress,
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromotionView {
    pub id: String,
    pub target: String,
    pub state: PromotionState,
    pub elapsed_seconds: u64,
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberView {
    pub name: String,
    pub declared_role: DeclaredRole,
    pub observed_role: ObservedRole,
    pub lag_ms: Option<u64>,
    pub lag_bytes: Option<u64>,
    pub ready: bool,
    pub last_probe: Option<DateTime<Utc>>,
    pub probe_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub namespace: String,
    pub name: String,
    pub condition: ClusterCondition,
    pub desired_members: usize,
    pub observed_members: usize,
    pub declared_primary: Option<String>,
    pub observed_primary: Option<String>,
    pub promotion: Option<PromotionView>,
    pub members: Vec<MemberView>,
}

/// Build the status view for `snapshot`.
///
/// A pending marker older than `convergence_timeout` whose target never
/// became primary is reported as stalled and does not count as in progress.
pub fn render(
    snapshot: &ClusterSnapshot,
    now: DateTime<Utc>,
    convergence_timeout: Duration,
) -> StatusView {
    let promotion = snapshot.pending_promotion.as_ref().and_then(|p| {
        if snapshot.is_sole_primary(&p.target) {
            return None;
        }
        let elapsed = (now - p.started_at).to_std().unwrap_or_default();
        let state = if elapsed < convergence_timeout {
            PromotionState::InProgress
        } else {
            PromotionState::Stalled
        };
        Some(PromotionView {
            id: p.id.clone(),
            target: p.target.clone(),
            state,
            elapsed_seconds: elapsed.as_secs(),
            forced: p.forced,
        })
    });

    let observed_primary = snapshot.observed_primary().map(str::to_string);
    let condition = if snapshot.is_split_brain() {
        ClusterCondition::SplitBrain
    } else if promotion
        .as_ref()
        .is_some_and(|p| p.state == PromotionState::InProgress)
    {
        ClusterCondition::PromotionInProgress
    } else if is_healthy(snapshot) {
        ClusterCondition::Healthy
    } else {
        ClusterCondition::Degraded
    };

    StatusView {
        namespace: snapshot.cluster.namespace.clone(),
        name: snapshot.cluster.name.clone(),
        condition,
        desired_members: snapshot.desired_members,
        observed_members: snapshot.members.len(),
        declared_primary: snapshot.declared_primary.clone(),
        observed_primary,
        promotion,
        members: snapshot
            .members
            .iter()
            .map(|m| MemberView {
                name: m.name.clone(),
                declared_role: m.declared_role,
                observed_role: m.observed_role,
                lag_ms: m.lag.map(|d| d.as_millis() as u64),
                lag_bytes: m.lag_bytes,
                ready: m.ready,
                last_probe: m.last_probe,
                probe_error: m.probe_error.clone(),
            })
            .collect(),
    }
}

fn is_healthy(snapshot: &ClusterSnapshot) -> bool {
    let Some(primary) = snapshot.observed_primary() else {
        return false;
    };
    if let Some(declared) = &snapshot.declared_primary {
        if declared != primary {
            return false;
        }
    }
    snapshot.members.len() == snapshot.desired_members
        && snapshot.members.iter().all(|m| {
            m.ready && matches!(m.observed_role, ObservedRole::Primary | ObservedRole::Replica)
        })
}

impl fmt::Display for StatusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cluster:   {}/{}", self.namespace, self.name)?;
        writeln!(f, "Condition: {}", self.condition)?;
        writeln!(
            f,
            "Primary:   {} (declared {})",
            self.observed_primary.as_deref().unwrap_or("<none>"),
            self.declared_primary.as_deref().unwrap_or("<none>")
        )?;
        writeln!(
            f,
            "Members:   {}/{}",
            self.observed_members, self.desired_members
        )?;
        if let Some(p) = &self.promotion {
            let state = match p.state {
                PromotionState::InProgress => "in progress",
                PromotionState::Stalled => "stalled",
            };
            writeln!(
                f,
                "Promotion: to {} {}, {}s elapsed{}",
                p.target,
                state,
                p.elapsed_seconds,
                if p.forced { " (forced)" } else { "" }
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:<28} {:<9} {:<12} {:<10} {:<6} ERROR",
            "MEMBER", "DECLARED", "OBSERVED", "LAG", "READY"
        )?;
        for m in &self.members {
            let lag = m
                .lag_ms
                .map(|ms| format_duration(Duration::from_millis(ms)))
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "{:<28} {:<9} {:<12} {:<10} {:<6} {}",
                m.name,
                m.declared_role.to_string(),
                m.observed_role.to_string(),
                lag,
                if m.ready { "yes" } else { "no" },
                m.probe_error.as_deref().unwrap_or("")
            )?;
        }
        Ok(())
    }
}
