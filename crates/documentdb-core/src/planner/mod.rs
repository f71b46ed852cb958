//! Promotion planning.
//!
//! `Planner::build_plan` is deterministic and side-effect free: the same
//! snapshot, target and policy always yield the same decision. Checks run in
//! a fixed order and the first failure is returned.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::{ForceScope, PromotionPolicy};
use crate::error::{DocumentDbError, Result};
use crate::types::{format_duration, ClusterSnapshot, DeclaredRole, MemberState, ObservedRole};

static PLAN_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Identifies a plan and the cluster state it was built against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanToken {
    /// Process-wide, strictly increasing.
    pub sequence: u64,
    /// Resource version of the snapshot the plan was built from.
    pub resource_version: String,
}

impl PlanToken {
    fn issue(resource_version: &str) -> Self {
        Self {
            sequence: PLAN_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            resource_version: resource_version.to_string(),
        }
    }
}

impl fmt::Display for PlanToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plan-{}@{}", self.sequence, self.resource_version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStep {
    /// Patch the cluster resource so `target` becomes the desired primary.
    SetDesiredPrimary { target: String },
    /// Poll until `target` reports the primary role.
    AwaitTargetPrimary { target: String },
    /// Poll until the old primary reports replica or becomes unreachable.
    AwaitDemotion { previous: String },
    /// Re-probe and confirm a single primary.
    VerifyTopology { target: String },
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStep::SetDesiredPrimary { target } => write!(f, "set desired primary to {target}"),
            PlanStep::AwaitTargetPrimary { target } => write!(f, "wait for {target} to be primary"),
            PlanStep::AwaitDemotion { previous } => {
                write!(f, "wait for {previous} to step down")
            }
            PlanStep::VerifyTopology { target } => {
                write!(f, "verify {target} is the only primary")
            }
        }
    }
}

/// A planning check skipped because of `--force`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOverride {
    pub check: String,
    pub detail: String,
}

/// Ordered actions for one promotion. Built once per invocation, never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionPlan {
    pub target: String,
    /// Observed primary at plan time, if any.
    pub previous_primary: Option<String>,
    pub steps: Vec<PlanStep>,
    pub token: PlanToken,
    pub forced: bool,
    pub overrides: Vec<PlanOverride>,
    pub snapshot: ClusterSnapshot,
}

pub struct Planner<'a> {
    policy: &'a PromotionPolicy,
}

impl<'a> Planner<'a> {
    pub fn new(policy: &'a PromotionPolicy) -> Self {
        Self { policy }
    }

    /// Validate preconditions and build the plan for promoting `target`.
    pub fn build_plan(
        &self,
        snapshot: &ClusterSnapshot,
        target: &str,
        force: bool,
    ) -> Result<PromotionPlan> {
        let mut overrides = Vec::new();

        // 1. Target must exist.
        let member = snapshot
            .member(target)
            .ok_or_else(|| DocumentDbError::UnknownMember(target.to_string()))?;

        // 2. No split-brain. Never bypassable.
        check_split_brain(snapshot)?;

        // 3. Target must be a ready replica.
        if member.observed_role != ObservedRole::Replica || !member.ready {
            return Err(DocumentDbError::TargetNotReady {
                member: target.to_string(),
                role: member.observed_role.to_string(),
                ready: member.ready,
            });
        }

        // 4. Target must be caught up.
        if let Err(e) = self.check_lag(snapshot, target) {
            if force {
                overrides.push(PlanOverride {
                    check: e.code().to_string(),
                    detail: e.to_string(),
                });
            } else {
                return Err(e);
            }
        }

        // 5. The control plane must not declare more than one primary.
        let declared = snapshot.declared_primaries();
        if declared.len() > 1 {
            let e = DocumentDbError::AmbiguousPrimary(format!(
                "members {} are all labelled primary",
                declared.join(", ")
            ));
            if force && self.policy.force_scope == ForceScope::LagAndAmbiguousPrimary {
                overrides.push(PlanOverride {
                    check: e.code().to_string(),
                    detail: e.to_string(),
                });
            } else {
                return Err(e);
            }
        }

        for o in &overrides {
            tracing::warn!(
                cluster = %snapshot.cluster,
                member = target,
                check = %o.check,
                "Precondition bypassed by --force: {}",
                o.detail
            );
        }

        let previous_primary = snapshot.observed_primary().map(str::to_string);
        let mut steps = vec![
            PlanStep::SetDesiredPrimary {
                target: target.to_string(),
            },
            PlanStep::AwaitTargetPrimary {
                target: target.to_string(),
            },
        ];
        if let Some(previous) = &previous_primary {
            steps.push(PlanStep::AwaitDemotion {
                previous: previous.clone(),
            });
        }
        steps.push(PlanStep::VerifyTopology {
            target: target.to_string(),
        });

        Ok(PromotionPlan {
            target: target.to_string(),
            previous_primary,
            steps,
            token: PlanToken::issue(&snapshot.resource_version),
            forced: force,
            overrides,
            snapshot: snapshot.clone(),
        })
    }

    fn check_lag(&self, snapshot: &ClusterSnapshot, target: &str) -> Result<()> {
        let Some(member) = snapshot.member(target) else {
            return Err(DocumentDbError::UnknownMember(target.to_string()));
        };
        let limit = self.policy.max_lag();
        match member.lag {
            None => {
                return Err(DocumentDbError::LagTooHigh {
                    member: target.to_string(),
                    observed: "unknown".to_string(),
                    limit: format_duration(limit),
                });
            }
            Some(lag) if lag >= limit => {
                return Err(DocumentDbError::LagTooHigh {
                    member: target.to_string(),
                    observed: format_duration(lag),
                    limit: format_duration(limit),
                });
            }
            Some(_) => {}
        }
        if let Some(max_bytes) = self.policy.max_lag_bytes {
            let observed = match member.lag_bytes {
                Some(bytes) if bytes < max_bytes => None,
                Some(bytes) => Some(format!("{bytes} bytes")),
                None => Some("unknown bytes".to_string()),
            };
            if let Some(observed) = observed {
                return Err(DocumentDbError::LagTooHigh {
                    member: target.to_string(),
                    observed,
                    limit: format!("{max_bytes} bytes"),
                });
            }
        }
        Ok(())
    }
}

/// Fails with `SplitBrain` when more than one member reports primary.
pub fn check_split_brain(snapshot: &ClusterSnapshot) -> Result<()> {
    let primaries = snapshot.observed_primaries();
    if primaries.len() > 1 {
        return Err(DocumentDbError::SplitBrain(
            primaries.into_iter().map(str::to_string).collect(),
        ));
    }
    Ok(())
}

/// A demoted member must positively report `replica` or be unreachable; an
/// undecodable reply may still come from a serving primary.
pub fn has_stepped_down(member: &MemberState) -> bool {
    matches!(
        member.observed_role,
        ObservedRole::Replica | ObservedRole::Unreachable
    )
}

/// Post-promotion check: no split-brain, `target` is the only primary and
/// the previous primary, if any, reports `replica` or is unreachable.
pub fn verify_topology(
    snapshot: &ClusterSnapshot,
    target: &str,
    previous_primary: Option<&str>,
) -> Result<()> {
    check_split_brain(snapshot)
        .map_err(|e| DocumentDbError::PostConditionViolated(e.to_string()))?;
    if let Some(previous) = previous_primary.filter(|p| *p != target) {
        if let Some(member) = snapshot.member(previous) {
            if !has_stepped_down(member) {
                return Err(DocumentDbError::PostConditionViolated(format!(
                    "previous primary {previous} has not stepped down (observed {})",
                    member.observed_role
                )));
            }
        }
    }
    match snapshot.observed_primary() {
        Some(primary) if primary == target => {}
        Some(other) => {
            return Err(DocumentDbError::PostConditionViolated(format!(
                "{other} is primary, expected {target}"
            )));
        }
        None => {
            return Err(DocumentDbError::PostConditionViolated(format!(
                "no member reports primary, expected {target}"
            )));
        }
    }
    if snapshot.declared_primary.as_deref() != Some(target) {
        return Err(DocumentDbError::PostConditionViolated(format!(
            "cluster resource declares {} as primary, expected {target}",
            snapshot.declared_primary.as_deref().unwrap_or("no member")
        )));
    }
    let conflicting: Vec<&str> = snapshot
        .members
        .iter()
        .filter(|m| m.name != target && m.declared_role == DeclaredRole::Primary)
        .map(|m| m.name.as_str())
        .collect();
    if !conflicting.is_empty() {
        return Err(DocumentDbError::PostConditionViolated(format!(
            "members {} are still labelled primary",
            conflicting.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClusterRef, PendingPromotion};
    use chrono::Utc;
    use std::time::Duration;

    fn member(name: &str, role: ObservedRole, lag_secs: Option<u64>) -> MemberState {
        let declared = match role {
            ObservedRole::Primary => DeclaredRole::Primary,
            _ => DeclaredRole::Replica,
        };
        MemberState {
            observed_role: role,
            lag: lag_secs.map(Duration::from_secs),
            ..MemberState::unprobed(name, Some(format!("10.0.0.{}:8000", name.len())), declared, true)
        }
    }

    fn snapshot(members: Vec<MemberState>) -> ClusterSnapshot {
        let declared_primary = members
            .iter()
            .find(|m| m.declared_role == DeclaredRole::Primary)
            .map(|m| m.name.clone());
        ClusterSnapshot {
            cluster: ClusterRef::new("default", "docdb"),
            desired_members: members.len(),
            members,
            declared_primary,
            resource_version: "100".into(),
            pending_promotion: None,
            captured_at: Utc::now(),
        }
    }

    /// A: primary lag 0, B: replica lag 0s, C: replica lag 30s.
    fn three_member_cluster() -> ClusterSnapshot {
        snapshot(vec![
            member("a", ObservedRole::Primary, Some(0)),
            member("b", ObservedRole::Replica, Some(0)),
            member("c", ObservedRole::Replica, Some(30)),
        ])
    }

    fn policy() -> PromotionPolicy {
        PromotionPolicy {
            max_lag_ms: 10_000,
            ..PromotionPolicy::default()
        }
    }

    #[test]
    fn caught_up_replica_gets_full_plan() {
        let policy = policy();
        let plan = Planner::new(&policy)
            .build_plan(&three_member_cluster(), "b", false)
            .unwrap();

        assert_eq!(plan.target, "b");
        assert_eq!(plan.previous_primary.as_deref(), Some("a"));
        assert_eq!(plan.token.resource_version, "100");
        assert!(!plan.forced);
        assert!(plan.overrides.is_empty());
        assert_eq!(
            plan.steps,
            vec![
                PlanStep::SetDesiredPrimary { target: "b".into() },
                PlanStep::AwaitTargetPrimary { target: "b".into() },
                PlanStep::AwaitDemotion { previous: "a".into() },
                PlanStep::VerifyTopology { target: "b".into() },
            ]
        );
    }

    #[test]
    fn lagging_replica_is_rejected() {
        let policy = policy();
        let err = Planner::new(&policy)
            .build_plan(&three_member_cluster(), "c", false)
            .unwrap_err();
        assert!(matches!(err, DocumentDbError::LagTooHigh { ref member, .. } if member == "c"));
    }

    #[test]
    fn force_bypasses_lag_and_is_recorded() {
        let policy = policy();
        let plan = Planner::new(&policy)
            .build_plan(&three_member_cluster(), "c", true)
            .unwrap();
        assert!(plan.forced);
        assert_eq!(plan.overrides.len(), 1);
        assert_eq!(plan.overrides[0].check, "LagTooHigh");
    }

    #[test]
    fn unknown_member_is_rejected_first() {
        let policy = policy();
        let mut snap = three_member_cluster();
        snap.members[1].observed_role = ObservedRole::Primary;
        let err = Planner::new(&policy).build_plan(&snap, "z", false).unwrap_err();
        assert_eq!(err, DocumentDbError::UnknownMember("z".into()));
    }

    #[test]
    fn split_brain_rejects_every_target() {
        let policy = policy();
        let snap = snapshot(vec![
            member("a", ObservedRole::Primary, Some(0)),
            member("b", ObservedRole::Primary, Some(0)),
            member("c", ObservedRole::Replica, Some(0)),
        ]);
        for target in ["a", "b", "c"] {
            for force in [false, true] {
                let err = Planner::new(&policy)
                    .build_plan(&snap, target, force)
                    .unwrap_err();
                assert!(matches!(err, DocumentDbError::SplitBrain(_)), "target {target}");
            }
        }
    }

    #[test]
    fn unreachable_target_is_not_ready() {
        let policy = policy();
        let mut snap = three_member_cluster();
        snap.members[1].observed_role = ObservedRole::Unreachable;
        let err = Planner::new(&policy).build_plan(&snap, "b", true).unwrap_err();
        assert!(matches!(err, DocumentDbError::TargetNotReady { ready: true, .. }));
    }

    #[test]
    fn unready_replica_is_not_ready() {
        let policy = policy();
        let mut snap = three_member_cluster();
        snap.members[1].ready = false;
        let err = Planner::new(&policy).build_plan(&snap, "b", false).unwrap_err();
        assert!(matches!(err, DocumentDbError::TargetNotReady { ready: false, .. }));
    }

    #[test]
    fn primary_cannot_be_promoted_again_through_planner() {
        let policy = policy();
        let err = Planner::new(&policy)
            .build_plan(&three_member_cluster(), "a", false)
            .unwrap_err();
        assert!(matches!(err, DocumentDbError::TargetNotReady { .. }));
    }

    #[test]
    fn unknown_lag_fails_closed() {
        let policy = policy();
        let mut snap = three_member_cluster();
        snap.members[1].lag = None;
        let err = Planner::new(&policy).build_plan(&snap, "b", false).unwrap_err();
        assert!(matches!(err, DocumentDbError::LagTooHigh { ref observed, .. } if observed == "unknown"));
    }

    #[test]
    fn byte_lag_limit_applies_when_configured() {
        let policy = PromotionPolicy {
            max_lag_bytes: Some(1024),
            ..policy()
        };
        let mut snap = three_member_cluster();
        snap.members[1].lag_bytes = Some(4096);
        let err = Planner::new(&policy).build_plan(&snap, "b", false).unwrap_err();
        assert!(matches!(err, DocumentDbError::LagTooHigh { .. }));
    }

    #[test]
    fn zero_primaries_is_allowed() {
        let policy = policy();
        let mut snap = three_member_cluster();
        snap.members[0].observed_role = ObservedRole::Unreachable;
        let plan = Planner::new(&policy).build_plan(&snap, "b", false).unwrap();
        assert_eq!(plan.previous_primary, None);
        assert_eq!(plan.steps.len(), 3);
    }

    #[test]
    fn conflicting_declared_primaries_are_ambiguous() {
        let policy = policy();
        let mut snap = three_member_cluster();
        snap.members[2].declared_role = DeclaredRole::Primary;
        let err = Planner::new(&policy).build_plan(&snap, "b", false).unwrap_err();
        assert!(matches!(err, DocumentDbError::AmbiguousPrimary(_)));

        // Default scope: --force only covers lag.
        let err = Planner::new(&policy).build_plan(&snap, "b", true).unwrap_err();
        assert!(matches!(err, DocumentDbError::AmbiguousPrimary(_)));

        let wide = PromotionPolicy {
            force_scope: ForceScope::LagAndAmbiguousPrimary,
            ..policy
        };
        let plan = Planner::new(&wide).build_plan(&snap, "b", true).unwrap();
        assert_eq!(plan.overrides[0].check, "AmbiguousPrimary");
    }

    #[test]
    fn plan_tokens_increase() {
        let policy = policy();
        let snap = three_member_cluster();
        let first = Planner::new(&policy).build_plan(&snap, "b", false).unwrap();
        let second = Planner::new(&policy).build_plan(&snap, "b", false).unwrap();
        assert!(second.token.sequence > first.token.sequence);
    }

    #[test]
    fn any_ready_caught_up_replica_is_plannable() {
        let policy = policy();
        // Every combination of roles for three members with at most one primary.
        let roles = [
            ObservedRole::Primary,
            ObservedRole::Replica,
            ObservedRole::Unreachable,
            ObservedRole::Unknown,
        ];
        for r0 in roles {
            for r1 in roles {
                let primaries = [r0, r1]
                    .iter()
                    .filter(|r| **r == ObservedRole::Primary)
                    .count();
                if primaries > 1 {
                    continue;
                }
                let snap = snapshot(vec![
                    member("a", r0, Some(0)),
                    member("b", r1, Some(5)),
                    member("t", ObservedRole::Replica, Some(9)),
                ]);
                let result = Planner::new(&policy).build_plan(&snap, "t", false);
                assert!(result.is_ok(), "roles {r0}/{r1}: {result:?}");
            }
        }
    }

    #[test]
    fn verify_topology_requires_sole_target_primary() {
        let mut snap = snapshot(vec![
            member("a", ObservedRole::Replica, Some(0)),
            member("b", ObservedRole::Primary, Some(0)),
        ]);
        snap.members[0].declared_role = DeclaredRole::Replica;
        snap.members[1].declared_role = DeclaredRole::Primary;
        snap.declared_primary = Some("b".into());
        assert!(verify_topology(&snap, "b", Some("a")).is_ok());

        let mut split = snap.clone();
        split.members[0].observed_role = ObservedRole::Primary;
        assert!(matches!(
            verify_topology(&split, "b", Some("a")),
            Err(DocumentDbError::PostConditionViolated(_))
        ));

        assert!(verify_topology(&snap, "a", Some("a")).is_err());
    }

    #[test]
    fn verify_topology_checks_declared_primary() {
        let mut snap = snapshot(vec![
            member("a", ObservedRole::Replica, Some(0)),
            member("b", ObservedRole::Primary, Some(0)),
        ]);
        snap.members[1].declared_role = DeclaredRole::Primary;
        snap.declared_primary = Some("a".into());
        snap.pending_promotion = Some(PendingPromotion {
            id: "x".into(),
            target: "b".into(),
            started_at: Utc::now(),
            forced: false,
        });
        assert!(verify_topology(&snap, "b", Some("a")).is_err());
    }

    #[test]
    fn lag_equal_to_limit_is_too_high() {
        let policy = policy();
        let mut snap = three_member_cluster();
        snap.members[1].lag = Some(Duration::from_millis(policy.max_lag_ms));
        let err = Planner::new(&policy).build_plan(&snap, "b", false).unwrap_err();
        assert!(matches!(err, DocumentDbError::LagTooHigh { .. }));

        snap.members[1].lag = Some(Duration::from_millis(policy.max_lag_ms - 1));
        assert!(Planner::new(&policy).build_plan(&snap, "b", false).is_ok());
    }

    #[test]
    fn byte_lag_equal_to_limit_is_too_high() {
        let policy = PromotionPolicy {
            max_lag_bytes: Some(1024),
            ..policy()
        };
        let mut snap = three_member_cluster();
        snap.members[1].lag_bytes = Some(1024);
        let err = Planner::new(&policy).build_plan(&snap, "b", false).unwrap_err();
        assert!(matches!(err, DocumentDbError::LagTooHigh { .. }));

        snap.members[1].lag_bytes = Some(1023);
        assert!(Planner::new(&policy).build_plan(&snap, "b", false).is_ok());
    }

    #[test]
    fn unknown_byte_lag_fails_closed_when_limited() {
        let limited = PromotionPolicy {
            max_lag_bytes: Some(1024),
            ..policy()
        };
        let snap = three_member_cluster();
        assert_eq!(snap.members[1].lag_bytes, None);
        let err = Planner::new(&limited).build_plan(&snap, "b", false).unwrap_err();
        assert!(
            matches!(err, DocumentDbError::LagTooHigh { ref observed, .. } if observed == "unknown bytes")
        );

        // Without a byte limit only time lag matters.
        assert!(Planner::new(&policy()).build_plan(&snap, "b", false).is_ok());

        // Force still bypasses it.
        let plan = Planner::new(&limited).build_plan(&snap, "b", true).unwrap();
        assert_eq!(plan.overrides[0].check, "LagTooHigh");
    }

    #[test]
    fn verify_topology_rejects_undecided_previous_primary() {
        let mut snap = snapshot(vec![
            member("a", ObservedRole::Unknown, Some(0)),
            member("b", ObservedRole::Primary, Some(0)),
        ]);
        snap.members[0].declared_role = DeclaredRole::Replica;
        snap.members[1].declared_role = DeclaredRole::Primary;
        snap.declared_primary = Some("b".into());
        assert!(matches!(
            verify_topology(&snap, "b", Some("a")),
            Err(DocumentDbError::PostConditionViolated(_))
        ));

        snap.members[0].observed_role = ObservedRole::Unreachable;
        assert!(verify_topology(&snap, "b", Some("a")).is_ok());
        snap.members[0].observed_role = ObservedRole::Replica;
        assert!(verify_topology(&snap, "b", Some("a")).is_ok());
    }
}
