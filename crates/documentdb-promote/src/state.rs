//! Executor state machine.
//!
//! ```text
//! Planned ──► Mutating ──► Converging ──► Verifying ──► Succeeded
//!    │            │             │             │
//!    └────────────┴─────────────┴─────────────┴──► Failed | Aborted
//! ```
//!
//! `Planned ──► Succeeded` is the no-op path taken when the target is
//! already the sole primary. Terminal phases have no outgoing edges.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use documentdb_core::types::ClusterSnapshot;
use documentdb_core::DocumentDbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutorPhase {
    Planned,
    Mutating,
    Converging,
    Verifying,
    Succeeded,
    Failed,
    Aborted,
}

impl ExecutorPhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Mutating => "mutating",
            Self::Converging => "converging",
            Self::Verifying => "verifying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    pub fn can_transition_to(&self, next: ExecutorPhase) -> bool {
        use ExecutorPhase::*;
        matches!(
            (self, next),
            (Planned, Mutating | Succeeded | Aborted)
                | (Mutating, Converging | Failed | Aborted)
                | (Converging, Verifying | Failed | Aborted)
                | (Verifying, Succeeded | Failed | Aborted)
        )
    }
}

impl fmt::Display for ExecutorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One recorded state change, with the snapshot that triggered it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: ExecutorPhase,
    pub to: ExecutorPhase,
    pub at: DateTime<Utc>,
    pub snapshot: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    phase: ExecutorPhase,
    entered_at: DateTime<Utc>,
    history: Vec<Transition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            phase: ExecutorPhase::Planned,
            entered_at: Utc::now(),
            history: Vec::new(),
        }
    }

    pub fn phase(&self) -> ExecutorPhase {
        self.phase
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Move to `to`, recording the snapshot that justified it.
    pub fn transition(
        &mut self,
        to: ExecutorPhase,
        snapshot: &ClusterSnapshot,
        note: Option<String>,
    ) -> Result<&Transition, DocumentDbError> {
        if !self.phase.can_transition_to(to) {
            return Err(DocumentDbError::PostConditionViolated(format!(
                "invalid executor transition {} -> {to}",
                self.phase
            )));
        }
        let at = Utc::now();
        self.history.push(Transition {
            from: self.phase,
            to,
            at,
            snapshot: snapshot.summary(),
            note,
        });
        self.phase = to;
        self.entered_at = at;
        Ok(&self.history[self.history.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use documentdb_core::types::ClusterRef;
    use ExecutorPhase::*;

    const ALL: [ExecutorPhase; 7] = [
        Planned, Mutating, Converging, Verifying, Succeeded, Failed, Aborted,
    ];

    fn snapshot() -> ClusterSnapshot {
        ClusterSnapshot {
            cluster: ClusterRef::new("default", "docdb"),
            desired_members: 0,
            members: vec![],
            declared_primary: None,
            resource_version: "1".into(),
            pending_promotion: None,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn terminal_phases_are_final() {
        for terminal in [Succeeded, Failed, Aborted] {
            for next in ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn no_skipping_convergence() {
        assert!(!Mutating.can_transition_to(Verifying));
        assert!(!Mutating.can_transition_to(Succeeded));
        assert!(!Converging.can_transition_to(Succeeded));
        assert!(!Planned.can_transition_to(Converging));
        assert!(!Planned.can_transition_to(Failed));
    }

    #[test]
    fn full_path_is_recorded() {
        let snap = snapshot();
        let mut sm = StateMachine::new();
        for next in [Mutating, Converging, Verifying, Succeeded] {
            sm.transition(next, &snap, None).unwrap();
        }
        assert_eq!(sm.phase(), Succeeded);
        let path: Vec<_> = sm.history().iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            path,
            vec![
                (Planned, Mutating),
                (Mutating, Converging),
                (Converging, Verifying),
                (Verifying, Succeeded)
            ]
        );
    }

    #[test]
    fn rejected_transition_leaves_state_untouched() {
        let snap = snapshot();
        let mut sm = StateMachine::new();
        assert!(sm.transition(Verifying, &snap, None).is_err());
        assert_eq!(sm.phase(), Planned);
        assert!(sm.history().is_empty());
    }
}
