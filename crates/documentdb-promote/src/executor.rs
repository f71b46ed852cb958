//! Promotion executor.
//!
//! Drives one promotion through `Planned → Mutating → Converging →
//! Verifying` and always ends in exactly one of `Succeeded`, `Failed` or
//! `Aborted`. The only write is a single conditional patch of the cluster
//! resource; everything after it is polling.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use documentdb_cluster::{ClusterReader, EventSource, PromotionPatch};
use documentdb_core::config::PromotionPolicy;
use documentdb_core::event::{ClusterEvent, EventQuery};
use documentdb_core::outcome::PromotionOutcome;
use documentdb_core::planner::{
    has_stepped_down, verify_topology, PlanOverride, PlanStep, PlanToken, Planner, PromotionPlan,
};
use documentdb_core::types::{ClusterRef, ClusterSnapshot, ObservedRole};
use documentdb_core::{DocumentDbError, Result};

use crate::progress::PromotionProgress;
use crate::state::{ExecutorPhase, StateMachine, Transition};

/// How long to spend collecting audit events after the outcome is known.
const AUDIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PromotionRequest {
    pub cluster: ClusterRef,
    pub target: String,
    pub force: bool,
}

/// Everything known about one promotion once it has finished.
#[derive(Debug, Clone, Serialize)]
pub struct PromotionReport {
    /// Marker id written with the patch; `None` when nothing was written.
    pub promotion_id: Option<String>,
    pub outcome: PromotionOutcome,
    pub plan_token: Option<PlanToken>,
    pub overrides: Vec<PlanOverride>,
    pub history: Vec<Transition>,
    /// Cluster events recorded since the promotion began.
    pub audit: Vec<ClusterEvent>,
}

pub struct PromotionExecutor {
    reader: ClusterReader,
    policy: PromotionPolicy,
    events: Option<Arc<dyn EventSource>>,
    progress: watch::Sender<Option<PromotionProgress>>,
}

impl PromotionExecutor {
    pub fn new(reader: ClusterReader, policy: PromotionPolicy) -> Self {
        let (progress, _) = watch::channel(None);
        Self {
            reader,
            policy,
            events: None,
            progress,
        }
    }

    /// Collect cluster events into the report's audit trail.
    pub fn with_events(mut self, events: Arc<dyn EventSource>) -> Self {
        self.events = Some(events);
        self
    }

    /// Receiver updated on every transition and convergence poll.
    pub fn progress(&self) -> watch::Receiver<Option<PromotionProgress>> {
        self.progress.subscribe()
    }

    /// Read, plan and execute a promotion.
    ///
    /// Read and planning failures are returned as errors: nothing has been
    /// written. Once the patch is attempted the result is always a report.
    pub async fn promote(
        &self,
        request: &PromotionRequest,
        cancel: &CancellationToken,
    ) -> Result<PromotionReport> {
        let snapshot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DocumentDbError::Cancelled),
            snapshot = self.reader.snapshot(&request.cluster) => snapshot?,
        };

        if snapshot.is_sole_primary(&request.target) {
            tracing::info!(
                cluster = %request.cluster,
                member = %request.target,
                "Target is already the primary, nothing to do"
            );
            let mut machine = StateMachine::new();
            machine.transition(
                ExecutorPhase::Succeeded,
                &snapshot,
                Some("already primary".to_string()),
            )?;
            self.publish(&request.target, Utc::now(), &machine, &snapshot);
            return Ok(PromotionReport {
                promotion_id: None,
                outcome: PromotionOutcome::Succeeded {
                    new_primary: request.target.clone(),
                    snapshot,
                    mutated: false,
                },
                plan_token: None,
                overrides: Vec::new(),
                history: machine.history().to_vec(),
                audit: Vec::new(),
            });
        }

        if let Some(active) =
            snapshot.active_promotion(Utc::now(), self.policy.convergence_timeout())
        {
            return Err(DocumentDbError::PromotionInProgress {
                target: active.target.clone(),
            });
        }

        let plan = Planner::new(&self.policy).build_plan(&snapshot, &request.target, request.force)?;
        tracing::info!(
            cluster = %request.cluster,
            member = %plan.target,
            token = %plan.token,
            forced = plan.forced,
            "Promotion planned: {}",
            plan.steps
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let started_at = Utc::now();
        let run = self.execute(&plan, cancel).await;
        let audit = self.collect_audit(&plan.snapshot.cluster, started_at).await;

        Ok(PromotionReport {
            promotion_id: run.promotion_id,
            outcome: run.outcome,
            plan_token: Some(plan.token.clone()),
            overrides: plan.overrides.clone(),
            history: run.machine.history().to_vec(),
            audit,
        })
    }

    /// Execute an already validated plan.
    pub async fn execute(&self, plan: &PromotionPlan, cancel: &CancellationToken) -> Run {
        let mut run = Run {
            machine: StateMachine::new(),
            started_at: Utc::now(),
            promotion_id: None,
            last: plan.snapshot.clone(),
            outcome: PromotionOutcome::Aborted {
                reason: DocumentDbError::Cancelled,
                snapshot: plan.snapshot.clone(),
            },
        };
        self.publish(&plan.target, run.started_at, &run.machine, &run.last);

        match self.drive(plan, cancel, &mut run).await {
            Ok(outcome) => run.outcome = outcome,
            Err(e) => {
                tracing::error!(member = %plan.target, "Promotion executor error: {e}");
                run.outcome = PromotionOutcome::Failed {
                    reason: e,
                    snapshot: run.last.clone(),
                };
            }
        }
        run
    }

    async fn drive(
        &self,
        plan: &PromotionPlan,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<PromotionOutcome> {
        let cluster = &plan.snapshot.cluster;

        if cancel.is_cancelled() {
            return self.abort(plan, run, DocumentDbError::Cancelled);
        }

        // Mutating: one conditional patch. It is not raced against
        // cancellation so the write is either applied or not.
        self.enter(plan, run, ExecutorPhase::Mutating, None)?;
        let patch = PromotionPatch::new(&plan.target, plan.forced, &plan.token.resource_version);
        run.promotion_id = Some(patch.id.clone());
        match self.reader.store().patch_target_primary(cluster, &patch).await {
            Ok(resource_version) => {
                tracing::info!(
                    cluster = %cluster,
                    promotion_id = %patch.id,
                    resource_version = %resource_version,
                    "Desired primary set to {}",
                    plan.target
                );
            }
            Err(e) => {
                self.reread(cluster, run).await;
                return match e {
                    DocumentDbError::StaleState(_) => self.abort(plan, run, e),
                    e => self.fail(plan, run, e),
                };
            }
        }
        if cancel.is_cancelled() {
            self.reread(cluster, run).await;
            return self.abort(plan, run, DocumentDbError::Cancelled);
        }

        // Converging: poll until every await step holds or the deadline passes.
        self.enter(plan, run, ExecutorPhase::Converging, None)?;
        let timeout = self.policy.convergence_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.abort(plan, run, DocumentDbError::Cancelled);
                }
                read = tokio::time::timeout_at(deadline, self.reader.snapshot_once(cluster)) => read,
            };
            match read {
                Err(_) => return self.fail(plan, run, DocumentDbError::ConvergenceTimeout(timeout)),
                Ok(Ok(snapshot)) => {
                    run.last = snapshot;
                    if run.last.declared_primary.as_deref() != Some(plan.target.as_str()) {
                        let reason = DocumentDbError::StaleState(format!(
                            "cluster was re-targeted to {} by another writer",
                            run.last.declared_primary.as_deref().unwrap_or("no member")
                        ));
                        return self.abort(plan, run, reason);
                    }
                    if is_converged(plan, &run.last) {
                        break;
                    }
                    self.publish(&plan.target, run.started_at, &run.machine, &run.last);
                }
                Ok(Err(e)) if e.is_retryable() => {
                    tracing::warn!(cluster = %cluster, "Read failed while converging: {e}");
                }
                Ok(Err(e)) => return self.fail(plan, run, e),
            }

            let wake = (Instant::now() + self.policy.poll_interval()).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.abort(plan, run, DocumentDbError::Cancelled);
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
            if Instant::now() >= deadline {
                return self.fail(plan, run, DocumentDbError::ConvergenceTimeout(timeout));
            }
        }

        // Verifying: a fresh read, checked against the post-conditions.
        self.enter(plan, run, ExecutorPhase::Verifying, None)?;
        let snapshot = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return self.abort(plan, run, DocumentDbError::Cancelled);
            }
            snapshot = self.reader.snapshot(cluster) => snapshot,
        };
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => return self.fail(plan, run, e),
        };
        run.last = snapshot;
        if let Err(e) = verify_topology(&run.last, &plan.target, plan.previous_primary.as_deref()) {
            return self.fail(plan, run, e);
        }

        self.enter(plan, run, ExecutorPhase::Succeeded, None)?;
        Ok(PromotionOutcome::Succeeded {
            new_primary: plan.target.clone(),
            snapshot: run.last.clone(),
            mutated: true,
        })
    }

    fn enter(
        &self,
        plan: &PromotionPlan,
        run: &mut Run,
        to: ExecutorPhase,
        note: Option<String>,
    ) -> Result<()> {
        let from = run.machine.phase();
        let transition = run.machine.transition(to, &run.last, note)?;
        match &transition.note {
            Some(note) => tracing::info!(
                cluster = %plan.snapshot.cluster,
                member = %plan.target,
                %from,
                %to,
                snapshot = %transition.snapshot,
                "Promotion {from} -> {to}: {note}"
            ),
            None => tracing::info!(
                cluster = %plan.snapshot.cluster,
                member = %plan.target,
                %from,
                %to,
                snapshot = %transition.snapshot,
                "Promotion {from} -> {to}"
            ),
        }
        self.publish(&plan.target, run.started_at, &run.machine, &run.last);
        Ok(())
    }

    fn fail(
        &self,
        plan: &PromotionPlan,
        run: &mut Run,
        reason: DocumentDbError,
    ) -> Result<PromotionOutcome> {
        self.enter(plan, run, ExecutorPhase::Failed, Some(reason.to_string()))?;
        Ok(PromotionOutcome::Failed {
            reason,
            snapshot: run.last.clone(),
        })
    }

    fn abort(
        &self,
        plan: &PromotionPlan,
        run: &mut Run,
        reason: DocumentDbError,
    ) -> Result<PromotionOutcome> {
        self.enter(plan, run, ExecutorPhase::Aborted, Some(reason.to_string()))?;
        Ok(PromotionOutcome::Aborted {
            reason,
            snapshot: run.last.clone(),
        })
    }

    /// Best-effort refresh of the last snapshot after a failed or cancelled write.
    async fn reread(&self, cluster: &ClusterRef, run: &mut Run) {
        match self.reader.snapshot_once(cluster).await {
            Ok(snapshot) => run.last = snapshot,
            Err(e) => tracing::warn!(cluster = %cluster, "Could not re-read cluster: {e}"),
        }
    }

    fn publish(
        &self,
        target: &str,
        started_at: DateTime<Utc>,
        machine: &StateMachine,
        snapshot: &ClusterSnapshot,
    ) {
        self.progress.send_replace(Some(PromotionProgress {
            phase: machine.phase(),
            target: target.to_string(),
            started_at,
            phase_entered_at: machine.entered_at(),
            snapshot: snapshot.summary(),
            history: machine.history().to_vec(),
        }));
    }

    async fn collect_audit(&self, cluster: &ClusterRef, since: DateTime<Utc>) -> Vec<ClusterEvent> {
        let Some(source) = &self.events else {
            return Vec::new();
        };
        let collect = async {
            let stream = source.events(cluster, EventQuery::since(since)).await?;
            let events: Vec<Result<ClusterEvent>> = stream.collect().await;
            events.into_iter().collect::<Result<Vec<_>>>()
        };
        match tokio::time::timeout(AUDIT_TIMEOUT, collect).await {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                tracing::warn!(cluster = %cluster, "Could not collect audit events: {e}");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(cluster = %cluster, "Timed out collecting audit events");
                Vec::new()
            }
        }
    }
}

/// State of one execution.
pub struct Run {
    pub machine: StateMachine,
    pub started_at: DateTime<Utc>,
    pub promotion_id: Option<String>,
    /// Last snapshot observed.
    pub last: ClusterSnapshot,
    pub outcome: PromotionOutcome,
}

/// True when every await step of the plan holds in `snapshot`.
fn is_converged(plan: &PromotionPlan, snapshot: &ClusterSnapshot) -> bool {
    !snapshot.is_split_brain()
        && plan.steps.iter().all(|step| match step {
            PlanStep::SetDesiredPrimary { target } => {
                snapshot.declared_primary.as_deref() == Some(target.as_str())
            }
            PlanStep::AwaitTargetPrimary { target } => snapshot
                .member(target)
                .is_some_and(|m| m.observed_role == ObservedRole::Primary),
            PlanStep::AwaitDemotion { previous } => {
                snapshot.member(previous).is_none_or(has_stepped_down)
            }
            PlanStep::VerifyTopology { .. } => true,
        })
}
