use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use documentdb_cluster::memory::{Convergence, MemoryCluster, SimHealth};
use documentdb_cluster::{ClusterReader, EventSource};
use documentdb_core::config::{ForceScope, ProbeSettings, PromotionPolicy, RetryPolicy};
use documentdb_core::outcome::PromotionOutcome;
use documentdb_core::status::{self, ClusterCondition, PromotionState};
use documentdb_core::types::{ClusterRef, DeclaredRole, ObservedRole, PendingPromotion};
use documentdb_core::DocumentDbError;
use documentdb_promote::{ExecutorPhase, PromotionExecutor, PromotionRequest};

fn cluster() -> ClusterRef {
    ClusterRef::new("default", "docdb")
}

fn policy() -> PromotionPolicy {
    PromotionPolicy {
        max_lag_ms: 10_000,
        max_lag_bytes: None,
        poll_interval_ms: 10,
        convergence_timeout_ms: 300,
        force_scope: ForceScope::Lag,
    }
}

/// A primary, B replica lag 0s, C replica lag 30s.
fn three_members(convergence: Convergence) -> Arc<MemoryCluster> {
    Arc::new(
        MemoryCluster::new(cluster())
            .with_primary("a")
            .with_replica("b", Duration::ZERO)
            .with_replica("c", Duration::from_secs(30))
            .with_convergence(convergence),
    )
}

fn executor(mem: &Arc<MemoryCluster>, policy: PromotionPolicy) -> PromotionExecutor {
    let reader = ClusterReader::new(
        mem.clone(),
        mem.clone(),
        ProbeSettings::default(),
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
    );
    let events: Arc<dyn EventSource> = mem.clone();
    PromotionExecutor::new(reader, policy).with_events(events)
}

fn request(target: &str, force: bool) -> PromotionRequest {
    PromotionRequest {
        cluster: cluster(),
        target: target.to_string(),
        force,
    }
}

#[tokio::test]
async fn promotes_caught_up_replica() {
    let mem = three_members(Convergence::AfterReads(2));
    let exec = executor(&mem, policy());
    let progress = exec.progress();

    let report = exec
        .promote(&request("b", false), &CancellationToken::new())
        .await
        .unwrap();

    match &report.outcome {
        PromotionOutcome::Succeeded {
            new_primary,
            snapshot,
            mutated,
        } => {
            assert_eq!(new_primary, "b");
            assert!(*mutated);
            assert!(snapshot.is_sole_primary("b"));
            assert_eq!(snapshot.member("a").unwrap().observed_role, ObservedRole::Replica);
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(mem.patches(), 1);
    assert!(report.promotion_id.is_some());

    let phases: Vec<ExecutorPhase> = report.history.iter().map(|t| t.to).collect();
    assert_eq!(
        phases,
        vec![
            ExecutorPhase::Mutating,
            ExecutorPhase::Converging,
            ExecutorPhase::Verifying,
            ExecutorPhase::Succeeded,
        ]
    );

    let reasons: Vec<&str> = report.audit.iter().map(|e| e.reason.as_str()).collect();
    assert!(reasons.contains(&"SwitchoverRequested"));
    assert!(reasons.contains(&"SwitchoverCompleted"));

    let last = progress.borrow().clone().unwrap();
    assert_eq!(last.phase, ExecutorPhase::Succeeded);
    assert_eq!(last.history.len(), 4);
}

#[tokio::test]
async fn lagging_replica_is_refused_without_writing() {
    let mem = three_members(Convergence::AfterReads(1));
    let err = executor(&mem, policy())
        .promote(&request("c", false), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentDbError::LagTooHigh { ref member, .. } if member == "c"));
    assert_eq!(mem.patches(), 0);
}

#[tokio::test]
async fn force_promotes_lagging_replica_and_records_override() {
    let mem = three_members(Convergence::AfterReads(1));
    let report = executor(&mem, policy())
        .promote(&request("c", true), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.outcome.is_success());
    assert_eq!(report.overrides.len(), 1);
    assert_eq!(report.overrides[0].check, "LagTooHigh");
}

#[tokio::test]
async fn split_brain_blocks_promotion() {
    let mem = three_members(Convergence::AfterReads(1));
    mem.set_health(
        "b",
        SimHealth::Report(documentdb_cluster::probe::ProbeReport::primary()),
    );
    let err = executor(&mem, policy())
        .promote(&request("c", true), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentDbError::SplitBrain(_)));
    assert_eq!(mem.patches(), 0);
}

#[tokio::test]
async fn unknown_member_is_rejected() {
    let mem = three_members(Convergence::AfterReads(1));
    let err = executor(&mem, policy())
        .promote(&request("z", false), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, DocumentDbError::UnknownMember("z".into()));
}

#[tokio::test]
async fn failover_with_unreachable_primary() {
    let mem = three_members(Convergence::AfterReads(1));
    mem.set_health("a", SimHealth::Unreachable);
    let report = executor(&mem, policy())
        .promote(&request("b", false), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.outcome.is_success());
    let snapshot = report.outcome.snapshot();
    assert_eq!(snapshot.member("a").unwrap().observed_role, ObservedRole::Unreachable);
    assert_eq!(snapshot.member("a").unwrap().declared_role, DeclaredRole::Replica);
}

#[tokio::test]
async fn never_converging_times_out_and_status_shows_stall() {
    let mem = three_members(Convergence::Never);
    let policy = policy();
    let report = executor(&mem, policy.clone())
        .promote(&request("b", false), &CancellationToken::new())
        .await
        .unwrap();

    match &report.outcome {
        PromotionOutcome::Failed { reason, snapshot } => {
            assert!(matches!(reason, DocumentDbError::ConvergenceTimeout(_)));
            assert!(snapshot.is_sole_primary("a"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(report.history.last().unwrap().to, ExecutorPhase::Failed);

    let reader = ClusterReader::new(
        mem.clone(),
        mem.clone(),
        ProbeSettings::default(),
        RetryPolicy::default(),
    );
    let snap = reader.snapshot(&cluster()).await.unwrap();
    let view = status::render(&snap, Utc::now(), policy.convergence_timeout());
    let promotion = view.promotion.expect("pending promotion shown");
    assert_eq!(promotion.target, "b");
    assert_eq!(promotion.state, PromotionState::Stalled);
    assert_ne!(view.condition, ClusterCondition::PromotionInProgress);
}

#[tokio::test]
async fn stalled_marker_does_not_block_new_attempt() {
    let mem = three_members(Convergence::Never);
    mem.set_pending(Some(PendingPromotion {
        id: "old".into(),
        target: "c".into(),
        started_at: Utc::now() - chrono::Duration::minutes(30),
        forced: false,
    }));
    let report = executor(&mem, policy())
        .promote(&request("b", false), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        report.outcome,
        PromotionOutcome::Failed {
            reason: DocumentDbError::ConvergenceTimeout(_),
            ..
        }
    ));
    assert_eq!(mem.patches(), 1);
}

#[tokio::test]
async fn active_marker_blocks_second_promotion() {
    let mem = three_members(Convergence::Never);
    mem.set_pending(Some(PendingPromotion {
        id: "running".into(),
        target: "c".into(),
        started_at: Utc::now(),
        forced: true,
    }));
    let err = executor(&mem, policy())
        .promote(&request("b", false), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DocumentDbError::PromotionInProgress {
            target: "c".into()
        }
    );
    assert_eq!(mem.patches(), 0);
}

#[tokio::test]
async fn repeated_promotion_is_a_no_op() {
    let mem = three_members(Convergence::AfterReads(1));
    let exec = executor(&mem, policy());
    let cancel = CancellationToken::new();

    let first = exec.promote(&request("b", false), &cancel).await.unwrap();
    assert!(first.outcome.is_success());

    let second = exec.promote(&request("b", false), &cancel).await.unwrap();
    assert!(matches!(
        second.outcome,
        PromotionOutcome::Succeeded { mutated: false, .. }
    ));
    assert!(second.promotion_id.is_none());
    assert_eq!(mem.patches(), 1);
}

#[tokio::test]
async fn resource_version_conflict_aborts_with_stale_state() {
    let mem = three_members(Convergence::AfterReads(1));
    mem.fail_next_patch(DocumentDbError::StaleState("resourceVersion changed".into()));
    let report = executor(&mem, policy())
        .promote(&request("b", false), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        report.outcome,
        PromotionOutcome::Aborted {
            reason: DocumentDbError::StaleState(_),
            ..
        }
    ));
    assert_eq!(mem.patches(), 0);
    assert_eq!(report.history.last().unwrap().from, ExecutorPhase::Mutating);
}

#[tokio::test]
async fn other_patch_errors_fail_without_retry() {
    let mem = three_members(Convergence::AfterReads(1));
    mem.fail_next_patch(DocumentDbError::Transient("etcd timeout".into()));
    let report = executor(&mem, policy())
        .promote(&request("b", false), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        report.outcome,
        PromotionOutcome::Failed {
            reason: DocumentDbError::Transient(_),
            ..
        }
    ));
    assert_eq!(mem.patches(), 0);
}

#[tokio::test]
async fn retarget_during_convergence_aborts() {
    let mem = three_members(Convergence::Never);
    let exec = executor(&mem, policy());

    let writer = {
        let mem = mem.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            mem.retarget("c");
        })
    };
    let report = exec
        .promote(&request("b", false), &CancellationToken::new())
        .await
        .unwrap();
    writer.await.unwrap();

    match &report.outcome {
        PromotionOutcome::Aborted { reason, snapshot } => {
            assert!(matches!(reason, DocumentDbError::StaleState(_)));
            assert_eq!(snapshot.declared_primary.as_deref(), Some("c"));
        }
        other => panic!("expected abort, got {other:?}"),
    }
}

#[tokio::test]
async fn transient_reads_while_converging_are_tolerated() {
    let mem = three_members(Convergence::AfterReads(3));
    let exec = executor(&mem, policy());
    let progress = exec.progress();
    let flaky = {
        let mem = mem.clone();
        let mut progress = progress.clone();
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let converging = progress
                    .borrow()
                    .as_ref()
                    .is_some_and(|p| p.phase == ExecutorPhase::Converging);
                if converging {
                    mem.fail_next_reads(1);
                    break;
                }
            }
        })
    };

    let report = exec
        .promote(&request("b", false), &CancellationToken::new())
        .await
        .unwrap();
    drop(exec);
    flaky.await.unwrap();
    assert!(report.outcome.is_success(), "{:?}", report.outcome);
}

#[tokio::test]
async fn cancellation_while_converging_aborts() {
    let mem = three_members(Convergence::Never);
    let exec = executor(
        &mem,
        PromotionPolicy {
            convergence_timeout_ms: 60_000,
            ..policy()
        },
    );
    let cancel = CancellationToken::new();
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let report = exec.promote(&request("b", false), &cancel).await.unwrap();
    trigger.await.unwrap();

    match &report.outcome {
        PromotionOutcome::Aborted { reason, snapshot } => {
            assert_eq!(reason, &DocumentDbError::Cancelled);
            assert_eq!(snapshot.declared_primary.as_deref(), Some("b"));
        }
        other => panic!("expected abort, got {other:?}"),
    }
    assert_eq!(mem.patches(), 1);
}

#[tokio::test]
async fn cancelled_before_start_writes_nothing() {
    let mem = three_members(Convergence::AfterReads(1));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = executor(&mem, policy())
        .promote(&request("b", false), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, DocumentDbError::Cancelled);
    assert_eq!(mem.patches(), 0);
}

#[tokio::test]
async fn concurrent_promoters_never_both_write() {
    let mem = three_members(Convergence::AfterReads(1));
    let first = executor(&mem, policy());
    let second = executor(&mem, policy());
    let cancel = CancellationToken::new();

    let req1 = request("b", false);
    let req2 = request("b", false);
    let (r1, r2) = tokio::join!(
        first.promote(&req1, &cancel),
        second.promote(&req2, &cancel),
    );

    let outcomes = [r1, r2];
    let successes = outcomes
        .iter()
        .filter(|r| matches!(r, Ok(report) if report.outcome.is_success()))
        .count();
    assert!(successes >= 1);
    assert_eq!(mem.patches(), 1);
    for result in &outcomes {
        match result {
            Ok(report) => match &report.outcome {
                PromotionOutcome::Succeeded { .. } => {}
                PromotionOutcome::Aborted { reason, .. } => {
                    assert!(matches!(reason, DocumentDbError::StaleState(_)));
                }
                other => panic!("unexpected outcome {other:?}"),
            },
            Err(e) => assert!(matches!(e, DocumentDbError::PromotionInProgress { .. })),
        }
    }
}

#[tokio::test]
async fn old_primary_with_garbled_health_is_not_counted_as_demoted() {
    let mem = three_members(Convergence::Never);
    let exec = executor(&mem, policy());
    let progress = exec.progress();
    let operator = {
        let mem = mem.clone();
        let mut progress = progress.clone();
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let converging = progress
                    .borrow()
                    .as_ref()
                    .is_some_and(|p| p.phase == ExecutorPhase::Converging);
                if converging {
                    // Target takes over but the old primary answers with garbage.
                    mem.set_health(
                        "b",
                        SimHealth::Report(documentdb_cluster::probe::ProbeReport::primary()),
                    );
                    mem.set_declared_role("b", DeclaredRole::Primary);
                    mem.set_declared_role("a", DeclaredRole::Replica);
                    mem.set_health("a", SimHealth::Garbled);
                    break;
                }
            }
        })
    };

    let report = exec
        .promote(&request("b", false), &CancellationToken::new())
        .await
        .unwrap();
    drop(exec);
    operator.await.unwrap();

    match &report.outcome {
        PromotionOutcome::Failed { reason, snapshot } => {
            assert!(matches!(reason, DocumentDbError::ConvergenceTimeout(_)));
            assert_eq!(snapshot.member("a").unwrap().observed_role, ObservedRole::Unknown);
            assert_eq!(snapshot.member("b").unwrap().observed_role, ObservedRole::Primary);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}
