//! In-memory cluster backend.
//!
//! Behaves like the Kubernetes store closely enough to drive the promotion
//! executor: optimistic concurrency on a resource version, a simulated
//! operator that completes a switchover after a number of reads, injected
//! read failures, and a live event feed.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use documentdb_core::event::{ClusterEvent, EventKind, EventQuery};
use documentdb_core::types::{
    ClusterRef, ClusterSnapshot, DeclaredRole, MemberState, ObservedRole, PendingPromotion,
};
use documentdb_core::{DocumentDbError, Result};

use crate::probe::ProbeReport;
use crate::provider::{ClusterStore, EventSource, MemberProber, PromotionPatch};

/// What a simulated member answers when probed.
#[derive(Debug, Clone, PartialEq)]
pub enum SimHealth {
    Report(ProbeReport),
    /// Connection refused.
    Unreachable,
    /// Responds with a body that cannot be decoded.
    Garbled,
}

/// How the simulated operator reacts to a new desired primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Switch over once this many reads have happened after the patch.
    AfterReads(u32),
    Never,
}

#[derive(Debug, Clone)]
struct SimMember {
    declared_role: DeclaredRole,
    ready: bool,
    health: SimHealth,
}

#[derive(Debug)]
struct State {
    desired_members: usize,
    members: BTreeMap<String, SimMember>,
    spec_target: Option<String>,
    current_primary: Option<String>,
    resource_version: u64,
    pending: Option<PendingPromotion>,
    convergence: Convergence,
    switchover: Option<(String, u32)>,
    failing_reads: u32,
    failing_patch: Option<DocumentDbError>,
    reads: u64,
    patches: u64,
    events: Vec<ClusterEvent>,
    event_seq: u64,
}

pub struct MemoryCluster {
    cluster: ClusterRef,
    state: Mutex<State>,
    feed: broadcast::Sender<ClusterEvent>,
}

impl MemoryCluster {
    pub fn new(cluster: ClusterRef) -> Self {
        let (feed, _) = broadcast::channel(256);
        Self {
            cluster,
            state: Mutex::new(State {
                desired_members: 0,
                members: BTreeMap::new(),
                spec_target: None,
                current_primary: None,
                resource_version: 1,
                pending: None,
                convergence: Convergence::AfterReads(1),
                switchover: None,
                failing_reads: 0,
                failing_patch: None,
                reads: 0,
                patches: 0,
                events: Vec::new(),
                event_seq: 0,
            }),
            feed,
        }
    }

    /// Add a ready member reporting primary.
    pub fn with_primary(self, name: &str) -> Self {
        {
            let mut state = self.lock();
            state.current_primary = Some(name.to_string());
            state.members.insert(
                name.to_string(),
                SimMember {
                    declared_role: DeclaredRole::Primary,
                    ready: true,
                    health: SimHealth::Report(ProbeReport::primary()),
                },
            );
            state.desired_members += 1;
        }
        self
    }

    /// Add a ready replica with the given replay lag.
    pub fn with_replica(self, name: &str, lag: Duration) -> Self {
        {
            let mut state = self.lock();
            state.members.insert(
                name.to_string(),
                SimMember {
                    declared_role: DeclaredRole::Replica,
                    ready: true,
                    health: SimHealth::Report(ProbeReport::replica(Some(lag))),
                },
            );
            state.desired_members += 1;
        }
        self
    }

    pub fn with_convergence(self, convergence: Convergence) -> Self {
        self.lock().convergence = convergence;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `n` reads fail with a transient error.
    pub fn fail_next_reads(&self, n: u32) {
        self.lock().failing_reads = n;
    }

    /// Make the next patch fail with `err` instead of applying.
    pub fn fail_next_patch(&self, err: DocumentDbError) {
        self.lock().failing_patch = Some(err);
    }

    /// Another writer touched the resource.
    pub fn bump_resource_version(&self) {
        self.lock().resource_version += 1;
    }

    /// Another writer re-targeted the cluster to `name`.
    pub fn retarget(&self, name: &str) {
        let mut state = self.lock();
        state.spec_target = Some(name.to_string());
        state.resource_version += 1;
    }

    pub fn set_health(&self, name: &str, health: SimHealth) {
        if let Some(member) = self.lock().members.get_mut(name) {
            member.health = health;
        }
    }

    pub fn set_ready(&self, name: &str, ready: bool) {
        if let Some(member) = self.lock().members.get_mut(name) {
            member.ready = ready;
        }
    }

    pub fn set_declared_role(&self, name: &str, role: DeclaredRole) {
        if let Some(member) = self.lock().members.get_mut(name) {
            member.declared_role = role;
        }
    }

    /// Write a promotion marker as if another client had started one.
    pub fn set_pending(&self, pending: Option<PendingPromotion>) {
        let mut state = self.lock();
        state.pending = pending;
        state.resource_version += 1;
    }

    pub fn record_event(&self, kind: EventKind, reason: &str, message: &str) {
        let mut state = self.lock();
        self.push_event(&mut state, kind, reason, message);
    }

    pub fn reads(&self) -> u64 {
        self.lock().reads
    }

    pub fn patches(&self) -> u64 {
        self.lock().patches
    }

    pub fn resource_version(&self) -> String {
        self.lock().resource_version.to_string()
    }

    fn push_event(&self, state: &mut State, kind: EventKind, reason: &str, message: &str) {
        state.event_seq += 1;
        let event = ClusterEvent {
            uid: format!("mem-{}", state.event_seq),
            timestamp: Utc::now(),
            kind,
            reason: reason.to_string(),
            message: message.to_string(),
            object: format!("DocumentDB/{}", self.cluster.name),
            count: 1,
        };
        state.events.push(event.clone());
        // No subscribers is fine.
        let _ = self.feed.send(event);
    }

    fn complete_switchover(&self, state: &mut State, target: &str) {
        for (name, member) in state.members.iter_mut() {
            if name == target {
                member.declared_role = DeclaredRole::Primary;
                member.health = SimHealth::Report(ProbeReport::primary());
            } else if member.declared_role == DeclaredRole::Primary
                || matches!(&member.health, SimHealth::Report(r) if r.role == ObservedRole::Primary)
            {
                member.declared_role = DeclaredRole::Replica;
                if let SimHealth::Report(_) = member.health {
                    member.health = SimHealth::Report(ProbeReport::replica(Some(Duration::ZERO)));
                }
            }
        }
        state.current_primary = Some(target.to_string());
        state.resource_version += 1;
        self.push_event(
            state,
            EventKind::Normal,
            "SwitchoverCompleted",
            &format!("{target} is now primary"),
        );
    }
}

#[async_trait]
impl ClusterStore for MemoryCluster {
    async fn read_cluster(&self, cluster: &ClusterRef) -> Result<ClusterSnapshot> {
        if cluster != &self.cluster {
            return Err(DocumentDbError::NotFound(cluster.to_string()));
        }
        let mut state = self.lock();
        state.reads += 1;
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(DocumentDbError::Transient("simulated API outage".to_string()));
        }

        if let Some((target, remaining)) = state.switchover.take() {
            if remaining <= 1 {
                self.complete_switchover(&mut state, &target);
            } else {
                state.switchover = Some((target, remaining - 1));
            }
        }

        let members = state
            .members
            .iter()
            .map(|(name, m)| {
                MemberState::unprobed(
                    name.clone(),
                    Some(format!("{name}.memory:8000")),
                    m.declared_role,
                    m.ready,
                )
            })
            .collect();
        Ok(ClusterSnapshot {
            cluster: self.cluster.clone(),
            desired_members: state.desired_members,
            members,
            declared_primary: state
                .spec_target
                .clone()
                .or_else(|| state.current_primary.clone()),
            resource_version: state.resource_version.to_string(),
            pending_promotion: state.pending.clone(),
            captured_at: Utc::now(),
        })
    }

    async fn patch_target_primary(
        &self,
        cluster: &ClusterRef,
        patch: &PromotionPatch,
    ) -> Result<String> {
        if cluster != &self.cluster {
            return Err(DocumentDbError::NotFound(cluster.to_string()));
        }
        let mut state = self.lock();
        if let Some(err) = state.failing_patch.take() {
            return Err(err);
        }
        let current = state.resource_version.to_string();
        if patch.expected_resource_version != current {
            return Err(DocumentDbError::StaleState(format!(
                "resourceVersion is {current}, patch expected {}",
                patch.expected_resource_version
            )));
        }

        state.patches += 1;
        state.spec_target = Some(patch.target.clone());
        state.pending = Some(PendingPromotion {
            id: patch.id.clone(),
            target: patch.target.clone(),
            started_at: patch.started_at,
            forced: patch.forced,
        });
        state.resource_version += 1;
        state.switchover = match state.convergence {
            Convergence::AfterReads(n) => Some((patch.target.clone(), n)),
            Convergence::Never => None,
        };
        self.push_event(
            &mut state,
            EventKind::Normal,
            "SwitchoverRequested",
            &format!("switching primary to {}", patch.target),
        );
        Ok(state.resource_version.to_string())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[async_trait]
impl MemberProber for MemoryCluster {
    async fn probe(&self, member: &MemberState) -> Result<ProbeReport> {
        let health = self
            .lock()
            .members
            .get(&member.name)
            .map(|m| m.health.clone())
            .unwrap_or(SimHealth::Unreachable);
        match health {
            SimHealth::Report(report) => Ok(report),
            SimHealth::Unreachable => Err(DocumentDbError::Transient(format!(
                "{}: connection refused",
                member.name
            ))),
            SimHealth::Garbled => Err(DocumentDbError::Malformed(format!(
                "{}: expected JSON status",
                member.name
            ))),
        }
    }
}

#[async_trait]
impl EventSource for MemoryCluster {
    async fn events(
        &self,
        cluster: &ClusterRef,
        query: EventQuery,
    ) -> Result<BoxStream<'static, Result<ClusterEvent>>> {
        if cluster != &self.cluster {
            return Err(DocumentDbError::NotFound(cluster.to_string()));
        }
        // Subscribe before copying the backlog so nothing falls in between.
        let live = self.feed.subscribe();
        let backlog: Vec<ClusterEvent> = self
            .lock()
            .events
            .iter()
            .filter(|e| query.admits(e))
            .cloned()
            .collect();
        let last_seq = backlog.len();
        let initial = stream::iter(backlog.into_iter().map(Ok));
        if !query.follow {
            return Ok(initial.boxed());
        }

        let mut seen = std::collections::HashSet::new();
        let updates = BroadcastStream::new(live).filter_map(move |item| {
            let next = item
                .ok()
                .filter(|e| query.admits(e) && seen.insert(e.uid.clone()))
                .map(Ok);
            async move { next }
        });
        tracing::debug!(backlog = last_seq, "Following in-memory events");
        Ok(initial.chain(updates).boxed())
    }
}
