use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use uuid::Uuid;

use documentdb_core::event::{ClusterEvent, EventQuery};
use documentdb_core::types::{ClusterRef, ClusterSnapshot, MemberState};
use documentdb_core::Result;

use crate::probe::ProbeReport;

/// Source of truth for the cluster resource and its members.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Read the cluster resource and its members. Members are returned
    /// unprobed; observed roles are filled in by the prober.
    async fn read_cluster(&self, cluster: &ClusterRef) -> Result<ClusterSnapshot>;

    /// Set the desired primary and write the promotion marker in one
    /// conditional update. Returns the new resource version.
    ///
    /// Fails with `StaleState` when the resource changed since
    /// `patch.expected_resource_version`.
    async fn patch_target_primary(
        &self,
        cluster: &ClusterRef,
        patch: &PromotionPatch,
    ) -> Result<String>;

    /// Backend name for display.
    fn name(&self) -> &str;
}

/// Asks one member for its own view of its role and replication position.
#[async_trait]
pub trait MemberProber: Send + Sync {
    /// `Malformed` errors mark the member `unknown`; any other error marks
    /// it `unreachable`.
    async fn probe(&self, member: &MemberState) -> Result<ProbeReport>;
}

/// Kubernetes events scoped to the cluster resource.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Events ordered by occurrence time. With `query.follow` the stream
    /// stays open until dropped.
    async fn events(
        &self,
        cluster: &ClusterRef,
        query: EventQuery,
    ) -> Result<BoxStream<'static, Result<ClusterEvent>>>;
}

/// The single mutation a promotion performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionPatch {
    pub id: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub forced: bool,
    pub expected_resource_version: String,
}

impl PromotionPatch {
    pub fn new(target: &str, forced: bool, expected_resource_version: &str) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            target: target.to_string(),
            started_at: Utc::now(),
            forced,
            expected_resource_version: expected_resource_version.to_string(),
        }
    }
}
