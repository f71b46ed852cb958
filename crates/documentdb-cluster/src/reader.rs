use std::sync::Arc;

use documentdb_core::config::{ProbeSettings, RetryPolicy};
use documentdb_core::retry::retry_transient;
use documentdb_core::types::{ClusterRef, ClusterSnapshot};
use documentdb_core::Result;

use crate::probe::probe_members;
use crate::provider::{ClusterStore, MemberProber};

/// Produces probed snapshots: one control-plane read plus one probe per member.
#[derive(Clone)]
pub struct ClusterReader {
    store: Arc<dyn ClusterStore>,
    prober: Arc<dyn MemberProber>,
    probe: ProbeSettings,
    retry: RetryPolicy,
}

impl ClusterReader {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        prober: Arc<dyn MemberProber>,
        probe: ProbeSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            prober,
            probe,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    /// Read the cluster, retrying transient API errors, then probe members.
    pub async fn snapshot(&self, cluster: &ClusterRef) -> Result<ClusterSnapshot> {
        let unprobed = retry_transient(&self.retry, "cluster read", || {
            self.store.read_cluster(cluster)
        })
        .await?;
        Ok(self.probe(unprobed).await)
    }

    /// Single attempt, for callers that run their own retry loop.
    pub async fn snapshot_once(&self, cluster: &ClusterRef) -> Result<ClusterSnapshot> {
        let unprobed = self.store.read_cluster(cluster).await?;
        Ok(self.probe(unprobed).await)
    }

    async fn probe(&self, unprobed: ClusterSnapshot) -> ClusterSnapshot {
        let members = probe_members(self.prober.clone(), &unprobed.members, &self.probe).await;
        let snapshot = unprobed.with_members(members);
        tracing::debug!(snapshot = %snapshot.summary(), "Cluster snapshot");
        snapshot
    }
}
