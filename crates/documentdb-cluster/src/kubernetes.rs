//! Kubernetes-backed cluster store.
//!
//! The cluster resource is the single source of mutable truth. Members are
//! the pods the operator labels with the cluster name; they are listed at
//! the resource version of the cluster read so both halves of a snapshot
//! describe the same moment.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams, VersionMatch};
use kube::Client;

use documentdb_core::types::{
    ClusterRef, ClusterSnapshot, DeclaredRole, MemberState, PendingPromotion,
};
use documentdb_core::{DocumentDbError, Result};

use crate::crd::{
    DocumentDB, CLUSTER_LABEL, PROMOTION_FORCED_ANNOTATION, PROMOTION_ID_ANNOTATION,
    PROMOTION_STARTED_ANNOTATION, PROMOTION_TARGET_ANNOTATION, ROLE_LABEL,
};
use crate::provider::{ClusterStore, PromotionPatch};

pub struct KubeClusterStore {
    client: Client,
    status_port: u16,
    name: String,
}

impl KubeClusterStore {
    pub fn new(client: Client, status_port: u16) -> Self {
        Self {
            client,
            status_port,
            name: "kubernetes".to_string(),
        }
    }

    fn clusters(&self, cluster: &ClusterRef) -> Api<DocumentDB> {
        Api::namespaced(self.client.clone(), &cluster.namespace)
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn read_cluster(&self, cluster: &ClusterRef) -> Result<ClusterSnapshot> {
        let db = self
            .clusters(cluster)
            .get(&cluster.name)
            .await
            .map_err(|e| map_kube_error(e, cluster))?;
        let resource_version = db.metadata.resource_version.clone().ok_or_else(|| {
            DocumentDbError::Malformed(format!("{cluster} has no resourceVersion"))
        })?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let params = ListParams::default()
            .labels(&format!("{CLUSTER_LABEL}={}", cluster.name))
            .at(&resource_version)
            .matching(VersionMatch::NotOlderThan);
        let pods = pods
            .list(&params)
            .await
            .map_err(|e| map_kube_error(e, cluster))?;

        build_snapshot(cluster, &db, &pods.items, self.status_port, Utc::now())
    }

    async fn patch_target_primary(
        &self,
        cluster: &ClusterRef,
        patch: &PromotionPatch,
    ) -> Result<String> {
        let body = promotion_patch_body(patch);
        tracing::debug!(cluster = %cluster, body = %body, "Patching cluster resource");
        let updated = self
            .clusters(cluster)
            .patch(&cluster.name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_kube_error(e, cluster))?;
        updated.metadata.resource_version.ok_or_else(|| {
            DocumentDbError::Malformed(format!("{cluster} patch returned no resourceVersion"))
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Merge patch setting the desired primary and the promotion marker.
///
/// Carrying `metadata.resourceVersion` makes the API server reject the
/// patch with 409 if anyone else wrote the resource in between.
pub fn promotion_patch_body(patch: &PromotionPatch) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "resourceVersion": patch.expected_resource_version,
            "annotations": {
                PROMOTION_ID_ANNOTATION: patch.id,
                PROMOTION_TARGET_ANNOTATION: patch.target,
                PROMOTION_STARTED_ANNOTATION: patch.started_at.to_rfc3339(),
                PROMOTION_FORCED_ANNOTATION: patch.forced.to_string(),
            }
        },
        "spec": {
            "targetPrimary": patch.target,
        }
    })
}

/// Assemble an unprobed snapshot from the cluster resource and its pods.
pub fn build_snapshot(
    cluster: &ClusterRef,
    db: &DocumentDB,
    pods: &[Pod],
    status_port: u16,
    captured_at: DateTime<Utc>,
) -> Result<ClusterSnapshot> {
    let mut members = pods
        .iter()
        .map(|pod| member_from_pod(pod, status_port))
        .collect::<Result<Vec<_>>>()?;
    members.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(ClusterSnapshot {
        cluster: cluster.clone(),
        desired_members: db.spec.desired_members(),
        members,
        declared_primary: db.declared_primary().map(str::to_string),
        resource_version: db.metadata.resource_version.clone().unwrap_or_default(),
        pending_promotion: pending_promotion(db.metadata.annotations.as_ref())?,
        captured_at,
    })
}

fn member_from_pod(pod: &Pod, status_port: u16) -> Result<MemberState> {
    let name = pod
        .metadata
        .name
        .clone()
        .ok_or_else(|| DocumentDbError::Malformed("pod without a name".to_string()))?;
    let declared_role = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(ROLE_LABEL))
        .map(|role| role.parse::<DeclaredRole>())
        .transpose()?
        .unwrap_or(DeclaredRole::Unassigned);

    let status = pod.status.as_ref();
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });
    let endpoint = status
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
        .map(|ip| format!("{ip}:{status_port}"));

    Ok(MemberState::unprobed(name, endpoint, declared_role, ready))
}

fn pending_promotion(
    annotations: Option<&BTreeMap<String, String>>,
) -> Result<Option<PendingPromotion>> {
    let Some(annotations) = annotations else {
        return Ok(None);
    };
    let (Some(id), Some(target), Some(started)) = (
        annotations.get(PROMOTION_ID_ANNOTATION),
        annotations.get(PROMOTION_TARGET_ANNOTATION),
        annotations.get(PROMOTION_STARTED_ANNOTATION),
    ) else {
        return Ok(None);
    };
    let started_at = DateTime::parse_from_rfc3339(started)
        .map_err(|e| {
            DocumentDbError::Malformed(format!("{PROMOTION_STARTED_ANNOTATION}={started}: {e}"))
        })?
        .with_timezone(&Utc);
    Ok(Some(PendingPromotion {
        id: id.clone(),
        target: target.clone(),
        started_at,
        forced: annotations
            .get(PROMOTION_FORCED_ANNOTATION)
            .is_some_and(|v| v == "true"),
    }))
}

/// Map a kube client error into the read/conflict taxonomy.
pub fn map_kube_error(err: kube::Error, cluster: &ClusterRef) -> DocumentDbError {
    match err {
        kube::Error::Api(e) if e.code == 404 => DocumentDbError::NotFound(cluster.to_string()),
        kube::Error::Api(e) if e.code == 409 => DocumentDbError::StaleState(e.message),
        kube::Error::Api(e) if e.code == 429 || e.code >= 500 => {
            DocumentDbError::Transient(format!("{} ({})", e.message, e.code))
        }
        kube::Error::Api(e) => DocumentDbError::Malformed(format!(
            "API server rejected request for {cluster}: {} ({})",
            e.message, e.code
        )),
        kube::Error::SerdeError(e) => DocumentDbError::Malformed(e.to_string()),
        other => DocumentDbError::Transient(other.to_string()),
    }
}
