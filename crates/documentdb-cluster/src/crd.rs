use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &str = "db.microsoft.com";

/// Pod label naming the cluster a member belongs to.
pub const CLUSTER_LABEL: &str = "cnpg.io/cluster";
/// Pod label carrying the role the operator assigned.
pub const ROLE_LABEL: &str = "cnpg.io/instanceRole";

pub const PROMOTION_ID_ANNOTATION: &str = "documentdb.io/promotion-id";
pub const PROMOTION_TARGET_ANNOTATION: &str = "documentdb.io/promotion-target";
pub const PROMOTION_STARTED_ANNOTATION: &str = "documentdb.io/promotion-started-at";
pub const PROMOTION_FORCED_ANNOTATION: &str = "documentdb.io/promotion-forced";

/// DocumentDB is a managed DocumentDB cluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "db.microsoft.com",
    version = "preview",
    kind = "DocumentDB",
    plural = "dbs",
    namespaced,
    status = "DocumentDBStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.currentPrimary"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDBSpec {
    pub node_count: i32,
    pub instances_per_node: i32,
    /// Member the operator should make primary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_primary: Option<String>,
    /// Image of the gateway sidecar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_image: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDBStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_primary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_primary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl DocumentDBSpec {
    /// Number of members the cluster should run. Negative counts read as zero.
    pub fn desired_members(&self) -> usize {
        let nodes = usize::try_from(self.node_count).unwrap_or(0);
        let per_node = usize::try_from(self.instances_per_node).unwrap_or(0);
        nodes * per_node
    }
}

impl DocumentDB {
    /// `spec.targetPrimary`, else `status.currentPrimary`.
    pub fn declared_primary(&self) -> Option<&str> {
        self.spec
            .target_primary
            .as_deref()
            .or_else(|| self.status.as_ref()?.current_primary.as_deref())
            .filter(|name| !name.is_empty())
    }
}
