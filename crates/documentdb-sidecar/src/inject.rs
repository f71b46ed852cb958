use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, Pod};
use kube::ResourceExt;
use serde_json::{json, Value};

use documentdb_cluster::crd::DocumentDB;

pub const GATEWAY_CONTAINER: &str = "documentdb-gateway";
pub const GATEWAY_PORT: i32 = 10260;
pub const GATEWAY_PORT_NAME: &str = "gateway";
pub const CLUSTER_NAME_ENV: &str = "DOCUMENTDB_CLUSTER_NAME";

#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("invalid pod definition: {0}")]
    InvalidPod(serde_json::Error),

    #[error("invalid cluster definition: {0}")]
    InvalidCluster(serde_json::Error),

    #[error("pod has no spec")]
    MissingPodSpec,

    #[error("encoding failed: {0}")]
    Encode(serde_json::Error),
}

/// Result of one mutation: the pod to admit plus the patch that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub pod: Pod,
    /// Empty when the pod already carried the gateway.
    pub patch: Vec<Value>,
}

impl Mutation {
    pub fn is_noop(&self) -> bool {
        self.patch.is_empty()
    }
}

/// Adds the gateway sidecar to pods of DocumentDB clusters.
#[derive(Debug, Clone)]
pub struct SidecarInjector {
    default_image: String,
}

impl SidecarInjector {
    pub fn new(default_image: impl Into<String>) -> Self {
        Self {
            default_image: default_image.into(),
        }
    }

    /// Decode both definitions and mutate. Returns the pod and patch as JSON.
    pub fn mutate_json(
        &self,
        pod_json: &[u8],
        cluster_json: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), InjectError> {
        let pod: Pod = serde_json::from_slice(pod_json).map_err(InjectError::InvalidPod)?;
        let cluster: DocumentDB =
            serde_json::from_slice(cluster_json).map_err(InjectError::InvalidCluster)?;

        let mutation = self.mutate(pod, &cluster)?;
        let pod = serde_json::to_vec(&mutation.pod).map_err(InjectError::Encode)?;
        let patch = serde_json::to_vec(&mutation.patch).map_err(InjectError::Encode)?;
        Ok((pod, patch))
    }

    pub fn mutate(&self, mut pod: Pod, cluster: &DocumentDB) -> Result<Mutation, InjectError> {
        let spec = pod.spec.as_mut().ok_or(InjectError::MissingPodSpec)?;
        if spec.containers.iter().any(|c| c.name == GATEWAY_CONTAINER) {
            tracing::debug!(pod = %pod.name_any(), "Gateway already present");
            return Ok(Mutation {
                pod,
                patch: Vec::new(),
            });
        }

        let container = self.gateway_container(cluster);
        let value = serde_json::to_value(&container).map_err(InjectError::Encode)?;
        spec.containers.push(container);

        tracing::info!(
            pod = %pod.name_any(),
            cluster = %cluster.name_any(),
            "Injected gateway sidecar"
        );
        Ok(Mutation {
            pod,
            patch: vec![json!({
                "op": "add",
                "path": "/spec/containers/-",
                "value": value,
            })],
        })
    }

    fn gateway_container(&self, cluster: &DocumentDB) -> Container {
        let image = cluster
            .spec
            .gateway_image
            .clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| self.default_image.clone());
        Container {
            name: GATEWAY_CONTAINER.to_string(),
            image: Some(image),
            ports: Some(vec![ContainerPort {
                name: Some(GATEWAY_PORT_NAME.to_string()),
                container_port: GATEWAY_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            env: Some(vec![EnvVar {
                name: CLUSTER_NAME_ENV.to_string(),
                value: Some(cluster.name_any()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }
}
