use tonic::{Request, Response, Status};

use crate::inject::{InjectError, SidecarInjector};
use crate::proto::sidecar_injector_server::SidecarInjector as SidecarInjectorRpc;
use crate::proto::{GetPluginMetadataRequest, MutatePodRequest, MutatePodResponse, PluginMetadata};

pub const PLUGIN_NAME: &str = "cnpg-i-sidecar-injector.documentdb.io";
pub const DISPLAY_NAME: &str = "Document DB Gateway Sidecar Injector";

/// gRPC front of [`SidecarInjector`].
pub struct SidecarInjectorService {
    injector: SidecarInjector,
}

impl SidecarInjectorService {
    pub fn new(injector: SidecarInjector) -> Self {
        Self { injector }
    }
}

impl From<InjectError> for Status {
    fn from(e: InjectError) -> Self {
        match e {
            InjectError::Encode(_) => Status::internal(e.to_string()),
            _ => Status::invalid_argument(e.to_string()),
        }
    }
}

#[tonic::async_trait]
impl SidecarInjectorRpc for SidecarInjectorService {
    async fn get_plugin_metadata(
        &self,
        _request: Request<GetPluginMetadataRequest>,
    ) -> Result<Response<PluginMetadata>, Status> {
        Ok(Response::new(PluginMetadata {
            name: PLUGIN_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            display_name: DISPLAY_NAME.to_string(),
            description: "Adds the DocumentDB gateway container to cluster pods".to_string(),
        }))
    }

    async fn mutate_pod(
        &self,
        request: Request<MutatePodRequest>,
    ) -> Result<Response<MutatePodResponse>, Status> {
        let req = request.into_inner();
        let (pod_definition, json_patch) = self
            .injector
            .mutate_json(&req.pod_definition, &req.cluster_definition)
            .inspect_err(|e| tracing::warn!(error = %e, "Pod mutation rejected"))?;
        Ok(Response::new(MutatePodResponse {
            pod_definition,
            json_patch,
        }))
    }
}
