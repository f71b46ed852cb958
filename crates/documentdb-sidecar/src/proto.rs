//! Wire messages of the `documentdb.sidecar.v1.SidecarInjector` service.

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetPluginMetadataRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PluginMetadata {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub version: String,
    #[prost(string, tag = "3")]
    pub display_name: String,
    #[prost(string, tag = "4")]
    pub description: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MutatePodRequest {
    /// JSON-encoded Pod.
    #[prost(bytes = "vec", tag = "1")]
    pub pod_definition: Vec<u8>,
    /// JSON-encoded DocumentDB cluster resource.
    #[prost(bytes = "vec", tag = "2")]
    pub cluster_definition: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MutatePodResponse {
    /// JSON-encoded Pod after mutation.
    #[prost(bytes = "vec", tag = "1")]
    pub pod_definition: Vec<u8>,
    /// RFC 6902 patch from the request pod to the returned one.
    #[prost(bytes = "vec", tag = "2")]
    pub json_patch: Vec<u8>,
}

include!(concat!(
    env!("OUT_DIR"),
    "/documentdb.sidecar.v1.SidecarInjector.rs"
));
