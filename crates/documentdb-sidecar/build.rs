use tonic_build::manual::{Builder, Method, Service};

fn main() {
    let method = |name: &str, route: &str, input: &str, output: &str| {
        Method::builder()
            .name(name)
            .route_name(route)
            .input_type(format!("crate::proto::{input}"))
            .output_type(format!("crate::proto::{output}"))
            .codec_path("tonic::codec::ProstCodec")
            .build()
    };

    let service = Service::builder()
        .name("SidecarInjector")
        .package("documentdb.sidecar.v1")
        .method(method(
            "get_plugin_metadata",
            "GetPluginMetadata",
            "GetPluginMetadataRequest",
            "PluginMetadata",
        ))
        .method(method(
            "mutate_pod",
            "MutatePod",
            "MutatePodRequest",
            "MutatePodResponse",
        ))
        .build();

    Builder::new().compile(&[service]);
}
