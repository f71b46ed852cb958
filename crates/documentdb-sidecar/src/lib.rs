pub mod inject;
pub mod proto;
pub mod service;

pub use inject::SidecarInjector;
pub use proto::sidecar_injector_server::SidecarInjectorServer;
pub use service::SidecarInjectorService;
