pub mod crd;
pub mod events;
pub mod kubernetes;
pub mod memory;
pub mod probe;
pub mod provider;
pub mod reader;

pub use provider::{ClusterStore, EventSource, MemberProber, PromotionPatch};
pub use reader::ClusterReader;
