pub mod executor;
pub mod progress;
pub mod state;

pub use executor::{PromotionExecutor, PromotionReport, PromotionRequest};
pub use progress::PromotionProgress;
pub use state::{ExecutorPhase, Transition};
