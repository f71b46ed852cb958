pub mod config;
pub mod error;
pub mod event;
pub mod outcome;
pub mod planner;
pub mod retry;
pub mod status;
pub mod types;

pub use error::{DocumentDbError, ErrorKind, Result};
