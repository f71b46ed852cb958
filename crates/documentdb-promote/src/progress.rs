use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use documentdb_core::types::format_duration;

use crate::state::{ExecutorPhase, Transition};

/// Live view of a running promotion, published on every transition and
/// every convergence poll.
#[derive(Debug, Clone, Serialize)]
pub struct PromotionProgress {
    pub phase: ExecutorPhase,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub phase_entered_at: DateTime<Utc>,
    /// Summary of the last snapshot seen.
    pub snapshot: String,
    pub history: Vec<Transition>,
}

impl PromotionProgress {
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or_default()
    }

    /// e.g. `converging to docdb-2, 12s elapsed`
    pub fn describe(&self, now: DateTime<Utc>) -> String {
        format!(
            "{} to {}, {} elapsed",
            self.phase,
            self.target,
            format_duration(self.elapsed(now))
        )
    }
}
