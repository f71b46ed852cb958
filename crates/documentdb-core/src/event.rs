use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Normal,
    Warning,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Normal => write!(f, "Normal"),
            EventKind::Warning => write!(f, "Warning"),
        }
    }
}

/// A Kubernetes event about the cluster resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub uid: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
    /// `Kind/name` of the object the event is about.
    pub object: String,
    pub count: i32,
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {:<7} {:<24} {}  {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            self.kind,
            self.reason,
            self.object,
            self.message
        )?;
        if self.count > 1 {
            write!(f, " (x{})", self.count)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    /// Drop events older than this.
    pub since: Option<DateTime<Utc>>,
    /// Keep streaming new events after the backlog.
    pub follow: bool,
}

impl EventQuery {
    pub fn backlog() -> Self {
        Self::default()
    }

    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            follow: false,
        }
    }

    pub fn admits(&self, event: &ClusterEvent) -> bool {
        self.since.is_none_or(|since| event.timestamp >= since)
    }
}

/// Sort events by occurrence time, uid as tie breaker.
pub fn sort_events(events: &mut [ClusterEvent]) {
    events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.uid.cmp(&b.uid)));
}
