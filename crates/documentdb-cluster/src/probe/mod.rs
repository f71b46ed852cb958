//! Member health probing.
//!
//! Members of one snapshot are probed concurrently with bounded parallelism
//! and joined before the snapshot is returned. Byte lag needs the primary's
//! position, so it is computed only after every probe has finished.

pub mod http;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use documentdb_core::config::ProbeSettings;
use documentdb_core::types::{format_duration, MemberState, ObservedRole};
use documentdb_core::DocumentDbError;

use crate::provider::MemberProber;

pub use http::HttpProber;

/// A Postgres WAL position, written `X/Y` in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Bytes between `self` and an earlier position.
    pub fn bytes_since(self, earlier: Lsn) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl FromStr for Lsn {
    type Err = DocumentDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DocumentDbError::Malformed(format!("invalid LSN '{s}'"));
        let (hi, lo) = s.split_once('/').ok_or_else(bad)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| bad())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| bad())?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// What a member reported about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub role: ObservedRole,
    pub ready: bool,
    pub replay_lag: Option<Duration>,
    pub current_lsn: Option<Lsn>,
    pub replay_lsn: Option<Lsn>,
}

impl ProbeReport {
    pub fn primary() -> Self {
        Self {
            role: ObservedRole::Primary,
            ready: true,
            replay_lag: Some(Duration::ZERO),
            current_lsn: None,
            replay_lsn: None,
        }
    }

    pub fn replica(lag: Option<Duration>) -> Self {
        Self {
            role: ObservedRole::Replica,
            ready: true,
            replay_lag: lag,
            current_lsn: None,
            replay_lsn: None,
        }
    }
}

type ProbeResult = Result<ProbeReport, (ObservedRole, String)>;

/// Probe every member and return them with observed roles filled in.
///
/// Never fails as a whole: a member that cannot be probed is marked
/// `unreachable` or `unknown` with the reason in `probe_error`.
pub async fn probe_members(
    prober: Arc<dyn MemberProber>,
    members: &[MemberState],
    settings: &ProbeSettings,
) -> Vec<MemberState> {
    let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
    let timeout = settings.timeout();
    let mut tasks = JoinSet::new();

    for (idx, member) in members.iter().cloned().enumerate() {
        let prober = prober.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            (idx, probe_one(prober.as_ref(), &member, timeout).await)
        });
    }

    let mut results: Vec<ProbeResult> = members
        .iter()
        .map(|_| Err((ObservedRole::Unknown, "probe did not complete".to_string())))
        .collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, result)) => results[idx] = result,
            Err(e) => tracing::warn!("probe task failed: {e}"),
        }
    }

    apply_reports(members, results)
}

async fn probe_one(prober: &dyn MemberProber, member: &MemberState, timeout: Duration) -> ProbeResult {
    if member.endpoint.is_none() {
        return Err((ObservedRole::Unreachable, "no endpoint".to_string()));
    }
    match tokio::time::timeout(timeout, prober.probe(member)).await {
        Ok(Ok(report)) => Ok(report),
        Ok(Err(DocumentDbError::Malformed(msg))) => Err((ObservedRole::Unknown, msg)),
        Ok(Err(e)) => Err((ObservedRole::Unreachable, e.to_string())),
        Err(_) => Err((
            ObservedRole::Unreachable,
            format!("timed out after {}", format_duration(timeout)),
        )),
    }
}

fn apply_reports(members: &[MemberState], results: Vec<ProbeResult>) -> Vec<MemberState> {
    let now = Utc::now();
    let primaries: Vec<&ProbeReport> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .filter(|r| r.role == ObservedRole::Primary)
        .collect();
    let primary_lsn = match primaries.as_slice() {
        [only] => only.current_lsn,
        _ => None,
    };

    members
        .iter()
        .zip(results)
        .map(|(member, result)| {
            let mut probed = member.clone();
            probed.last_probe = Some(now);
            match result {
                Ok(report) => {
                    probed.observed_role = report.role;
                    probed.ready = member.ready && report.ready;
                    probed.probe_error = None;
                    if report.role == ObservedRole::Primary {
                        probed.lag = Some(Duration::ZERO);
                        probed.lag_bytes = Some(0);
                    } else {
                        probed.lag = report.replay_lag;
                        probed.lag_bytes = primary_lsn
                            .zip(report.replay_lsn)
                            .map(|(primary, replayed)| primary.bytes_since(replayed));
                    }
                }
                Err((role, error)) => {
                    tracing::debug!(member = %member.name, %role, "Probe failed: {error}");
                    probed.observed_role = role;
                    probed.lag = None;
                    probed.lag_bytes = None;
                    probed.probe_error = Some(error);
                }
            }
            probed
        })
        .collect()
}
