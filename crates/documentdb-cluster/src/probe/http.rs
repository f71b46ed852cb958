use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use documentdb_core::config::ProbeSettings;
use documentdb_core::types::{MemberState, ObservedRole};
use documentdb_core::{DocumentDbError, Result};

use super::{Lsn, ProbeReport};
use crate::provider::MemberProber;

/// Body of the instance status endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub is_primary: bool,
    #[serde(default = "default_ready")]
    pub is_ready: bool,
    #[serde(default)]
    pub replay_lag_seconds: Option<f64>,
    #[serde(default)]
    pub current_lsn: Option<String>,
    #[serde(default)]
    pub received_lsn: Option<String>,
    #[serde(default)]
    pub replay_lsn: Option<String>,
}

fn default_ready() -> bool {
    true
}

impl InstanceStatus {
    pub fn into_report(self) -> Result<ProbeReport> {
        let parse = |lsn: Option<String>| lsn.as_deref().map(str::parse::<Lsn>).transpose();
        let role = if self.is_primary {
            ObservedRole::Primary
        } else {
            ObservedRole::Replica
        };
        // A replica that has not replayed what it received is still behind.
        let replay_lsn = parse(self.replay_lsn)?.or(parse(self.received_lsn)?);
        Ok(ProbeReport {
            role,
            ready: self.is_ready,
            replay_lag: self
                .replay_lag_seconds
                .and_then(|s| Duration::try_from_secs_f64(s).ok()),
            current_lsn: parse(self.current_lsn)?,
            replay_lsn,
        })
    }
}

/// Probes members over HTTP.
pub struct HttpProber {
    client: reqwest::Client,
    path: String,
}

impl HttpProber {
    pub fn new(settings: &ProbeSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| DocumentDbError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            path: settings.status_path.clone(),
        })
    }
}

#[async_trait]
impl MemberProber for HttpProber {
    async fn probe(&self, member: &MemberState) -> Result<ProbeReport> {
        let endpoint = member
            .endpoint
            .as_deref()
            .ok_or_else(|| DocumentDbError::Transient(format!("{} has no endpoint", member.name)))?;
        let url = format!("http://{endpoint}{}", self.path);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DocumentDbError::Transient(format!("GET {url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DocumentDbError::Transient(format!("GET {url}: HTTP {status}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| DocumentDbError::Transient(format!("GET {url}: {e}")))?;
        let parsed: InstanceStatus = serde_json::from_slice(&body)
            .map_err(|e| DocumentDbError::Malformed(format!("{}: {e}", member.name)))?;
        parsed.into_report()
    }
}
