use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;

use documentdb_cluster::events::KubeEventSource;
use documentdb_cluster::EventSource;
use documentdb_core::event::EventQuery;

use super::Session;

pub async fn run(session: &Session, follow: bool, since: Option<&str>) -> Result<()> {
    let since = since.map(parse_since).transpose()?;
    let source = KubeEventSource::new(session.client.clone());
    let mut stream = source
        .events(&session.cluster, EventQuery { since, follow })
        .await?;

    let mut printed = 0usize;
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = tokio::signal::ctrl_c() => break,
        };
        match next {
            Some(Ok(event)) => {
                println!("{event}");
                printed += 1;
            }
            Some(Err(e)) => tracing::warn!(error = %e, "Event stream error"),
            None => break,
        }
    }

    if printed == 0 && !follow {
        println!("No events found for {}", session.cluster);
    }
    Ok(())
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("--since expects an RFC 3339 timestamp, got '{raw}'"))?;
    Ok(parsed.with_timezone(&Utc))
}
