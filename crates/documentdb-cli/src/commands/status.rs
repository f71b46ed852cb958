use anyhow::Result;
use chrono::Utc;

use documentdb_core::status;

use super::Session;
use crate::OutputFormat;

pub async fn run(session: &Session, output: OutputFormat) -> Result<()> {
    let reader = session.reader()?;
    let snapshot = reader.snapshot(&session.cluster).await?;
    let view = status::render(
        &snapshot,
        Utc::now(),
        session.config.promotion.convergence_timeout(),
    );

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
        OutputFormat::Table => print!("{view}"),
    }
    Ok(())
}
