use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use documentdb_cluster::events::KubeEventSource;
use documentdb_core::outcome::PromotionOutcome;
use documentdb_core::status;
use documentdb_core::types::format_duration;
use documentdb_promote::{PromotionExecutor, PromotionReport, PromotionRequest};

use super::Session;

pub async fn run(session: &Session, target: &str, force: bool, timeout: Option<u64>) -> Result<()> {
    let mut config = session.config.clone();
    if let Some(secs) = timeout {
        config.promotion.convergence_timeout_ms = secs.saturating_mul(1000);
        config.validate()?;
    }
    let policy = config.promotion;

    let executor = PromotionExecutor::new(session.reader()?, policy.clone())
        .with_events(Arc::new(KubeEventSource::new(session.client.clone())));
    let request = PromotionRequest {
        cluster: session.cluster.clone(),
        target: target.to_string(),
        force,
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping promotion");
            on_signal.cancel();
        }
    });

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner} {msg}")?);
    pb.set_message(format!("Promoting {target} in {}", session.cluster));
    pb.enable_steady_tick(Duration::from_millis(120));

    let mut progress = executor.progress();
    let ticker = pb.clone();
    let watch_progress = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                changed = progress.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {}
            }
            if let Some(p) = progress.borrow().as_ref() {
                ticker.set_message(p.describe(Utc::now()));
            }
        }
    });

    let result = executor.promote(&request, &cancel).await;
    drop(executor);
    let _ = watch_progress.await;

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            pb.finish_and_clear();
            bail!("promotion not started: {e} [{}]", e.code());
        }
    };
    pb.finish_and_clear();

    print_report(&report, policy.convergence_timeout());

    match report.outcome.reason() {
        None => Ok(()),
        Some(reason) => bail!("promotion of {target} did not complete: {reason} [{}]", reason.code()),
    }
}

fn print_report(report: &PromotionReport, convergence_timeout: Duration) {
    if let Some(id) = &report.promotion_id {
        println!("Promotion: {id}");
    }
    for o in &report.overrides {
        println!("Override:  {} ({})", o.check, o.detail);
    }

    let start = report.history.first().map(|t| t.at);
    println!("\nPhases:");
    for t in &report.history {
        let offset = start
            .and_then(|s| (t.at - s).to_std().ok())
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        match &t.note {
            Some(note) => println!("  +{offset:<8} {} -> {}  {note}", t.from, t.to),
            None => println!("  +{offset:<8} {} -> {}", t.from, t.to),
        }
    }

    let view = status::render(report.outcome.snapshot(), Utc::now(), convergence_timeout);
    println!("\n{view}");

    if !report.audit.is_empty() {
        println!("Events:");
        for event in &report.audit {
            println!("  {event}");
        }
    }

    match &report.outcome {
        PromotionOutcome::Succeeded {
            new_primary,
            mutated: false,
            ..
        } => println!("\n{new_primary} is already the primary, nothing changed"),
        PromotionOutcome::Succeeded { new_primary, .. } => {
            println!("\n{new_primary} is now the primary")
        }
        PromotionOutcome::Failed { .. } => println!("\nResult: failed"),
        PromotionOutcome::Aborted { .. } => println!("\nResult: aborted"),
    }
}
