//! Read-only views: `draftline status`, `draftline checkpoints`, `draftline orders`.

use anyhow::Result;

use draftline::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use draftline::config::DraftlineConfig;
use draftline::db::DbHandle;
use draftline::orchestrator::RunSnapshot;
use draftline::services::{OrderStore, SqliteOrderStore};
use draftline::state::{OrderId, RunStatus};

fn open(config: &DraftlineConfig) -> Result<DbHandle> {
    DbHandle::open(&config.db_path())
}

fn status_label(status: RunStatus) -> console::StyledObject<&'static str> {
    match status {
        RunStatus::Running => console::style(status.as_str()).cyan(),
        RunStatus::Completed => console::style(status.as_str()).green(),
        RunStatus::Failed => console::style(status.as_str()).red(),
        RunStatus::Cancelled => console::style(status.as_str()).yellow(),
    }
}

pub async fn cmd_status(config: &DraftlineConfig, order_id: &str) -> Result<()> {
    let db = open(config)?;
    let store = SqliteCheckpointStore::new(db.clone());
    let order_id = OrderId::from(order_id);

    let Some(latest) = store.load(&order_id).await? else {
        anyhow::bail!("No checkpoints found for order {}", order_id);
    };
    let snapshot = RunSnapshot::from(&latest);
    let state = &latest.state;

    println!();
    println!("{}", console::style(format!("Order {}", order_id)).bold().cyan());
    println!("  status:     {}", status_label(snapshot.status));
    println!(
        "  stage:      {}",
        snapshot
            .stage
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "(not started)".to_string())
    );
    println!("  checkpoint: #{} at {}", snapshot.seq, snapshot.at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  terminal:   {}", snapshot.terminal);
    if let Some(words) = state.word_count() {
        match state.length_window() {
            Some(window) => println!("  words:      {} (target {}-{})", words, window.low, window.high),
            None => println!("  words:      {}", words),
        }
    }
    if let Some(score) = state.originality_score() {
        println!("  ai score:   {:.1}%", score);
    }
    let loops = state.loops();
    println!(
        "  loops:      length {} / quality {} / originality {}",
        loops.length, loops.quality, loops.originality
    );
    if snapshot.degraded.any() {
        println!(
            "  degraded:   {}",
            console::style(format!("{:?}", snapshot.degraded)).yellow()
        );
    }
    if let Some(error) = state.error() {
        println!("  error:      {} {}", console::style(&error.kind).red(), error.message);
    }

    let orders = SqliteOrderStore::new(db);
    if let Some(record) = orders.get(&order_id).await? {
        println!("  reported:   {} at {}", record.status, record.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();
    Ok(())
}

pub async fn cmd_checkpoints(config: &DraftlineConfig, order_id: &str) -> Result<()> {
    let store = SqliteCheckpointStore::new(open(config)?);
    let order_id = OrderId::from(order_id);

    let history = store.history(&order_id).await?;
    if history.is_empty() {
        anyhow::bail!("No checkpoints found for order {}", order_id);
    }

    println!();
    println!("{}", console::style(format!("Checkpoints for {}", order_id)).bold().cyan());
    for checkpoint in &history {
        let stage = checkpoint
            .stage
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "start".to_string());
        println!(
            "  #{:<4} {:<22} {:<10} v{:<4} {}",
            checkpoint.seq,
            stage,
            status_label(checkpoint.status()),
            checkpoint.state.version(),
            console::style(checkpoint.created_at.format("%H:%M:%S")).dim()
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_orders(config: &DraftlineConfig) -> Result<()> {
    let orders = SqliteOrderStore::new(open(config)?);
    let records = orders.list().await?;
    if records.is_empty() {
        println!("No orders recorded yet.");
        return Ok(());
    }

    println!();
    for record in &records {
        let marker = if record.degraded.any() {
            console::style(" degraded").yellow().to_string()
        } else {
            String::new()
        };
        println!(
            "  {:<38} {:<10}{} {}",
            record.order_id.to_string(),
            status_label(record.status),
            marker,
            console::style(record.updated_at.format("%Y-%m-%d %H:%M")).dim()
        );
    }
    println!();
    Ok(())
}
