//! Pipeline execution: `draftline run` and `draftline resume`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use draftline::checkpoint::SqliteCheckpointStore;
use draftline::config::DraftlineConfig;
use draftline::db::DbHandle;
use draftline::graph::standard_graph;
use draftline::orchestrator::RunSnapshot;
use draftline::services::{
    ChatCompletionsClient, Collaborators, LlmHumanizer, OrderRecord, OrderStore,
    PlainTextExtractor, SemanticScholarClient, ServiceGate, SqliteOrderStore, TextGenerator,
    Throttled, ZeroGptDetector,
};
use draftline::stage::standard_stages;
use draftline::state::{OrderBrief, OrderId, RunStatus};
use draftline::supervisor::Supervisor;
use serde::Deserialize;

/// Order file accepted by `draftline run`.
#[derive(Debug, Deserialize)]
struct OrderFile {
    #[serde(default)]
    order_id: Option<String>,
    #[serde(flatten)]
    brief: OrderBrief,
}

fn load_order(path: &Path) -> Result<(OrderId, OrderBrief)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read order file: {}", path.display()))?;
    let OrderFile { order_id, mut brief } = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse order file: {}", path.display()))?;

    // Attachments are listed relative to the order file.
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    brief.attachments = brief
        .attachments
        .into_iter()
        .map(|p| if p.is_absolute() { p } else { base.join(p) })
        .collect();

    let order_id = order_id
        .map(OrderId::new)
        .unwrap_or_else(|| OrderId::new(uuid::Uuid::new_v4().to_string()));
    Ok((order_id, brief))
}

/// Build the HTTP collaborators, each behind its throttle gate.
fn collaborators(config: &DraftlineConfig) -> Result<Collaborators> {
    let toml = &config.toml;
    let key_env = &toml.llm.api_key_env;
    let api_key = std::env::var(key_env)
        .with_context(|| format!("Set {} to the chat completions API key", key_env))?;
    let timeout = toml.request_timeout();

    let gate = |name: &str, settings: &draftline::config::GateSettings| {
        Arc::new(ServiceGate::new(
            name,
            settings.max_concurrent,
            settings.min_interval(),
        ))
    };

    let chat = ChatCompletionsClient::new(&toml.llm.base_url, api_key, &toml.llm.model, timeout)?;
    let generator: Arc<dyn TextGenerator> = Arc::new(Throttled::new(
        Arc::new(chat),
        gate("generation", &toml.throttle.generation),
    ));

    let mut search = SemanticScholarClient::new(timeout)?
        .with_api_key(std::env::var(&toml.services.search_api_key_env).ok());
    if let Some(url) = &toml.services.search_base_url {
        search = search.with_base_url(url);
    }

    let mut detector = ZeroGptDetector::new(timeout)?;
    if let Some(url) = &toml.services.detector_base_url {
        detector = detector.with_base_url(url);
    }

    Ok(Collaborators {
        generator: generator.clone(),
        search: Arc::new(Throttled::new(
            Arc::new(search),
            gate("search", &toml.throttle.search),
        )),
        detector: Arc::new(Throttled::new(
            Arc::new(detector),
            gate("detection", &toml.throttle.detection),
        )),
        humanizer: Arc::new(Throttled::new(
            Arc::new(LlmHumanizer::new(generator)),
            gate("humanization", &toml.throttle.humanization),
        )),
        extractor: Arc::new(PlainTextExtractor),
    })
}

struct Runtime {
    supervisor: Supervisor,
    orders: Arc<SqliteOrderStore>,
}

fn runtime(config: &DraftlineConfig) -> Result<Runtime> {
    for warning in config.validate() {
        tracing::warn!("Config: {}", warning);
    }

    let db = DbHandle::open(&config.db_path())?;
    let stages = standard_stages(&collaborators(config)?);
    let graph = standard_graph(stages, config.toml.loop_bounds())
        .context("Failed to build the stage graph")?;
    let orders = Arc::new(SqliteOrderStore::new(db.clone()));
    let supervisor = Supervisor::new(
        Arc::new(graph),
        Arc::new(SqliteCheckpointStore::new(db)),
        orders.clone(),
        config.toml.orchestrator_settings(),
        config.toml.thresholds(),
    );
    Ok(Runtime { supervisor, orders })
}

/// Print each checkpoint as it lands.
fn follow(supervisor: &Supervisor) -> tokio::task::JoinHandle<()> {
    let mut feed = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(snapshot) => print_progress(&snapshot),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "Progress feed lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn print_progress(snapshot: &RunSnapshot) {
    let stage = snapshot
        .stage
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "start".to_string());
    eprintln!(
        "  {} {} {} {}",
        console::style(format!("[{}]", snapshot.order_id)).dim(),
        console::style(format!("#{:<3}", snapshot.seq)).dim(),
        console::style(stage).cyan(),
        status_style(snapshot.status),
    );
}

fn status_style(status: RunStatus) -> console::StyledObject<&'static str> {
    match status {
        RunStatus::Running => console::style(status.as_str()).dim(),
        RunStatus::Completed => console::style(status.as_str()).green().bold(),
        RunStatus::Failed => console::style(status.as_str()).red().bold(),
        RunStatus::Cancelled => console::style(status.as_str()).yellow(),
    }
}

/// Wait for a run, cancelling it on Ctrl-C.
async fn wait_for(supervisor: &Supervisor, order_id: &OrderId) -> Result<RunSnapshot> {
    tokio::select! {
        result = supervisor.wait(order_id) => return Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", console::style("Interrupted; stopping at the next stage boundary").yellow());
            // The run may have finished in the meantime.
            if let Err(e) = supervisor.cancel_run(order_id).await {
                tracing::debug!(error = %e, "Nothing to cancel");
            }
        }
    }
    Ok(supervisor.wait(order_id).await?)
}

fn report(record: &OrderRecord, out: Option<&Path>) -> Result<()> {
    eprintln!();
    eprintln!(
        "{} {}",
        console::style(format!("Order {}", record.order_id)).bold(),
        status_style(record.status)
    );

    let degraded = record.degraded;
    for (flag, name) in [
        (degraded.length_degraded, "length"),
        (degraded.quality_degraded, "quality"),
        (degraded.originality_degraded, "originality"),
    ] {
        if flag {
            eprintln!(
                "  {} {} loop hit its bound; best effort delivered",
                console::style("⚠").yellow(),
                name
            );
        }
    }
    if let Some(failure) = &record.failure {
        eprintln!("  {} {}", console::style("Error:").red().bold(), failure);
    }

    let (text, kind) = match (&record.final_text, &record.recoverable_draft) {
        (Some(text), _) => (text, "final text"),
        (None, Some(draft)) => (draft, "recoverable draft"),
        (None, None) => return Ok(()),
    };
    match out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(path, text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("  Wrote {} to {}", kind, path.display());
        }
        None => println!("{}", text),
    }
    Ok(())
}

pub async fn cmd_run(config: &DraftlineConfig, order: &Path, out: Option<&Path>) -> Result<()> {
    let (order_id, brief) = load_order(order)?;
    let Runtime { supervisor, orders } = runtime(config)?;
    let progress = follow(&supervisor);

    eprintln!(
        "{} {}",
        console::style("Starting order").bold().cyan(),
        console::style(&order_id).bold()
    );
    supervisor.start_run(order_id.clone(), brief).await?;
    let snapshot = wait_for(&supervisor, &order_id).await?;
    progress.abort();

    let record = orders
        .get(&order_id)
        .await?
        .with_context(|| format!("Order {} has no record after its run", order_id))?;
    report(&record, out)?;

    if snapshot.status != RunStatus::Completed {
        anyhow::bail!("Order {} ended {}", order_id, snapshot.status);
    }
    Ok(())
}

pub async fn cmd_resume(config: &DraftlineConfig) -> Result<()> {
    let Runtime { supervisor, orders } = runtime(config)?;
    let progress = follow(&supervisor);

    let resumed = supervisor.resume_active().await?;
    if resumed.is_empty() {
        eprintln!("No interrupted runs to resume.");
        return Ok(());
    }
    eprintln!(
        "{} {} run(s)",
        console::style("Resuming").bold().cyan(),
        resumed.len()
    );

    let mut failed = Vec::new();
    for order_id in &resumed {
        let snapshot = wait_for(&supervisor, order_id).await?;
        if snapshot.status != RunStatus::Completed {
            failed.push(order_id.to_string());
        }
    }
    progress.abort();

    for order_id in &resumed {
        if let Some(record) = orders.get(order_id).await? {
            let out = output_path(config, order_id, &record);
            report(&record, Some(&out))?;
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("{} run(s) did not complete: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

/// Resumed runs write their text under `.draftline/output/`, one file per order.
fn output_path(config: &DraftlineConfig, order_id: &OrderId, record: &OrderRecord) -> PathBuf {
    let suffix = if record.final_text.is_some() { "final" } else { "draft" };
    config
        .config_dir
        .join("output")
        .join(format!("{}.{}.md", order_id, suffix))
}
