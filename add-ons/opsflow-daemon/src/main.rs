//! opsflow daemon (operator console + background workers)
//!
//! Reads operator lines from stdin. `<thread> <message>` submits a message; commands start
//! with `:`: `:status <thread>`, `:approve <item> [reviewer]`, `:reject <item> <reason>`,
//! `:cancel <thread>`, `:pending`, `:quit`. A ledger listener resumes threads when items are
//! decided, and a timer collects expired checkpoints.

use std::path::Path as StdPath;
use std::sync::Arc;
use std::time::Duration;

use opsflow_core::gateway::{ChatCompletionsModel, HttpWorkloadApi};
use opsflow_core::graph::HttpGraphBackend;
use opsflow_core::{
    CoreConfig, Decision, Gateway, GraphBackend, GraphQueryService, InMemoryGraph, LanguageModel,
    OpsError, Orchestrator, SubmitOutcome,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Checkpoint GC cadence unless `OPSFLOW_GC_INTERVAL_SECS` overrides it.
const DEFAULT_GC_INTERVAL_SECS: u64 = 3_600;
const CONSOLE_REVIEWER: &str = "console";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[opsflow-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CoreConfig::load()?;
    config.validate()?;
    let gc_every = std::env::var("OPSFLOW_GC_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_GC_INTERVAL_SECS)
        .max(1);

    // sled is single-writer: one daemon per storage path.
    let db = sled::open(StdPath::new(&config.storage_path).join("opsflow.db"))?;

    let model: Option<Arc<dyn LanguageModel>> = if config.llm.base_url.trim().is_empty() {
        tracing::info!("no language model configured; responses are template-only");
        None
    } else {
        Some(Arc::new(ChatCompletionsModel::new(
            config.llm.api_key.clone(),
            &config.llm.model,
        )))
    };
    let workload = Arc::new(HttpWorkloadApi::new(config.workload.api_token.clone()));
    let gateway = Arc::new(Gateway::new(&config, workload, model)?);

    let backend: Arc<dyn GraphBackend> = if config.graph.base_url.trim().is_empty() {
        tracing::warn!("graph.base_url not set; dependency queries run against an empty graph");
        Arc::new(InMemoryGraph::new())
    } else {
        Arc::new(HttpGraphBackend::new(Arc::clone(&gateway)))
    };
    let graph = Arc::new(GraphQueryService::new(backend, &config));
    let engine = Arc::new(Orchestrator::new(config.clone(), &db, gateway, graph)?);

    let listener = tokio::spawn(Arc::clone(&engine).run_ledger_listener());
    let gc = tokio::spawn(collect_garbage(
        Arc::clone(&engine),
        Duration::from_secs(gc_every),
    ));

    tracing::info!(
        profile = ?config.profile,
        storage_path = %config.storage_path,
        gc_interval_secs = gc_every,
        "opsflow daemon started"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&engine, line.trim()).await {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down daemon");
                break;
            }
        }
    }

    listener.abort();
    gc.abort();
    db.flush_async().await?;
    Ok(())
}

/// Returns false when the console should exit.
async fn handle_line(engine: &Orchestrator, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let (head, rest) = line
        .split_once(char::is_whitespace)
        .map(|(h, r)| (h, r.trim()))
        .unwrap_or((line, ""));

    let result: Result<String, OpsError> = match head {
        ":quit" | ":exit" => return false,
        ":pending" => list_pending(engine).await,
        ":status" => engine.get_thread_status(rest).await.and_then(|summary| {
            serde_json::to_string_pretty(&summary).map_err(OpsError::from)
        }),
        ":approve" => {
            let (item, reviewer) = rest.split_once(' ').unwrap_or((rest, CONSOLE_REVIEWER));
            engine
                .decide_audit_item(item, Decision::Approve, reviewer.trim())
                .await
                .map(render)
        }
        ":reject" => {
            let (item, reason) = rest
                .split_once(' ')
                .unwrap_or((rest, "rejected from the console"));
            let decision = Decision::Reject {
                reason: reason.trim().to_string(),
            };
            engine
                .decide_audit_item(item, decision, CONSOLE_REVIEWER)
                .await
                .map(render)
        }
        ":cancel" => engine.cancel_thread(rest).await.map(render),
        cmd if cmd.starts_with(':') => Ok(format!("unknown command {}", cmd)),
        thread if rest.is_empty() => Ok(format!("usage: {} <message>", thread)),
        thread => engine.submit_message(thread, rest).await.map(render),
    };

    match result {
        Ok(out) => println!("{}", out),
        Err(e) => {
            tracing::debug!(error = %e, "console command failed");
            println!("error: {}", e.user_message());
        }
    }
    true
}

fn render(outcome: SubmitOutcome) -> String {
    match outcome {
        SubmitOutcome::Response {
            text,
            correlation_id,
        } => format!("{}\n  [ref {}]", text, correlation_id),
        SubmitOutcome::PendingApproval { item_id, message } => {
            format!("{}\n  [approve with `:approve {}`]", message, item_id)
        }
        SubmitOutcome::ClarificationNeeded { question } => question,
    }
}

async fn list_pending(engine: &Orchestrator) -> Result<String, OpsError> {
    let items = engine.ledger().pending().await?;
    if items.is_empty() {
        return Ok("no pending audit items".to_string());
    }
    Ok(items
        .iter()
        .map(|item| format!("{}  thread={}  {}", item.id, item.thread_id, item.payload))
        .collect::<Vec<_>>()
        .join("\n"))
}

async fn collect_garbage(engine: Arc<Orchestrator>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // First tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        match engine.collect_expired_checkpoints().await {
            Ok(removed) => tracing::debug!(removed, "checkpoint gc pass finished"),
            Err(e) => tracing::warn!(error = %e, "checkpoint gc failed"),
        }
        let purged = engine.graph().purge_expired();
        tracing::debug!(purged, "query cache sweep finished");
    }
}
