// Entry point of the moderation engine.
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Start the periodic sweeper
// 4. Run the event loop: one JSON message per stdin line in, one JSON
//    verdict per stdout line out

use anyhow::Context;
use chat_sentinel::core::moderation::{
    Collaborators, InboundMessage, KeyValueStore, PolicyEngine, Sweeper, Verdict,
};
use chat_sentinel::infra::moderation::{
    InMemoryKvStore, KvErrorReporter, PerspectiveScorer, SqliteKvStore, TracingActions,
};
use chat_sentinel::settings::EngineSettings;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

/// Verdicts waiting to be written before producers are back-pressured.
const OUTPUT_BUFFER: usize = 256;

async fn open_store(settings: &EngineSettings) -> Arc<dyn KeyValueStore> {
    match SqliteKvStore::connect(&settings.database_url).await {
        Ok(store) => {
            tracing::info!(database_url = %settings.database_url, "Using SQLite store");
            Arc::new(store)
        }
        Err(e) => {
            // Moderation keeps running; policies and strikes just won't persist.
            tracing::warn!(error = %e, "SQLite store unavailable, falling back to in-memory store");
            Arc::new(InMemoryKvStore::new())
        }
    }
}

async fn write_verdicts(mut rx: mpsc::Receiver<Verdict>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(verdict) = rx.recv().await {
        let mut line = serde_json::to_vec(&verdict)?;
        line.push(b'\n');
        stdout.write_all(&line).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn run_event_loop(engine: Arc<PolicyEngine>) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel::<Verdict>(OUTPUT_BUFFER);
    let writer = tokio::spawn(write_verdicts(rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let message: InboundMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed input line");
                continue;
            }
        };

        let engine = Arc::clone(&engine);
        let tx = tx.clone();
        in_flight.spawn(async move {
            if let Some(verdict) = engine.process(&message).await {
                let _ = tx.send(verdict).await;
            }
        });

        // Reap finished runs so the set doesn't grow without bound.
        while let Some(result) = in_flight.try_join_next() {
            if let Err(e) = result {
                tracing::error!(error = %e, "Pipeline task panicked");
            }
        }
    }

    while let Some(result) = in_flight.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Pipeline task panicked");
        }
    }

    drop(tx);
    writer.await.context("verdict writer task")??;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging on stderr; stdout carries verdicts.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = EngineSettings::from_env().context("invalid configuration")?;

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================

    let store = open_store(&settings).await;
    let scorer = Arc::new(PerspectiveScorer::new(
        settings.scorer_api_key.clone(),
        settings.scorer_timeout(),
    ));
    let reporter = Arc::new(KvErrorReporter::new(
        Arc::clone(&store),
        settings.max_error_log_entries,
    ));
    let actions = Arc::new(TracingActions::new());

    let collaborators = Collaborators::new(store, scorer, actions, reporter);
    let engine = Arc::new(PolicyEngine::new(settings.to_engine_config(), collaborators));

    let sweeper = Sweeper::start(Arc::clone(&engine), settings.sweep_interval());
    tracing::info!("Moderation engine ready, reading messages from stdin");

    let result = tokio::select! {
        result = run_event_loop(Arc::clone(&engine)) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, shutting down");
            Ok(())
        }
    };

    sweeper.stop().await;
    result
}
