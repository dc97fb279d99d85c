use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use doc_analyzer::config::{Config, EmbeddingBackend};
use doc_analyzer::db::Database;
use doc_analyzer::embedding::{Embedder, HashEmbedder, OllamaEmbedder};
use doc_analyzer::events::{AuditSink, EventLog};
use doc_analyzer::gateway::TaskGateway;
use doc_analyzer::query::QueryService;
use doc_analyzer::queue::{JobQueue, SqliteJobQueue};
use doc_analyzer::reaper::start_reaper_task;
use doc_analyzer::routes::{router, AppState};
use doc_analyzer::storage::{LocalStorage, StorageResolver};
use doc_analyzer::worker::{run_worker, ProcessorConfig, TaskProcessor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(role = ?config.role, "Starting doc-analyzer...");

    let db = Database::new(&config.database_path)
        .with_context(|| format!("failed to open task store at {}", config.database_path))?;
    let queue: Arc<dyn JobQueue> = Arc::new(
        SqliteJobQueue::new(&config.queue_database_path, config.queue_config())
            .with_context(|| format!("failed to open job queue at {}", config.queue_database_path))?,
    );

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("failed to create upload dir {}", config.upload_dir))?;
    let storage = LocalStorage::new(&config.upload_dir);

    let events = EventLog::new(db.clone(), 100);
    let audit: Arc<dyn AuditSink> = Arc::new(events.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();

    if config.role.runs_workers() {
        let embedder: Arc<dyn Embedder> = match config.embedding_backend {
            EmbeddingBackend::Ollama => {
                tracing::info!(url = %config.ollama_url, model = %config.embedding_model, "using ollama embeddings");
                Arc::new(
                    OllamaEmbedder::new(
                        &config.ollama_url,
                        &config.embedding_model,
                        config.embed_timeout,
                    )
                    .context("failed to build embedding client")?,
                )
            }
            EmbeddingBackend::Hash => {
                tracing::info!("using hashed bag-of-words embeddings");
                Arc::new(HashEmbedder)
            }
        };
        let resolver: Arc<dyn StorageResolver> = Arc::new(storage.clone());
        let processor = TaskProcessor::new(
            db.clone(),
            resolver,
            embedder,
            audit.clone(),
            ProcessorConfig {
                embed_timeout: config.embed_timeout,
                ..ProcessorConfig::default()
            },
        );

        for n in 0..config.worker_count.max(1) {
            let worker_id = format!("worker-{}-{}", std::process::id(), n);
            background.push(tokio::spawn(run_worker(
                worker_id,
                queue.clone(),
                processor.clone(),
                shutdown_rx.clone(),
            )));
        }

        background.push(tokio::spawn(start_reaper_task(
            queue.clone(),
            config.reaper_interval,
            shutdown_rx.clone(),
        )));
    }

    if config.role.runs_api() {
        let state = AppState {
            gateway: TaskGateway::new(db.clone(), queue.clone(), audit.clone()),
            query: QueryService::new(db.clone()),
            storage,
            queue: queue.clone(),
            events,
            max_upload_size: config.max_upload_size,
        };
        let app = router(state);

        let addr = format!("0.0.0.0:{}", config.port);
        tracing::info!("Server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server error")?;
    } else {
        shutdown_signal().await;
    }

    tracing::info!("Shutting down, waiting for workers to finish current jobs");
    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            tracing::error!("background task panicked: {}", e);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
}
