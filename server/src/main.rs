use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{signal, task};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use graph_memory_adapter::api::{build_router, AppState};
use graph_memory_adapter::config::{Cli, Config};
use graph_memory_adapter::episodes::EpisodeManager;
use graph_memory_adapter::graph::KnowledgeGraph;
use graph_memory_adapter::llm::LlmClient;
use graph_memory_adapter::store::GraphStore;
use graph_memory_adapter::worker::JobQueue;

#[tokio::main]
async fn main() -> Result<()> {
	init_tracing();
	let cli = Cli::parse();
	let mut cfg = Config::load()?;
	cfg.apply_cli(&cli)?;

	let db_path = ensure_data_dir(&cfg.data_dir)?;
	let store = GraphStore::open(&db_path).with_context(|| format!("opening graph store at {}", db_path.display()))?;

	let mut llm = LlmClient::builder()
		.primary(cfg.llm.clone())
		.retry_policy(cfg.retry)
		.schema(cfg.schema)
		.request_timeout(cfg.request_timeout);
	if cfg.has_distinct_fast_tier() {
		llm = llm.fast(cfg.fast_model.clone(), cfg.fast.clone());
	}
	let llm = llm.build()?;
	info!(base_url = %cfg.llm.base_url, model = %cfg.llm_model, fast_model = %cfg.fast_model, reranker = ?cfg.reranker_model, "model server configured");

	let graph = Arc::new(KnowledgeGraph::new(llm, store.clone(), cfg.extraction()));
	let (queue, mut failures) = JobQueue::start(cfg.max_concurrent_ingest);
	let episodes = EpisodeManager::new(store.clone(), graph, queue, cfg.sweep);

	// Background job failures (pending placeholders stay for the sweep)
	task::spawn(async move {
		while let Some(f) = failures.recv().await {
			error!(job = %f.job, error = %f.error, "background job failed");
		}
	});
	task::spawn(episodes.clone().sweep_loop());

	let state = Arc::new(AppState { started: Instant::now(), store: store.clone(), episodes, max_restore_bytes: cfg.max_restore_bytes });
	let app = build_router(state);
	let listener = tokio::net::TcpListener::bind(cfg.bind).await.with_context(|| format!("binding {}", cfg.bind))?;
	info!(bind = %cfg.bind, data_dir = %cfg.data_dir, "Starting HTTP server");
	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("server error")?;

	info!("Shutdown signal received");
	store.flush()?;
	Ok(())
}

fn init_tracing() {
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = fmt::layer().with_target(false).with_ansi(false).with_writer(std::io::stderr);
	tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

fn ensure_data_dir(root: &str) -> Result<PathBuf> {
	let graph = PathBuf::from(root).join("graph");
	std::fs::create_dir_all(&graph).with_context(|| format!("creating {}", graph.display()))?;
	Ok(graph)
}

async fn shutdown_signal() {
	let _ = signal::ctrl_c().await;
}
