use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use reqwest::Url;

use crate::episodes::SweepSettings;
use crate::graph::ExtractionConfig;
use crate::llm::Endpoint;
use crate::normalize::SchemaVersion;
use crate::transport::{BackoffStrategy, RetryPolicy};

pub const DEFAULT_MAX_RESTORE_BYTES: usize = 512 * 1024 * 1024;

#[derive(clap::Parser, Debug, Default)]
#[command(name = "graph-memory-adapter", version, about = "Episodic memory over an LLM-built knowledge graph")]
pub struct Cli {
	/// Bind address for the HTTP server
	#[arg(long)]
	pub bind: Option<String>,

	/// Data directory root
	#[arg(long)]
	pub data_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub bind: SocketAddr,
	pub data_dir: String,
	pub llm: Endpoint,
	pub llm_model: String,
	pub fast: Endpoint,
	pub fast_model: String,
	pub reranker_model: Option<String>,
	pub retry: RetryPolicy,
	pub request_timeout: Duration,
	pub max_concurrent_ingest: usize,
	pub max_entities: usize,
	/// Largest archive body accepted by the restore route.
	pub max_restore_bytes: usize,
	pub sweep: SweepSettings,
	pub schema: SchemaVersion,
}

impl Config {
	/// `.env` first, then the process environment.
	pub fn load() -> anyhow::Result<Self> {
		let _ = dotenvy::dotenv();
		Self::from_lookup(|k| std::env::var(k).ok())
	}

	pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
		let var = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
		let ms = |k: &str, default: u64| Duration::from_millis(var(k).and_then(|v| v.parse().ok()).unwrap_or(default));

		let bind = match var("PORT").and_then(|p| p.parse::<u16>().ok()) {
			Some(p) => format!("127.0.0.1:{}", p),
			None => var("HTTP_BIND").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
		};
		let bind: SocketAddr = bind.parse().with_context(|| format!("invalid bind address '{}'", bind))?;
		let data_dir = var("DATA_DIR").unwrap_or_else(|| "./data".to_string());

		let llm = Endpoint {
			base_url: parse_url(&var("LLM_BASE_URL").unwrap_or_else(|| "http://127.0.0.1:8000/v1".to_string()))?,
			api_key: var("LLM_API_KEY").unwrap_or_default(),
		};
		let llm_model = var("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
		let fast = Endpoint {
			base_url: match var("LLM_FAST_BASE_URL") { Some(u) => parse_url(&u)?, None => llm.base_url.clone() },
			api_key: var("LLM_FAST_API_KEY").unwrap_or_else(|| llm.api_key.clone()),
		};
		let fast_model = var("LLM_FAST_MODEL").unwrap_or_else(|| llm_model.clone());

		let backoff = ms("LLM_RETRY_BACKOFF_MS", 5_000);
		let strategy = match var("LLM_RETRY_STRATEGY").as_deref().map(str::to_ascii_lowercase).as_deref() {
			None | Some("fixed") => BackoffStrategy::Fixed,
			Some("exponential") => BackoffStrategy::Exponential { max: ms("LLM_RETRY_MAX_BACKOFF_MS", 20_000), jitter: true },
			Some(other) => return Err(anyhow!("unknown LLM_RETRY_STRATEGY '{}'", other)),
		};
		let retry = RetryPolicy { backoff, budget: ms("LLM_RETRY_BUDGET_MS", 30_000), strategy };

		let schema = match var("NORMALIZER_SCHEMA") {
			Some(s) => SchemaVersion::from_str(&s).map_err(|e| anyhow!(e))?,
			None => SchemaVersion::default(),
		};

		Ok(Self {
			bind,
			data_dir,
			llm,
			llm_model,
			fast,
			fast_model,
			reranker_model: var("RERANKER_MODEL"),
			retry,
			request_timeout: ms("LLM_REQUEST_TIMEOUT_MS", 120_000),
			max_concurrent_ingest: var("MAX_CONCURRENT_INGEST").and_then(|v| v.parse().ok()).unwrap_or(4),
			max_entities: var("MAX_ENTITIES_PER_EPISODE").and_then(|v| v.parse().ok()).unwrap_or(20),
			max_restore_bytes: var("MAX_RESTORE_BYTES").and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_MAX_RESTORE_BYTES),
			sweep: SweepSettings {
				interval: ms("PENDING_SWEEP_INTERVAL_MS", 30 * 60 * 1000),
				initial_delay: ms("PENDING_SWEEP_INITIAL_DELAY_MS", 60 * 1000),
				stale_after: ms("PENDING_STALE_AFTER_MS", 30 * 60 * 1000),
			},
			schema,
		})
	}

	/// Command-line flags win over the environment.
	pub fn apply_cli(&mut self, cli: &Cli) -> anyhow::Result<()> {
		if let Some(bind) = cli.bind.as_deref() {
			self.bind = bind.parse().with_context(|| format!("invalid --bind '{}'", bind))?;
		}
		if let Some(dir) = cli.data_dir.as_deref() {
			self.data_dir = dir.to_string();
		}
		Ok(())
	}

	pub fn extraction(&self) -> ExtractionConfig {
		ExtractionConfig {
			model: self.llm_model.clone(),
			small_model: self.fast_model.clone(),
			reranker_model: self.reranker_model.clone(),
			max_entities: self.max_entities,
		}
	}

	/// Requests are routed by model name, so a fast tier needs a model of its own.
	pub fn has_distinct_fast_tier(&self) -> bool {
		self.fast_model != self.llm_model
	}
}

fn parse_url(raw: &str) -> anyhow::Result<Url> {
	Url::parse(raw).with_context(|| format!("invalid URL '{}'", raw))
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn load(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
		let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		Config::from_lookup(|k| env.get(k).cloned())
	}

	#[test]
	fn defaults() {
		let cfg = load(&[]).unwrap();
		assert_eq!(cfg.bind.to_string(), "127.0.0.1:8080");
		assert_eq!(cfg.retry, RetryPolicy::default());
		assert_eq!(cfg.max_concurrent_ingest, 4);
		assert_eq!(cfg.max_restore_bytes, DEFAULT_MAX_RESTORE_BYTES);
		assert_eq!(cfg.sweep.stale_after, Duration::from_secs(1800));
		assert_eq!(cfg.fast_model, cfg.llm_model);
		assert!(!cfg.has_distinct_fast_tier());
	}

	#[test]
	fn fast_tier_and_retry_overrides() {
		let cfg = load(&[
			("PORT", "9100"),
			("LLM_BASE_URL", "http://big:8000/v1"),
			("LLM_MODEL", "big"),
			("LLM_FAST_BASE_URL", "http://small:8001"),
			("LLM_FAST_MODEL", "small"),
			("LLM_RETRY_STRATEGY", "Exponential"),
			("LLM_RETRY_BUDGET_MS", "1000"),
		]).unwrap();
		assert_eq!(cfg.bind.port(), 9100);
		assert_eq!(cfg.fast.base_url.host_str(), Some("small"));
		assert!(cfg.has_distinct_fast_tier());
		assert!(matches!(cfg.retry.strategy, BackoffStrategy::Exponential { jitter: true, .. }));
		assert_eq!(cfg.retry.budget, Duration::from_secs(1));
		assert_eq!(cfg.extraction().small_model, "small");
	}

	#[test]
	fn bad_values_are_startup_errors() {
		assert!(load(&[("LLM_BASE_URL", "not a url")]).is_err());
		assert!(load(&[("HTTP_BIND", "nowhere")]).is_err());
		assert!(load(&[("LLM_RETRY_STRATEGY", "linear")]).is_err());
		assert!(load(&[("NORMALIZER_SCHEMA", "v9")]).is_err());
	}

	#[test]
	fn cli_overrides_env() {
		let mut cfg = load(&[]).unwrap();
		cfg.apply_cli(&Cli { bind: Some("0.0.0.0:7000".into()), data_dir: Some("/tmp/x".into()) }).unwrap();
		assert_eq!(cfg.bind.port(), 7000);
		assert_eq!(cfg.data_dir, "/tmp/x");
	}
}
