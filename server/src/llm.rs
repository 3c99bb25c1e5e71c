use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::{LlmError, TransportError};
use crate::normalize::{content_pointer, Normalizer, SchemaVersion};
use crate::router::{DualEndpointRouter, FastRoute};
use crate::transport::{HttpSend, OutboundRequest, ReqwestSender, RetryPolicy, RetryingTransport, UpstreamResponse};

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub base_url: Url,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self { Self { role: "system".to_string(), content: content.into() } }
    pub fn user(content: impl Into<String>) -> Self { Self { role: "user".to_string(), content: content.into() } }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct RerankScore {
    pub index: usize,
    pub relevance_score: f64,
}

#[derive(Deserialize)]
struct RerankResponse { results: Vec<RerankScore> }

/// Chat-completion and rerank client. Requests always target the primary
/// endpoint; the router underneath moves fast-model calls elsewhere.
#[derive(Clone)]
pub struct LlmClient {
    stack: Arc<dyn HttpSend>,
    primary: Endpoint,
}

impl LlmClient {
    pub fn builder() -> LlmClientBuilder { LlmClientBuilder::default() }

    pub async fn chat_json(&self, model: &str, messages: &[ChatMessage]) -> Result<JsonValue, LlmError> {
        let payload = json!({
            "model": model,
            "messages": messages,
            "temperature": 0.0,
            "response_format": { "type": "json_object" },
        });
        let doc = self.post("chat/completions", &payload).await?;
        let pointer = content_pointer(&doc).ok_or(LlmError::MissingContent)?;
        let content = doc.pointer(&pointer).and_then(|v| v.as_str()).ok_or(LlmError::MissingContent)?;
        Ok(serde_json::from_str(content)?)
    }

    pub async fn rerank(&self, model: &str, query: &str, documents: &[String], top_n: usize) -> Result<Vec<RerankScore>, LlmError> {
        let payload = json!({ "model": model, "query": query, "documents": documents, "top_n": top_n });
        let doc = self.post("rerank", &payload).await?;
        let parsed: RerankResponse = serde_json::from_value(doc)?;
        Ok(parsed.results)
    }

    async fn post(&self, path: &str, payload: &JsonValue) -> Result<JsonValue, LlmError> {
        let url = endpoint_url(&self.primary.base_url, path)?;
        let mut request = OutboundRequest::post_json(url, payload)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.primary.api_key))
            .map_err(|e| TransportError::InvalidRequest(format!("api key: {}", e)))?;
        request.headers.insert(AUTHORIZATION, bearer);
        let UpstreamResponse { status, body, .. } = self.stack.send(request).await?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(LlmError::Status { status: status.as_u16(), body: text.chars().take(500).collect() });
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

/// `{base}/{path}` keeping any path prefix on the base (e.g. `/v1`).
pub fn endpoint_url(base: &Url, path: &str) -> Result<Url, TransportError> {
    let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), path.trim_start_matches('/'));
    Url::parse(&joined).map_err(|e| TransportError::InvalidRequest(format!("{}: {}", joined, e)))
}

pub struct LlmClientBuilder {
    primary: Option<Endpoint>,
    fast: Option<FastRoute>,
    policy: RetryPolicy,
    schema: SchemaVersion,
    request_timeout: Duration,
    network: Option<Arc<dyn HttpSend>>,
}

impl Default for LlmClientBuilder {
    fn default() -> Self {
        Self { primary: None, fast: None, policy: RetryPolicy::default(), schema: SchemaVersion::default(), request_timeout: Duration::from_secs(120), network: None }
    }
}

impl LlmClientBuilder {
    pub fn primary(mut self, endpoint: Endpoint) -> Self { self.primary = Some(endpoint); self }

    pub fn fast(mut self, model: impl Into<String>, endpoint: Endpoint) -> Self {
        self.fast = Some(FastRoute { model: model.into(), base_url: endpoint.base_url, api_key: endpoint.api_key });
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self { self.policy = policy; self }

    pub fn schema(mut self, schema: SchemaVersion) -> Self { self.schema = schema; self }

    pub fn request_timeout(mut self, timeout: Duration) -> Self { self.request_timeout = timeout; self }

    /// Replaces the bottom network layer.
    pub fn network(mut self, network: Arc<dyn HttpSend>) -> Self { self.network = Some(network); self }

    pub fn build(self) -> anyhow::Result<LlmClient> {
        let primary = self.primary.context("primary LLM endpoint is required")?;
        let network: Arc<dyn HttpSend> = match self.network {
            Some(n) => n,
            None => Arc::new(ReqwestSender::new(self.request_timeout).context("building HTTP client")?),
        };
        let retrying = RetryingTransport::new(network, self.policy, Normalizer::new(self.schema));
        let stack: Arc<dyn HttpSend> = Arc::new(DualEndpointRouter::new(retrying, self.fast));
        Ok(LlmClient { stack, primary })
    }
}
