//! Outbound HTTP to model servers.
//!
//! Every layer implements [`HttpSend`], so the stack is assembled by wrapping:
//! [`crate::router::DualEndpointRouter`] over [`RetryingTransport`] over
//! [`ReqwestSender`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::normalize::Normalizer;

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    pub fn post_json<T: Serialize + ?Sized>(url: Url, payload: &T) -> Result<Self, TransportError> {
        let body = serde_json::to_vec(payload).map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Self { method: Method::POST, url, headers, body: Bytes::from(body) })
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[async_trait]
pub trait HttpSend: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<UpstreamResponse, TransportError>;
}

#[async_trait]
impl<T: HttpSend + ?Sized> HttpSend for Arc<T> {
    async fn send(&self, request: OutboundRequest) -> Result<UpstreamResponse, TransportError> {
        (**self).send(request).await
    }
}

/// The network itself.
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new(request_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpSend for ReqwestSender {
    async fn send(&self, request: OutboundRequest) -> Result<UpstreamResponse, TransportError> {
        let url = request.url.to_string();
        let resp = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| TransportError::Connect { url: url.clone(), source: Box::new(e) })?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| TransportError::Body { url, source: Box::new(e) })?;
        Ok(UpstreamResponse { status, headers, body })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    Fixed,
    /// Doubles per retry up to `max`; with `jitter` each delay is drawn from `[d/2, d]`.
    Exponential { max: Duration, jitter: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub backoff: Duration,
    /// Wall-clock bound on the whole exchange, retries included.
    pub budget: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { backoff: Duration::from_secs(5), budget: Duration::from_secs(30), strategy: BackoffStrategy::Fixed }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.backoff,
            BackoffStrategy::Exponential { max, jitter } => {
                let factor = 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
                let delay = self.backoff.saturating_mul(factor).min(max);
                if jitter && delay > Duration::ZERO {
                    let half = delay / 2;
                    let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
                    half + Duration::from_millis(spread)
                } else {
                    delay
                }
            }
        }
    }
}

pub fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Retries transient failures and normalizes successful bodies.
pub struct RetryingTransport<S> {
    inner: S,
    policy: RetryPolicy,
    normalizer: Normalizer,
}

impl<S: HttpSend> RetryingTransport<S> {
    pub fn new(inner: S, policy: RetryPolicy, normalizer: Normalizer) -> Self {
        Self { inner, policy, normalizer }
    }

    fn normalize(&self, mut resp: UpstreamResponse) -> UpstreamResponse {
        if let Some(body) = self.normalizer.normalize_body(&resp.body) {
            if resp.headers.contains_key(CONTENT_LENGTH) {
                resp.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            }
            resp.body = Bytes::from(body);
        }
        resp
    }
}

#[async_trait]
impl<S: HttpSend> HttpSend for RetryingTransport<S> {
    async fn send(&self, request: OutboundRequest) -> Result<UpstreamResponse, TransportError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let last = match self.inner.send(request.clone()).await {
                Ok(resp) if resp.status == StatusCode::OK => {
                    if attempt > 1 {
                        debug!(attempt, url = %request.url, "upstream recovered");
                    }
                    return Ok(self.normalize(resp));
                }
                Ok(resp) if !is_retryable(resp.status) => return Ok(resp),
                Ok(resp) => {
                    warn!(attempt, status = resp.status.as_u16(), url = %request.url, elapsed_ms = started.elapsed().as_millis() as u64, "retryable upstream status");
                    Ok(resp)
                }
                Err(err @ TransportError::InvalidRequest(_)) => return Err(err),
                Err(err) => {
                    warn!(attempt, error = %err, elapsed_ms = started.elapsed().as_millis() as u64, "upstream call failed");
                    Err(err)
                }
            };
            let elapsed = started.elapsed();
            if elapsed >= self.policy.budget {
                warn!(attempt, url = %request.url, "retry budget exhausted");
                return last;
            }
            // the final retry lands at the budget, never past it
            sleep(self.policy.delay_for(attempt - 1).min(self.policy.budget - elapsed)).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn request() -> OutboundRequest {
        let url = Url::parse("http://model.local/v1/chat/completions").unwrap();
        OutboundRequest::post_json(url, &serde_json::json!({"model": "m", "messages": []})).unwrap()
    }

    fn transport(sender: Arc<ScriptedSender>) -> RetryingTransport<Arc<ScriptedSender>> {
        RetryingTransport::new(sender, RetryPolicy::default(), Normalizer::default())
    }

    const VALID: &str = r#"{"choices":[{"message":{"role":"assistant","content":"{\"extracted_entities\":[],\"edges\":[]}"}}]}"#;

    #[tokio::test(start_paused = true)]
    async fn recovers_after_two_server_errors() {
        let sender = Arc::new(ScriptedSender::new(vec![response(503, "busy"), response(500, "boom"), response(200, VALID)]));
        let t = transport(sender.clone());
        let started = Instant::now();
        let resp = t.send(request()).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, Bytes::from(VALID));
        assert_eq!(sender.calls(), 3);
        // two fixed backoff sleeps of 5s each
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_failure_when_budget_runs_out() {
        let sender = Arc::new(ScriptedSender::new((0..20).map(|_| response(503, "busy")).collect()));
        let t = transport(sender.clone());
        let started = Instant::now();
        let resp = t.send(request()).await.unwrap();
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() >= RetryPolicy::default().budget);
        assert!(sender.calls() >= 2 && sender.calls() < 20);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_returned_without_sleeping() {
        let sender = Arc::new(ScriptedSender::new(vec![response(404, "no such model"), response(200, VALID)]));
        let t = transport(sender.clone());
        let started = Instant::now();
        let resp = t.send(request()).await.unwrap();
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(sender.calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn too_many_requests_is_retried() {
        let sender = Arc::new(ScriptedSender::new(vec![response(429, "slow down"), response(200, VALID)]));
        let resp = transport(sender.clone()).send(request()).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(sender.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_errors_are_retried_then_raised() {
        let sender = Arc::new(ScriptedSender::new(vec![refused(), response(200, VALID)]));
        let resp = transport(sender.clone()).send(request()).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);

        let sender = Arc::new(ScriptedSender::new((0..20).map(|_| refused()).collect()));
        let err = transport(sender.clone()).send(request()).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn success_body_is_normalized_with_headers_kept() {
        let fenced = r#"{"choices":[{"message":{"role":"assistant","content":"```json\n[{\"name\": \"Ada\"}]\n```"}}]}"#;
        let sender = Arc::new(ScriptedSender::new(vec![response(200, fenced)]));
        let resp = transport(sender).send(request()).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(resp.headers.get(CONTENT_LENGTH).unwrap(), &HeaderValue::from(resp.body.len()));
        let doc: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        let content: serde_json::Value = serde_json::from_str(doc["choices"][0]["message"]["content"].as_str().unwrap()).unwrap();
        assert_eq!(content["extracted_entities"][0]["name"], "Ada");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_never_sleeps_past_the_budget() {
        let policy = RetryPolicy {
            backoff: Duration::from_secs(1),
            budget: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential { max: Duration::from_secs(60), jitter: false },
        };
        let sender = Arc::new(ScriptedSender::new((0..20).map(|_| response(503, "busy")).collect()));
        let t = RetryingTransport::new(sender.clone(), policy, Normalizer::default());
        let started = Instant::now();
        let resp = t.send(request()).await.unwrap();
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        // attempts at 0s, 1s, 3s, 7s, then 10s instead of 15s
        assert_eq!(sender.calls(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            backoff: Duration::from_secs(1),
            budget: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential { max: Duration::from_secs(8), jitter: false },
        };
        let delays: Vec<u64> = (0..6).map(|r| policy.delay_for(r).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
        let jittered = RetryPolicy { strategy: BackoffStrategy::Exponential { max: Duration::from_secs(8), jitter: true }, ..policy };
        for r in 0..6 {
            let d = jittered.delay_for(r);
            let full = policy.delay_for(r);
            assert!(d >= full / 2 && d <= full);
        }
    }
}
