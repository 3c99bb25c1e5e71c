use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::Url;
use tracing::debug;

use crate::error::TransportError;
use crate::transport::{HttpSend, OutboundRequest, UpstreamResponse};

/// Backend that serves requests for one designated "fast" model.
#[derive(Debug, Clone)]
pub struct FastRoute {
    pub model: String,
    pub base_url: Url,
    pub api_key: String,
}

/// Sends requests naming the fast model to the fast backend; everything else
/// goes to whatever the request already targets.
pub struct DualEndpointRouter<S> {
    inner: S,
    fast: Option<FastRoute>,
}

impl<S: HttpSend> DualEndpointRouter<S> {
    pub fn new(inner: S, fast: Option<FastRoute>) -> Self { Self { inner, fast } }

    pub fn route(&self, mut request: OutboundRequest) -> Result<OutboundRequest, TransportError> {
        let Some(fast) = self.fast.as_ref() else { return Ok(request) };
        if requested_model(&request.body).as_deref() != Some(fast.model.as_str()) {
            return Ok(request);
        }
        swap_origin(&mut request.url, &fast.base_url)?;
        // overwritten unconditionally: primary and fast keys may look alike
        let bearer = HeaderValue::from_str(&format!("Bearer {}", fast.api_key))
            .map_err(|e| TransportError::InvalidRequest(format!("fast-tier api key: {}", e)))?;
        request.headers.insert(AUTHORIZATION, bearer);
        debug!(model = %fast.model, url = %request.url, "routed to fast endpoint");
        Ok(request)
    }
}

#[async_trait]
impl<S: HttpSend> HttpSend for DualEndpointRouter<S> {
    async fn send(&self, request: OutboundRequest) -> Result<UpstreamResponse, TransportError> {
        let request = self.route(request)?;
        self.inner.send(request).await
    }
}

/// `model` field of a JSON request body, if there is one.
pub fn requested_model(body: &[u8]) -> Option<String> {
    let doc: serde_json::Value = serde_json::from_slice(body).ok()?;
    doc.get("model")?.as_str().map(|s| s.to_string())
}

/// Replaces scheme, host and port; path and query stay.
fn swap_origin(url: &mut Url, origin: &Url) -> Result<(), TransportError> {
    let message = format!("cannot reroute {} to {}", url, origin);
    let invalid = |_: ()| TransportError::InvalidRequest(message.clone());
    if url.scheme() != origin.scheme() {
        url.set_scheme(origin.scheme()).map_err(invalid)?;
    }
    url.set_host(origin.host_str()).map_err(|_| TransportError::InvalidRequest(message.clone()))?;
    url.set_port(origin.port()).map_err(invalid)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::testing::{response, ScriptedSender};
    use bytes::Bytes;

    fn fast() -> FastRoute {
        FastRoute { model: "qwen-small".to_string(), base_url: Url::parse("https://fast.example:9443/ignored/path").unwrap(), api_key: "sk-fast".to_string() }
    }

    fn request(body: &str) -> OutboundRequest {
        let mut req = OutboundRequest::post_json(Url::parse("http://primary.local:8000/v1/chat/completions?x=1").unwrap(), &()).unwrap();
        req.body = Bytes::from(body.to_string());
        req.headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-primary"));
        req
    }

    #[test]
    fn fast_model_swaps_origin_and_key() {
        let router = DualEndpointRouter::new(Arc::new(ScriptedSender::default()), Some(fast()));
        let routed = router.route(request(r#"{"model": "qwen-small", "messages": []}"#)).unwrap();
        assert_eq!(routed.url.as_str(), "https://fast.example:9443/v1/chat/completions?x=1");
        assert_eq!(routed.headers.get(AUTHORIZATION).unwrap(), "Bearer sk-fast");
        assert_eq!(routed.method, reqwest::Method::POST);
    }

    #[test]
    fn other_models_stay_on_primary() {
        let router = DualEndpointRouter::new(Arc::new(ScriptedSender::default()), Some(fast()));
        for body in [r#"{"model": "llama-70b"}"#, "not json", r#"{"messages": []}"#, ""] {
            let routed = router.route(request(body)).unwrap();
            assert_eq!(routed.url.as_str(), "http://primary.local:8000/v1/chat/completions?x=1");
            assert_eq!(routed.headers.get(AUTHORIZATION).unwrap(), "Bearer sk-primary");
        }
    }

    #[test]
    fn without_fast_route_nothing_changes() {
        let router = DualEndpointRouter::new(Arc::new(ScriptedSender::default()), None);
        let routed = router.route(request(r#"{"model": "qwen-small"}"#)).unwrap();
        assert_eq!(routed.url.host_str(), Some("primary.local"));
    }

    #[tokio::test]
    async fn forwards_rerouted_request() {
        let sender = Arc::new(ScriptedSender::new(vec![response(200, "{}")]));
        let router = DualEndpointRouter::new(sender.clone(), Some(fast()));
        router.send(request(r#"{"model": "qwen-small"}"#)).await.unwrap();
        let seen = sender.seen.lock().unwrap();
        assert_eq!(seen[0].url.host_str(), Some("fast.example"));
    }
}
