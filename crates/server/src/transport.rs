use axum::body::Body;
use config::KubernetesConfig;
use http::{HeaderMap, Request, Response};
use url::Url;

/// Headers that must not be copied between the client connection and the
/// upstream connection (RFC 9110 section 7.6.1).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    #[error("invalid upstream request: {0}")]
    Request(String),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("failed to assemble upstream response: {0}")]
    Response(#[from] http::Error),
}

/// Forwards a rewritten request to the Kubernetes API server.
///
/// Behind a trait so pipeline tests can capture what would have been sent
/// without a live API server.
#[async_trait::async_trait]
pub(crate) trait KubeTransport: Send + Sync {
    async fn forward(&self, req: Request<Body>) -> Result<Response<Body>, TransportError>;
}

/// Streaming reqwest-based transport. Request and response bodies are piped
/// through without buffering so `kubectl logs -f` and large manifests work.
pub(crate) struct ReqwestTransport {
    client: reqwest::Client,
    base: Url,
}

impl ReqwestTransport {
    pub(crate) fn new(kubernetes: &KubernetesConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();

        if let Some(ca_path) = &kubernetes.ca_path {
            let pem = std::fs::read(ca_path)
                .map_err(|e| anyhow::anyhow!("failed to read CA bundle {}: {e}", ca_path.display()))?;

            for certificate in reqwest::Certificate::from_pem_bundle(&pem)? {
                builder = builder.add_root_certificate(certificate);
            }
        }

        if kubernetes.insecure_skip_verify {
            log::warn!("API server certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            client: builder.build()?,
            base: kubernetes.host.clone(),
        })
    }

    fn target_url(&self, req: &Request<Body>) -> Result<Url, TransportError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        self.base
            .join(path_and_query)
            .map_err(|e| TransportError::Request(format!("invalid request path: {e}")))
    }
}

#[async_trait::async_trait]
impl KubeTransport for ReqwestTransport {
    async fn forward(&self, req: Request<Body>) -> Result<Response<Body>, TransportError> {
        let url = self.target_url(&req)?;
        let (parts, body) = req.into_parts();

        let mut upstream = self
            .client
            .request(parts.method, url)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()));

        for (name, value) in end_to_end_headers(&parts.headers) {
            upstream = upstream.header(name, value);
        }

        let response = upstream.send().await?;

        let mut builder = Response::builder().status(response.status());

        for (name, value) in end_to_end_headers(response.headers()) {
            builder = builder.header(name, value);
        }

        Ok(builder.body(Body::from_stream(response.bytes_stream()))?)
    }
}

fn end_to_end_headers(headers: &HeaderMap) -> impl Iterator<Item = (&http::HeaderName, &http::HeaderValue)> {
    headers
        .iter()
        .filter(|(name, _)| name != &http::header::HOST && !HOP_BY_HOP_HEADERS.contains(&name.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("host", "proxy.example.com".parse().unwrap());
        headers.insert("accept", "application/json".parse().unwrap());

        let kept: Vec<_> = end_to_end_headers(&headers).map(|(name, _)| name.as_str()).collect();

        assert_eq!(kept, vec!["accept"]);
    }
}
