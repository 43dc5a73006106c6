use std::net::SocketAddr;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::redirect::Policy;
use serde_json::Value;
use tracing::debug;
use url::{Host, Url};

use crate::codec;
use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::ssrf::SsrfPolicy;

pub const HEADER_SIGNATURE: &str = "Webhook-Signature";
pub const HEADER_ORIGIN_BASE_URL: &str = "X-Origin-Base-URL";

/// Bytes of the response body kept; the rest is never read.
pub const MAX_RESPONSE_BODY_BYTES: usize = 4096;

/// Raw HTTP outcome. Judging success is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Signs and posts a payload to a destination URL
#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn post(
        &self,
        url: &str,
        payload: &Value,
        secret: Option<&str>,
    ) -> Result<TransportResponse, DeliveryError>;
}

pub struct HttpTransport {
    http_client: Client,
    policy: SsrfPolicy,
    origin_base_url: String,
    timeout: std::time::Duration,
}

impl HttpTransport {
    pub fn new(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        let timeout = config.timeout();
        Ok(Self {
            http_client: Self::client_builder(timeout)
                .build()
                .map_err(|e| DeliveryError::Internal(e.to_string()))?,
            policy: SsrfPolicy::from_config(config),
            origin_base_url: config.site_url.clone(),
            timeout,
        })
    }

    fn client_builder(timeout: std::time::Duration) -> reqwest::ClientBuilder {
        // A redirect could lead anywhere, including past the address policy
        Client::builder().timeout(timeout).redirect(Policy::none())
    }

    /// Client that connects only to the addresses already vetted by the
    /// policy, so a second DNS answer cannot swap in a private address.
    fn pinned_client(&self, url: &str, addrs: &[SocketAddr]) -> Result<Client, DeliveryError> {
        let parsed = Url::parse(url).map_err(|e| DeliveryError::InvalidUrl(e.to_string()))?;
        match parsed.host() {
            Some(Host::Domain(domain)) => Self::client_builder(self.timeout)
                .resolve_to_addrs(domain, addrs)
                .build()
                .map_err(|e| DeliveryError::Internal(e.to_string())),
            _ => Ok(self.http_client.clone()),
        }
    }
}

#[async_trait]
impl TransportClient for HttpTransport {
    async fn post(
        &self,
        url: &str,
        payload: &Value,
        secret: Option<&str>,
    ) -> Result<TransportResponse, DeliveryError> {
        let body = codec::to_canonical_json(payload)?;
        let signature = secret.map(|s| codec::sign(&body, s)).transpose()?;

        let addrs = self.policy.check(url).await?;
        let client = self.pinned_client(url, &addrs)?;

        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .header(HEADER_ORIGIN_BASE_URL, &self.origin_base_url);
        if let Some(signature) = signature {
            request = request.header(HEADER_SIGNATURE, signature);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = read_body_prefix(response, MAX_RESPONSE_BODY_BYTES).await;
        debug!(url, status, "Webhook POST completed");

        Ok(TransportResponse { status, body })
    }
}

/// Read at most `limit` bytes of the body. A read error ends the body early.
async fn read_body_prefix(mut response: reqwest::Response, limit: usize) -> String {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Response body read failed");
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
