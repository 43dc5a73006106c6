//! Ad hoc "send one sample payload now" used by operators to check a URL.

use serde::Serialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;

use crate::error::DeliveryError;
use crate::transport::TransportClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Banner {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestSendOutcome {
    pub banner: Banner,
    pub message: String,
    /// `None` when no response was received
    pub status: Option<u16>,
}

/// Sample body; always carries a top-level `timestamp`.
pub fn sample_payload(now: OffsetDateTime) -> Result<Value, DeliveryError> {
    let timestamp = now
        .format(&Rfc3339)
        .map_err(|e| DeliveryError::Internal(e.to_string()))?;
    Ok(json!({
        "test.webhook": [{
            "message": "This is a test payload sent to verify the webhook endpoint.",
        }],
        "timestamp": timestamp,
    }))
}

/// Post the sample payload and translate the outcome into a banner.
///
/// An address rejected by the SSRF policy gets its own message so it is
/// never mistaken for an unreachable endpoint.
pub async fn send_test(
    transport: &dyn TransportClient,
    url: &str,
    secret: Option<&str>,
    now: OffsetDateTime,
) -> Result<TestSendOutcome, DeliveryError> {
    let payload = sample_payload(now)?;
    let outcome = match transport.post(url, &payload, secret).await {
        Ok(response) => {
            let status = response.status;
            let (banner, message) = match status {
                200..=299 => (
                    Banner::Success,
                    format!("Test payload delivered (HTTP {status})"),
                ),
                300..=399 => (
                    Banner::Warning,
                    format!("Endpoint answered with a redirect (HTTP {status}); redirects are not followed"),
                ),
                400..=499 => (
                    Banner::Warning,
                    format!("Endpoint rejected the test payload (HTTP {status}, client error)"),
                ),
                500..=599 => (
                    Banner::Error,
                    format!("Endpoint failed to process the test payload (HTTP {status}, server error)"),
                ),
                _ => (
                    Banner::Warning,
                    format!("Endpoint answered with an unexpected status (HTTP {status})"),
                ),
            };
            TestSendOutcome {
                banner,
                message,
                status: Some(status),
            }
        }
        Err(DeliveryError::PrivateAddress(addr)) => TestSendOutcome {
            banner: Banner::Error,
            message: format!(
                "The URL points at a private or disallowed address ({addr}) and was not contacted"
            ),
            status: None,
        },
        Err(DeliveryError::InvalidUrl(e)) => TestSendOutcome {
            banner: Banner::Error,
            message: format!("The URL is not a valid http(s) URL: {e}"),
            status: None,
        },
        Err(DeliveryError::Transport(e)) => TestSendOutcome {
            banner: Banner::Error,
            message: format!("Could not reach the endpoint: {e}"),
            status: None,
        },
        Err(e) => return Err(e),
    };

    info!(url, banner = ?outcome.banner, status = ?outcome.status, "Test payload sent");
    Ok(outcome)
}
