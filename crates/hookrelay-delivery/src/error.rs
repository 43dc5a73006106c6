use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Destination resolves to an address the SSRF policy forbids.
    /// No network attempt has been made.
    #[error("Destination address is private or disallowed: {0}")]
    PrivateAddress(String),

    #[error("Invalid destination URL: {0}")]
    InvalidUrl(String),

    #[error("Transport failed: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Destination not found: {0}")]
    DestinationNotFound(i64),

    #[error("Payload codec error: {0}")]
    Codec(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Mail delivery failed: {0}")]
    Mail(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Failures that must never be retried against the same destination URL.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::PrivateAddress(_) | Self::InvalidUrl(_))
    }
}
