//! Payload codec: canonical JSON bytes, HMAC-SHA256 signatures and the
//! compressed at-rest form of queued payloads.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::error::DeliveryError;

type HmacSha256 = Hmac<Sha256>;

/// Serialize to JSON with object keys in sorted order, so the same payload
/// always produces the same bytes (and therefore the same signature).
pub fn to_canonical_json<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, DeliveryError> {
    // serde_json::Map is BTreeMap-backed, routing through Value sorts every level
    let value = serde_json::to_value(payload).map_err(|e| DeliveryError::Codec(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| DeliveryError::Codec(e.to_string()))
}

/// `base64(HMAC_SHA256(body, secret))`
pub fn sign(body: &[u8], secret: &str) -> Result<String, DeliveryError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::Codec(e.to_string()))?;
    mac.update(body);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a signature produced by [`sign`].
pub fn verify(body: &[u8], secret: &str, signature: &str) -> bool {
    let Ok(expected) = STANDARD.decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub fn compress(payload: &str) -> Result<Vec<u8>, DeliveryError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload.as_bytes())
        .map_err(|e| DeliveryError::Codec(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| DeliveryError::Codec(e.to_string()))
}

/// A missing compressed column decodes to `None`, not an error.
pub fn decompress(compressed: Option<&[u8]>) -> Result<Option<String>, DeliveryError> {
    let Some(bytes) = compressed else {
        return Ok(None);
    };
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(|e| DeliveryError::Codec(e.to_string()))?;
    Ok(Some(out))
}
