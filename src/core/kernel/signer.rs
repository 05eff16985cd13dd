use crate::core::errors::ExchangeError;
use crate::core::types::QueryParams;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the API key on every request when one is configured.
pub const API_KEY_HEADER: &str = "X-MBX-APIKEY";

/// Lowercase hex HMAC-SHA256 of `payload` keyed by `secret`.
///
/// Pure and deterministic: the same inputs always give the same signature.
pub fn sign(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::AuthError(format!("Failed to create HMAC: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Render parameters as `k=v` pairs joined with `&`, in order.
#[must_use]
pub fn build_query_string(params: &QueryParams) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Signer trait for request authentication
///
/// Given the canonical query string and the transmission timestamp, produce
/// the full query string that goes on the wire.
pub trait Signer: Send + Sync {
    fn sign_query(&self, query_string: &str, timestamp: u64) -> Result<String, ExchangeError>;
}

/// Appends `timestamp=<ms>` and then `signature=<hex>` over everything before it.
pub struct HmacSigner {
    secret_key: String,
}

impl HmacSigner {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
        }
    }
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner").finish_non_exhaustive()
    }
}

impl Signer for HmacSigner {
    fn sign_query(&self, query_string: &str, timestamp: u64) -> Result<String, ExchangeError> {
        let with_timestamp = if query_string.is_empty() {
            format!("timestamp={}", timestamp)
        } else {
            format!("{}&timestamp={}", query_string, timestamp)
        };

        let signature = sign(&self.secret_key, &with_timestamp)?;
        Ok(format!("{}&signature={}", with_timestamp, signature))
    }
}

/// Wall-clock source, in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Result<u64, ExchangeError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> Result<u64, ExchangeError> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .map_err(|e| ExchangeError::Other(format!("System time error: {}", e)))
    }
}

/// A clock stuck at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now_ms(&self) -> Result<u64, ExchangeError> {
        Ok(self.0)
    }
}
