//! Remote mirror: hosted JSON blob holding the shared product collection.
//!
//! DESIGN
//! ======
//! `RemoteMirror` is the seam the store talks to; `HttpMirror` speaks the
//! blob-store protocol over reqwest. `GET {url}/latest` returns the blob,
//! `PUT {url}` replaces it with `{"products": [...]}`. Both carry the
//! `X-Master-Key` header. Payload parsing is a pure function so it can be
//! tested without a server.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::MirrorConfig;
use crate::product::{Product, decode_collection};

/// Header carrying the mirror access key.
pub const ACCESS_KEY_HEADER: &str = "X-Master-Key";

// =============================================================================
// ERROR
// =============================================================================

/// Errors produced by mirror operations.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// The HTTP request could not be sent or its body not read.
    #[error("mirror request failed: {0}")]
    Request(String),

    /// The mirror answered with a non-success status.
    #[error("mirror response error: status {status}")]
    Status { status: u16, body: String },

    /// The mirror payload did not contain a product collection.
    #[error("mirror payload parse failed: {0}")]
    Parse(String),

    /// The HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl MirrorError {
    /// Whether a later attempt might succeed without intervention.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Status { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// MIRROR TRAIT
// =============================================================================

/// Remote copy of the collection. Enables mocking in tests.
#[async_trait::async_trait]
pub trait RemoteMirror: Send + Sync {
    /// Fetch the latest stored collection.
    ///
    /// # Errors
    ///
    /// Returns a [`MirrorError`] for transport failures, non-2xx answers and
    /// payloads without a product collection.
    async fn fetch(&self) -> Result<Vec<Product>, MirrorError>;

    /// Replace the stored collection.
    ///
    /// # Errors
    ///
    /// Returns a [`MirrorError`] for transport failures and non-2xx answers.
    async fn store(&self, products: &[Product]) -> Result<(), MirrorError>;
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

pub struct HttpMirror {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpMirror {
    /// # Errors
    ///
    /// Returns [`MirrorError::HttpClientBuild`] if reqwest rejects the
    /// client settings.
    pub fn new(config: &MirrorConfig) -> Result<Self, MirrorError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| MirrorError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, url: config.url.clone(), api_key: config.api_key.clone() })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, MirrorError> {
        let response = request
            .header(ACCESS_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| MirrorError::Request(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| MirrorError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(MirrorError::Status { status: status.as_u16(), body: text });
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl RemoteMirror for HttpMirror {
    async fn fetch(&self) -> Result<Vec<Product>, MirrorError> {
        let text = self.send(self.http.get(format!("{}/latest", self.url))).await?;
        parse_payload(&text)
    }

    async fn store(&self, products: &[Product]) -> Result<(), MirrorError> {
        let body = PutBody { products };
        self.send(self.http.put(&self.url).json(&body)).await?;
        Ok(())
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Serialize)]
struct PutBody<'a> {
    products: &'a [Product],
}

// =============================================================================
// PARSING
// =============================================================================

/// Extract the product collection from a mirror response body.
///
/// Accepted shapes, first match wins:
/// - `{"record": {"products": [...]}}`
/// - `{"record": [...]}`
/// - `{"products": [...]}`
/// - `[...]`
///
/// # Errors
///
/// Returns [`MirrorError::Parse`] for invalid JSON, a body matching none of
/// the shapes, or a collection with no usable records.
pub fn parse_payload(text: &str) -> Result<Vec<Product>, MirrorError> {
    let value: Value = serde_json::from_str(text).map_err(|e| MirrorError::Parse(e.to_string()))?;
    let collection = find_collection(value).ok_or_else(|| MirrorError::Parse("no product collection in payload".into()))?;
    let (products, normalized) = decode_collection(&collection).map_err(|e| MirrorError::Parse(e.to_string()))?;
    if normalized {
        debug!(count = products.len(), "mirror payload normalized");
    }
    Ok(products)
}

fn find_collection(value: Value) -> Option<Value> {
    match value {
        Value::Array(_) => Some(value),
        Value::Object(mut map) => {
            if let Some(record) = map.remove("record") {
                return match record {
                    Value::Array(_) => Some(record),
                    Value::Object(mut inner) => inner.remove("products").filter(Value::is_array),
                    _ => None,
                };
            }
            map.remove("products").filter(Value::is_array)
        }
        _ => None,
    }
}

#[cfg(test)]
#[path = "remote_test.rs"]
mod tests;
