//! Remote authority boundary.
//!
//! The engine consumes one idempotency-friendly operation per
//! (domain, action) pair. Every replay carries the queue item's UUID as
//! `X-Idempotency-Key`, so the remote side can deduplicate a retry whose
//! first response was lost. Any error, timeout, or non-2xx response is
//! retryable from the engine's perspective.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;

use crate::catalog::Product;
use crate::customers::Customer;
use crate::error::NetworkError;
use crate::queue::{Action, Domain, QueueItem};

/// Default timeout for remote requests. The drainer additionally bounds
/// each call with its own per-item timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the remote authority base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Strip trailing slashes again (in case "/api/" was present)
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Connection string import
// ---------------------------------------------------------------------------

/// Credentials decoded from a compact pairing string issued by the admin
/// dashboard: either raw JSON or URL-safe base64 of the same JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDetails {
    pub api_key: String,
    pub base_url: Option<String>,
    pub terminal_id: Option<String>,
}

fn decode_connection_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Decode a pairing string into connection details. Returns `None` when the
/// string is neither JSON nor base64-encoded JSON with a `key` field.
pub fn decode_connection_string(raw: &str) -> Option<ConnectionDetails> {
    let payload = decode_connection_payload(raw)?;
    let api_key = payload
        .get("key")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())?;
    let base_url = payload
        .get("url")
        .and_then(Value::as_str)
        .map(normalize_base_url)
        .filter(|s| !s.is_empty());
    let terminal_id = payload
        .get("tid")
        .or_else(|| payload.get("terminalId"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    Some(ConnectionDetails {
        api_key,
        base_url,
        terminal_id,
    })
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into the engine taxonomy.
fn friendly_error(url: &str, err: &reqwest::Error) -> NetworkError {
    if err.is_timeout() {
        return NetworkError::Timeout {
            url: url.to_string(),
        };
    }
    if err.is_connect() {
        return NetworkError::Unreachable {
            url: url.to_string(),
            detail: "connection failed".to_string(),
        };
    }
    NetworkError::Unreachable {
        url: url.to_string(),
        detail: err.to_string(),
    }
}

/// Convert an HTTP status code into an operator-facing message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Remote authority endpoint not found".to_string(),
        409 => "Duplicate submission rejected by remote authority".to_string(),
        s if s >= 500 => format!("Remote authority server error (HTTP {s})"),
        s => format!("Unexpected response from remote authority (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Consumed contract with the remote system-of-record.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Replay one queued mutation. The item's UUID is the idempotency key:
    /// submitting the same item twice must produce one net remote effect.
    async fn submit(&self, item: &QueueItem) -> Result<(), NetworkError>;

    /// Fetch the authoritative product catalog for a full resync.
    async fn fetch_catalog(&self) -> Result<Vec<Product>, NetworkError>;

    /// Fetch the authoritative customer list for a full resync.
    async fn fetch_customers(&self) -> Result<Vec<Customer>, NetworkError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: String,
    pub terminal_id: String,
}

impl RemoteConfig {
    pub fn new(base_url: &str, api_key: &str, terminal_id: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
            terminal_id: terminal_id.trim().to_string(),
        }
    }
}

pub struct HttpRemote {
    config: RemoteConfig,
    client: Client,
}

impl HttpRemote {
    pub fn new(config: RemoteConfig) -> Result<Self, NetworkError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| NetworkError::Client(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Map a (domain, action) pair onto its remote operation.
    fn endpoint_for(&self, domain: Domain, action: Action, entity_id: &str) -> (Method, String) {
        let base = &self.config.base_url;
        let collection = match domain {
            Domain::Order => "orders",
            Domain::Customer => "customers",
            Domain::Product => "products",
            Domain::Inventory => "inventory/transactions",
        };
        match action {
            Action::Create => (Method::POST, format!("{base}/api/pos/{collection}")),
            Action::Update => (
                Method::PUT,
                format!("{base}/api/pos/{collection}/{entity_id}"),
            ),
            Action::Delete => (
                Method::DELETE,
                format!("{base}/api/pos/{collection}/{entity_id}"),
            ),
        }
    }

    async fn fetch_collection(&self, path: &str, key: &str) -> Result<Value, NetworkError> {
        let url = format!("{}{}", self.config.base_url, path);
        let resp = self
            .client
            .get(&url)
            .header("X-POS-API-Key", &self.config.api_key)
            .header("x-terminal-id", &self.config.terminal_id)
            .send()
            .await
            .map_err(|e| friendly_error(&url, &e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NetworkError::Status {
                status: status.as_u16(),
                message: status_error(status),
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| NetworkError::InvalidResponse(e.to_string()))?;

        // Accept either a bare array or an object wrapping one.
        match body {
            Value::Array(_) => Ok(body),
            Value::Object(ref obj) => obj
                .get(key)
                .cloned()
                .ok_or_else(|| NetworkError::InvalidResponse(format!("missing `{key}` field"))),
            _ => Err(NetworkError::InvalidResponse(
                "expected an array or object body".to_string(),
            )),
        }
    }
}

#[async_trait]
impl RemoteAuthority for HttpRemote {
    async fn submit(&self, item: &QueueItem) -> Result<(), NetworkError> {
        let (method, url) = self.endpoint_for(item.domain, item.action, &item.entity_id);

        let mut req = self
            .client
            .request(method, &url)
            .header("X-POS-API-Key", &self.config.api_key)
            .header("x-terminal-id", &self.config.terminal_id)
            .header("X-Idempotency-Key", &item.id);

        if item.action != Action::Delete {
            req = req.json(&item.payload);
        }

        let resp = req.send().await.map_err(|e| friendly_error(&url, &e))?;
        let status = resp.status();

        if !status.is_success() {
            // Preserve the response detail for the queue item's last_error.
            let body_text = resp.text().await.unwrap_or_default();
            let message = if let Ok(json) = serde_json::from_str::<Value>(&body_text) {
                json.get("error")
                    .or_else(|| json.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| status_error(status))
            } else if !body_text.trim().is_empty() {
                format!("{}: {}", status_error(status), body_text.trim())
            } else {
                status_error(status)
            };
            return Err(NetworkError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }

    async fn fetch_catalog(&self) -> Result<Vec<Product>, NetworkError> {
        let body = self.fetch_collection("/api/pos/products", "products").await?;
        serde_json::from_value(body).map_err(|e| NetworkError::InvalidResponse(e.to_string()))
    }

    async fn fetch_customers(&self) -> Result<Vec<Customer>, NetworkError> {
        let body = self
            .fetch_collection("/api/pos/customers", "customers")
            .await?;
        serde_json::from_value(body).map_err(|e| NetworkError::InvalidResponse(e.to_string()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("admin.example.com"),
            "https://admin.example.com"
        );
        assert_eq!(
            normalize_base_url("https://admin.example.com/"),
            "https://admin.example.com"
        );
        assert_eq!(
            normalize_base_url("https://admin.example.com/api/"),
            "https://admin.example.com"
        );
        assert_eq!(
            normalize_base_url("localhost:3000"),
            "http://localhost:3000"
        );
    }

    #[test]
    fn test_decode_connection_string_json_and_base64() {
        let json = r#"{"key": "sk-123", "url": "admin.example.com/api", "tid": "term-9"}"#;
        let details = decode_connection_string(json).expect("json form decodes");
        assert_eq!(details.api_key, "sk-123");
        assert_eq!(
            details.base_url.as_deref(),
            Some("https://admin.example.com")
        );
        assert_eq!(details.terminal_id.as_deref(), Some("term-9"));

        let encoded = BASE64_STANDARD.encode(json);
        let details = decode_connection_string(&encoded).expect("base64 form decodes");
        assert_eq!(details.api_key, "sk-123");

        assert!(decode_connection_string("not a connection string").is_none());
        assert!(decode_connection_string(r#"{"url": "x.example.com"}"#).is_none());
    }

    #[test]
    fn test_endpoint_mapping_per_domain_and_action() {
        let remote = HttpRemote::new(RemoteConfig::new(
            "https://admin.example.com",
            "sk-123",
            "term-1",
        ))
        .expect("client builds");

        let (method, url) = remote.endpoint_for(Domain::Order, Action::Create, "ord-1");
        assert_eq!(method, Method::POST);
        assert_eq!(url, "https://admin.example.com/api/pos/orders");

        let (method, url) = remote.endpoint_for(Domain::Customer, Action::Update, "cust-1");
        assert_eq!(method, Method::PUT);
        assert_eq!(url, "https://admin.example.com/api/pos/customers/cust-1");

        let (method, url) = remote.endpoint_for(Domain::Product, Action::Delete, "p-1");
        assert_eq!(method, Method::DELETE);
        assert_eq!(url, "https://admin.example.com/api/pos/products/p-1");

        let (method, url) = remote.endpoint_for(Domain::Inventory, Action::Create, "t-1");
        assert_eq!(method, Method::POST);
        assert_eq!(
            url,
            "https://admin.example.com/api/pos/inventory/transactions"
        );
    }

    #[test]
    fn test_status_error_messages() {
        assert_eq!(
            status_error(StatusCode::UNAUTHORIZED),
            "API key is invalid or expired"
        );
        assert_eq!(status_error(StatusCode::FORBIDDEN), "Terminal not authorized");
        assert!(status_error(StatusCode::INTERNAL_SERVER_ERROR).contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_submit_maps_connection_failure() {
        // Nothing listens on this port; the request must fail as unreachable
        // (or a timeout on slow CI), never panic.
        let remote = HttpRemote::new(RemoteConfig::new(
            "http://127.0.0.1:1",
            "sk-123",
            "term-1",
        ))
        .expect("client builds");

        let item = QueueItem {
            id: "q-1".to_string(),
            domain: Domain::Order,
            entity_id: "ord-1".to_string(),
            action: Action::Create,
            payload: serde_json::json!({ "id": "ord-1" }),
            status: crate::queue::Status::Pending,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            enqueued_at: String::new(),
            updated_at: String::new(),
            completed_at: None,
        };

        let err = remote.submit(&item).await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Unreachable { .. } | NetworkError::Timeout { .. }
        ));
    }
}
