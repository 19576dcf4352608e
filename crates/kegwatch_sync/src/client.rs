//! Cloud inventory API client.

use std::future::Future;
use std::time::Duration;

use kegwatch_protocol::DeliveryKey;
use thiserror::Error;
use tracing::debug;

/// Delivery failures, split by retry eligibility the same way the queue
/// treats them: network problems and server errors are worth retrying,
/// everything else is not.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {detail}")]
    Http { status: u16, detail: String },

    #[error("client setup failed: {0}")]
    Setup(String),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Http { status, .. } => *status >= 500 || *status == 429,
            SyncError::Setup(_) => false,
        }
    }

    /// Did the failure happen before the server answered at all?
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}

/// The cloud endpoint consumed by the flush worker. Idempotent on the
/// delivery key: replaying the same key must not double-count upstream.
pub trait CloudApi: Send + Sync {
    /// POST one pallet record body. `Ok(())` is the ack.
    fn post_record(
        &self,
        payload_json: &str,
        delivery_key: &DeliveryKey,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;

    /// Cheap reachability check used while the worker believes it is
    /// offline. Default: assume reachable and let the POST find out.
    fn probe(&self) -> impl Future<Output = bool> + Send {
        async { true }
    }
}

/// reqwest-backed client for the inventory endpoint.
pub struct HttpCloudApi {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCloudApi {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("kegwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Setup(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    fn base_url(&self) -> String {
        match reqwest::Url::parse(&self.endpoint) {
            Ok(url) => {
                let mut base = format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""));
                if let Some(port) = url.port() {
                    base.push_str(&format!(":{port}"));
                }
                base
            }
            Err(_) => self.endpoint.clone(),
        }
    }
}

impl CloudApi for HttpCloudApi {
    async fn post_record(
        &self,
        payload_json: &str,
        delivery_key: &DeliveryKey,
    ) -> Result<(), SyncError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("X-Delivery-Key", delivery_key.as_str())
            .body(payload_json.to_string())
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(key = %delivery_key, %status, "record delivered");
            return Ok(());
        }

        let detail = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(200)
            .collect();
        Err(SyncError::Http {
            status: status.as_u16(),
            detail,
        })
    }

    async fn probe(&self) -> bool {
        match self.client.get(self.base_url()).send().await {
            // Any answer short of a server error means the host is back.
            Ok(response) => response.status().as_u16() < 500,
            Err(_) => false,
        }
    }
}
