//! Backend HTTP transport
//!
//! One `reqwest` client per credential generation. When device credentials
//! are present they are attached as mTLS material; the pairing endpoints run
//! on a credential-less client. Responses are classified into the shared
//! error taxonomy so upstream components can branch on failure class.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use hexmon_common::{Error, Result};

use crate::certs::DeviceCredentials;

/// Default timeout applied to every request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a reachability probe
#[derive(Debug, Clone)]
pub struct ConnectivityReport {
    /// True when the backend answered at all, regardless of status
    pub online: bool,
    /// HTTP status of the probe response, when one arrived
    pub status: Option<u16>,
    /// Round-trip latency of the probe
    pub latency_ms: Option<u64>,
    /// Transport error description when offline
    pub error: Option<String>,
}

/// mTLS-capable backend HTTP client
pub struct HttpClient {
    client: reqwest::Client,
    base: String,
    has_credentials: bool,
}

impl HttpClient {
    /// Build a client without device credentials (pairing phase)
    pub fn new(base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            has_credentials: false,
        })
    }

    /// Build a client presenting the device certificate as mTLS material
    pub fn with_credentials(base: &str, credentials: &DeviceCredentials) -> Result<Self> {
        let identity_pem = format!("{}{}", credentials.key_pem, credentials.cert_pem);
        let identity = reqwest::Identity::from_pem(identity_pem.as_bytes())
            .map_err(|e| Error::Certificate(format!("invalid client identity: {e}")))?;
        let ca = reqwest::Certificate::from_pem(credentials.ca_pem.as_bytes())
            .map_err(|e| Error::Certificate(format!("invalid CA certificate: {e}")))?;

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .add_root_certificate(ca)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;

        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            has_credentials: true,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn has_credentials(&self) -> bool {
        self.has_credentials
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// GET an API path and return the parsed JSON body
    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.url(path);
        debug!("GET {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Self::json_or_error(response).await
    }

    /// POST a JSON payload to an API path and return the parsed JSON body
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<serde_json::Value> {
        let url = self.url(path);
        debug!("POST {url}");
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Self::json_or_error(response).await
    }

    /// POST a JSON payload to an absolute URL (request-queue replay)
    pub async fn post_absolute(&self, url: &str, payload: &serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::from_api_status(status.as_u16(), &body))
        }
    }

    /// GET an absolute URL without status classification.
    ///
    /// Used for signed media URLs, where 401/403 means URL expiry rather
    /// than a device credential problem; the cache applies its own
    /// classification.
    pub async fn get_absolute(&self, url: &str) -> Result<reqwest::Response> {
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))
    }

    /// Probe backend reachability against the default-media endpoint, the
    /// one documented route that needs no device id.
    ///
    /// Any HTTP answer counts as online; only transport failures count as
    /// offline.
    pub async fn check_connectivity(&self) -> ConnectivityReport {
        let started = Instant::now();
        match self
            .client
            .get(self.url("/api/v1/settings/default-media"))
            .send()
            .await
        {
            Ok(response) => ConnectivityReport {
                online: true,
                status: Some(response.status().as_u16()),
                latency_ms: Some(started.elapsed().as_millis() as u64),
                error: None,
            },
            Err(e) => ConnectivityReport {
                online: false,
                status: None,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }

    async fn json_or_error(response: reqwest::Response) -> Result<serde_json::Value> {
        let status = response.status();
        if status.is_success() {
            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| Error::Parse(e.to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::from_api_status(status.as_u16(), &body))
        }
    }
}

/// Shared handle over the current credential generation's client.
///
/// Pairing and certificate renewal swap in a rebuilt client; every component
/// resolves the client through this handle at call time.
pub struct Backend {
    client: RwLock<Arc<HttpClient>>,
}

impl Backend {
    pub fn new(client: HttpClient) -> Self {
        Self {
            client: RwLock::new(Arc::new(client)),
        }
    }

    pub async fn client(&self) -> Arc<HttpClient> {
        self.client.read().await.clone()
    }

    pub async fn replace(&self, client: HttpClient) {
        *self.client.write().await = Arc::new(client);
    }
}
