//! Device pairing against the backend
//!
//! Pairing ties a device to an account through a short human-readable code
//! and ends with a signed client certificate for mTLS:
//!
//! ```text
//! UNPAIRED -> REQUESTED -> CONFIRMED -> CERT_ISSUED
//!                        \-> EXPIRED -> UNPAIRED
//! ```
//!
//! The backend returning 404 for a code means the code expired or was never
//! known; the caller discards it and requests a new one.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use hexmon_common::{Error, Result};

use crate::certs::{CertificateManager, CsrOptions, DeviceCredentials};
use crate::http::HttpClient;
use crate::snapshot::parser::{opt_str, opt_u64};

/// Pairing lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Unpaired,
    Requested,
    Confirmed,
    CertIssued,
    Expired,
}

/// Device description submitted with the code request
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_label: String,
    pub width: u32,
    pub height: u32,
    pub orientation: String,
    pub aspect_ratio: String,
    pub model: String,
    pub codecs: Vec<String>,
}

/// Issued pairing code
#[derive(Debug, Clone)]
pub struct PairingCode {
    pub pairing_code: String,
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
}

impl PairingCode {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Pairing workflow against the backend pairing endpoints
pub struct PairingService {
    http: Arc<HttpClient>,
    certs: Arc<CertificateManager>,
    state: RwLock<PairingState>,
}

impl PairingService {
    pub fn new(http: Arc<HttpClient>, certs: Arc<CertificateManager>) -> Self {
        Self {
            http,
            certs,
            state: RwLock::new(PairingState::Unpaired),
        }
    }

    pub async fn state(&self) -> PairingState {
        *self.state.read().await
    }

    /// Request a pairing code for this device.
    ///
    /// The backend replies with the code, the assigned device id, and an
    /// expiry as either an absolute `expiresAt` or a relative `expiresIn`
    /// (seconds).
    pub async fn request_pairing_code(&self, info: &DeviceInfo) -> Result<PairingCode> {
        let body = self.http.post_json("/v1/device/pairing/code", info).await?;

        let pairing_code = opt_str(&body, &["pairing_code", "pairingCode", "code"])
            .ok_or_else(|| Error::Parse("pairing response lacks pairingCode".to_string()))?;
        let device_id = opt_str(&body, &["device_id", "deviceId"])
            .ok_or_else(|| Error::Parse("pairing response lacks deviceId".to_string()))?;

        let expires_at = opt_str(&body, &["expires_at", "expiresAt"])
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                opt_u64(&body, &["expires_in", "expiresIn"])
                    .map(|secs| Utc::now() + Duration::seconds(secs as i64))
            })
            .unwrap_or_else(|| Utc::now() + Duration::minutes(10));

        *self.state.write().await = PairingState::Requested;
        info!("Pairing code issued for device {device_id}, expires {expires_at}");

        Ok(PairingCode {
            pairing_code,
            device_id,
            expires_at,
        })
    }

    /// Poll the pairing status of an issued code.
    ///
    /// Returns `Ok(true)` once the operator confirmed the code. A backend
    /// 404 marks the code expired and resets the state machine.
    pub async fn fetch_pairing_status(&self, code: &PairingCode) -> Result<bool> {
        let path = format!(
            "/v1/device/pairing/status?code={}&device_id={}",
            code.pairing_code, code.device_id
        );
        let body = match self.http.get_json(&path).await {
            Ok(body) => body,
            Err(Error::NotFound(detail)) => {
                // Code expired or unknown; a new request_pairing_code call
                // moves the machine back through UNPAIRED -> REQUESTED.
                *self.state.write().await = PairingState::Expired;
                return Err(Error::NotFound(detail));
            }
            Err(e) => return Err(e),
        };

        let paired = body
            .get("paired")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if paired {
            *self.state.write().await = PairingState::Confirmed;
        }
        debug!("Pairing status for {}: paired={paired}", code.device_id);
        Ok(paired)
    }

    /// Submit the CSR for a confirmed code and store the issued
    /// certificate chain.
    pub async fn submit_pairing(&self, code: &PairingCode) -> Result<DeviceCredentials> {
        let key_pem = self.certs.ensure_keypair().await?;
        let csr_pem = self
            .certs
            .build_csr(&key_pem, &CsrOptions::for_device(Some(&code.device_id)))?;

        let body = self
            .http
            .post_json(
                "/v1/device/pairing/complete",
                &serde_json::json!({
                    "code": code.pairing_code,
                    "deviceId": code.device_id,
                    "csr": csr_pem,
                }),
            )
            .await?;

        let cert_pem = opt_str(&body, &["certificate", "client_cert", "clientCert", "cert"])
            .ok_or_else(|| Error::Parse("pairing completion lacks certificate".to_string()))?;
        let ca_pem = opt_str(&body, &["ca", "ca_cert", "caCert"])
            .ok_or_else(|| Error::Parse("pairing completion lacks CA certificate".to_string()))?;

        let metadata = self.certs.store_issued(&cert_pem, &ca_pem)?;
        *self.state.write().await = PairingState::CertIssued;
        info!(
            "Pairing complete for device {}, certificate valid until {}",
            code.device_id, metadata.valid_to
        );

        Ok(DeviceCredentials {
            device_id: code.device_id.clone(),
            key_pem,
            cert_pem,
            ca_pem,
            metadata,
        })
    }
}
