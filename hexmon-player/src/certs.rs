//! Device credential lifecycle
//!
//! Generates the RSA-2048 device keypair, builds the PKCS#10 CSR submitted
//! during pairing, stores the issued client certificate and CA, and answers
//! validity/renewal questions for the rest of the runtime.
//!
//! Credential files are owned exclusively by this module: `client.key`,
//! `client.crt`, `ca.crt` (all 0600), `client.csr`, and `cert-meta.json`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rcgen::{CertificateParams, DnType, KeyPair};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use hexmon_common::fsutil;
use hexmon_common::{Error, Result};

/// RSA modulus size for the device keypair
const KEY_BITS: usize = 2048;

/// Organization name placed in every CSR subject
pub const CSR_ORGANIZATION: &str = "HexmonSignage";

/// Parsed metadata of the issued client certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertMetadata {
    /// Lowercase hex SHA-256 of the certificate DER
    pub fingerprint: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub subject: String,
    pub issuer: String,
    pub serial: String,
}

/// Complete credential material for mTLS requests
#[derive(Clone)]
pub struct DeviceCredentials {
    pub device_id: String,
    pub key_pem: String,
    pub cert_pem: String,
    pub ca_pem: String,
    pub metadata: CertMetadata,
}

impl std::fmt::Debug for DeviceCredentials {
    // Key material stays out of logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("device_id", &self.device_id)
            .field("fingerprint", &self.metadata.fingerprint)
            .field("valid_to", &self.metadata.valid_to)
            .finish_non_exhaustive()
    }
}

/// CSR subject fields
#[derive(Debug, Clone, Default)]
pub struct CsrOptions {
    pub common_name: String,
    pub organizational_unit: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub country: Option<String>,
}

impl CsrOptions {
    /// Subject for a paired device: CN = deviceId, falling back to the
    /// hostname when no device id is known yet.
    pub fn for_device(device_id: Option<&str>) -> Self {
        let common_name = device_id
            .map(str::to_string)
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "hexmon-device".to_string());
        Self {
            common_name,
            ..Self::default()
        }
    }
}

/// Manages keypair, CSR and certificate files under one directory
pub struct CertificateManager {
    dir: PathBuf,
}

impl CertificateManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join("client.key")
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join("client.crt")
    }

    pub fn ca_path(&self) -> PathBuf {
        self.dir.join("ca.crt")
    }

    pub fn csr_path(&self) -> PathBuf {
        self.dir.join("client.csr")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join("cert-meta.json")
    }

    /// Load the persisted private key, generating and storing a new
    /// RSA-2048 key when none exists.
    ///
    /// Key generation is CPU-bound and runs on a blocking worker so the
    /// control loop keeps serving commands meanwhile.
    pub async fn ensure_keypair(&self) -> Result<String> {
        if let Ok(pem) = std::fs::read_to_string(self.key_path()) {
            debug!("Using existing device key at {}", self.key_path().display());
            return Ok(pem);
        }

        info!("Generating RSA-{KEY_BITS} device keypair");
        let pem = tokio::task::spawn_blocking(|| -> Result<String> {
            let mut rng = rand::thread_rng();
            let key = RsaPrivateKey::new(&mut rng, KEY_BITS)
                .map_err(|e| Error::Certificate(format!("keypair generation failed: {e}")))?;
            let pem = key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| Error::Certificate(format!("key encoding failed: {e}")))?;
            Ok(pem.to_string())
        })
        .await
        .map_err(|e| Error::Internal(format!("keygen task failed: {e}")))??;

        fsutil::atomic_write_sensitive(&self.key_path(), pem.as_bytes())?;
        Ok(pem)
    }

    /// Build a PKCS#10 CSR (SHA-256 signed) for the given subject and
    /// persist it alongside the key.
    pub fn build_csr(&self, key_pem: &str, options: &CsrOptions) -> Result<String> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::Certificate(format!("unusable device key: {e}")))?;

        let mut params = CertificateParams::default();
        let dn = &mut params.distinguished_name;
        dn.push(DnType::CommonName, options.common_name.as_str());
        dn.push(DnType::OrganizationName, CSR_ORGANIZATION);
        if let Some(ou) = &options.organizational_unit {
            dn.push(DnType::OrganizationalUnitName, ou.as_str());
        }
        if let Some(st) = &options.state {
            dn.push(DnType::StateOrProvinceName, st.as_str());
        }
        if let Some(l) = &options.locality {
            dn.push(DnType::LocalityName, l.as_str());
        }
        if let Some(c) = &options.country {
            dn.push(DnType::CountryName, c.as_str());
        }

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| Error::Certificate(format!("CSR generation failed: {e}")))?;
        let pem = csr
            .pem()
            .map_err(|e| Error::Certificate(format!("CSR encoding failed: {e}")))?;

        fsutil::atomic_write(&self.csr_path(), pem.as_bytes())?;
        Ok(pem)
    }

    /// Store the issued client certificate and CA, extract and persist the
    /// certificate metadata.
    pub fn store_issued(&self, cert_pem: &str, ca_pem: &str) -> Result<CertMetadata> {
        let metadata = parse_cert_metadata(cert_pem)?;

        fsutil::atomic_write_sensitive(&self.cert_path(), cert_pem.as_bytes())?;
        fsutil::atomic_write_sensitive(&self.ca_path(), ca_pem.as_bytes())?;
        fsutil::atomic_write_json_sensitive(&self.meta_path(), &metadata)?;

        info!(
            "Stored client certificate, subject {:?}, valid until {}",
            metadata.subject, metadata.valid_to
        );
        Ok(metadata)
    }

    /// Persisted certificate metadata; reparsed from the certificate when
    /// the metadata file is missing.
    pub fn metadata(&self) -> Result<Option<CertMetadata>> {
        if let Some(meta) = fsutil::read_json::<CertMetadata>(&self.meta_path())? {
            return Ok(Some(meta));
        }
        match std::fs::read_to_string(self.cert_path()) {
            Ok(cert_pem) => {
                let metadata = parse_cert_metadata(&cert_pem)?;
                fsutil::atomic_write_json_sensitive(&self.meta_path(), &metadata)?;
                Ok(Some(metadata))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// A certificate is present only when key, cert and CA all exist and
    /// the current time is inside the validity window.
    pub fn verify_certificate(&self) -> bool {
        let all_present = self.key_path().exists()
            && self.cert_path().exists()
            && self.ca_path().exists();
        if !all_present {
            return false;
        }
        match self.metadata() {
            Ok(Some(meta)) => {
                let now = Utc::now();
                meta.valid_from <= now && now <= meta.valid_to
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Certificate verification failed: {e}");
                false
            }
        }
    }

    /// True when no certificate exists or it expires within
    /// `renew_before_days`.
    pub fn needs_renewal(&self, renew_before_days: i64) -> bool {
        match self.metadata() {
            Ok(Some(meta)) => {
                meta.valid_to - Utc::now() < Duration::days(renew_before_days)
            }
            _ => true,
        }
    }

    /// Load the complete credential bundle, or None when not yet paired
    /// or no longer valid.
    pub fn load_credentials(&self, device_id: &str) -> Result<Option<DeviceCredentials>> {
        if !self.verify_certificate() {
            return Ok(None);
        }
        let key_pem = std::fs::read_to_string(self.key_path())?;
        let cert_pem = std::fs::read_to_string(self.cert_path())?;
        let ca_pem = std::fs::read_to_string(self.ca_path())?;
        let metadata = self
            .metadata()?
            .ok_or_else(|| Error::Certificate("certificate metadata missing".to_string()))?;

        Ok(Some(DeviceCredentials {
            device_id: device_id.to_string(),
            key_pem,
            cert_pem,
            ca_pem,
            metadata,
        }))
    }

    /// Wipe all credential material (explicit re-pair)
    pub fn delete_certificates(&self) -> Result<()> {
        for path in [
            self.key_path(),
            self.cert_path(),
            self.ca_path(),
            self.csr_path(),
            self.meta_path(),
        ] {
            remove_if_present(&path)?;
        }
        info!("Deleted device credentials from {}", self.dir.display());
        Ok(())
    }
}

/// Extract subject/issuer/validity/serial/fingerprint from a PEM cert
pub fn parse_cert_metadata(cert_pem: &str) -> Result<CertMetadata> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| Error::Certificate(format!("invalid certificate PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::Certificate(format!("invalid certificate DER: {e}")))?;

    let valid_from = asn1_to_utc(cert.validity().not_before.timestamp())?;
    let valid_to = asn1_to_utc(cert.validity().not_after.timestamp())?;

    Ok(CertMetadata {
        fingerprint: hex::encode(Sha256::digest(&pem.contents)),
        valid_from,
        valid_to,
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial: cert.raw_serial_as_string(),
    })
}

fn asn1_to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .ok_or_else(|| Error::Certificate(format!("unrepresentable timestamp {timestamp}")))
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
