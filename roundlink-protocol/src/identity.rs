//! Local Identity and Certificates
//!
//! Every host has one durable identity: a device id plus an RSA key pair and
//! a self-signed X.509 certificate whose Common Name is the device id. The
//! identity is generated on first run, stored as PEM files and reused for
//! every session and every pairing.
//!
//! ## Certificate Requirements
//!
//! - **Algorithm**: RSA 2048-bit
//! - **Organization (O)**: "KDE"
//! - **Organizational Unit (OU)**: "Kde connect"
//! - **Common Name (CN)**: device id
//! - **Validity**: 10 years
//!
//! Peers' certificates are handled as [`PeerCertificate`] values, which is
//! what gets pinned when a device is paired.

use crate::{ProtocolError, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Certificate validity period (10 years)
const CERT_VALIDITY_YEARS: u32 = 10;

/// Organization name in certificate
const CERT_ORG: &str = "KDE";

/// Organizational unit in certificate
const CERT_ORG_UNIT: &str = "Kde connect";

/// File name of the local certificate inside the certificate directory
pub const CERTIFICATE_FILE: &str = "certificate.pem";

/// File name of the local private key inside the certificate directory
pub const PRIVATE_KEY_FILE: &str = "private_key.pem";

const PEM_CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Generate a fresh device id
///
/// UUID v4 with dashes replaced by underscores, as KDE Connect peers expect.
pub fn new_device_id() -> String {
    Uuid::new_v4().to_string().replace('-', "_")
}

/// Whether `id` is acceptable as a device id
///
/// Ids end up in logs and persisted records, so only a conservative alphabet
/// is accepted.
pub fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Calculate the SHA256 fingerprint of a DER certificate
///
/// Returns the fingerprint as colon-separated upper-case hex bytes.
pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
    let hash = Sha256::digest(cert_der);
    hash.iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Local device certificate and key
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Device ID (certificate Common Name)
    pub device_id: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// DER-encoded private key
    pub private_key: Vec<u8>,

    /// SHA256 fingerprint of the certificate
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Generate a new self-signed certificate for a device
    ///
    /// ```
    /// use roundlink_protocol::CertificateInfo;
    ///
    /// let cert_info = CertificateInfo::generate("test_device_id").unwrap();
    /// assert_eq!(cert_info.device_id, "test_device_id");
    /// ```
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();
        if !is_valid_device_id(&device_id) {
            return Err(ProtocolError::Configuration(format!(
                "invalid device id: {:?}",
                device_id
            )));
        }

        let rsa = Rsa::generate(2048)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("OU", CERT_ORG_UNIT)?;
        name.append_entry_by_text("CN", &device_id)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(CERT_VALIDITY_YEARS * 365)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&pkey)?;

        // End-entity certificate, not a CA
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .key_agreement()
                .build()?,
        )?;

        builder.sign(&pkey, MessageDigest::sha256())?;
        let cert = builder.build();

        let certificate = cert.to_der()?;
        let private_key = pkey.private_key_to_der()?;
        let fingerprint = calculate_fingerprint(&certificate);

        info!(
            "Generated certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Load the identity stored in `cert_dir`, generating and saving a new one
    /// if none exists yet
    pub fn load_or_generate(cert_dir: impl AsRef<Path>) -> Result<Self> {
        let cert_dir = cert_dir.as_ref();
        let cert_path = cert_dir.join(CERTIFICATE_FILE);
        let key_path = cert_dir.join(PRIVATE_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            return Self::load_from_files(&cert_path, &key_path);
        }

        let info = Self::generate(new_device_id())?;
        info.save_to_files(&cert_path, &key_path)?;
        Ok(info)
    }

    /// Save certificate and private key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            fs::create_dir_all(parent)?;
        }

        let cert = X509::from_der(&self.certificate)?;
        fs::write(cert_path, cert.to_pem()?)?;

        let pkey = PKey::private_key_from_der(&self.private_key)?;
        fs::write(key_path, pkey.private_key_to_pem_pkcs8()?)?;
        restrict_permissions(key_path)?;

        info!(
            "Saved certificate to {:?} and private key to {:?}",
            cert_path, key_path
        );

        Ok(())
    }

    /// Load certificate and private key from PEM files
    pub fn load_from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        debug!("Loading certificate from {:?}", cert_path);

        let cert = X509::from_pem(&fs::read(cert_path)?)?;
        let certificate = cert.to_der()?;

        let pkey = PKey::private_key_from_pem(&fs::read(key_path)?)?;
        let private_key = pkey.private_key_to_der()?;

        let device_id = common_name(&cert)?;
        let fingerprint = calculate_fingerprint(&certificate);

        info!(
            "Loaded certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// The public half, as peers see it
    pub fn peer_certificate(&self) -> PeerCertificate {
        PeerCertificate {
            der: self.certificate.clone(),
        }
    }
}

/// Paths of the local identity files in `cert_dir`
pub fn identity_paths(cert_dir: impl AsRef<Path>) -> (PathBuf, PathBuf) {
    let dir = cert_dir.as_ref();
    (dir.join(CERTIFICATE_FILE), dir.join(PRIVATE_KEY_FILE))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn common_name(cert: &X509) -> Result<String> {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .map(|entry| entry.data().as_utf8().map(|cn| cn.to_string()))
        .transpose()?
        .ok_or_else(|| {
            ProtocolError::CertificateValidation(
                "Certificate does not contain Common Name".to_string(),
            )
        })
}

/// A certificate presented by a peer
///
/// Holds the exact DER bytes. Two certificates are equal only if their
/// encodings are byte-identical, which is the comparison used for pinning.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerCertificate {
    der: Vec<u8>,
}

impl PeerCertificate {
    /// Wrap DER bytes, checking that they parse as X.509
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self> {
        let der = der.into();
        X509::from_der(&der).map_err(|e| {
            ProtocolError::CertificateValidation(format!("malformed peer certificate: {}", e))
        })?;
        Ok(Self { der })
    }

    pub(crate) fn from_x509(cert: &X509) -> Result<Self> {
        Ok(Self { der: cert.to_der()? })
    }

    /// Parse a PEM `CERTIFICATE` block
    pub fn from_pem(input: &str) -> Result<Self> {
        let block = pem::parse(input).map_err(|e| {
            ProtocolError::CertificateValidation(format!("invalid PEM certificate: {}", e))
        })?;
        if block.tag() != PEM_CERTIFICATE_TAG {
            return Err(ProtocolError::CertificateValidation(format!(
                "unexpected PEM block {}",
                block.tag()
            )));
        }
        Self::from_der(block.contents())
    }

    /// Encode as a PEM `CERTIFICATE` block
    pub fn to_pem(&self) -> String {
        let block = pem::Pem::new(PEM_CERTIFICATE_TAG, self.der.clone());
        pem::encode_config(
            &block,
            pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
        )
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn fingerprint(&self) -> String {
        calculate_fingerprint(&self.der)
    }

    /// Common Name of the certificate subject
    pub fn common_name(&self) -> Result<String> {
        common_name(&X509::from_der(&self.der)?)
    }
}

impl fmt::Debug for PeerCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerCertificate")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_certificate_generation() {
        let cert = CertificateInfo::generate("test_device_123").unwrap();

        assert_eq!(cert.device_id, "test_device_123");
        assert!(!cert.certificate.is_empty());
        assert!(!cert.private_key.is_empty());
        assert_eq!(cert.peer_certificate().common_name().unwrap(), "test_device_123");
    }

    #[test]
    fn test_invalid_device_id_rejected() {
        assert!(CertificateInfo::generate("").is_err());
        assert!(CertificateInfo::generate("has space").is_err());
        assert!(CertificateInfo::generate("../escape").is_err());
    }

    #[test]
    fn test_new_device_id_is_valid() {
        let id = new_device_id();
        assert!(is_valid_device_id(&id));
        assert!(!id.contains('-'));
        assert_ne!(id, new_device_id());
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = calculate_fingerprint(b"certificate bytes");

        // 32 bytes, two hex digits each, 31 separators
        assert_eq!(fingerprint.len(), 95);
        assert_eq!(fingerprint.matches(':').count(), 31);
        assert!(fingerprint
            .chars()
            .all(|c| c == ':' || c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn test_certificate_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let (cert_path, key_path) = identity_paths(temp_dir.path());

        let original = CertificateInfo::generate("test_device").unwrap();
        original.save_to_files(&cert_path, &key_path).unwrap();

        let loaded = CertificateInfo::load_from_files(&cert_path, &key_path).unwrap();

        assert_eq!(loaded.device_id, original.device_id);
        assert_eq!(loaded.certificate, original.certificate);
        assert_eq!(loaded.fingerprint, original.fingerprint);
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let temp_dir = TempDir::new().unwrap();

        let first = CertificateInfo::load_or_generate(temp_dir.path()).unwrap();
        let second = CertificateInfo::load_or_generate(temp_dir.path()).unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.certificate, second.certificate);
    }

    #[test]
    fn test_peer_certificate_pem_roundtrip_is_exact() {
        let cert = CertificateInfo::generate("pem_device").unwrap().peer_certificate();

        let pem = cert.to_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

        let parsed = PeerCertificate::from_pem(&pem).unwrap();
        assert_eq!(parsed, cert);
        assert_eq!(parsed.der(), cert.der());
        assert_eq!(parsed.fingerprint(), cert.fingerprint());
    }

    #[test]
    fn test_peer_certificate_rejects_garbage() {
        assert!(PeerCertificate::from_der(vec![1, 2, 3]).is_err());
        assert!(PeerCertificate::from_pem("not pem").is_err());
    }

    #[test]
    fn test_different_keys_differ() {
        let a = CertificateInfo::generate("same_id").unwrap().peer_certificate();
        let b = CertificateInfo::generate("same_id").unwrap().peer_certificate();

        assert_ne!(a, b);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
