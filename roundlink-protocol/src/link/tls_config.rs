//! TLS configuration for links
//!
//! Both ends present their self-signed certificate and accept any
//! certificate at the TLS layer. Trust is decided afterwards by comparing the
//! presented certificate with the pinned one, so the TLS layer only needs to
//! guarantee that the peer owns the private key of the certificate it shows.
//!
//! Uses OpenSSL directly to keep TLS 1.0 compatibility with older Android
//! peers.

use crate::{CertificateInfo, ProtocolError, Result};
use openssl::pkey::PKey;
use openssl::ssl::{
    SslAcceptor, SslConnector, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion,
};
use openssl::x509::X509;
use tracing::debug;

/// Cipher suites accepted by KDE Connect peers for TLS 1.2 and older.
/// `@SECLEVEL=1` keeps TLS 1.0 peers working.
const CIPHER_LIST: &str =
    "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-SHA:@SECLEVEL=1";

fn config_error(what: &str, e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::CertificateValidation(format!("Failed to {}: {}", what, e))
}

fn configure(builder: &mut SslContextBuilder, our_cert: &CertificateInfo) -> Result<()> {
    builder
        .set_min_proto_version(Some(SslVersion::TLS1))
        .map_err(|e| config_error("set min TLS version", e))?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_3))
        .map_err(|e| config_error("set max TLS version", e))?;
    builder
        .set_cipher_list(CIPHER_LIST)
        .map_err(|e| config_error("set cipher list", e))?;

    let cert = X509::from_der(&our_cert.certificate)
        .map_err(|e| config_error("parse certificate", e))?;
    let pkey = PKey::private_key_from_der(&our_cert.private_key)
        .map_err(|e| config_error("parse private key", e))?;

    builder
        .set_certificate(&cert)
        .map_err(|e| config_error("set certificate", e))?;
    builder
        .set_private_key(&pkey)
        .map_err(|e| config_error("set private key", e))?;
    builder
        .check_private_key()
        .map_err(|e| config_error("match private key", e))?;

    Ok(())
}

/// TLS server side, used by the host that opened the TCP connection
///
/// The server insists on a client certificate so both sides end up holding
/// each other's certificate.
pub fn create_acceptor(our_cert: &CertificateInfo) -> Result<SslAcceptor> {
    debug!("Creating TLS acceptor for {}", our_cert.device_id);

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
        .map_err(|e| config_error("create SSL acceptor", e))?;
    configure(&mut builder, our_cert)?;
    builder.set_verify_callback(
        SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        |_preverify, _ctx| true,
    );

    Ok(builder.build())
}

/// TLS client side, used by the host that accepted the TCP connection
pub fn create_connector(our_cert: &CertificateInfo) -> Result<SslConnector> {
    debug!("Creating TLS connector for {}", our_cert.device_id);

    let mut builder = SslConnector::builder(SslMethod::tls_client())
        .map_err(|e| config_error("create SSL connector", e))?;
    configure(&mut builder, our_cert)?;
    builder.set_verify_callback(SslVerifyMode::PEER, |_preverify, _ctx| true);

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configs_build_from_generated_identity() {
        let cert = CertificateInfo::generate("tls_config_device").unwrap();

        assert!(create_acceptor(&cert).is_ok());
        assert!(create_connector(&cert).is_ok());
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let mut cert = CertificateInfo::generate("tls_config_a").unwrap();
        let other = CertificateInfo::generate("tls_config_b").unwrap();
        cert.private_key = other.private_key;

        let err = create_acceptor(&cert).err().expect("expected mismatched key to be rejected");
        assert!(matches!(err, ProtocolError::CertificateValidation(_)));
    }
}
