//! Peer-certificate validation exceptions and the invalid-certificate
//! archive.
//!
//! A rule pairs an IP/mask (or all peers) with a list of acceptable X.509
//! error codes (or a match-all). When a certificate fails default
//! validation and a rule accepts the failure for the peer, the handshake
//! proceeds and the offending certificate is archived as
//! `<sha256-hex>-<depth>-<errcode>.pem`.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rustls::CertificateError;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use sha2::{Digest, Sha256};

use crate::config::ValidationExceptionSettings;
use crate::error::{Error, Result};

// X.509 validation error codes, matching the usual library numbering.
pub const X509_V_ERR_CERT_SIGNATURE_FAILURE: i32 = 7;
pub const X509_V_ERR_CERT_NOT_YET_VALID: i32 = 9;
pub const X509_V_ERR_CERT_HAS_EXPIRED: i32 = 10;
pub const X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT: i32 = 18;
pub const X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY: i32 = 20;
pub const X509_V_ERR_CERT_REVOKED: i32 = 23;
pub const X509_V_ERR_INVALID_PURPOSE: i32 = 26;
pub const X509_V_ERR_CERT_UNTRUSTED: i32 = 27;
pub const X509_V_ERR_CERT_REJECTED: i32 = 28;
pub const X509_V_ERR_HOSTNAME_MISMATCH: i32 = 62;
/// Sentinel accepting every validation error.
pub const X509_V_ERR_MATCH_ALL: i32 = -1;

pub fn error_name(code: i32) -> &'static str {
    match code {
        X509_V_ERR_CERT_SIGNATURE_FAILURE => "X509_V_ERR_CERT_SIGNATURE_FAILURE",
        X509_V_ERR_CERT_NOT_YET_VALID => "X509_V_ERR_CERT_NOT_YET_VALID",
        X509_V_ERR_CERT_HAS_EXPIRED => "X509_V_ERR_CERT_HAS_EXPIRED",
        X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT => "X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT",
        X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY => {
            "X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY"
        }
        X509_V_ERR_CERT_REVOKED => "X509_V_ERR_CERT_REVOKED",
        X509_V_ERR_INVALID_PURPOSE => "X509_V_ERR_INVALID_PURPOSE",
        X509_V_ERR_CERT_UNTRUSTED => "X509_V_ERR_CERT_UNTRUSTED",
        X509_V_ERR_CERT_REJECTED => "X509_V_ERR_CERT_REJECTED",
        X509_V_ERR_HOSTNAME_MISMATCH => "X509_V_ERR_HOSTNAME_MISMATCH",
        _ => "X509_V_ERR_UNSPECIFIED",
    }
}

/// Parse an error code given as a symbolic name, a number, or `*`.
pub fn parse_error_code(token: &str) -> Option<i32> {
    if token == "*" || token.eq_ignore_ascii_case("all") {
        return Some(X509_V_ERR_MATCH_ALL);
    }
    if let Ok(n) = token.parse::<i32>() {
        return Some(n);
    }
    match token {
        "X509_V_ERR_CERT_SIGNATURE_FAILURE" => Some(X509_V_ERR_CERT_SIGNATURE_FAILURE),
        "X509_V_ERR_CERT_NOT_YET_VALID" => Some(X509_V_ERR_CERT_NOT_YET_VALID),
        "X509_V_ERR_CERT_HAS_EXPIRED" => Some(X509_V_ERR_CERT_HAS_EXPIRED),
        "X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT" => Some(X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT),
        "X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY" => {
            Some(X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY)
        }
        "X509_V_ERR_CERT_REVOKED" => Some(X509_V_ERR_CERT_REVOKED),
        "X509_V_ERR_INVALID_PURPOSE" => Some(X509_V_ERR_INVALID_PURPOSE),
        "X509_V_ERR_CERT_UNTRUSTED" => Some(X509_V_ERR_CERT_UNTRUSTED),
        "X509_V_ERR_CERT_REJECTED" => Some(X509_V_ERR_CERT_REJECTED),
        "X509_V_ERR_HOSTNAME_MISMATCH" => Some(X509_V_ERR_HOSTNAME_MISMATCH),
        _ => None,
    }
}

/// Map a TLS-library certificate failure to the unified code space.
pub fn error_code_for(err: &rustls::Error) -> i32 {
    match err {
        rustls::Error::InvalidCertificate(cert_err) => match cert_err {
            CertificateError::Expired => X509_V_ERR_CERT_HAS_EXPIRED,
            CertificateError::NotValidYet => X509_V_ERR_CERT_NOT_YET_VALID,
            CertificateError::UnknownIssuer => X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY,
            CertificateError::Revoked => X509_V_ERR_CERT_REVOKED,
            CertificateError::BadSignature => X509_V_ERR_CERT_SIGNATURE_FAILURE,
            CertificateError::NotValidForName => X509_V_ERR_HOSTNAME_MISMATCH,
            CertificateError::InvalidPurpose => X509_V_ERR_INVALID_PURPOSE,
            CertificateError::ApplicationVerificationFailure => X509_V_ERR_CERT_REJECTED,
            _ => X509_V_ERR_CERT_UNTRUSTED,
        },
        _ => X509_V_ERR_CERT_UNTRUSTED,
    }
}

// ============================================================================
// Exception rules
// ============================================================================

#[derive(Debug, Clone)]
pub struct ValidationException {
    /// Network and prefix length; `None` matches every peer.
    net: Option<(IpAddr, u8)>,
    /// Accepted error codes; empty accepts every error from matching peers.
    accept: Vec<i32>,
}

impl ValidationException {
    pub fn parse(settings: &ValidationExceptionSettings) -> Result<Self> {
        let net = match settings.ip.trim() {
            "" | "all" | "*" => None,
            spec => {
                let (addr, prefix) = match spec.split_once('/') {
                    Some((a, p)) => {
                        let prefix: u8 = p
                            .parse()
                            .map_err(|_| Error::Config(format!("invalid prefix in '{spec}'")))?;
                        (a, prefix)
                    }
                    None => (spec, 255),
                };
                let addr: IpAddr = addr
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid IP address '{spec}'")))?;
                let max = if addr.is_ipv4() { 32 } else { 128 };
                let prefix = prefix.min(max);
                Some((addr, prefix))
            }
        };
        let mut accept = Vec::new();
        for token in &settings.accept {
            let code = parse_error_code(token)
                .ok_or_else(|| Error::Config(format!("unknown X.509 error '{token}'")))?;
            accept.push(code);
        }
        Ok(Self { net, accept })
    }

    fn ip_matches(&self, peer: IpAddr) -> bool {
        match self.net {
            None => true,
            Some((net, prefix)) => masked_match(peer, net, prefix),
        }
    }

    fn accepts(&self, code: i32) -> bool {
        self.accept.is_empty() || self.accept.iter().any(|&c| c == code || c == X509_V_ERR_MATCH_ALL)
    }
}

fn masked_match(peer: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (peer, net) {
        (IpAddr::V4(p), IpAddr::V4(n)) => {
            let bits = u32::from(prefix.min(32));
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            (u32::from(p) & mask) == (u32::from(n) & mask)
        }
        (IpAddr::V6(p), IpAddr::V6(n)) => {
            let bits = u32::from(prefix.min(128));
            let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
            (u128::from(p) & mask) == (u128::from(n) & mask)
        }
        _ => false,
    }
}

/// Per-server rule list plus the archive directory for rejected certs.
#[derive(Debug, Default)]
pub struct ExceptionStore {
    rules: Vec<ValidationException>,
    archive_dir: Option<PathBuf>,
}

impl ExceptionStore {
    pub fn new(
        settings: &[ValidationExceptionSettings],
        archive_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let rules = settings
            .iter()
            .map(ValidationException::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules, archive_dir })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether any rule accepts this error from this peer.
    pub fn exception_exists(&self, code: i32, peer: IpAddr) -> bool {
        self.rules.iter().any(|r| r.ip_matches(peer) && r.accepts(code))
    }

    /// Decide on a failed certificate: archives it either way, and returns
    /// whether an exception rule accepts the failure.
    pub fn decide(&self, peer: IpAddr, code: i32, cert: &[u8], depth: usize) -> bool {
        let accepted = self.exception_exists(code, peer);
        if accepted {
            log::warn!("invalid certificate accepted ({peer} {})", error_name(code));
        }
        self.store_invalid_certificate(cert, code, depth);
        accepted
    }

    /// Write the offending certificate to the archive as
    /// `<sha256-hex>-<depth>-<errcode>.pem`, skipping existing files.
    pub fn store_invalid_certificate(&self, cert: &[u8], code: i32, depth: usize) {
        let Some(dir) = &self.archive_dir else {
            return;
        };
        if !dir.is_dir() {
            log::warn!("invalid-certificate directory {} does not exist", dir.display());
            return;
        }
        let digest = hex::encode(Sha256::digest(cert));
        let path = dir.join(format!("{digest}-{depth}-{code}.pem"));
        if path.exists() {
            log::info!("invalid certificate stored already: {}", path.display());
            return;
        }
        match std::fs::write(&path, pem_encode_certificate(cert)) {
            Ok(()) => log::warn!("saved invalid certificate: {}", path.display()),
            Err(e) => log::warn!("could not write {}: {e}", path.display()),
        }
    }
}

fn pem_encode_certificate(der: &[u8]) -> String {
    let body = BASE64.encode(der);
    let mut pem = String::with_capacity(body.len() + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for chunk in body.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

// ============================================================================
// rustls verifier adapters
// ============================================================================

/// Server-certificate verifier (outbound connections) honoring the
/// exception store for the known peer address.
pub struct ExceptionServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    store: Arc<ExceptionStore>,
    peer: IpAddr,
}

impl ExceptionServerVerifier {
    pub fn new(inner: Arc<WebPkiServerVerifier>, store: Arc<ExceptionStore>, peer: IpAddr) -> Self {
        Self { inner, store, peer }
    }
}

impl fmt::Debug for ExceptionServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExceptionServerVerifier(peer {})", self.peer)
    }
}

impl ServerCertVerifier for ExceptionServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => Ok(verified),
            Err(err) => {
                let code = error_code_for(&err);
                if self.store.decide(self.peer, code, end_entity.as_ref(), 0) {
                    Ok(ServerCertVerified::assertion())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Client-certificate verifier (inbound connections) honoring the exception
/// store; built per accepted connection so the peer address is known.
pub struct ExceptionClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    store: Arc<ExceptionStore>,
    peer: IpAddr,
}

impl ExceptionClientVerifier {
    pub fn new(inner: Arc<dyn ClientCertVerifier>, store: Arc<ExceptionStore>, peer: IpAddr) -> Self {
        Self { inner, store, peer }
    }
}

impl fmt::Debug for ExceptionClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExceptionClientVerifier(peer {})", self.peer)
    }
}

impl ClientCertVerifier for ExceptionClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        match self.inner.verify_client_cert(end_entity, intermediates, now) {
            Ok(verified) => Ok(verified),
            Err(err) => {
                let code = error_code_for(&err);
                if self.store.decide(self.peer, code, end_entity.as_ref(), 0) {
                    Ok(ClientCertVerified::assertion())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Certificate verifier that accepts anything (`-insecure 1`).
#[derive(Debug)]
pub struct AcceptAllVerifier;

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(ip: &str, accept: &[&str]) -> ValidationException {
        ValidationException::parse(&ValidationExceptionSettings {
            ip: ip.to_string(),
            accept: accept.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn test_masked_ip_match() {
        let r = rule("10.0.0.5/32", &["X509_V_ERR_CERT_HAS_EXPIRED"]);
        assert!(r.ip_matches("10.0.0.5".parse().unwrap()));
        assert!(!r.ip_matches("10.0.0.6".parse().unwrap()));

        let subnet = rule("192.168.1.0/24", &["*"]);
        assert!(subnet.ip_matches("192.168.1.77".parse().unwrap()));
        assert!(!subnet.ip_matches("192.168.2.77".parse().unwrap()));
    }

    #[test]
    fn test_all_ips_rule() {
        let r = rule("all", &["10"]);
        assert!(r.ip_matches("203.0.113.9".parse().unwrap()));
        assert!(r.accepts(X509_V_ERR_CERT_HAS_EXPIRED));
        assert!(!r.accepts(X509_V_ERR_CERT_REVOKED));
    }

    #[test]
    fn test_match_all_errors() {
        let r = rule("10.0.0.5", &["*"]);
        assert!(r.accepts(X509_V_ERR_CERT_HAS_EXPIRED));
        assert!(r.accepts(X509_V_ERR_CERT_REVOKED));
        // Empty accept list behaves the same.
        let r = rule("10.0.0.5", &[]);
        assert!(r.accepts(X509_V_ERR_CERT_REVOKED));
    }

    #[test]
    fn test_store_decision_scenario() {
        // Expired cert accepted from 10.0.0.5/32, rejected from 10.0.0.6.
        let store = ExceptionStore::new(
            &[ValidationExceptionSettings {
                ip: "10.0.0.5/32".to_string(),
                accept: vec!["X509_V_ERR_CERT_HAS_EXPIRED".to_string()],
            }],
            None,
        )
        .unwrap();
        let expired = X509_V_ERR_CERT_HAS_EXPIRED;
        assert!(store.exception_exists(expired, "10.0.0.5".parse().unwrap()));
        assert!(!store.exception_exists(expired, "10.0.0.6".parse().unwrap()));
        assert!(!store.exception_exists(X509_V_ERR_CERT_REVOKED, "10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_archive_filename_and_skip() {
        let dir = std::env::temp_dir().join(format!("tidepool-archive-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = ExceptionStore::new(&[], Some(dir.clone())).unwrap();

        let cert = b"not really DER, but enough for naming";
        store.store_invalid_certificate(cert, X509_V_ERR_CERT_HAS_EXPIRED, 1);

        let expected = dir.join(format!("{}-1-10.pem", hex::encode(Sha256::digest(cert))));
        assert!(expected.exists());
        let pem = std::fs::read_to_string(&expected).unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(pem.trim_end().ends_with("-----END CERTIFICATE-----"));

        // A second store attempt leaves the file untouched.
        store.store_invalid_certificate(cert, X509_V_ERR_CERT_HAS_EXPIRED, 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_error_code_mapping() {
        let err = rustls::Error::InvalidCertificate(CertificateError::Expired);
        assert_eq!(error_code_for(&err), X509_V_ERR_CERT_HAS_EXPIRED);
        assert_eq!(parse_error_code("X509_V_ERR_CERT_HAS_EXPIRED"), Some(10));
        assert_eq!(parse_error_code("23"), Some(23));
        assert_eq!(parse_error_code("*"), Some(X509_V_ERR_MATCH_ALL));
        assert_eq!(parse_error_code("bogus"), None);
    }
}
