//! OCSP stapling.
//!
//! For a context with stapling enabled, each handshake consults the cached
//! response: memory first (bounded by `nextUpdate` and the check interval),
//! then the disk cache keyed by the certificate serial number, and finally a
//! fresh HTTP GET against the certificate's AIA responder (DER request,
//! base64 in the URL path). Failure to obtain a response downgrades to
//! "staple nothing" unless the certificate carries Must-Staple.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::NaiveDateTime;
use sha1::{Digest, Sha1};
use x509_parser::prelude::*;

use crate::error::{Error, Result};

// TLS Feature extension (RFC 7633); value 5 is status_request.
const OID_TLS_FEATURE: &str = "1.3.6.1.5.5.7.1.24";
// AIA access method for OCSP.
const OID_AD_OCSP: &str = "1.3.6.1.5.5.7.48.1";

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether the certificate carries the Must-Staple TLS Feature.
pub fn has_must_staple(cert_der: &[u8]) -> bool {
    let Ok((_, cert)) = parse_x509_certificate(cert_der) else {
        return false;
    };
    for ext in cert.extensions() {
        if ext.oid.to_id_string() != OID_TLS_FEATURE {
            continue;
        }
        // SEQUENCE OF INTEGER; scan for status_request (5).
        let Ok((_, features)) = x509_parser::der_parser::parse_der(ext.value) else {
            log::warn!("OCSP: failed to parse TLS Feature extension");
            return false;
        };
        if let Ok(seq) = features.as_sequence() {
            return seq.iter().any(|obj| matches!(obj.as_u32(), Ok(5)));
        }
        return false;
    }
    false
}

/// First OCSP responder URI from the AIA extension, if any.
pub fn ocsp_responder_url(cert_der: &[u8]) -> Option<String> {
    let (_, cert) = parse_x509_certificate(cert_der).ok()?;
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in &aia.accessdescs {
                if desc.access_method.to_id_string() == OID_AD_OCSP {
                    if let GeneralName::URI(uri) = &desc.access_location {
                        return Some((*uri).to_string());
                    }
                }
            }
        }
    }
    None
}

// ============================================================================
// DER encoding of the request
// ============================================================================

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push((len & 0xff) as u8);
    }
    out.extend_from_slice(content);
    out
}

fn der_sequence(parts: &[&[u8]]) -> Vec<u8> {
    let content: Vec<u8> = parts.concat();
    der_tlv(0x30, &content)
}

fn der_octet_string(bytes: &[u8]) -> Vec<u8> {
    der_tlv(0x04, bytes)
}

fn der_integer(bytes: &[u8]) -> Vec<u8> {
    // Serial numbers arrive as raw big-endian content bytes.
    der_tlv(0x02, bytes)
}

fn der_oid_sha1() -> Vec<u8> {
    der_tlv(0x06, &[0x2b, 0x0e, 0x03, 0x02, 0x1a])
}

fn der_null() -> Vec<u8> {
    vec![0x05, 0x00]
}

/// Build a one-certificate OCSPRequest and return it with the serial number
/// in hex (the disk-cache key).
pub fn build_ocsp_request(cert_der: &[u8], issuer_der: &[u8]) -> Option<(Vec<u8>, String)> {
    let (_, cert) = parse_x509_certificate(cert_der).ok()?;
    let (_, issuer) = parse_x509_certificate(issuer_der).ok()?;

    let name_hash = Sha1::digest(issuer.tbs_certificate.subject.as_raw());
    let key_hash = Sha1::digest(&issuer.tbs_certificate.subject_pki.subject_public_key.data);
    let serial = cert.tbs_certificate.raw_serial();

    let algorithm = der_sequence(&[&der_oid_sha1(), &der_null()]);
    let cert_id = der_sequence(&[
        &algorithm,
        &der_octet_string(&name_hash),
        &der_octet_string(&key_hash),
        &der_integer(serial),
    ]);
    let request = der_sequence(&[&cert_id]);
    let request_list = der_sequence(&[&request]);
    let tbs_request = der_sequence(&[&request_list]);
    let ocsp_request = der_sequence(&[&tbs_request]);

    Some((ocsp_request, hex::encode(serial)))
}

// ============================================================================
// Response validity
// ============================================================================

/// `nextUpdate` of the first single response, when present.
///
/// The tbsResponseData lays out producedAt, thisUpdate, nextUpdate as the
/// first three GeneralizedTime values; the signature follows the tbs, so a
/// linear scan over the leading bytes is unambiguous.
pub fn response_next_update(der: &[u8]) -> Option<SystemTime> {
    let mut times = Vec::new();
    let mut i = 0;
    while i + 17 <= der.len() && times.len() < 3 {
        if der[i] == 0x18 && der[i + 1] == 0x0f {
            let body = &der[i + 2..i + 17];
            if body.iter().all(|b| b.is_ascii_digit() || *b == b'Z') && body[14] == b'Z' {
                if let Ok(text) = std::str::from_utf8(body) {
                    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y%m%d%H%M%SZ") {
                        times.push(dt.and_utc());
                        i += 17;
                        continue;
                    }
                }
            }
        }
        i += 1;
    }
    let next_update = times.get(2)?;
    let secs = next_update.timestamp();
    if secs <= 0 {
        return None;
    }
    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64))
}

/// Cheap status check: a successful OCSPResponse starts with a SEQUENCE
/// whose first element is ENUMERATED 0.
fn response_is_successful(der: &[u8]) -> bool {
    // SEQ, len..., ENUM tag 0x0a, len 1, value 0
    let mut i = 0;
    if der.first() != Some(&0x30) {
        return false;
    }
    i += 1;
    if let Some(&len) = der.get(i) {
        i += 1 + if len == 0x81 { 1 } else if len == 0x82 { 2 } else { 0 };
    } else {
        return false;
    }
    der.get(i..i + 3) == Some(&[0x0a, 0x01, 0x00])
}

// ============================================================================
// Stapler
// ============================================================================

struct StaplerState {
    response: Option<Vec<u8>>,
    expire: SystemTime,
}

/// Per-context OCSP response cache and fetcher.
pub struct OcspStapler {
    aia_url: String,
    request_der: Vec<u8>,
    serial_hex: String,
    cache_dir: PathBuf,
    check_interval: Duration,
    state: Mutex<StaplerState>,
}

impl std::fmt::Debug for OcspStapler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OcspStapler(serial {}, aia {})", self.serial_hex, self.aia_url)
    }
}

impl OcspStapler {
    /// Build a stapler for a certificate chain; requires an AIA OCSP URI
    /// and the issuer certificate (second chain element).
    pub fn from_chain(
        chain: &[rustls::pki_types::CertificateDer<'static>],
        cache_dir: PathBuf,
        check_interval: Duration,
    ) -> Option<Self> {
        let end_entity = chain.first()?;
        let aia_url = ocsp_responder_url(end_entity)?;
        let issuer = chain.get(1)?;
        let (request_der, serial_hex) = build_ocsp_request(end_entity, issuer)?;
        Some(Self {
            aia_url,
            request_der,
            serial_hex,
            cache_dir,
            check_interval,
            state: Mutex::new(StaplerState {
                response: None,
                expire: SystemTime::UNIX_EPOCH,
            }),
        })
    }

    fn cache_file(&self) -> PathBuf {
        self.cache_dir.join(format!("{}.der", self.serial_hex))
    }

    /// Current DER response for stapling, consulting memory, disk and the
    /// AIA responder in that order. None when nothing valid is available.
    pub fn current_response(&self) -> Option<Vec<u8>> {
        let now = SystemTime::now();
        let mut state = self.state.lock().unwrap();

        if let Some(resp) = &state.response {
            if state.expire > now {
                return Some(resp.clone());
            }
            state.response = None;
        }
        if state.expire > now {
            // Negative cache: a recent attempt failed; do not hammer the
            // responder on every handshake.
            return None;
        }

        if let Some(resp) = self.load_disk_cache(now) {
            state.expire = cache_deadline(now, self.check_interval, &resp);
            state.response = Some(resp.clone());
            return Some(resp);
        }

        match self.fetch_from_aia() {
            Some(resp) if response_is_successful(&resp) => {
                if let Err(e) = std::fs::write(self.cache_file(), &resp) {
                    log::warn!("cannot write OCSP cache file {}: {e}", self.cache_file().display());
                } else {
                    log::info!("OCSP response cached: {}", self.cache_file().display());
                }
                state.expire = cache_deadline(now, self.check_interval, &resp);
                state.response = Some(resp.clone());
                Some(resp)
            }
            _ => {
                log::info!("cert_status: OCSP cannot validate the certificate");
                state.expire = now + self.check_interval;
                None
            }
        }
    }

    fn load_disk_cache(&self, now: SystemTime) -> Option<Vec<u8>> {
        let path = self.cache_file();
        let resp = std::fs::read(&path).ok()?;
        match response_next_update(&resp) {
            Some(next_update) if next_update > now => {
                log::info!("OCSP cache file is valid: {}", path.display());
                Some(resp)
            }
            _ => {
                log::info!("OCSP cache file expired: {}", path.display());
                None
            }
        }
    }

    /// HTTP GET of the DER request, base64 appended to the AIA URI path.
    fn fetch_from_aia(&self) -> Option<Vec<u8>> {
        match http_get_ocsp(&self.aia_url, &self.request_der) {
            Ok(body) => Some(body),
            Err(e) => {
                log::warn!("OCSP request to {} failed: {e}", self.aia_url);
                None
            }
        }
    }
}

fn cache_deadline(now: SystemTime, interval: Duration, response: &[u8]) -> SystemTime {
    let refresh = now + interval;
    match response_next_update(response) {
        Some(next_update) => refresh.min(next_update),
        None => refresh,
    }
}

/// Escape base64 output for use as a URL path segment.
fn url_path_encode(b64: &str) -> String {
    let mut out = String::with_capacity(b64.len());
    for c in b64.chars() {
        match c {
            '+' => out.push_str("%2B"),
            '/' => out.push_str("%2F"),
            '=' => out.push_str("%3D"),
            c => out.push(c),
        }
    }
    out
}

fn http_get_ocsp(aia_url: &str, request_der: &[u8]) -> Result<Vec<u8>> {
    let parsed = url::Url::parse(aia_url).map_err(|e| Error::Config(format!("bad AIA URL: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Config(format!("AIA URL without host: {aia_url}")))?;
    let port = parsed.port_or_known_default().unwrap_or(80);

    let mut path = parsed.path().to_string();
    if !path.ends_with('/') {
        path.push('/');
    }
    path.push_str(&url_path_encode(&BASE64.encode(request_der)));

    let addr = (host, port);
    let stream = {
        use std::net::ToSocketAddrs;
        let sockaddr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Config(format!("cannot resolve {host}:{port}")))?;
        TcpStream::connect_timeout(&sockaddr, FETCH_TIMEOUT)?
    };
    stream.set_read_timeout(Some(FETCH_TIMEOUT))?;
    stream.set_write_timeout(Some(FETCH_TIMEOUT))?;

    let mut stream = stream;
    write!(
        stream,
        "GET {path} HTTP/1.0\r\nHost: {host}\r\nAccept: application/ocsp-response\r\n\r\n"
    )?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    let parsed_len = match response.parse(&raw) {
        Ok(httparse::Status::Complete(n)) => n,
        _ => return Err(Error::Config(format!("malformed OCSP response from {aia_url}"))),
    };
    let status = response.code.unwrap_or(0);
    if !(200..300).contains(&status) {
        return Err(Error::Config(format!("OCSP responder {aia_url} returned status {status}")));
    }
    Ok(raw[parsed_len..].to_vec())
}
