//! TLS context registry.
//!
//! Owns long-lived server TLS contexts keyed by certificate path, resolves
//! SNI to per-vhost contexts, and supports in-place certificate reload on
//! SIGHUP without invalidating live connections: the rustls configs stay
//! put, only the certified key inside the resolver is swapped.

pub mod keys;
pub mod ocsp;
pub mod verify;

use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rustls::client::WebPkiServerVerifier;
use rustls::crypto::aws_lc_rs;
use rustls::server::danger::ClientCertVerifier;
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedCipherSuite};

use crate::config::TlsSettings;
use crate::error::{Error, Result};
use crate::tls::ocsp::OcspStapler;
use crate::tls::verify::{AcceptAllVerifier, ExceptionServerVerifier, ExceptionStore};

// ============================================================================
// ALPN and protocol selection
// ============================================================================

/// Validate a comma-separated ALPN list. Empty or over-long (>255 byte)
/// tokens are rejected at context-creation time.
pub fn alpn_protocols(alpn: &str) -> Result<Vec<Vec<u8>>> {
    let mut protos = Vec::new();
    if alpn.is_empty() {
        return Ok(protos);
    }
    for token in alpn.split(',') {
        if token.is_empty() || token.len() > 255 {
            return Err(Error::Config(format!("invalid ALPN protocol token '{token}'")));
        }
        protos.push(token.as_bytes().to_vec());
    }
    Ok(protos)
}

/// Map protocol exclusions (`!TLSv1.2` style) onto the supported versions.
/// SSLv2/SSLv3/TLS<1.2 are never offered, so excluding them is a no-op.
pub fn protocol_versions(
    exclusions: Option<&str>,
) -> Vec<&'static rustls::SupportedProtocolVersion> {
    let mut tls12 = true;
    let mut tls13 = true;
    if let Some(spec) = exclusions {
        for token in spec.split([',', ' ']).filter(|t| !t.is_empty()) {
            match token {
                "!TLSv1.2" => tls12 = false,
                "!TLSv1.3" => tls13 = false,
                "!SSLv2" | "!SSLv3" | "!TLSv1.0" | "!TLSv1.1" | "!TLSv1" => {}
                other => log::warn!("ignoring unknown protocol spec '{other}'"),
            }
        }
    }
    let mut versions = Vec::new();
    if tls12 {
        versions.push(&rustls::version::TLS12);
    }
    if tls13 {
        versions.push(&rustls::version::TLS13);
    }
    versions
}

fn normalize_suite_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase();
    if let Some(rest) = out.strip_prefix("TLS") {
        out = rest.to_string();
    }
    // The provider spells TLS 1.3 suites with a "13" marker.
    if let Some(rest) = out.strip_prefix("13") {
        out = rest.to_string();
    }
    out.replace("WITH", "")
}

/// Select provider cipher suites by configured names (OpenSSL or IANA
/// spelling); unknown names are warned about and skipped.
fn cipher_suites_from(spec: &str) -> Vec<SupportedCipherSuite> {
    let all = aws_lc_rs::default_provider().cipher_suites;
    let mut selected = Vec::new();
    for token in spec.split(':').flat_map(|s| s.split(',')).filter(|s| !s.is_empty()) {
        let wanted = normalize_suite_name(token);
        match all
            .iter()
            .find(|s| normalize_suite_name(&format!("{:?}", s.suite())) == wanted)
        {
            Some(suite) => selected.push(*suite),
            None => log::warn!("unknown cipher suite '{token}' ignored"),
        }
    }
    selected
}

// ============================================================================
// Key log
// ============================================================================

/// NSS-format key log sink, enabled via configuration or `SSLKEYLOGFILE`.
pub struct KeyLogWriter {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl fmt::Debug for KeyLogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyLogWriter({})", self.path.display())
    }
}

impl KeyLogWriter {
    pub fn from_settings(configured: Option<&Path>) -> Option<Arc<Self>> {
        let path = match configured {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(std::env::var_os("SSLKEYLOGFILE")?),
        };
        Some(Arc::new(Self { path, file: Mutex::new(None) }))
    }
}

impl rustls::KeyLog for KeyLogWriter {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let mut guard = self.file.lock().unwrap();
        if guard.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    log::warn!("cannot open key log file {}: {e}", self.path.display());
                    return;
                }
            }
        }
        if let Some(f) = guard.as_mut() {
            let _ = writeln!(f, "{label} {} {}", hex::encode(client_random), hex::encode(secret));
        }
    }

    fn will_log(&self, _label: &str) -> bool {
        true
    }
}

// ============================================================================
// Server contexts
// ============================================================================

/// One long-lived server context: a certificate chain plus key, reloadable
/// in place, with optional OCSP stapling.
pub struct TlsServerContext {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    key_script: Option<PathBuf>,
    certified: RwLock<Arc<CertifiedKey>>,
    stapler: Option<OcspStapler>,
    must_staple: bool,
}

impl fmt::Debug for TlsServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlsServerContext({})", self.cert_path.display())
    }
}

fn certified_key(
    cert_path: &Path,
    key_path: &Path,
    key_script: Option<&Path>,
) -> Result<(CertifiedKey, Vec<rustls::pki_types::CertificateDer<'static>>)> {
    let certs = keys::load_certs(cert_path)?;
    let key = keys::load_private_key(key_path, key_script)?;
    let signing = aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| Error::Pem(format!("unusable private key {}: {e}", key_path.display())))?;
    Ok((CertifiedKey::new(certs.clone(), signing), certs))
}

impl TlsServerContext {
    pub fn new(
        cert_path: PathBuf,
        key_path: Option<PathBuf>,
        key_script: Option<PathBuf>,
        stapling: Option<(PathBuf, Duration)>,
    ) -> Result<Arc<Self>> {
        let key_path = key_path.unwrap_or_else(|| cert_path.clone());
        let (certified, certs) = certified_key(&cert_path, &key_path, key_script.as_deref())?;

        let must_staple = ocsp::has_must_staple(certs[0].as_ref());
        let stapler = match stapling {
            Some((cache_dir, interval)) => {
                let stapler = OcspStapler::from_chain(&certs, cache_dir, interval);
                if stapler.is_none() {
                    log::warn!(
                        "OCSP stapling requested for {} but certificate has no usable \
                         AIA responder or issuer",
                        cert_path.display()
                    );
                }
                stapler
            }
            None => None,
        };
        if must_staple && stapler.is_none() {
            log::warn!(
                "certificate {} carries Must-Staple but stapling is unavailable",
                cert_path.display()
            );
        }

        Ok(Arc::new(Self {
            cert_path,
            key_path,
            key_script,
            certified: RwLock::new(Arc::new(certified)),
            stapler,
            must_staple,
        }))
    }

    /// Re-read certificate chain and private key. Failures are logged and
    /// leave the previous material in place.
    pub fn reload(&self) {
        log::info!("reloading certificate '{}'", self.cert_path.display());
        match certified_key(&self.cert_path, &self.key_path, self.key_script.as_deref()) {
            Ok((certified, _)) => {
                *self.certified.write().unwrap() = Arc::new(certified);
            }
            Err(e) => log::warn!("certificate reload error for {}: {e}", self.cert_path.display()),
        }
    }

    /// Key for one handshake, with a stapled OCSP response attached when
    /// available. Returns None only for a Must-Staple certificate without a
    /// response, which is fatal to the handshake.
    pub fn key_for_handshake(&self) -> Option<Arc<CertifiedKey>> {
        let base = self.certified.read().unwrap().clone();
        let Some(stapler) = &self.stapler else {
            return Some(base);
        };
        match stapler.current_response() {
            Some(der) => {
                let mut stapled = (*base).clone();
                stapled.ocsp = Some(der);
                Some(Arc::new(stapled))
            }
            None if self.must_staple => {
                log::error!(
                    "no OCSP response for Must-Staple certificate {}; failing handshake",
                    self.cert_path.display()
                );
                None
            }
            None => Some(base),
        }
    }
}

type VhostMap = Arc<RwLock<HashMap<String, Arc<TlsServerContext>>>>;

/// Certificate resolver consulting the SNI table, falling back to the
/// driver's default context.
pub struct SniResolver {
    default: Arc<TlsServerContext>,
    port: u16,
    vhosts: VhostMap,
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SniResolver(default {})", self.default.cert_path.display())
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let ctx = client_hello
            .server_name()
            .and_then(|name| {
                let key = format!("{name}:{}", self.port);
                self.vhosts.read().unwrap().get(&key).cloned()
            })
            .unwrap_or_else(|| self.default.clone());
        ctx.key_for_handshake()
    }
}

/// Everything a TLS driver needs to mint server configs: resolver, ALPN,
/// versions, optional suite restriction and key log.
pub struct TlsDriverSetup {
    resolver: Arc<SniResolver>,
    alpn: Vec<Vec<u8>>,
    versions: Vec<&'static rustls::SupportedProtocolVersion>,
    suites: Vec<SupportedCipherSuite>,
    key_log: Option<Arc<KeyLogWriter>>,
}

impl TlsDriverSetup {
    /// Build a server config; `verifier` enables client-certificate
    /// authentication (built per connection so the peer address is known).
    pub fn server_config(
        &self,
        verifier: Option<Arc<dyn ClientCertVerifier>>,
    ) -> Result<Arc<ServerConfig>> {
        let builder = if self.suites.is_empty() {
            ServerConfig::builder_with_protocol_versions(&self.versions)
        } else {
            let mut provider = aws_lc_rs::default_provider();
            provider.cipher_suites = self.suites.clone();
            ServerConfig::builder_with_provider(Arc::new(provider))
                .with_protocol_versions(&self.versions)
                .map_err(Error::Tls)?
        };
        let mut config = match verifier {
            Some(v) => builder.with_client_cert_verifier(v),
            None => builder.with_no_client_auth(),
        }
        .with_cert_resolver(self.resolver.clone());
        config.alpn_protocols = self.alpn.clone();
        config.ignore_client_order = true;
        if let Some(key_log) = &self.key_log {
            config.key_log = key_log.clone();
        }
        Ok(Arc::new(config))
    }
}

// ============================================================================
// Registry
// ============================================================================

static SIGHUP_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sighup(_sig: libc::c_int) {
    SIGHUP_PENDING.store(true, Ordering::Relaxed);
}

/// Registry of all server contexts, keyed by certificate path, plus the
/// SNI host:port table.
#[derive(Default)]
pub struct TlsRegistry {
    contexts: Mutex<Vec<Arc<TlsServerContext>>>,
    vhosts: VhostMap,
}

impl fmt::Debug for TlsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlsRegistry({} contexts)", self.contexts.lock().unwrap().len())
    }
}

impl TlsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for `reload()` on the next `take_reload_request()` after a
    /// SIGHUP.
    pub fn install_sighup_handler(&self) {
        unsafe {
            libc::signal(libc::SIGHUP, on_sighup as libc::sighandler_t);
        }
    }

    pub fn take_reload_request(&self) -> bool {
        SIGHUP_PENDING.swap(false, Ordering::Relaxed)
    }

    fn register(&self, ctx: Arc<TlsServerContext>) {
        self.contexts.lock().unwrap().push(ctx);
    }

    /// Create the driver-level TLS setup from a configuration section:
    /// default context, per-vhost contexts from the `vhostcertificates`
    /// directory, ALPN, protocol and suite restrictions.
    pub fn driver_setup(
        &self,
        settings: &TlsSettings,
        port: u16,
        cache_dir: &Path,
    ) -> Result<TlsDriverSetup> {
        if settings.certificate.as_os_str().is_empty() {
            return Err(Error::Config(
                "certificate parameter must be specified in the TLS section".to_string(),
            ));
        }
        log::info!("load certificate '{}'", settings.certificate.display());

        let stapling = settings
            .ocspstapling
            .then(|| (cache_dir.to_path_buf(), settings.ocsp_check_interval()));
        let default = TlsServerContext::new(
            settings.certificate.clone(),
            settings.key.clone(),
            settings.tlskeyscript.clone(),
            stapling.clone(),
        )?;
        self.register(default.clone());

        if let Some(dir) = &settings.vhostcertificates {
            self.load_vhost_certificates(dir, port, settings, stapling.as_ref())?;
        }

        let alpn = alpn_protocols(&settings.alpn)?;
        let versions = protocol_versions(settings.protocols.as_deref());
        if versions.is_empty() {
            return Err(Error::Config("all TLS protocol versions excluded".to_string()));
        }
        let mut suites = Vec::new();
        if let Some(spec) = &settings.ciphersuites {
            suites.extend(cipher_suites_from(spec));
        }
        if let Some(spec) = &settings.ciphers {
            suites.extend(cipher_suites_from(spec));
        }

        Ok(TlsDriverSetup {
            resolver: Arc::new(SniResolver {
                default,
                port,
                vhosts: self.vhosts.clone(),
            }),
            alpn,
            versions,
            suites,
            key_log: KeyLogWriter::from_settings(settings.tlskeylogfile.as_deref()),
        })
    }

    fn load_vhost_certificates(
        &self,
        dir: &Path,
        port: u16,
        settings: &TlsSettings,
        stapling: Option<&(PathBuf, Duration)>,
    ) -> Result<()> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::Config(format!("vhostcertificates directory {}: {e}", dir.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = if stem.contains(':') {
                stem.to_string()
            } else {
                format!("{stem}:{port}")
            };
            match TlsServerContext::new(
                path.clone(),
                None,
                settings.tlskeyscript.clone(),
                stapling.cloned(),
            ) {
                Ok(ctx) => {
                    log::info!("SNI certificate for {key}: {}", path.display());
                    self.register(ctx.clone());
                    self.vhosts.write().unwrap().insert(key, ctx);
                }
                Err(e) => log::warn!("skipping vhost certificate {}: {e}", path.display()),
            }
        }
        Ok(())
    }

    /// Resolve an SNI name; a `None` result leaves the caller on the
    /// default context.
    pub fn lookup_sni(&self, host: &str, port: u16) -> Option<Arc<TlsServerContext>> {
        self.vhosts.read().unwrap().get(&format!("{host}:{port}")).cloned()
    }

    /// Re-bind certificate chain and private key for every registered
    /// context. Failures are logged but never abort.
    pub fn reload(&self) {
        let contexts = self.contexts.lock().unwrap().clone();
        for ctx in contexts {
            ctx.reload();
        }
    }

    /// Certificate paths plus SNI table for the `certctl list` command.
    pub fn list(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .contexts
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.cert_path.display().to_string())
            .collect();
        for (host, ctx) in self.vhosts.read().unwrap().iter() {
            out.push(format!("{host} -> {}", ctx.cert_path.display()));
        }
        out
    }
}

// ============================================================================
// Client configurations
// ============================================================================

/// Options for outbound TLS (channel `open`/`connect`).
#[derive(Debug, Default, Clone)]
pub struct ClientTlsOptions {
    pub cafile: Option<PathBuf>,
    pub capath: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub insecure: bool,
    pub peer: Option<IpAddr>,
}

/// Build a client configuration. Contexts are created eagerly per dial and
/// dropped with the connection.
pub fn create_client_config(
    opts: &ClientTlsOptions,
    exceptions: Option<Arc<ExceptionStore>>,
) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(cafile) = &opts.cafile {
        for cert in keys::load_certs(cafile)? {
            roots
                .add(cert)
                .map_err(|e| Error::Pem(format!("bad CA cert in {}: {e}", cafile.display())))?;
        }
    }
    if let Some(capath) = &opts.capath {
        for entry in std::fs::read_dir(capath)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("pem") {
                if let Ok(certs) = keys::load_certs(&path) {
                    for cert in certs {
                        let _ = roots.add(cert);
                    }
                }
            }
        }
    }
    let roots = Arc::new(roots);

    let builder = ClientConfig::builder();
    let builder = if opts.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
    } else {
        match (&exceptions, opts.peer) {
            (Some(store), Some(peer)) if !store.is_empty() => {
                let inner = WebPkiServerVerifier::builder(roots.clone())
                    .build()
                    .map_err(|e| Error::Config(format!("verifier: {e}")))?;
                builder.dangerous().with_custom_certificate_verifier(Arc::new(
                    ExceptionServerVerifier::new(inner, store.clone(), peer),
                ))
            }
            _ => builder.with_root_certificates(roots.clone()),
        }
    };

    let mut config = match &opts.cert {
        Some(cert_path) => {
            let certs = keys::load_certs(cert_path)?;
            let key = keys::load_private_key(cert_path, None)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(Error::Tls)?
        }
        None => builder.with_no_client_auth(),
    };
    if let Some(key_log) = KeyLogWriter::from_settings(None) {
        config.key_log = key_log;
    }
    Ok(Arc::new(config))
}

/// Build the per-connection client-certificate verifier for a verify-mode
/// driver, wrapping the webpki verifier with the exception store.
pub fn client_cert_verifier(
    roots: Arc<RootCertStore>,
    store: Arc<ExceptionStore>,
    peer: IpAddr,
) -> Result<Arc<dyn ClientCertVerifier>> {
    let inner = WebPkiClientVerifier::builder(roots)
        .build()
        .map_err(|e| Error::Config(format!("client verifier: {e}")))?;
    Ok(Arc::new(verify::ExceptionClientVerifier::new(inner, store, peer)))
}
