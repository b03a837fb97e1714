//! Server configuration.
//!
//! The configuration file is JSON with one `server` section, a `pools` map
//! and a list of `drivers`; TLS settings nest inside the driver that uses
//! them. Every field has a default so a minimal file just names an address
//! and port.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::headers::HeaderCase;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub pools: HashMap<String, PoolSettings>,
    #[serde(default)]
    pub drivers: Vec<DriverSettings>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Settings for the named pool, falling back to defaults.
    pub fn pool(&self, name: &str) -> PoolSettings {
        self.pools.get(name).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub name: String,
    pub defaultpool: String,
    pub hdrcase: String,
    pub compressenable: bool,
    pub compresslevel: i32,
    pub outputencoding: Option<String>,
    pub urlencoding: Option<String>,
    /// Directory for the invalid-certificate archive; archiving is off when
    /// unset.
    pub invalidcertificates: Option<PathBuf>,
    /// Directory for persisted state (OCSP disk cache).
    pub logdir: PathBuf,
    pub validationexceptions: Vec<ValidationExceptionSettings>,
    pub shutdowntimeout: f64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "server1".to_string(),
            defaultpool: "default".to_string(),
            hdrcase: "preserve".to_string(),
            compressenable: false,
            compresslevel: 4,
            outputencoding: None,
            urlencoding: None,
            invalidcertificates: None,
            logdir: PathBuf::from("."),
            validationexceptions: Vec::new(),
            shutdowntimeout: 20.0,
        }
    }
}

impl ServerSettings {
    pub fn header_case(&self) -> HeaderCase {
        HeaderCase::parse(&self.hdrcase).unwrap_or_default()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.shutdowntimeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub minthreads: usize,
    pub maxthreads: usize,
    /// Preallocated Conn slots; enqueue attempts beyond this saturate.
    pub maxconnections: usize,
    /// A worker exits after processing this many connections.
    pub connsperthread: usize,
    /// Idle workers above `minthreads` exit after this long.
    pub threadtimeout: f64,
    pub lowwatermark: usize,
    pub highwatermark: usize,
    pub rejectoverrun: bool,
    pub poolratelimit: i64,
    pub connectionratelimit: i64,
    /// Mapspecs routed to this pool, e.g. `"GET /api/*"`.
    pub map: Vec<String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            minthreads: 1,
            maxthreads: 10,
            maxconnections: 100,
            connsperthread: 10_000,
            threadtimeout: 120.0,
            lowwatermark: 10,
            highwatermark: 80,
            rejectoverrun: false,
            poolratelimit: -1,
            connectionratelimit: -1,
            map: Vec::new(),
        }
    }
}

impl PoolSettings {
    pub fn thread_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.threadtimeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub backlog: i32,
    pub recvwait: f64,
    pub sendwait: f64,
    pub bufsize: usize,
    /// Require and verify client certificates.
    pub verify: bool,
    pub tls: Option<TlsSettings>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            name: "nssock".to_string(),
            address: "127.0.0.1".to_string(),
            port: 8080,
            backlog: 256,
            recvwait: 30.0,
            sendwait: 30.0,
            bufsize: 16_384,
            verify: false,
            tls: None,
        }
    }
}

impl DriverSettings {
    pub fn recv_wait(&self) -> Duration {
        Duration::from_secs_f64(self.recvwait)
    }

    pub fn send_wait(&self) -> Duration {
        Duration::from_secs_f64(self.sendwait)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// PEM file holding the certificate chain (and the key, unless
    /// `key` points elsewhere).
    pub certificate: PathBuf,
    pub key: Option<PathBuf>,
    pub cafile: Option<PathBuf>,
    pub capath: Option<PathBuf>,
    pub ciphers: Option<String>,
    pub ciphersuites: Option<String>,
    /// Protocol exclusions, e.g. `"!TLSv1.0,!TLSv1.1"`.
    pub protocols: Option<String>,
    /// Comma-separated ALPN protocol list.
    pub alpn: String,
    pub ocspstapling: bool,
    pub ocspcheckinterval: f64,
    /// Directory of per-vhost `host:port.pem` files; enables SNI.
    pub vhostcertificates: Option<PathBuf>,
    /// Helper executable printing the key passphrase on stdout.
    pub tlskeyscript: Option<PathBuf>,
    pub tlskeylogfile: Option<PathBuf>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            certificate: PathBuf::new(),
            key: None,
            cafile: None,
            capath: None,
            ciphers: None,
            ciphersuites: None,
            protocols: None,
            alpn: "http/1.1".to_string(),
            ocspstapling: false,
            ocspcheckinterval: 300.0,
            vhostcertificates: None,
            tlskeyscript: None,
            tlskeylogfile: None,
        }
    }
}

impl TlsSettings {
    pub fn ocsp_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.ocspcheckinterval)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ValidationExceptionSettings {
    /// `"10.0.0.5/32"`, a bare address, or empty for all peers.
    pub ip: String,
    /// X.509 error names or numbers; `"*"` accepts every error.
    pub accept: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse_from_empty_object() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.server.defaultpool, "default");
        assert_eq!(cfg.pool("default").maxthreads, 10);
        assert!(cfg.drivers.is_empty());
    }

    #[test]
    fn test_pool_settings_override() {
        let cfg: Config = serde_json::from_str(
            r#"{"pools": {"fast": {"minthreads": 2, "maxthreads": 8,
                "lowwatermark": 1, "highwatermark": 4, "rejectoverrun": true}}}"#,
        )
        .unwrap();
        let fast = cfg.pool("fast");
        assert_eq!(fast.minthreads, 2);
        assert_eq!(fast.maxthreads, 8);
        assert_eq!(fast.highwatermark, 4);
        assert!(fast.rejectoverrun);
        // Unnamed pools keep defaults.
        assert_eq!(cfg.pool("other").connsperthread, 10_000);
    }

    #[test]
    fn test_driver_tls_section() {
        let cfg: Config = serde_json::from_str(
            r#"{"drivers": [{"name": "nsssl", "port": 8443,
                "tls": {"certificate": "/etc/tls/server.pem", "alpn": "h2,http/1.1"}}]}"#,
        )
        .unwrap();
        let tls = cfg.drivers[0].tls.as_ref().unwrap();
        assert_eq!(tls.alpn, "h2,http/1.1");
        assert!(!tls.ocspstapling);
    }
}
