//! Result codes and the generalized errno shared by the socket, channel and
//! pool layers.

use std::fmt;
use std::io;

/// Result codes surfaced at the core boundary.
///
/// Filter phases and the request runner communicate exclusively through
/// these; `FilterBreak` and `FilterReturn` are short-circuits, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Timeout,
    Unauthorized,
    Forbidden,
    Continue,
    FilterBreak,
    FilterReturn,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Error => "ERROR",
            Status::Timeout => "TIMEOUT",
            Status::Unauthorized => "UNAUTHORIZED",
            Status::Forbidden => "FORBIDDEN",
            Status::Continue => "CONTINUE",
            Status::FilterBreak => "FILTER_BREAK",
            Status::FilterReturn => "FILTER_RETURN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generalized errno carried on a `Sock`.
///
/// A single value space covers both OS socket errors and TLS-library
/// failures; `reason()` renders the human string for either namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SockErrno {
    #[default]
    Clear,
    Posix(i32),
    Tls(String),
}

impl SockErrno {
    pub fn from_io(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => SockErrno::Posix(code),
            None => SockErrno::Posix(libc::EIO),
        }
    }

    pub fn from_tls(err: &rustls::Error) -> Self {
        SockErrno::Tls(err.to_string())
    }

    pub fn is_clear(&self) -> bool {
        matches!(self, SockErrno::Clear)
    }

    /// Transient conditions that a caller may retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            SockErrno::Posix(code) => {
                *code == libc::EAGAIN || *code == libc::EWOULDBLOCK || *code == libc::EINTR
            }
            _ => false,
        }
    }

    /// Human-readable reason, POSIX or TLS as appropriate.
    pub fn reason(&self) -> String {
        match self {
            SockErrno::Clear => "ok".to_string(),
            SockErrno::Posix(code) => io::Error::from_raw_os_error(*code).to_string(),
            SockErrno::Tls(msg) => msg.clone(),
        }
    }

    /// Symbolic identifier as used in structured command error codes.
    pub fn id(&self) -> String {
        match self {
            SockErrno::Clear => "OK".to_string(),
            SockErrno::Posix(code) => errno_id(*code).to_string(),
            SockErrno::Tls(_) => "TLS".to_string(),
        }
    }
}

impl fmt::Display for SockErrno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

/// Symbolic name for common POSIX errnos, for structured error codes.
pub fn errno_id(code: i32) -> &'static str {
    match code {
        libc::EPIPE => "EPIPE",
        libc::ECONNRESET => "ECONNRESET",
        libc::ECONNREFUSED => "ECONNREFUSED",
        libc::ETIMEDOUT => "ETIMEDOUT",
        libc::EAGAIN => "EAGAIN",
        libc::EINTR => "EINTR",
        libc::EINVAL => "EINVAL",
        libc::EBADF => "EBADF",
        libc::ENOTCONN => "ENOTCONN",
        libc::EADDRINUSE => "EADDRINUSE",
        libc::EACCES => "EACCES",
        libc::EIO => "EIO",
        _ => "EUNKNOWN",
    }
}

/// Crate-wide error type; public operations return `Result<T, Error>`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("TLS {0}")]
    Tls(#[from] rustls::Error),

    #[error("channel \"{0}\" does not exist")]
    UnknownChannel(String),

    #[error("channel {channel} timeout on {op} operation")]
    ChannelTimeout { channel: String, op: &'static str },

    #[error("POSIX {} {}", errno_id(*.0), SockErrno::Posix(*.0).reason())]
    Posix(i32),

    #[error("timeout")]
    Timeout,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Pem(String),

    #[error("{0}")]
    Command(String),
}

impl Error {
    pub fn from_sock_errno(errno: &SockErrno) -> Self {
        match errno {
            SockErrno::Clear => Error::Posix(0),
            SockErrno::Posix(code) => Error::Posix(*code),
            SockErrno::Tls(msg) => Error::Command(format!("TLS {msg}")),
        }
    }

    /// Structured error code for the dispatcher result slot, in the form
    /// `NS_TIMEOUT`, `POSIX <id> <message>` or `TLS <message>`.
    pub fn error_code(&self) -> String {
        match self {
            Error::Timeout | Error::ChannelTimeout { .. } => "NS_TIMEOUT".to_string(),
            Error::Posix(code) => {
                format!("POSIX {} {}", errno_id(*code), SockErrno::Posix(*code).reason())
            }
            Error::Tls(err) => format!("TLS {err}"),
            Error::Io(err) => match err.raw_os_error() {
                Some(code) => {
                    format!("POSIX {} {}", errno_id(code), SockErrno::Posix(code).reason())
                }
                None => format!("POSIX EUNKNOWN {err}"),
            },
            other => format!("ERROR {other}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(Status::Ok.as_str(), "OK");
        assert_eq!(Status::FilterReturn.as_str(), "FILTER_RETURN");
        assert_eq!(Status::Timeout.to_string(), "TIMEOUT");
    }

    #[test]
    fn test_sock_errno_retryable() {
        assert!(SockErrno::Posix(libc::EAGAIN).is_retryable());
        assert!(SockErrno::Posix(libc::EINTR).is_retryable());
        assert!(!SockErrno::Posix(libc::EPIPE).is_retryable());
        assert!(!SockErrno::Tls("handshake failure".into()).is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Timeout.error_code(), "NS_TIMEOUT");
        let code = Error::Posix(libc::ECONNRESET).error_code();
        assert!(code.starts_with("POSIX ECONNRESET"));
    }
}
