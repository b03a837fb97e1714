//! Conn: one request-processing slot.
//!
//! Slots migrate free-list -> wait-queue -> worker slot -> free-list; at
//! any moment a Conn is reachable from exactly one of those places.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use crate::headers::Headers;
use crate::sock::Sock;

/// Connection flags, mirrored between Sock and Conn.
pub mod flags {
    /// The connection is fully configured and its data may be inspected.
    pub const CONFIGURED: u32 = 0x0001;
    /// The connection is closed from the HTTP pipeline's perspective.
    pub const CLOSED: u32 = 0x0002;
    /// Enqueue already failed once; suppress repeated accounting.
    pub const SOCK_WAITING: u32 = 0x0004;
    /// Suppress response headers (HTTP/0.9).
    pub const SKIPHDRS: u32 = 0x0008;
    /// Suppress the response body (HEAD).
    pub const SKIPBODY: u32 = 0x0010;
}

#[derive(Debug, Default)]
pub struct Conn {
    pub id: u64,
    pub sock: Option<Sock>,
    pub request_line: String,
    pub url: String,
    pub method: String,

    pub request_queue_time: Option<Instant>,
    pub accept_time: Option<Instant>,
    pub request_dequeue_time: Option<Instant>,
    pub filter_done_time: Option<Instant>,

    pub flags: u32,
    pub headers: Headers,
    pub output_headers: Headers,
    pub body: Vec<u8>,
    pub files: HashMap<String, String>,

    pub auth_user: Option<String>,
    pub auth_passwd: Option<String>,

    pub peer: Option<IpAddr>,
    pub output_encoding: Option<String>,
    pub url_encoding: Option<String>,
    pub compress: i32,
    pub rate_limit: i64,
    pub response_status: u16,
    pub content_length: usize,
    pub n_content_sent: usize,
}

impl Conn {
    pub fn is_closed(&self) -> bool {
        self.flags & flags::CLOSED != 0
    }

    /// Reset between requests, keeping allocations (headers capacity)
    /// alive for reuse.
    pub fn reset(&mut self) {
        self.id = 0;
        self.sock = None;
        self.request_line.clear();
        self.url.clear();
        self.method.clear();
        self.request_queue_time = None;
        self.accept_time = None;
        self.request_dequeue_time = None;
        self.filter_done_time = None;
        self.flags = 0;
        self.headers.truncate();
        self.output_headers.truncate();
        self.body.clear();
        self.files.clear();
        self.auth_user = None;
        self.auth_passwd = None;
        self.peer = None;
        self.output_encoding = None;
        self.url_encoding = None;
        self.compress = -1;
        self.rate_limit = -1;
        self.response_status = 0;
        self.content_length = 0;
        self.n_content_sent = 0;
    }

    /// Short id string as used in log context (`cns<id>`).
    pub fn id_string(&self) -> String {
        format!("cns{}", self.id)
    }
}
