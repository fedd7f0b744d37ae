//! Routing and health core for a pooled HTTP CONNECT forward proxy.
//!
//! `polyproxy-core` sits between TLS clients and a pool of upstream HTTP
//! CONNECT proxies, choosing an upstream per destination host and keeping
//! the pool healthy.
//!
//! # Architecture
//!
//! ```text
//! Client CONNECT host:443
//!       |
//!       v
//! Frontend (accept loop, request classification)
//!       |
//!       +-- blocked host? --> 403
//!       +-- non-443 / direct host? --> raw forward via first-hop proxy
//!       |
//!       v
//! Registry::lookup_cluster(host)
//!       |
//!       v
//! Cluster (ordered pool of OutProxies)
//!       |
//!       +-- walk pool: skip bad, skip used, try CONNECT
//!       |      success --> move to front, bridge bytes until close
//!       |      failure --> move to back, try next
//!       |
//!       v
//! Upstream OutProxy --> CONNECT target:443 --> TLS tunnel
//! ```
//!
//! # Components
//!
//! - [`HostPattern`]: exact and `*.`-wildcard destination matching
//! - [`OutProxy`]: one upstream proxy with adaptive timeout and health state
//! - [`Cluster`]: ordered pool bound to a host pattern, with MRU promotion
//! - [`Registry`]: destination host → cluster dispatch, plus the
//!   background certificate checker and temporary-cluster housekeeper
//! - [`Frontend`]: the listening server that classifies inbound requests
//!
//! Background health probing (`CertCheck`) opens a tunnel through every
//! pool member to the cluster's representative host, performs a TLS
//! handshake and a throwaway GET, and demotes proxies that fail or serve
//! an interstitial block page.

mod admin;
mod cluster;
mod connection;
mod outproxy;
mod pattern;
mod registry;
mod server;

pub use cluster::Cluster;
pub use connection::RequestHead;
pub use outproxy::OutProxy;
pub use pattern::{BlockHost, HostPattern};
pub use registry::Registry;
pub use server::Frontend;

use std::sync::OnceLock;
use std::time::Instant;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind the listen address.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Every usable proxy in the pool was tried and failed.
    #[error("No good proxy for {domain}")]
    NoGoodProxy { domain: String },

    /// A CONNECT peer answered with a non-200 status line.
    #[error("Server returns error: {status_line}")]
    ConnectRejected { status_line: String },

    /// No CONNECT response arrived within the adaptive deadline.
    #[error("timed out waiting for CONNECT response from {addr}")]
    ConnectTimeout { addr: String },

    /// The connection closed before any CONNECT response.
    #[error("remote connection to {addr} closed")]
    ConnectClosed { addr: String },

    /// The first-hop proxy could not be used.
    #[error("middle proxy {addr}: {message}")]
    MiddleProxy { addr: String, message: String },

    /// The TLS handshake of a health probe failed.
    #[error("TLS handshake with {domain} failed: {message}")]
    TlsHandshake { domain: String, message: String },

    /// The probe response matched a known interstitial block page.
    #[error("interstitial detected: {marker}")]
    Interstitial { marker: &'static str },

    /// A health probe failed after the tunnel was established.
    #[error("probe of {domain} failed: {message}")]
    Probe { domain: String, message: String },

    /// An inbound request could not be parsed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Milliseconds elapsed on the process monotonic clock.
///
/// Health state (`bad_until`, temporary-cluster expiry) is kept as
/// offsets on this clock so it can live in atomics shared across
/// clusters.
pub(crate) fn mono_now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}
