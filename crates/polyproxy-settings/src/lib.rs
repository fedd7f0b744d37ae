//! Plain-text configuration for the polyproxy forward proxy.
//!
//! The config file is line-based with INI-ish section tags. A `[tag]`
//! line selects the current section; every following non-empty,
//! non-comment line is an entry in that section:
//!
//! ```text
//! [server]
//! 127.0.0.1:8080
//! [upstream]
//! proxy-a.example.net:3128
//! proxy-b.example.net:3128
//! [proxy]
//! first-hop.example.net:8080
//! [direct]
//! *.internal.example.com
//! [cluster]
//! www.example.com=*.example.com
//! [block]
//! ads.example.org
//! ```
//!
//! Lines starting with `#` and blank lines are ignored. Section order is
//! free; unknown sections are skipped. `[server]` holds the listen
//! address, `[upstream]` the ordered pool of outbound CONNECT proxies,
//! `[proxy]` an optional first-hop proxy, `[direct]` host patterns that
//! bypass cluster routing, `[cluster]` `certHost=hostPattern` pairs, and
//! `[block]` host patterns rejected outright.

use std::path::Path;
use thiserror::Error;

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// A line could not be interpreted in its section.
    #[error("config line {line}: {message}")]
    Parse { line: usize, message: String },

    /// I/O error reading a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The parsed config is structurally incomplete.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A `[cluster]` entry: a representative probe host bound to a host pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    /// Domain probed by the certificate checker for this cluster.
    pub cert_host: String,
    /// Host pattern (exact or `*.domain`) routed to this cluster.
    pub pattern: String,
}

/// Parsed proxy configuration, corresponding to one config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Listen address from `[server]`.
    pub listen: String,

    /// Ordered outbound proxy pool from `[upstream]`.
    pub upstreams: Vec<String>,

    /// Optional first-hop proxy from `[proxy]`.
    pub middle: Option<String>,

    /// Host patterns from `[direct]` that bypass cluster routing.
    pub direct: Vec<String>,

    /// Cluster definitions from `[cluster]`, in file order.
    pub clusters: Vec<ClusterSpec>,

    /// Host patterns from `[block]` rejected with 403.
    pub block: Vec<String>,
}

impl Config {
    /// Parse a `Config` from the text of a config file.
    ///
    /// # Errors
    /// Returns `SettingsError::Parse` for a `[cluster]` line without `=`.
    pub fn parse(text: &str) -> Result<Self, SettingsError> {
        let mut config = Config::default();
        let mut section = String::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                section = line.to_string();
                continue;
            }
            match section.as_str() {
                "[server]" => config.listen = line.to_string(),
                "[upstream]" => config.upstreams.push(line.to_string()),
                "[proxy]" => config.middle = Some(line.to_string()),
                "[direct]" => config.direct.push(line.to_string()),
                "[cluster]" => {
                    let (cert_host, pattern) =
                        line.split_once('=').ok_or_else(|| SettingsError::Parse {
                            line: idx + 1,
                            message: format!("cluster entry without '=': {line}"),
                        })?;
                    config.clusters.push(ClusterSpec {
                        cert_host: cert_host.to_string(),
                        pattern: pattern.to_string(),
                    });
                }
                "[block]" => config.block.push(line.to_string()),
                // Unknown sections (and lines before any section) are skipped.
                _ => {}
            }
        }
        Ok(config)
    }

    /// Load a `Config` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or `SettingsError::Parse`
    /// if the file content is malformed.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Check structural completeness: a listen address and a non-empty pool.
    ///
    /// # Errors
    /// Returns `SettingsError::Invalid` naming the missing piece.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.listen.is_empty() {
            return Err(SettingsError::Invalid(
                "missing [server] listen address".to_string(),
            ));
        }
        if self.upstreams.is_empty() {
            return Err(SettingsError::Invalid(
                "missing [upstream] proxy pool".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize back into the config file format.
    ///
    /// Loading the dump produces an equivalent config: proxy order and
    /// cluster order are preserved, and an absent `[proxy]` section stays
    /// absent.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        out.push_str("[server]\n");
        out.push_str(&self.listen);
        out.push('\n');
        out.push_str("[upstream]\n");
        for addr in &self.upstreams {
            out.push_str(addr);
            out.push('\n');
        }
        out.push_str("[proxy]\n");
        if let Some(middle) = &self.middle {
            out.push_str(middle);
            out.push('\n');
        }
        out.push_str("[direct]\n");
        for host in &self.direct {
            out.push_str(host);
            out.push('\n');
        }
        out.push_str("[cluster]\n");
        for spec in &self.clusters {
            out.push_str(&spec.cert_host);
            out.push('=');
            out.push_str(&spec.pattern);
            out.push('\n');
        }
        out.push_str("[block]\n");
        for host in &self.block {
            out.push_str(host);
            out.push('\n');
        }
        out
    }
}
