//! Upstream CONNECT proxy records.
//!
//! An [`OutProxy`] is shared by reference into every cluster that pools
//! it, so all mutable state lives in atomics: counters interleave freely
//! across clusters, the adaptive timeout only ever grows (read +
//! `fetch_max`), and a later `bad_until` extension always supersedes an
//! earlier one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::AsyncRead;
use tracing::info;

use crate::{mono_now_ms, ProxyError, Result};

/// Initial CONNECT-response deadline.
const INITIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Growth applied when a CONNECT response times out.
const TIMEOUT_STEP: Duration = Duration::from_secs(5);

/// Upper bound for the adaptive deadline.
const MAX_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a penalized proxy stays unusable.
const PENALTY: Duration = Duration::from_secs(10 * 60);

/// One upstream HTTP CONNECT proxy.
pub struct OutProxy {
    addr: String,
    timeout_ms: AtomicU64,
    bad_until_ms: AtomicU64,
    num_running: AtomicU64,
    success: AtomicU64,
    fail: AtomicU64,
}

impl OutProxy {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout_ms: AtomicU64::new(INITIAL_TIMEOUT.as_millis() as u64),
            bad_until_ms: AtomicU64::new(0),
            num_running: AtomicU64::new(0),
            success: AtomicU64::new(0),
            fail: AtomicU64::new(0),
        }
    }

    /// Proxy address as `host:port`.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Current adaptive CONNECT-response deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Grow the deadline by one step, capped. Concurrent growers race
    /// benignly: `fetch_max` keeps the result non-decreasing.
    fn extend_timeout(&self) {
        let current = self.timeout_ms.load(Ordering::Relaxed);
        let next = (current + TIMEOUT_STEP.as_millis() as u64)
            .min(MAX_TIMEOUT.as_millis() as u64);
        if next != current {
            info!(addr = %self.addr, from_ms = current, to_ms = next, "outproxy timeout change");
            self.timeout_ms.fetch_max(next, Ordering::Relaxed);
        }
    }

    /// True while the proxy is under a penalty window.
    pub fn is_bad(&self) -> bool {
        self.bad_until_ms.load(Ordering::Relaxed) > mono_now_ms()
    }

    /// Mark the proxy unusable for the next ten minutes. A concurrent
    /// longer penalty wins.
    pub fn penalize(&self) {
        self.bad_until_ms
            .fetch_max(mono_now_ms() + PENALTY.as_millis() as u64, Ordering::Relaxed);
    }

    /// Make the proxy immediately reusable again.
    pub fn clear_bad(&self) {
        self.bad_until_ms.store(mono_now_ms(), Ordering::Relaxed);
    }

    pub fn inc_running(&self) {
        self.num_running.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_running(&self) {
        self.num_running.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn running(&self) -> u64 {
        self.num_running.load(Ordering::Relaxed)
    }

    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.fail.load(Ordering::Relaxed)
    }

    /// One dump row: `<o|x> <addr> <success> <fail> to:<timeout>`.
    pub fn line(&self) -> String {
        let state = if self.is_bad() { "x" } else { "o" };
        format!(
            "{} {} {} {} to:{}s\n",
            state,
            self.addr,
            self.successes(),
            self.failures(),
            self.timeout().as_secs()
        )
    }

    /// Read the CONNECT response (at most 256 bytes) under the adaptive
    /// deadline.
    ///
    /// A timeout grows the deadline for the next attempt and fails this
    /// one; EOF before any byte fails. The raw bytes are returned so the
    /// tunnel handler can replay the recorded response to the client.
    pub async fn check_connect<S>(&self, stream: &mut S) -> Result<Vec<u8>>
    where
        S: AsyncRead + Unpin,
    {
        use tokio::io::AsyncReadExt;

        let mut buf = [0u8; 256];
        match tokio::time::timeout(self.timeout(), stream.read(&mut buf)).await {
            Err(_) => {
                self.extend_timeout();
                Err(ProxyError::ConnectTimeout {
                    addr: self.addr.clone(),
                })
            }
            Ok(Ok(0)) => Err(ProxyError::ConnectClosed {
                addr: self.addr.clone(),
            }),
            Ok(Ok(n)) => Ok(buf[..n].to_vec()),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

/// Check a CONNECT status line: the second token of the first CRLF line
/// must be `200`.
pub(crate) fn check_connect_ok(response: &[u8]) -> Result<()> {
    let text = String::from_utf8_lossy(response);
    let status_line = text.split("\r\n").next().unwrap_or("");
    let code = status_line.split(' ').nth(1);
    if code == Some("200") {
        Ok(())
    } else {
        Err(ProxyError::ConnectRejected {
            status_line: status_line.to_string(),
        })
    }
}
