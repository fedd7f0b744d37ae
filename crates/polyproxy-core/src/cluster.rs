//! Ordered proxy pools and the per-request selection state machine.
//!
//! A cluster owns an ordered pool of [`OutProxy`] handles bound to one
//! host pattern. The order is the policy: a successful proxy moves to
//! the front and serves the next request first, a failing proxy moves to
//! the back and is revisited only after the rest of the pool.
//!
//! # Selection Flow
//!
//! ```text
//! handle_session
//!       |
//!       v
//! pick first pool entry: not bad, not yet used this request
//!       |
//!       +-- none left --> "no good proxy"
//!       |
//!       v
//! attempt_once: dial (via middle proxy if configured), run handler
//!       |
//!       +-- established --> move to front, await done, count success
//!       +-- soft failure --> move to back, count failure, pick again
//!       +-- critical -----> abort (first hop unusable)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

use crate::connection::{
    open_middle, transfer, Handler, MiddleError, RequestHead, Session, RESPONSE_FORBIDDEN,
};
use crate::outproxy::check_connect_ok;
use crate::{mono_now_ms, HostPattern, OutProxy, ProxyError, Result};

/// Iteration bound for one selection. A pool with more than 128 usable
/// proxies will not be fully explored in one request.
const SELECTION_GUARD: u32 = 128;

/// Cap on a tunnel's total lifetime once established.
const TUNNEL_MAX: Duration = Duration::from_secs(24 * 60 * 60);

/// Body markers of interstitial block pages served instead of the real
/// destination.
const INTERSTITIAL_MARKERS: [&str; 3] = [
    "<title>Attention Required! | Cloudflare</title>",
    r#"<script src="https://www.google.com/recaptcha/api.js" async defer></script>"#,
    "https://www.google.com/sorry/index?continue",
];

/// Outcome of one attempt against one outproxy.
enum Attempt {
    /// Tunnel or probe is up; the receiver fires when it finishes.
    Established(oneshot::Receiver<()>),
    /// This proxy failed; try the next one.
    Soft(ProxyError),
    /// The first hop is unusable; trying more outproxies is pointless.
    Critical(ProxyError),
}

/// An ordered pool of outproxies bound to a host pattern.
pub struct Cluster {
    host: HostPattern,
    cert_host: String,
    /// Pool order carries the MRU policy. The lock is never held across
    /// a dial or any other await point.
    pool: Mutex<VecDeque<Arc<OutProxy>>>,
    /// Last successful probe; `None` while the cluster is unhealthy.
    cert_ok: Mutex<Option<SystemTime>>,
    /// Expiry on the monotonic clock; meaningful for temporary clusters.
    expire_ms: AtomicU64,
}

impl Cluster {
    pub fn new(host: HostPattern, cert_host: String, proxies: Vec<Arc<OutProxy>>) -> Self {
        Self {
            host,
            cert_host,
            pool: Mutex::new(proxies.into()),
            cert_ok: Mutex::new(None),
            expire_ms: AtomicU64::new(0),
        }
    }

    pub fn host(&self) -> &HostPattern {
        &self.host
    }

    pub fn cert_host(&self) -> &str {
        &self.cert_host
    }

    pub fn matches(&self, host: &str) -> bool {
        self.host.matches(host)
    }

    pub fn cert_ok(&self) -> Option<SystemTime> {
        *self
            .cert_ok
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn set_cert_ok(&self, value: Option<SystemTime>) {
        *self
            .cert_ok
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = value;
    }

    /// Push the expiry out to `ttl` from now.
    pub fn refresh_expire(&self, ttl: Duration) {
        self.expire_ms
            .store(mono_now_ms() + ttl.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn is_expired(&self) -> bool {
        self.expire_ms.load(Ordering::Relaxed) <= mono_now_ms()
    }

    #[cfg(test)]
    pub(crate) fn force_expire(&self) {
        self.expire_ms.store(0, Ordering::Relaxed);
    }

    /// Snapshot of the pool in current order.
    pub fn proxies_snapshot(&self) -> Vec<Arc<OutProxy>> {
        self.pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Demote the front proxy to the back (admin `bad` op). Returns the
    /// demoted proxy.
    pub fn demote_front(&self) -> Option<Arc<OutProxy>> {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        let front = pool.pop_front()?;
        pool.push_back(Arc::clone(&front));
        Some(front)
    }

    /// First pool entry that is neither penalized nor already used in
    /// this request.
    fn pick_candidate(&self, used: &[Arc<OutProxy>]) -> Option<Arc<OutProxy>> {
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.iter()
            .find(|p| !p.is_bad() && !used.iter().any(|u| Arc::ptr_eq(u, p)))
            .cloned()
    }

    fn move_to_front(&self, proxy: &Arc<OutProxy>) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(idx) = pool.iter().position(|p| Arc::ptr_eq(p, proxy)) {
            if let Some(entry) = pool.remove(idx) {
                pool.push_front(entry);
            }
        }
    }

    fn move_to_back(&self, proxy: &Arc<OutProxy>) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(idx) = pool.iter().position(|p| Arc::ptr_eq(p, proxy)) {
            if let Some(entry) = pool.remove(idx) {
                pool.push_back(entry);
            }
        }
    }

    /// Serve one client CONNECT through this cluster's pool.
    ///
    /// Blocks until the tunnel finishes. On failure the client receives
    /// a 403 before its socket is dropped.
    pub async fn run_tunnel(
        &self,
        middle: Option<&str>,
        domain: &str,
        client: TcpStream,
        head: RequestHead,
    ) -> Result<()> {
        let mut session = Session::new_tunnel(domain, client, head);
        match self.handle_session(middle, &mut session).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(mut client) = session.take_client() {
                    let _ = client.write_all(RESPONSE_FORBIDDEN).await;
                }
                Err(err)
            }
        }
    }

    /// The selection state machine.
    async fn handle_session(&self, middle: Option<&str>, session: &mut Session) -> Result<()> {
        let mut used: Vec<Arc<OutProxy>> = Vec::new();
        let mut guard = 0u32;

        loop {
            guard += 1;
            if guard > SELECTION_GUARD {
                warn!(domain = %session.domain(), "selection guard tripped");
                break;
            }
            let Some(proxy) = self.pick_candidate(&used) else {
                break;
            };
            used.push(Arc::clone(&proxy));
            info!(outproxy = %proxy.addr(), domain = %session.domain(), "try");

            match self.attempt_once(middle, session, &proxy).await {
                Attempt::Established(done) => {
                    self.move_to_front(&proxy);
                    let _ = done.await;
                    proxy.dec_running();
                    proxy.record_success();
                    return Ok(());
                }
                Attempt::Soft(err) => {
                    warn!(session = %session.describe(), error = %err, "attempt failed");
                    self.move_to_back(&proxy);
                    proxy.record_failure();
                }
                Attempt::Critical(err) => {
                    warn!(error = %err, "CRITICAL");
                    break;
                }
            }
        }

        warn!(domain = %session.domain(), "no proxy found");
        Err(ProxyError::NoGoodProxy {
            domain: session.domain().to_string(),
        })
    }

    /// One attempt against one outproxy: open a socket (through the
    /// first-hop proxy when configured), then run the session's handler.
    async fn attempt_once(
        &self,
        middle: Option<&str>,
        session: &mut Session,
        proxy: &Arc<OutProxy>,
    ) -> Attempt {
        let upstream = if let Some(middle) = middle {
            match open_middle(middle, proxy.addr()).await {
                Ok(stream) => stream,
                Err(MiddleError::Status(line)) => {
                    // The middle proxy answered, so the hop works; the
                    // outproxy it was asked for is to blame.
                    proxy.penalize();
                    return Attempt::Critical(ProxyError::ConnectRejected { status_line: line });
                }
                Err(err) => return Attempt::Critical(err.into_proxy_error(middle)),
            }
        } else {
            match tokio::time::timeout(proxy.timeout(), TcpStream::connect(proxy.addr())).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    proxy.penalize();
                    return Attempt::Soft(e.into());
                }
                Err(_) => {
                    proxy.penalize();
                    return Attempt::Soft(ProxyError::ConnectTimeout {
                        addr: proxy.addr().to_string(),
                    });
                }
            }
        };

        session.outproxy = Some(Arc::clone(proxy));
        let (done_tx, done_rx) = oneshot::channel();
        let is_tunnel = matches!(session.handler(), Handler::Tunnel);
        let result = if is_tunnel {
            tunnel_attempt(upstream, done_tx, session).await
        } else {
            probe_attempt(upstream, done_tx, session).await
        };
        match result {
            Ok(()) => {
                proxy.clear_bad();
                proxy.inc_running();
                info!(outproxy = %proxy.addr(), running = proxy.running(), "running");
                Attempt::Established(done_rx)
            }
            Err((err, penalty)) => {
                if penalty {
                    proxy.penalize();
                }
                Attempt::Soft(err)
            }
        }
    }

    /// One probe cycle against `cert_host`.
    ///
    /// Phase one sweeps the whole pool in parallel, one probe per
    /// member, demoting failures only after every probe finished so the
    /// sweep observes a stable order. Phase two confirms serially
    /// through the normal selection path and publishes the result in
    /// `cert_ok`.
    pub async fn cert_check(self: Arc<Self>, middle: Option<String>) {
        info!(cluster = %self.cert_host, "start certcheck");

        let mut sweeps = Vec::new();
        for proxy in self.proxies_snapshot() {
            if proxy.is_bad() {
                continue;
            }
            let cluster = Arc::clone(&self);
            let middle = middle.clone();
            sweeps.push(tokio::spawn(async move {
                let mut session = Session::new_probe(cluster.cert_host());
                match cluster
                    .attempt_once(middle.as_deref(), &mut session, &proxy)
                    .await
                {
                    Attempt::Established(done) => {
                        let _ = done.await;
                        proxy.dec_running();
                        proxy.record_success();
                        None
                    }
                    Attempt::Soft(err) | Attempt::Critical(err) => {
                        warn!(outproxy = %proxy.addr(), error = %err, "sweep probe failed");
                        proxy.record_failure();
                        Some(proxy)
                    }
                }
            }));
        }
        let mut failed = Vec::new();
        for handle in sweeps {
            if let Ok(Some(proxy)) = handle.await {
                failed.push(proxy);
            }
        }
        for proxy in &failed {
            self.move_to_back(proxy);
        }

        let mut session = Session::new_probe(&self.cert_host);
        match self.handle_session(middle.as_deref(), &mut session).await {
            Ok(()) => {
                self.set_cert_ok(Some(SystemTime::now()));
                info!(cluster = %self.cert_host, "done certcheck");
            }
            Err(err) => {
                self.set_cert_ok(None);
                warn!(cluster = %self.cert_host, error = %err, "fail certcheck");
            }
        }
    }
}

/// Tunnel handler: forward the client's rewritten CONNECT head, require
/// a 200, then hand the byte streams to a background bridge task.
async fn tunnel_attempt(
    mut upstream: TcpStream,
    done: oneshot::Sender<()>,
    session: &mut Session,
) -> std::result::Result<(), (ProxyError, bool)> {
    let Some(proxy) = session.outproxy.clone() else {
        return Err((
            ProxyError::Internal("tunnel session without selected outproxy".to_string()),
            false,
        ));
    };
    let head = match session.head() {
        Some(head) => head,
        None => {
            return Err((
                ProxyError::Internal("tunnel session without request head".to_string()),
                false,
            ))
        }
    };
    if let Err(e) = upstream.write_all(&head.to_proxy_bytes()).await {
        return Err((e.into(), false));
    }
    let response = match proxy.check_connect(&mut upstream).await {
        Ok(buf) => buf,
        Err(err) => return Err((err, false)),
    };
    if let Err(err) = check_connect_ok(&response) {
        return Err((err, false));
    }

    info!(domain = %session.domain(), outproxy = %proxy.addr(), "start communication");

    let Some(mut client) = session.take_client() else {
        return Err((
            ProxyError::Internal("tunnel session without client socket".to_string()),
            false,
        ));
    };
    let domain = session.domain().to_string();
    tokio::spawn(async move {
        // The 200 must reach the client before any tunneled bytes.
        if client.write_all(&response).await.is_ok() {
            let _ = tokio::time::timeout(TUNNEL_MAX, transfer(client, upstream)).await;
        }
        info!(%domain, "done communication");
        let _ = done.send(());
    });

    Ok(())
}

/// Probe handler: tunnel to `<domain>:443`, TLS-handshake, issue a
/// throwaway GET and scan the response for interstitial block pages.
async fn probe_attempt(
    mut upstream: TcpStream,
    done: oneshot::Sender<()>,
    session: &Session,
) -> std::result::Result<(), (ProxyError, bool)> {
    let Some(proxy) = session.outproxy.clone() else {
        return Err((
            ProxyError::Internal("probe session without selected outproxy".to_string()),
            false,
        ));
    };
    let domain = session.domain();
    let msg = format!("CONNECT {domain}:443 HTTP/1.0\r\n\r\n");
    if let Err(e) = upstream.write_all(msg.as_bytes()).await {
        return Err((e.into(), true));
    }
    let response = match proxy.check_connect(&mut upstream).await {
        Ok(buf) => buf,
        // A timeout already grew the adaptive deadline; a closed or
        // broken connection in the CONNECT phase blames the outproxy.
        Err(err @ ProxyError::ConnectTimeout { .. }) => return Err((err, false)),
        Err(err) => return Err((err, true)),
    };
    if let Err(err) = check_connect_ok(&response) {
        return Err((err, true));
    }

    info!(%domain, outproxy = %proxy.addr(), "start certcheck communication");

    let server_name = match rustls::pki_types::ServerName::try_from(domain.to_string()) {
        Ok(name) => name,
        Err(e) => {
            return Err((
                ProxyError::TlsHandshake {
                    domain: domain.to_string(),
                    message: e.to_string(),
                },
                false,
            ))
        }
    };
    let mut tls = match tls_connector().connect(server_name, upstream).await {
        Ok(tls) => tls,
        Err(e) => {
            return Err((
                ProxyError::TlsHandshake {
                    domain: domain.to_string(),
                    message: e.to_string(),
                },
                false,
            ))
        }
    };
    info!(%domain, "cert good");

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {domain}\r\nUser-Agent: curl/7.58.0\r\nAccept: */*\r\n\r\n"
    );
    if let Err(e) = tls.write_all(request.as_bytes()).await {
        return Err((e.into(), false));
    }

    let mut buf = vec![0u8; 4096];
    let n = match tokio::time::timeout(proxy.timeout(), tls.read(&mut buf)).await {
        Err(_) => {
            return Err((
                ProxyError::Probe {
                    domain: domain.to_string(),
                    message: "timed out waiting for GET / response".to_string(),
                },
                false,
            ))
        }
        Ok(Ok(0)) => {
            return Err((
                ProxyError::Probe {
                    domain: domain.to_string(),
                    message: "remote TLS connection closed".to_string(),
                },
                false,
            ))
        }
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            return Err((
                ProxyError::Probe {
                    domain: domain.to_string(),
                    message: e.to_string(),
                },
                false,
            ))
        }
    };

    let body = String::from_utf8_lossy(&buf[..n]);
    if let Some(marker) = find_interstitial(&body) {
        return Err((ProxyError::Interstitial { marker }, false));
    }

    let domain = domain.to_string();
    tokio::spawn(async move {
        drop(tls);
        info!(%domain, "done certcheck ok");
        let _ = done.send(());
    });

    Ok(())
}

/// Best-effort scan for a known blocking-page marker.
fn find_interstitial(body: &str) -> Option<&'static str> {
    INTERSTITIAL_MARKERS
        .iter()
        .find(|marker| body.contains(*marker))
        .copied()
}

/// Shared TLS client configuration for probes. Probes are a
/// reachability heuristic: a handshake failure demotes nothing
/// permanently.
fn tls_connector() -> TlsConnector {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    let config = CONFIG.get_or_init(|| {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    });
    TlsConnector::from(Arc::clone(config))
}
