//! Per-request session state and the byte-level plumbing shared by the
//! tunnel and probe paths: request-head parsing, the first-hop proxy
//! handshake, and the bidirectional relay.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::outproxy::check_connect_ok;
use crate::{OutProxy, ProxyError, Result};

/// How much data to read for the request head before it's considered
/// invalid. 8 KiB is plenty for a proxy request line plus headers.
pub(crate) const HEADER_SECTION_MAX: usize = 8192;

/// Deadline for dialing the first-hop proxy and reading its CONNECT
/// response.
const MIDDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period after one tunnel direction closes, letting in-flight
/// bytes of the other direction flush.
const SETTLE: Duration = Duration::from_secs(1);

/// Canned 403 sent for blocked hosts and exhausted pools.
pub(crate) const RESPONSE_FORBIDDEN: &[u8] =
    b"HTTP/1.1 403 Forbidden\r\nConnection: close\r\n\r\n";

/// A parsed HTTP request line plus headers, byte-faithful enough to be
/// replayed upstream.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Header name/value pairs in arrival order.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse the head section (request line + headers, no trailing blank
    /// line required).
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| ProxyError::BadRequest("empty request".to_string()))?;
        let mut parts = request_line.split(' ');
        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) if !m.is_empty() && !t.is_empty() => {
                (m.to_string(), t.to_string(), v.to_string())
            }
            _ => {
                return Err(ProxyError::BadRequest(format!(
                    "malformed request line: {request_line}"
                )))
            }
        };

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(ProxyError::BadRequest(format!(
                    "malformed header line: {line}"
                )));
            };
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method,
            target,
            version,
            headers,
        })
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Destination of a CONNECT request: `(host, port)`. The port is the
    /// raw token so non-numeric ports fall through to the direct path.
    pub fn connect_target(&self) -> (String, String) {
        match self.target.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.to_string()),
            None => (self.target.clone(), String::new()),
        }
    }

    /// Host component of an absolute-form target
    /// (`http://host[:port]/path`), if present.
    pub fn absolute_host(&self) -> Option<String> {
        let rest = self
            .target
            .strip_prefix("http://")
            .or_else(|| self.target.strip_prefix("https://"))?;
        let authority = rest.split('/').next()?;
        if authority.is_empty() {
            return None;
        }
        let host = authority.rsplit_once(':').map_or(authority, |(h, _)| h);
        Some(host.to_string())
    }

    /// Serialize for forwarding to a proxy, rewriting
    /// `Proxy-Connection: Keep-Alive` to `close` and appending
    /// `Connection: close`.
    pub fn to_proxy_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("connection") {
                continue;
            }
            if name.eq_ignore_ascii_case("proxy-connection")
                && value.eq_ignore_ascii_case("keep-alive")
            {
                out.push_str(name);
                out.push_str(": close\r\n");
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("Connection: close\r\n\r\n");
        out.into_bytes()
    }
}

/// Read the request head from a client socket.
///
/// Returns the parsed head and any bytes that arrived after the header
/// section (forwarded verbatim on the non-tunnel paths).
pub(crate) async fn read_request_head(
    stream: &mut TcpStream,
) -> Result<(RequestHead, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::BadRequest(
                "connection closed before request head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let head_text = String::from_utf8_lossy(&buf[..end]).into_owned();
            let head = RequestHead::parse(&head_text)?;
            let remainder = buf[end + 4..].to_vec();
            return Ok((head, remainder));
        }
        if buf.len() > HEADER_SECTION_MAX {
            return Err(ProxyError::BadRequest(
                "request head exceeds 8KiB".to_string(),
            ));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Which side of the proxy a session serves.
pub(crate) enum Handler {
    /// A client CONNECT to be bridged through an outproxy.
    Tunnel,
    /// A synthetic health probe against the cluster's cert host.
    CertProbe,
}

/// One in-flight destination-session.
///
/// Created per client request or per probe, owned by the handling task,
/// discarded after the handler returns.
pub(crate) struct Session {
    domain: String,
    handler: Handler,
    /// Inbound client socket; `None` for probes. Taken by the bridge
    /// task only on success, so failed attempts leave the client
    /// untouched for the next proxy in the pool.
    client: Option<TcpStream>,
    head: Option<RequestHead>,
    pub(crate) outproxy: Option<Arc<OutProxy>>,
}

impl Session {
    pub(crate) fn new_tunnel(domain: &str, client: TcpStream, head: RequestHead) -> Self {
        Self {
            domain: domain.to_string(),
            handler: Handler::Tunnel,
            client: Some(client),
            head: Some(head),
            outproxy: None,
        }
    }

    pub(crate) fn new_probe(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            handler: Handler::CertProbe,
            client: None,
            head: None,
            outproxy: None,
        }
    }

    pub(crate) fn domain(&self) -> &str {
        &self.domain
    }

    pub(crate) fn handler(&self) -> &Handler {
        &self.handler
    }

    pub(crate) fn head(&self) -> Option<&RequestHead> {
        self.head.as_ref()
    }

    pub(crate) fn take_client(&mut self) -> Option<TcpStream> {
        self.client.take()
    }

    pub(crate) fn describe(&self) -> String {
        match self.handler {
            Handler::Tunnel => format!("Normal for {}", self.domain),
            Handler::CertProbe => format!("CertCheck for {}", self.domain),
        }
    }
}

/// Failure modes of the first-hop proxy handshake. Dial and read
/// failures mean the hop itself is broken; a non-200 status blames the
/// requested outproxy.
pub(crate) enum MiddleError {
    Dial(std::io::Error),
    Read(ProxyError),
    Status(String),
}

impl MiddleError {
    pub(crate) fn into_proxy_error(self, middle: &str) -> ProxyError {
        match self {
            MiddleError::Dial(e) => ProxyError::MiddleProxy {
                addr: middle.to_string(),
                message: format!("dial: {e}"),
            },
            MiddleError::Read(e) => ProxyError::MiddleProxy {
                addr: middle.to_string(),
                message: e.to_string(),
            },
            MiddleError::Status(line) => ProxyError::ConnectRejected { status_line: line },
        }
    }
}

/// Open a tunnel to `outproxy_addr` through the first-hop proxy:
/// dial, send `CONNECT <addr> HTTP/1.0`, require a 200 within 10s.
pub(crate) async fn open_middle(
    middle: &str,
    outproxy_addr: &str,
) -> std::result::Result<TcpStream, MiddleError> {
    let mut stream = match tokio::time::timeout(MIDDLE_TIMEOUT, TcpStream::connect(middle)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(MiddleError::Dial(e)),
        Err(_) => {
            return Err(MiddleError::Dial(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connection timed out",
            )))
        }
    };

    let msg = format!("CONNECT {outproxy_addr} HTTP/1.0\r\n\r\n");
    if let Err(e) = stream.write_all(msg.as_bytes()).await {
        return Err(MiddleError::Read(e.into()));
    }

    let mut buf = [0u8; 256];
    let n = match tokio::time::timeout(MIDDLE_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(0)) => {
            return Err(MiddleError::Read(ProxyError::ConnectClosed {
                addr: middle.to_string(),
            }))
        }
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(MiddleError::Read(e.into())),
        Err(_) => {
            return Err(MiddleError::Read(ProxyError::ConnectTimeout {
                addr: middle.to_string(),
            }))
        }
    };

    match check_connect_ok(&buf[..n]) {
        Ok(()) => Ok(stream),
        Err(ProxyError::ConnectRejected { status_line }) => {
            Err(MiddleError::Status(status_line))
        }
        Err(e) => Err(MiddleError::Read(e)),
    }
}

/// Bridge two sockets until either side closes.
///
/// The first direction to finish wins; the other keeps draining in the
/// background for a one-second settle, then both sockets are dropped.
pub(crate) async fn transfer(client: TcpStream, upstream: TcpStream) {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let mut outbound = tokio::spawn(copy_then_shutdown(client_read, upstream_write));
    let mut inbound = tokio::spawn(copy_then_shutdown(upstream_read, client_write));

    tokio::select! {
        _ = &mut outbound => {}
        _ = &mut inbound => {}
    }
    tokio::time::sleep(SETTLE).await;

    // Dropping the halves closes both sockets, ending the drain.
    outbound.abort();
    inbound.abort();
}

async fn copy_then_shutdown(mut read: OwnedReadHalf, mut write: OwnedWriteHalf) {
    let _ = tokio::io::copy(&mut read, &mut write).await;
    let _ = write.shutdown().await;
}
