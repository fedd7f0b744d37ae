//! Frontend: the listening server and inbound request gate.
//!
//! Accepts raw TCP connections, parses the request head once, and owns
//! the byte stream from then on. Three request classes:
//!
//! ```text
//! CONNECT host:443 (not direct) --> block check --> cluster tunnel
//! CONNECT other-port / direct   --> raw forward via first-hop proxy
//! other method, absolute URI    --> plain forward via first-hop proxy
//! other method, path-only URI   --> admin API
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::admin::handle_api;
use crate::connection::{read_request_head, transfer, RequestHead, RESPONSE_FORBIDDEN};
use crate::{ProxyError, Registry, Result};

/// Deadline for dialing the first-hop proxy on the direct path.
const DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const RESPONSE_INTERNAL_ERROR: &[u8] =
    b"HTTP/1.1 500 Internal Server Error\r\nConnection: close\r\n\r\n";

/// The listening server. Owns the accept loop; everything else is
/// shared through the registry.
pub struct Frontend {
    registry: Arc<Registry>,
}

impl Frontend {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Bind the configured listen address and serve forever.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - if binding the listen address fails.
    pub async fn run(&self) -> Result<()> {
        let addr = self.registry.listen().to_string();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::Bind { addr: addr.clone(), source: e })?;
        info!(%addr, "listening");
        self.run_on(listener).await
    }

    /// Serve on a pre-bound listener.
    ///
    /// Used by tests (and callers that bind port 0) to learn the actual
    /// address before the accept loop starts.
    pub async fn run_on(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (client, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept error");
                    continue;
                }
            };
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                if let Err(e) = handle_client(registry, client, peer).await {
                    debug!(%peer, error = %e, "connection error");
                }
            });
        }
    }
}

async fn handle_client(
    registry: Arc<Registry>,
    mut client: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let (head, remainder) = read_request_head(&mut client).await?;
    info!(%peer, method = %head.method, target = %head.target, "request");

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(registry, client, head).await
    } else if head.absolute_host().is_some() {
        handle_http(registry, client, head, remainder).await
    } else {
        let body = handle_api(&registry, &head);
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        client.write_all(response.as_bytes()).await?;
        Ok(())
    }
}

async fn handle_connect(
    registry: Arc<Registry>,
    mut client: TcpStream,
    head: RequestHead,
) -> Result<()> {
    let (host, port) = head.connect_target();

    if registry.check_block(&host) {
        info!(%host, "block");
        client.write_all(RESPONSE_FORBIDDEN).await?;
        return Ok(());
    }

    if port != "443" || registry.check_direct(&host) {
        info!(%host, %port, "direct connection");
        let Some(middle) = registry.middle_addr() else {
            warn!(%host, "no middle proxy for direct connection");
            return Ok(());
        };
        let mut upstream = match tokio::time::timeout(
            DIRECT_DIAL_TIMEOUT,
            TcpStream::connect(middle),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(middle, error = %e, "dial middle failed");
                return Ok(());
            }
            Err(_) => {
                warn!(middle, "dial middle timed out");
                return Ok(());
            }
        };
        upstream.write_all(&head.to_proxy_bytes()).await?;
        transfer(client, upstream).await;
        return Ok(());
    }

    let cluster = registry.lookup_cluster(&host);
    info!(cluster = %cluster.cert_host(), "cluster");
    // On failure the cluster has already answered the client with a 403.
    let _ = cluster
        .run_tunnel(registry.middle_addr(), &host, client, head)
        .await;
    Ok(())
}

/// Plain (non-CONNECT) forward through the first-hop proxy. The request
/// head goes out with `Proxy-Connection` rewritten and
/// `Connection: close` appended; the response streams back until EOF.
async fn handle_http(
    registry: Arc<Registry>,
    mut client: TcpStream,
    head: RequestHead,
    remainder: Vec<u8>,
) -> Result<()> {
    let Some(middle) = registry.middle_addr() else {
        warn!("no middle proxy for plain forward");
        client.write_all(RESPONSE_INTERNAL_ERROR).await?;
        return Ok(());
    };
    let mut upstream = match TcpStream::connect(middle).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(middle, error = %e, "dial middle failed");
            client.write_all(RESPONSE_INTERNAL_ERROR).await?;
            return Ok(());
        }
    };

    upstream.write_all(&head.to_proxy_bytes()).await?;
    if !remainder.is_empty() {
        upstream.write_all(&remainder).await?;
    }
    tokio::io::copy(&mut upstream, &mut client).await?;
    Ok(())
}
