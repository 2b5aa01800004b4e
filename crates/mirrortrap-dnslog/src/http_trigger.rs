//! Blind HTTP/HTTPS trigger listener
//!
//! Catches web callbacks against issued tokens: any request whose Host or
//! path contains a registered token is answered `200 OK` echoing the token
//! and recorded as a trigger event. TLS is an external collaborator; pass
//! a pre-built acceptor to serve HTTPS.

use crate::{broker::split_host_port, DnsLogError, DnsLogService};
use mirrortrap_proto::DnsLogEvent;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_REQUEST_HEAD: usize = 8192;

/// HTTP/HTTPS blind trigger server
pub struct HttpTriggerServer {
    listener: TcpListener,
    service: Arc<DnsLogService>,
    tls: Option<TlsAcceptor>,
}

impl HttpTriggerServer {
    /// Bind a plain-HTTP trigger listener
    pub async fn bind(
        addr: SocketAddr,
        service: Arc<DnsLogService>,
    ) -> Result<Self, DnsLogError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "HTTP trigger listener bound");
        Ok(Self {
            listener,
            service,
            tls: None,
        })
    }

    /// Serve HTTPS with an externally built acceptor
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DnsLogError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept callbacks until cancellation
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DnsLogError> {
        let event_type = if self.tls.is_some() { "HTTPS" } else { "HTTP" };
        loop {
            let (socket, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Trigger accept failed: {}", e);
                        continue;
                    }
                },
            };

            let service = self.service.clone();
            let tls = self.tls.clone();
            tokio::spawn(async move {
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(stream) => {
                            handle_request(stream, peer, service, event_type).await
                        }
                        Err(e) => {
                            debug!(peer = %peer, "TLS handshake failed: {}", e);
                            return;
                        }
                    },
                    None => handle_request(socket, peer, service, event_type).await,
                };
                if let Err(e) = result {
                    debug!(peer = %peer, "Trigger connection failed: {}", e);
                }
            });
        }
    }
}

async fn handle_request<S>(
    mut stream: S,
    peer: SocketAddr,
    service: Arc<DnsLogService>,
    event_type: &str,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }
    let head = String::from_utf8_lossy(&buf[..n]).to_string();

    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let host = extract_host(&head).unwrap_or_default();

    match service.find_http_token(&host, &path) {
        Some(token) => {
            debug!(peer = %peer, token = %token, "Blind web trigger hit");
            let remote_addr = peer.to_string();
            let (remote_ip, remote_port) = split_host_port(&remote_addr);
            service.record_http_hit(
                &token,
                DnsLogEvent {
                    event_type: event_type.to_string(),
                    token: token.clone(),
                    domain: host,
                    remote_addr,
                    remote_ip,
                    remote_port,
                    raw: buf[..n].to_vec(),
                    timestamp: chrono::Utc::now().timestamp(),
                },
            );

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                token.len(),
                token
            );
            stream.write_all(response.as_bytes()).await?;
        }
        None => {
            let response =
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
            stream.write_all(response).await?;
        }
    }
    stream.shutdown().await?;
    Ok(())
}

/// Extract the Host header, dropping any port suffix
fn extract_host(request: &str) -> Option<String> {
    for line in request.lines() {
        if line.to_lowercase().starts_with("host:") {
            let host = line[5..].trim();
            let host = host.split(':').next().unwrap_or(host);
            return Some(host.to_string());
        }
    }
    None
}
