//! Control connection server
//!
//! Accepts framed TCP connections. A connection that opens with a mirror
//! registration becomes a tunnel session; every other connection serves
//! control requests until the peer hangs up. When a shared secret is
//! configured, the first message must authenticate.

use crate::handler::ControlHandler;
use crate::mux;
use crate::ServerError;
use dashmap::DashMap;
use mirrortrap_proto::{ClientMessage, FramedStream, ServerMessage};
use mirrortrap_registry::TunnelRegistry;
use mirrortrap_trigger::PortUsage;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Server configuration
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Shared secret required from every connection, when set
    pub secret: Option<String>,
}

/// Port-usage probe spanning tunnel registrations and live mirror binds
pub struct ClaimedPorts {
    registry: Arc<TunnelRegistry>,
    mirror_ports: Arc<DashMap<u16, ()>>,
}

impl ClaimedPorts {
    pub fn new(registry: Arc<TunnelRegistry>, mirror_ports: Arc<DashMap<u16, ()>>) -> Self {
        Self {
            registry,
            mirror_ports,
        }
    }
}

impl PortUsage for ClaimedPorts {
    fn is_port_claimed(&self, port: u16) -> bool {
        self.mirror_ports.contains_key(&port) || self.registry.is_port_claimed(port)
    }
}

/// The tunnel/control server
pub struct TunnelServer {
    config: ServerConfig,
    handler: Arc<ControlHandler>,
    registry: Arc<TunnelRegistry>,
    mirror_ports: Arc<DashMap<u16, ()>>,
}

impl TunnelServer {
    pub fn new(
        config: ServerConfig,
        handler: Arc<ControlHandler>,
        registry: Arc<TunnelRegistry>,
        mirror_ports: Arc<DashMap<u16, ()>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            registry,
            mirror_ports,
        })
    }

    /// Ports currently bound by live mirror sessions
    pub fn mirror_ports(&self) -> Arc<DashMap<u16, ()>> {
        self.mirror_ports.clone()
    }

    /// Accept connections until cancellation
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        info!(addr = %listener.local_addr()?, "Tunnel server listening");
        loop {
            let (socket, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            debug!(peer = %peer, "Connection accepted");
            let server = self.clone();
            let conn_cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(socket, peer, conn_cancel).await {
                    debug!(peer = %peer, "Connection ended with error: {}", e);
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        socket: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        let mut stream = FramedStream::new(socket);
        let mut authenticated = self.config.secret.is_none();

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = stream.recv::<ClientMessage>() => msg?,
            };
            let msg = match msg {
                Some(msg) => msg,
                None => return Ok(()),
            };

            if !authenticated {
                match msg {
                    ClientMessage::Auth { secret }
                        if Some(&secret) == self.config.secret.as_ref() =>
                    {
                        authenticated = true;
                        stream.send(&ServerMessage::AuthOk).await?;
                        continue;
                    }
                    _ => {
                        warn!(peer = %peer, "Unauthenticated connection rejected");
                        stream
                            .send(&ServerMessage::Error {
                                message: "authentication required".to_string(),
                            })
                            .await?;
                        return Err(ServerError::AuthenticationFailed);
                    }
                }
            }

            match msg {
                ClientMessage::CreateTunnel { mirrors } => {
                    if mirrors.is_empty() {
                        // Hard precondition on the very first stream message
                        stream
                            .send(&ServerMessage::Error {
                                message: "empty mirrors".to_string(),
                            })
                            .await?;
                        return Err(ServerError::EmptyMirrors);
                    }
                    return mux::run_mirror_session(
                        stream,
                        mirrors,
                        Some(self.registry.clone()),
                        self.mirror_ports.clone(),
                        cancel,
                    )
                    .await;
                }
                ClientMessage::Auth { .. } => {
                    // Re-auth on a live connection is a no-op
                    stream.send(&ServerMessage::AuthOk).await?;
                }
                request => {
                    let response = self.handler.handle(request, peer).await;
                    stream.send(&response).await?;
                }
            }
        }
    }
}
