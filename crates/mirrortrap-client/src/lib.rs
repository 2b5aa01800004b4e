//! Tunnel client connection multiplexer
//!
//! Registers a mirror on the server, then demultiplexes tagged frames into
//! per-peer channel contexts. The first frame for a new peer lazily dials
//! the backing local service; bytes then relay bidirectionally until a
//! close frame or stream shutdown. A failed local dial is fatal to the
//! whole client run, since the tunnel is unusable without the backing
//! service.

use mirrortrap_proto::{
    ClientMessage, FramedStream, Mirror, MirrorNetwork, RecvHalf, SendHalf, ServerMessage,
    StreamError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const CONN_QUEUE: usize = 1024;
const OUT_QUEUE: usize = 1024;
const READ_BUF: usize = 4096;
const MAX_DATAGRAM: usize = 65535;

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Registration rejected: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Fatal: the backing local service is unreachable
    #[error("Local dial to {addr} failed: {reason}")]
    LocalDialFailed { addr: String, reason: String },
}

/// Tunnel client configuration
#[derive(Debug, Clone)]
pub struct TunnelClientConfig {
    /// Mirror id this client answers for
    pub id: String,
    /// Backing local service
    pub local_host: String,
    pub local_port: u16,
    /// Port requested on the server (0 lets the server pick)
    pub remote_port: u16,
    pub network: MirrorNetwork,
    /// Shared secret expected by the server, if any
    pub secret: Option<String>,
}

impl TunnelClientConfig {
    pub fn new(
        id: impl Into<String>,
        local_host: impl Into<String>,
        local_port: u16,
        remote_port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            local_host: local_host.into(),
            local_port,
            remote_port,
            network: MirrorNetwork::Tcp,
            secret: None,
        }
    }

    pub fn with_network(mut self, network: MirrorNetwork) -> Self {
        self.network = network;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

/// A registered tunnel client, ready to relay
#[derive(Debug)]
pub struct TunnelClient<S> {
    stream: FramedStream<S>,
    config: TunnelClientConfig,
    mirrors: Vec<Mirror>,
}

/// Register a mirror and relay until the stream closes; the holding
/// counterpart of the server's `CreateTunnel`.
pub async fn hold_tunnel_client<S>(
    stream: S,
    config: TunnelClientConfig,
    cancel: CancellationToken,
) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    TunnelClient::register(stream, config)
        .await?
        .relay(cancel)
        .await
}

impl<S> TunnelClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Authenticate (when configured) and send the mirror registration
    pub async fn register(stream: S, config: TunnelClientConfig) -> Result<Self, ClientError> {
        let mut stream = FramedStream::new(stream);

        if let Some(secret) = &config.secret {
            stream
                .send(&ClientMessage::Auth {
                    secret: secret.clone(),
                })
                .await?;
            match stream.recv::<ServerMessage>().await? {
                Some(ServerMessage::AuthOk) => {}
                Some(ServerMessage::Error { message }) => {
                    return Err(ClientError::Rejected(message));
                }
                other => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected auth response: {:?}",
                        other
                    )));
                }
            }
        }

        let mirror = Mirror {
            id: config.id.clone(),
            port: config.remote_port,
            network: config.network,
        };
        stream
            .send(&ClientMessage::CreateTunnel {
                mirrors: vec![mirror],
            })
            .await?;

        let mirrors = match stream.recv::<ServerMessage>().await? {
            Some(ServerMessage::TunnelCreated { mirrors }) => mirrors,
            Some(ServerMessage::Error { message }) => return Err(ClientError::Rejected(message)),
            other => {
                return Err(ClientError::Protocol(format!(
                    "unexpected registration response: {:?}",
                    other
                )));
            }
        };

        info!(id = %config.id, mirrors = mirrors.len(), "Tunnel registered");
        Ok(Self {
            stream,
            config,
            mirrors,
        })
    }

    /// Mirrors as the server bound them (effective ports)
    pub fn mirrors(&self) -> &[Mirror] {
        &self.mirrors
    }

    /// Relay frames until the stream closes, `cancel` fires, or a local
    /// dial fails (fatal)
    pub async fn relay(self, cancel: CancellationToken) -> Result<(), ClientError> {
        let TunnelClient { stream, config, .. } = self;
        let session = cancel.child_token();
        let (tx, rx) = stream.split();

        let (out_tx, out_rx) = mpsc::channel::<ClientMessage>(OUT_QUEUE);
        tokio::spawn(feedback_write_loop(tx, out_rx, session.clone()));

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ClientError>(1);

        let result = receive_loop(&config, rx, out_tx, fatal_tx, &mut fatal_rx, &session).await;

        session.cancel();
        result
    }
}

async fn receive_loop<S>(
    config: &TunnelClientConfig,
    mut rx: RecvHalf<S>,
    out_tx: mpsc::Sender<ClientMessage>,
    fatal_tx: mpsc::Sender<ClientError>,
    fatal_rx: &mut mpsc::Receiver<ClientError>,
    session: &CancellationToken,
) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Touched only by this loop; peer relays own their sockets
    let mut contexts: HashMap<(String, String), ChannelContext> = HashMap::new();

    loop {
        let msg = tokio::select! {
            _ = session.cancelled() => return Ok(()),
            fatal = fatal_rx.recv() => {
                // A context hit an unrecoverable condition
                return Err(match fatal {
                    Some(err) => err,
                    None => ClientError::Protocol("relay aborted".to_string()),
                });
            }
            msg = rx.recv::<ServerMessage>() => msg?,
        };

        let (from_id, remote_addr, data, close) = match msg {
            Some(ServerMessage::TunnelData {
                from_id,
                remote_addr,
                data,
                close,
            }) => (from_id, remote_addr, data, close),
            Some(ServerMessage::Error { message }) => {
                warn!("Server error on tunnel stream: {}", message);
                continue;
            }
            Some(_) => continue,
            None => return Ok(()),
        };

        let key = (from_id, remote_addr);
        if close {
            if let Some(ctx) = contexts.remove(&key) {
                ctx.cancel.cancel();
                debug!(peer = %key.1, "Channel context closed by server");
            }
            continue;
        }

        let data_tx = contexts
            .entry(key.clone())
            .or_insert_with(|| {
                spawn_context(
                    key.0.clone(),
                    key.1.clone(),
                    config,
                    out_tx.clone(),
                    fatal_tx.clone(),
                    session.child_token(),
                )
            })
            .data_tx
            .clone();

        // Non-blocking enqueue with async fallback: one saturated peer
        // must never stall the shared receive loop
        match data_tx.try_send(data) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(data)) => {
                tokio::spawn(async move {
                    let _ = data_tx.send(data).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                contexts.remove(&key);
            }
        }
    }
}

async fn feedback_write_loop<S>(
    mut tx: SendHalf<S>,
    mut out_rx: mpsc::Receiver<ClientMessage>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = out_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if let Err(e) = tx.send(&msg).await {
            debug!("Feedback stream write failed: {}", e);
            cancel.cancel();
            break;
        }
    }
}

/// Per-peer channel context: inbound queue plus the relay task owning the
/// lazily dialed local socket
struct ChannelContext {
    data_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

fn spawn_context(
    tunnel_id: String,
    remote_addr: String,
    config: &TunnelClientConfig,
    out_tx: mpsc::Sender<ClientMessage>,
    fatal_tx: mpsc::Sender<ClientError>,
    cancel: CancellationToken,
) -> ChannelContext {
    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(CONN_QUEUE);
    let target = format!("{}:{}", config.local_host, config.local_port);
    let network = config.network;

    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let result = match network {
            MirrorNetwork::Tcp => {
                relay_tcp(
                    &target,
                    tunnel_id,
                    remote_addr,
                    data_rx,
                    out_tx,
                    task_cancel.clone(),
                )
                .await
            }
            MirrorNetwork::Udp => {
                relay_udp(
                    &target,
                    tunnel_id,
                    remote_addr,
                    data_rx,
                    out_tx,
                    task_cancel.clone(),
                )
                .await
            }
        };
        if let Err(e) = result {
            // Dial failures terminate the whole run; the tunnel is useless
            // without the backing service
            let _ = fatal_tx.send(e).await;
        }
        task_cancel.cancel();
    });

    ChannelContext { data_tx, cancel }
}

async fn relay_tcp(
    target: &str,
    tunnel_id: String,
    remote_addr: String,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    out_tx: mpsc::Sender<ClientMessage>,
    cancel: CancellationToken,
) -> Result<(), ClientError> {
    let socket = tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(target))
        .await
        .map_err(|_| ClientError::LocalDialFailed {
            addr: target.to_string(),
            reason: "timed out".to_string(),
        })?
        .map_err(|e| ClientError::LocalDialFailed {
            addr: target.to_string(),
            reason: e.to_string(),
        })?;
    debug!(target = %target, peer = %remote_addr, "Dialed local service");

    let (mut read_half, mut write_half) = socket.into_split();

    // local socket -> stream feedback
    let feedback_cancel = cancel.clone();
    let feedback_id = tunnel_id.clone();
    let feedback_peer = remote_addr.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; READ_BUF];
        loop {
            let n = tokio::select! {
                _ = feedback_cancel.cancelled() => break,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => {
                        let _ = out_tx
                            .send(ClientMessage::TunnelData {
                                to_id: feedback_id.clone(),
                                to_remote_addr: feedback_peer.clone(),
                                data: Vec::new(),
                                close: true,
                            })
                            .await;
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(peer = %feedback_peer, "Local read failed: {}", e);
                        break;
                    }
                },
            };
            let frame = ClientMessage::TunnelData {
                to_id: feedback_id.clone(),
                to_remote_addr: feedback_peer.clone(),
                data: buf[..n].to_vec(),
                close: false,
            };
            if out_tx.send(frame).await.is_err() {
                break;
            }
        }
        feedback_cancel.cancel();
    });

    // queue -> local socket, strictly FIFO
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            data = data_rx.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };
        if let Err(e) = write_half.write_all(&data).await {
            debug!(peer = %remote_addr, "Local write failed: {}", e);
            break;
        }
    }
    let _ = write_half.shutdown().await;
    Ok(())
}

async fn relay_udp(
    target: &str,
    tunnel_id: String,
    remote_addr: String,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    out_tx: mpsc::Sender<ClientMessage>,
    cancel: CancellationToken,
) -> Result<(), ClientError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ClientError::LocalDialFailed {
            addr: target.to_string(),
            reason: e.to_string(),
        })?;
    socket
        .connect(target)
        .await
        .map_err(|e| ClientError::LocalDialFailed {
            addr: target.to_string(),
            reason: e.to_string(),
        })?;
    let socket = Arc::new(socket);
    debug!(target = %target, peer = %remote_addr, "Bound local UDP relay");

    let recv_socket = socket.clone();
    let feedback_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let n = tokio::select! {
                _ = feedback_cancel.cancelled() => break,
                received = recv_socket.recv(&mut buf) => match received {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Local UDP receive failed: {}", e);
                        break;
                    }
                },
            };
            let frame = ClientMessage::TunnelData {
                to_id: tunnel_id.clone(),
                to_remote_addr: remote_addr.clone(),
                data: buf[..n].to_vec(),
                close: false,
            };
            if out_tx.send(frame).await.is_err() {
                break;
            }
        }
        feedback_cancel.cancel();
    });

    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            data = data_rx.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };
        if let Err(e) = socket.send(&data).await {
            debug!("Local UDP send failed: {}", e);
            break;
        }
    }
    Ok(())
}
