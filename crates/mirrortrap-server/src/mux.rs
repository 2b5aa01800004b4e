//! Server-side connection multiplexer
//!
//! One session per tunnel stream. Every registered mirror gets a TCP
//! listener or UDP socket; peer traffic is tagged with the mirror id and
//! peer address, sent over the stream, and answered frames are routed back
//! to the matching peer. All listeners, sockets and relay tasks are
//! children of the stream's cancellation token.

use crate::ServerError;
use dashmap::DashMap;
use mirrortrap_proto::{
    ClientMessage, FramedStream, Mirror, MirrorNetwork, RecvHalf, SendHalf, ServerMessage,
};
use mirrortrap_registry::TunnelRegistry;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const READ_BUF: usize = 4096;
const CONN_QUEUE: usize = 256;
const OUT_QUEUE: usize = 1024;
const MAX_DATAGRAM: usize = 65535;

/// Routing target for one mirror
enum MirrorHandle {
    /// Per-peer TCP descriptors live in the connection table
    Tcp,
    /// Single socket; the send loop demuxes by peer address
    Udp { tx: mpsc::Sender<(String, Vec<u8>)> },
}

/// Per-peer TCP connection descriptor
struct ConnHandle {
    data_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

/// Run one tunnel session until the stream closes or `cancel` fires
///
/// `mirrors` is the already-received registration (the hard first-message
/// precondition is enforced by the caller). `mirror_ports` tracks the
/// session's bound ports for the random-port reservation probe.
pub async fn run_mirror_session<S>(
    stream: FramedStream<S>,
    mirrors: Vec<Mirror>,
    registry: Option<Arc<TunnelRegistry>>,
    mirror_ports: Arc<DashMap<u16, ()>>,
    cancel: CancellationToken,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if mirrors.is_empty() {
        return Err(ServerError::EmptyMirrors);
    }

    let (tx, rx) = stream.split();

    // One writer task owns the server->client half
    let (out_tx, out_rx) = mpsc::channel::<ServerMessage>(OUT_QUEUE);
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(write_loop(tx, out_rx, writer_cancel));

    let handles: Arc<DashMap<String, MirrorHandle>> = Arc::new(DashMap::new());
    let conns: Arc<DashMap<(String, String), ConnHandle>> = Arc::new(DashMap::new());

    let mut bound = Vec::with_capacity(mirrors.len());
    for mirror in mirrors {
        // A prior registration reserved a port for this id: reuse it
        let requested = registry
            .as_ref()
            .and_then(|r| r.port_for_id(&mirror.id))
            .unwrap_or(mirror.port);

        match bind_mirror(
            &mirror,
            requested,
            handles.clone(),
            conns.clone(),
            out_tx.clone(),
            cancel.child_token(),
        )
        .await
        {
            Ok(port) => {
                mirror_ports.insert(port, ());
                bound.push(Mirror {
                    id: mirror.id,
                    port,
                    network: mirror.network,
                });
            }
            Err(e) => {
                // Fatal to this mirror only; the session keeps its siblings
                error!(mirror_id = %mirror.id, port = requested, "Mirror bind failed: {}", e);
            }
        }
    }

    let _ = out_tx
        .send(ServerMessage::TunnelCreated {
            mirrors: bound.clone(),
        })
        .await;
    info!(mirrors = bound.len(), "Tunnel session established");

    let result = route_loop(rx, &handles, &conns, &out_tx, &cancel).await;

    // Stream gone or cancelled: close every listener, socket and descriptor
    cancel.cancel();
    for port in bound.iter().map(|m| m.port) {
        mirror_ports.remove(&port);
    }
    writer.abort();
    info!("Tunnel session closed");
    result
}

async fn write_loop<S>(
    mut tx: SendHalf<S>,
    mut out_rx: mpsc::Receiver<ServerMessage>,
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
            debug!("Tunnel stream write failed: {}", e);
            cancel.cancel();
            break;
        }
    }
}

async fn route_loop<S>(
    mut rx: RecvHalf<S>,
    handles: &DashMap<String, MirrorHandle>,
    conns: &DashMap<(String, String), ConnHandle>,
    out_tx: &mpsc::Sender<ServerMessage>,
    cancel: &CancellationToken,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = rx.recv::<ClientMessage>() => msg?,
        };

        let (to_id, to_remote_addr, data, close) = match msg {
            Some(ClientMessage::TunnelData {
                to_id,
                to_remote_addr,
                data,
                close,
            }) => (to_id, to_remote_addr, data, close),
            Some(ClientMessage::CreateTunnel { .. }) => {
                // Single registration per stream; reject without tearing down
                let _ = out_tx
                    .send(ServerMessage::Error {
                        message: "mirrors already registered on this stream".to_string(),
                    })
                    .await;
                continue;
            }
            Some(_) => {
                let _ = out_tx
                    .send(ServerMessage::Error {
                        message: "unexpected control message on tunnel stream".to_string(),
                    })
                    .await;
                continue;
            }
            None => return Ok(()),
        };

        let is_udp = match handles.get(&to_id) {
            Some(handle) => match handle.value() {
                MirrorHandle::Udp { tx } => Some(tx.clone()),
                MirrorHandle::Tcp => None,
            },
            None => {
                debug!(mirror_id = %to_id, "Frame for unknown mirror dropped");
                continue;
            }
        };

        if let Some(udp_tx) = is_udp {
            if !close {
                let _ = udp_tx.send((to_remote_addr, data)).await;
            }
            continue;
        }

        let key = (to_id, to_remote_addr);
        if close {
            if let Some((_, conn)) = conns.remove(&key) {
                conn.cancel.cancel();
                debug!(mirror_id = %key.0, peer = %key.1, "Descriptor closed by client");
            }
            continue;
        }

        // Ordered drain: the descriptor's queue is the single write side
        let data_tx = match conns.get(&key) {
            Some(conn) => conn.data_tx.clone(),
            None => {
                debug!(mirror_id = %key.0, peer = %key.1, "Frame for unknown peer dropped");
                continue;
            }
        };
        if data_tx.send(data).await.is_err() {
            conns.remove(&key);
        }
    }
}

/// Bind one mirror's listener or socket; returns the effective port
async fn bind_mirror(
    mirror: &Mirror,
    port: u16,
    handles: Arc<DashMap<String, MirrorHandle>>,
    conns: Arc<DashMap<(String, String), ConnHandle>>,
    out_tx: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
) -> Result<u16, std::io::Error> {
    match mirror.network {
        MirrorNetwork::Tcp => {
            let listener = TcpListener::bind(("0.0.0.0", port)).await?;
            let bound_port = listener.local_addr()?.port();
            handles.insert(mirror.id.clone(), MirrorHandle::Tcp);
            info!(mirror_id = %mirror.id, port = bound_port, "TCP mirror listening");

            let id = mirror.id.clone();
            tokio::spawn(accept_loop(listener, id, conns, out_tx, cancel));
            Ok(bound_port)
        }
        MirrorNetwork::Udp => {
            let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
            let bound_port = socket.local_addr()?.port();
            info!(mirror_id = %mirror.id, port = bound_port, "UDP mirror bound");

            let (udp_tx, udp_rx) = mpsc::channel::<(String, Vec<u8>)>(CONN_QUEUE);
            handles.insert(mirror.id.clone(), MirrorHandle::Udp { tx: udp_tx });

            let id = mirror.id.clone();
            tokio::spawn(udp_loops(socket, id, udp_rx, out_tx, cancel));
            Ok(bound_port)
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mirror_id: String,
    conns: Arc<DashMap<(String, String), ConnHandle>>,
    out_tx: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Fatal to this mirror's loop only
                    error!(mirror_id = %mirror_id, "Accept failed: {}", e);
                    break;
                }
            },
        };

        debug!(mirror_id = %mirror_id, peer = %peer, "Peer connected to mirror");
        spawn_tcp_conn(
            socket,
            mirror_id.clone(),
            peer.to_string(),
            conns.clone(),
            out_tx.clone(),
            cancel.child_token(),
        );
    }
}

/// One descriptor per live peer: a socket->stream relay tagging frames and
/// a stream->socket relay draining the inbound queue, each terminating the
/// other through the shared token.
fn spawn_tcp_conn(
    socket: TcpStream,
    mirror_id: String,
    remote_addr: String,
    conns: Arc<DashMap<(String, String), ConnHandle>>,
    out_tx: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
) {
    let (data_tx, mut data_rx) = mpsc::channel::<Vec<u8>>(CONN_QUEUE);
    let key = (mirror_id.clone(), remote_addr.clone());
    conns.insert(
        key.clone(),
        ConnHandle {
            data_tx,
            cancel: cancel.clone(),
        },
    );

    let (mut read_half, mut write_half) = socket.into_split();

    // socket -> stream
    let from_id = mirror_id.clone();
    let peer = remote_addr.clone();
    let tagger_cancel = cancel.clone();
    let tagger_out = out_tx.clone();
    let tagger_conns = conns.clone();
    let tagger_key = key.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; READ_BUF];
        loop {
            let n = tokio::select! {
                _ = tagger_cancel.cancelled() => break,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => {
                        let _ = tagger_out
                            .send(ServerMessage::TunnelData {
                                from_id: from_id.clone(),
                                remote_addr: peer.clone(),
                                data: Vec::new(),
                                close: true,
                            })
                            .await;
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(peer = %peer, "Mirror socket read failed: {}", e);
                        break;
                    }
                },
            };
            let frame = ServerMessage::TunnelData {
                from_id: from_id.clone(),
                remote_addr: peer.clone(),
                data: buf[..n].to_vec(),
                close: false,
            };
            if tagger_out.send(frame).await.is_err() {
                break;
            }
        }
        tagger_cancel.cancel();
        tagger_conns.remove(&tagger_key);
    });

    // stream -> socket
    tokio::spawn(async move {
        loop {
            let data = tokio::select! {
                _ = cancel.cancelled() => break,
                data = data_rx.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
            };
            if let Err(e) = write_half.write_all(&data).await {
                debug!(peer = %remote_addr, "Mirror socket write failed: {}", e);
                break;
            }
        }
        let _ = write_half.shutdown().await;
        cancel.cancel();
        conns.remove(&key);
    });
}

/// UDP mirror: one receive loop tagging datagrams, one send loop demuxing
/// queued frames by peer address.
async fn udp_loops(
    socket: Arc<UdpSocket>,
    mirror_id: String,
    mut udp_rx: mpsc::Receiver<(String, Vec<u8>)>,
    out_tx: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
) {
    let send_socket = socket.clone();
    let send_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let (addr, data) = tokio::select! {
                _ = send_cancel.cancelled() => break,
                item = udp_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            if let Err(e) = send_socket.send_to(&data, &addr).await {
                warn!(peer = %addr, "UDP mirror send failed: {}", e);
            }
        }
    });

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(mirror_id = %mirror_id, "UDP mirror receive failed: {}", e);
                    continue;
                }
            },
        };
        let frame = ServerMessage::TunnelData {
            from_id: mirror_id.clone(),
            remote_addr: peer.to_string(),
            data: buf[..n].to_vec(),
            close: false,
        };
        if out_tx.send(frame).await.is_err() {
            break;
        }
    }
}
