//! Shared wiring for integration tests

use dashmap::DashMap;
use mirrortrap_dnslog::{DnsLogConfig, DnsLogService};
use mirrortrap_registry::TunnelRegistry;
use mirrortrap_server::{ClaimedPorts, ControlHandler, ServerConfig, TunnelServer};
use mirrortrap_trigger::{IcmpTriggerEngine, PortTriggerEngine, PortTriggerReservations};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<TunnelRegistry>,
    pub cancel: CancellationToken,
}

/// Spin up a full server on an ephemeral port
pub async fn start_server(secret: Option<String>) -> TestServer {
    let registry = Arc::new(TunnelRegistry::new());
    let mirror_ports: Arc<DashMap<u16, ()>> = Arc::new(DashMap::new());
    let reservations = Arc::new(PortTriggerReservations::new(Arc::new(ClaimedPorts::new(
        registry.clone(),
        mirror_ports.clone(),
    ))));
    let dnslog = Arc::new(DnsLogService::new(DnsLogConfig {
        domains: vec!["oob.example.com".to_string()],
        external_ip: "127.0.0.1".parse().unwrap(),
    }));
    let handler = Arc::new(ControlHandler::new(
        dnslog,
        IcmpTriggerEngine::new(),
        PortTriggerEngine::new(),
        reservations,
        registry.clone(),
        "127.0.0.1",
    ));

    let server = TunnelServer::new(
        ServerConfig { secret },
        handler,
        registry.clone(),
        mirror_ports,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(server.serve(listener, cancel.clone()));

    TestServer {
        addr,
        registry,
        cancel,
    }
}
