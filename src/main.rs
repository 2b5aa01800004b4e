//! Mirrortrap server node
//!
//! Public-facing entry point: binds the control/tunnel listener, the
//! authoritative DNS-log listener and the blind HTTP trigger listener,
//! and runs the passive packet-capture trigger engines.

use anyhow::{Context, Result};
use clap::Parser;
use dashmap::DashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mirrortrap_dnslog::{
    DnsLogConfig, DnsLogListener, DnsLogService, HttpTriggerServer, RemoteHttpBroker,
};
use mirrortrap_registry::TunnelRegistry;
use mirrortrap_server::{ClaimedPorts, ControlHandler, ServerConfig, TunnelServer};
use mirrortrap_trigger::{IcmpTriggerEngine, PortTriggerEngine, PortTriggerReservations};

const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Mirrortrap - reverse-tunnel server with passive OOB trigger detection
#[derive(Parser, Debug)]
#[command(name = "mirrortrap")]
#[command(about = "Run a reverse-tunnel and OOB trigger-detection server", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Control/tunnel listener address
    #[arg(long, default_value = "0.0.0.0:64333")]
    addr: String,

    /// Shared secret required from every client connection
    #[arg(long, env = "MIRRORTRAP_SECRET")]
    secret: Option<String>,

    /// Third-party DNS-log broker, as "mode=base-url" (repeatable)
    #[arg(long = "dnslog")]
    dnslog: Vec<String>,

    /// Root domain served for OOB correlation (repeatable)
    #[arg(long = "domain")]
    domains: Vec<String>,

    /// Public IP reported to operators and answered for DNS queries
    #[arg(long = "public-ip", default_value = "127.0.0.1")]
    public_ip: String,

    /// Password gating tunnel registration
    #[arg(long = "secondary-password", env = "MIRRORTRAP_SECONDARY_PASSWORD")]
    secondary_password: Option<String>,

    /// Authoritative DNS listener address
    #[arg(long = "dns-addr", default_value = "0.0.0.0:53")]
    dns_addr: String,

    /// Blind HTTP trigger listener address
    #[arg(long = "http-addr", default_value = "0.0.0.0:80")]
    http_addr: String,

    /// Skip the packet-capture trigger engines (no pcap privileges)
    #[arg(long)]
    no_capture: bool,

    /// Give up when the control listener cannot bind within this many
    /// seconds (retried on a fixed interval)
    #[arg(long = "listen-timeout", default_value = "60")]
    listen_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    let public_ip: Ipv4Addr = cli
        .public_ip
        .parse()
        .with_context(|| format!("invalid --public-ip {}", cli.public_ip))?;

    let cancel = CancellationToken::new();

    // Services
    let mut dnslog = DnsLogService::new(DnsLogConfig {
        domains: cli.domains.clone(),
        external_ip: public_ip,
    });
    for entry in &cli.dnslog {
        let (mode, base_url) = entry
            .split_once('=')
            .with_context(|| format!("invalid --dnslog {}, expected mode=base-url", entry))?;
        dnslog = dnslog.with_broker(mode, Arc::new(RemoteHttpBroker::new(mode, base_url)));
        info!(mode = %mode, "Registered dnslog broker");
    }
    let dnslog = Arc::new(dnslog);

    let registry = Arc::new(TunnelRegistry::new());
    let mirror_ports: Arc<DashMap<u16, ()>> = Arc::new(DashMap::new());
    let reservations = Arc::new(PortTriggerReservations::new(Arc::new(ClaimedPorts::new(
        registry.clone(),
        mirror_ports.clone(),
    ))));

    let icmp = IcmpTriggerEngine::new();
    let port_engine = PortTriggerEngine::new();

    // Trigger engines: capture failures are fatal to the engine, not the node
    if cli.no_capture {
        info!("Packet-capture trigger engines disabled");
    } else {
        let engine = icmp.clone();
        let token = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = engine.run(token).await {
                error!("ICMP trigger engine stopped: {}", e);
            }
        });
        let engine = port_engine.clone();
        let token = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = engine.run(token).await {
                error!("Random-port trigger engine stopped: {}", e);
            }
        });
    }

    // DNS-log listener; without root domains there is nothing to serve
    if cli.domains.is_empty() {
        warn!("No --domain configured, DNS log listener disabled");
    } else {
        let dns_addr = cli.dns_addr.parse().context("invalid --dns-addr")?;
        match DnsLogListener::bind(dns_addr, dnslog.clone()).await {
            Ok(listener) => {
                let token = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = listener.run(token).await {
                        error!("DNS log listener stopped: {}", e);
                    }
                });
            }
            Err(e) => error!(addr = %dns_addr, "DNS log listener bind failed: {}", e),
        }
    }

    // Blind HTTP trigger listener
    {
        let http_addr = cli.http_addr.parse().context("invalid --http-addr")?;
        match HttpTriggerServer::bind(http_addr, dnslog.clone()).await {
            Ok(server) => {
                let token = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = server.run(token).await {
                        error!("HTTP trigger listener stopped: {}", e);
                    }
                });
            }
            Err(e) => error!(addr = %http_addr, "HTTP trigger listener bind failed: {}", e),
        }
    }

    // Control listener is process-critical: retry, then give up non-zero
    let listener = bind_with_retry(&cli.addr, Duration::from_secs(cli.listen_timeout)).await?;

    let mut handler = ControlHandler::new(
        dnslog,
        icmp,
        port_engine,
        reservations,
        registry.clone(),
        public_ip.to_string(),
    );
    if let Some(password) = &cli.secondary_password {
        handler = handler.with_secondary_password(password.clone());
    }

    let server = TunnelServer::new(
        ServerConfig {
            secret: cli.secret.clone(),
        },
        Arc::new(handler),
        registry,
        mirror_ports,
    );

    let serve_cancel = cancel.child_token();
    let serve = tokio::spawn(server.serve(listener, serve_cancel));

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("Shutting down");
    cancel.cancel();
    let _ = serve.await;

    Ok(())
}

/// Bind the control listener, retrying on a fixed interval until `timeout`
async fn bind_with_retry(addr: &str, timeout: Duration) -> Result<TcpListener> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                if tokio::time::Instant::now() + BIND_RETRY_INTERVAL >= deadline {
                    return Err(e).with_context(|| format!("failed to bind {}", addr));
                }
                warn!(addr = %addr, "Bind failed ({}), retrying", e);
                tokio::time::sleep(BIND_RETRY_INTERVAL).await;
            }
        }
    }
}
