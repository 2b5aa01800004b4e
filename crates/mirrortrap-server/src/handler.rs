//! Control RPC handler
//!
//! One dispatch point for every request/response operation on a control
//! connection. Request failures answer with an error message and leave
//! the connection open; only tunnel-stream preconditions tear streams down.

use mirrortrap_dnslog::DnsLogService;
use mirrortrap_proto::{ClientMessage, HttpFlow, ServerMessage};
use mirrortrap_registry::TunnelRegistry;
use mirrortrap_trigger::{IcmpTriggerEngine, PortTriggerEngine, PortTriggerReservations};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Control request dispatcher owning handles to every service
pub struct ControlHandler {
    dnslog: Arc<DnsLogService>,
    icmp: Arc<IcmpTriggerEngine>,
    port_engine: Arc<PortTriggerEngine>,
    reservations: Arc<PortTriggerReservations>,
    registry: Arc<TunnelRegistry>,
    external_ip: String,
    secondary_password: Option<String>,
}

impl ControlHandler {
    pub fn new(
        dnslog: Arc<DnsLogService>,
        icmp: Arc<IcmpTriggerEngine>,
        port_engine: Arc<PortTriggerEngine>,
        reservations: Arc<PortTriggerReservations>,
        registry: Arc<TunnelRegistry>,
        external_ip: impl Into<String>,
    ) -> Self {
        Self {
            dnslog,
            icmp,
            port_engine,
            reservations,
            registry,
            external_ip: external_ip.into(),
            secondary_password: None,
        }
    }

    /// Require this password on `RegisterTunnel`
    pub fn with_secondary_password(mut self, password: impl Into<String>) -> Self {
        self.secondary_password = Some(password.into());
        self
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    /// Handle one control request
    pub async fn handle(&self, request: ClientMessage, peer: SocketAddr) -> ServerMessage {
        match request {
            ClientMessage::RequireDomain { mode } => {
                match self.dnslog.require_domain(&mode).await {
                    Ok(assignment) => ServerMessage::DomainAssigned {
                        domain: assignment.domain,
                        token: assignment.token,
                        mode: assignment.mode,
                    },
                    Err(e) => error_response(e),
                }
            }

            ClientMessage::QueryExistedDnsLog { token, mode } => {
                match self.dnslog.query_existed_dnslog(&token, &mode).await {
                    Ok(events) => ServerMessage::DnsLogEvents { events },
                    Err(e) => error_response(e),
                }
            }

            ClientMessage::RegisterTunnel {
                public_key,
                secret,
                verbose,
                auth,
            } => {
                if let Some(required) = &self.secondary_password {
                    if &auth != required {
                        warn!(peer = %peer, "Tunnel registration with bad secondary password");
                        return ServerMessage::Error {
                            message: "secondary password mismatch".to_string(),
                        };
                    }
                }
                match self
                    .registry
                    .register(&self.external_ip, public_key, secret, verbose)
                {
                    Ok(registration) => ServerMessage::TunnelRegistered {
                        id: registration.id,
                    },
                    Err(e) => error_response(e),
                }
            }

            ClientMessage::RequireRandomPortTrigger { token, ttl_seconds } => {
                match self
                    .reservations
                    .reserve(&token, Duration::from_secs(ttl_seconds as u64))
                {
                    Ok(port) => ServerMessage::RandomPortAssigned {
                        port,
                        token,
                        external_ip: self.external_ip.clone(),
                    },
                    Err(e) => error_response(e),
                }
            }

            ClientMessage::QueryExistedRandomPortTrigger { token } => {
                let port = match self.reservations.port_for(&token) {
                    Ok(port) => port,
                    Err(e) => return error_response(e),
                };
                match self.port_engine.get_trigger_notification(port) {
                    Ok(event) => ServerMessage::RandomPortEvents {
                        events: vec![event],
                    },
                    Err(e) => error_response(e),
                }
            }

            ClientMessage::QuerySpecificIcmpLengthTrigger { length } => {
                match self.icmp.get_trigger_notification(length) {
                    Ok(notification) => ServerMessage::IcmpNotifications {
                        notifications: vec![notification],
                    },
                    Err(e) => error_response(e),
                }
            }

            ClientMessage::RemoteIp => ServerMessage::RemoteIp {
                ip_address: peer.ip().to_string(),
            },

            ClientMessage::CheckServerReachable {
                server,
                http_check,
                http_flow,
            } => self.check_reachable(&server, http_check, http_flow).await,

            // Stream-level messages never reach the dispatcher
            ClientMessage::Auth { .. }
            | ClientMessage::CreateTunnel { .. }
            | ClientMessage::TunnelData { .. } => ServerMessage::Error {
                message: "unexpected message on control connection".to_string(),
            },
        }
    }

    async fn check_reachable(
        &self,
        server: &str,
        http_check: bool,
        want_flow: bool,
    ) -> ServerMessage {
        if !http_check {
            let reachable = tokio::time::timeout(
                TCP_PROBE_TIMEOUT,
                tokio::net::TcpStream::connect(server),
            )
            .await;
            return match reachable {
                Ok(Ok(_)) => ServerMessage::ServerReachable {
                    reachable: true,
                    verbose: format!("tcp connect to {} succeeded", server),
                    http_flow: None,
                },
                Ok(Err(e)) => ServerMessage::ServerReachable {
                    reachable: false,
                    verbose: format!("tcp connect to {} failed: {}", server, e),
                    http_flow: None,
                },
                Err(_) => ServerMessage::ServerReachable {
                    reachable: false,
                    verbose: format!("tcp connect to {} timed out", server),
                    http_flow: None,
                },
            };
        }

        let url = if server.starts_with("http://") || server.starts_with("https://") {
            server.to_string()
        } else {
            format!("http://{}", server)
        };

        let client = match reqwest::Client::builder()
            .timeout(HTTP_PROBE_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                return ServerMessage::Error {
                    message: format!("http probe setup failed: {}", e),
                }
            }
        };

        debug!(url = %url, "HTTP reachability probe");
        match client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                let flow = if want_flow {
                    let mut head = format!("HTTP/1.1 {}\r\n", status);
                    for (name, value) in response.headers() {
                        head.push_str(&format!(
                            "{}: {}\r\n",
                            name,
                            value.to_str().unwrap_or("<binary>")
                        ));
                    }
                    head.push_str("\r\n");
                    let mut body = response.bytes().await.unwrap_or_default().to_vec();
                    body.truncate(64 * 1024);
                    let mut captured = head.into_bytes();
                    captured.extend_from_slice(&body);
                    Some(HttpFlow {
                        request: format!("GET {} HTTP/1.1\r\n\r\n", url).into_bytes(),
                        response: captured,
                    })
                } else {
                    None
                };
                ServerMessage::ServerReachable {
                    reachable: true,
                    verbose: format!("http probe of {} answered {}", url, status),
                    http_flow: flow,
                }
            }
            Err(e) => ServerMessage::ServerReachable {
                reachable: false,
                verbose: format!("http probe of {} failed: {}", url, e),
                http_flow: None,
            },
        }
    }
}

fn error_response(err: impl std::fmt::Display) -> ServerMessage {
    ServerMessage::Error {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrortrap_dnslog::DnsLogConfig;
    use mirrortrap_trigger::reservation::NoPortUsage;

    fn test_handler() -> ControlHandler {
        let dnslog = Arc::new(DnsLogService::new(DnsLogConfig {
            domains: vec!["oob.example.com".to_string()],
            external_ip: "198.51.100.1".parse().unwrap(),
        }));
        ControlHandler::new(
            dnslog,
            IcmpTriggerEngine::new(),
            PortTriggerEngine::new(),
            Arc::new(PortTriggerReservations::new(Arc::new(NoPortUsage))),
            Arc::new(TunnelRegistry::new()),
            "198.51.100.1",
        )
    }

    fn peer() -> SocketAddr {
        "203.0.113.9:40100".parse().unwrap()
    }

    #[tokio::test]
    async fn test_remote_ip_reports_peer() {
        let handler = test_handler();
        let response = handler.handle(ClientMessage::RemoteIp, peer()).await;
        assert_eq!(
            response,
            ServerMessage::RemoteIp {
                ip_address: "203.0.113.9".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_require_and_query_domain() {
        let handler = test_handler();
        let response = handler
            .handle(
                ClientMessage::RequireDomain {
                    mode: String::new(),
                },
                peer(),
            )
            .await;

        let token = match response {
            ServerMessage::DomainAssigned { domain, token, .. } => {
                assert!(domain.ends_with(".oob.example.com"));
                token
            }
            other => panic!("Expected DomainAssigned, got {:?}", other),
        };

        let response = handler
            .handle(
                ClientMessage::QueryExistedDnsLog {
                    token,
                    mode: String::new(),
                },
                peer(),
            )
            .await;
        assert!(matches!(response, ServerMessage::DnsLogEvents { events } if events.is_empty()));
    }

    #[tokio::test]
    async fn test_icmp_query_for_unseen_size_is_error() {
        let handler = test_handler();
        let response = handler
            .handle(
                ClientMessage::QuerySpecificIcmpLengthTrigger { length: 0 },
                peer(),
            )
            .await;
        assert_eq!(
            response,
            ServerMessage::Error {
                message: "empty size connections".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_random_port_lifecycle() {
        let handler = test_handler();
        let response = handler
            .handle(
                ClientMessage::RequireRandomPortTrigger {
                    token: "tok1".to_string(),
                    ttl_seconds: 60,
                },
                peer(),
            )
            .await;

        let port = match response {
            ServerMessage::RandomPortAssigned {
                port,
                token,
                external_ip,
            } => {
                assert_eq!(token, "tok1");
                assert_eq!(external_ip, "198.51.100.1");
                port
            }
            other => panic!("Expected RandomPortAssigned, got {:?}", other),
        };
        assert!((55000..=65534).contains(&port));

        // Known token, but nothing observed yet
        let response = handler
            .handle(
                ClientMessage::QueryExistedRandomPortTrigger {
                    token: "tok1".to_string(),
                },
                peer(),
            )
            .await;
        assert_eq!(
            response,
            ServerMessage::Error {
                message: "empty port connections".to_string()
            }
        );

        // Unknown token
        let response = handler
            .handle(
                ClientMessage::QueryExistedRandomPortTrigger {
                    token: "other".to_string(),
                },
                peer(),
            )
            .await;
        assert_eq!(
            response,
            ServerMessage::Error {
                message: "empty token port mapped".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_register_tunnel_requires_secondary_password() {
        let handler = test_handler().with_secondary_password("letmein");

        let denied = handler
            .handle(
                ClientMessage::RegisterTunnel {
                    public_key: Vec::new(),
                    secret: "s".to_string(),
                    verbose: String::new(),
                    auth: "wrong".to_string(),
                },
                peer(),
            )
            .await;
        assert!(matches!(denied, ServerMessage::Error { .. }));

        let granted = handler
            .handle(
                ClientMessage::RegisterTunnel {
                    public_key: Vec::new(),
                    secret: "s".to_string(),
                    verbose: String::new(),
                    auth: "letmein".to_string(),
                },
                peer(),
            )
            .await;
        match granted {
            ServerMessage::TunnelRegistered { id } => {
                assert!(handler.registry().get(&id).is_ok());
            }
            other => panic!("Expected TunnelRegistered, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tcp_reachability_probe() {
        let handler = test_handler();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let response = handler
            .handle(
                ClientMessage::CheckServerReachable {
                    server: addr.to_string(),
                    http_check: false,
                    http_flow: false,
                },
                peer(),
            )
            .await;
        assert!(
            matches!(response, ServerMessage::ServerReachable { reachable: true, .. })
        );

        drop(listener);
        let response = handler
            .handle(
                ClientMessage::CheckServerReachable {
                    server: addr.to_string(),
                    http_check: false,
                    http_flow: false,
                },
                peer(),
            )
            .await;
        assert!(
            matches!(response, ServerMessage::ServerReachable { reachable: false, .. })
        );
    }

    #[tokio::test]
    async fn test_stream_messages_rejected_on_control_path() {
        let handler = test_handler();
        let response = handler
            .handle(
                ClientMessage::TunnelData {
                    to_id: "m1".to_string(),
                    to_remote_addr: "1.2.3.4:5".to_string(),
                    data: Vec::new(),
                    close: false,
                },
                peer(),
            )
            .await;
        assert!(matches!(response, ServerMessage::Error { .. }));
    }
}
