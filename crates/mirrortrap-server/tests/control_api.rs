//! Control RPC surface over a real TCP connection

mod common;

use common::start_server;
use mirrortrap_proto::{ClientMessage, FramedStream, ServerMessage};
use tokio::net::TcpStream;

async fn connect(addr: std::net::SocketAddr) -> FramedStream<TcpStream> {
    FramedStream::new(TcpStream::connect(addr).await.unwrap())
}

async fn call(
    stream: &mut FramedStream<TcpStream>,
    request: ClientMessage,
) -> ServerMessage {
    stream.send(&request).await.unwrap();
    stream.recv().await.unwrap().expect("server closed stream")
}

#[tokio::test]
async fn test_require_domain_twice_yields_distinct_tokens() {
    let server = start_server(None).await;
    let mut stream = connect(server.addr).await;

    let mut tokens = Vec::new();
    for _ in 0..2 {
        match call(
            &mut stream,
            ClientMessage::RequireDomain {
                mode: String::new(),
            },
        )
        .await
        {
            ServerMessage::DomainAssigned { domain, token, .. } => {
                assert_eq!(domain, format!("{}.oob.example.com", token));
                tokens.push(token);
            }
            other => panic!("Expected DomainAssigned, got {:?}", other),
        }
    }
    assert_ne!(tokens[0], tokens[1]);

    // Both resolve independently (empty so far)
    for token in tokens {
        match call(
            &mut stream,
            ClientMessage::QueryExistedDnsLog {
                token,
                mode: String::new(),
            },
        )
        .await
        {
            ServerMessage::DnsLogEvents { events } => assert!(events.is_empty()),
            other => panic!("Expected DnsLogEvents, got {:?}", other),
        }
    }

    server.cancel.cancel();
}

#[tokio::test]
async fn test_remote_ip_sees_loopback() {
    let server = start_server(None).await;
    let mut stream = connect(server.addr).await;

    match call(&mut stream, ClientMessage::RemoteIp).await {
        ServerMessage::RemoteIp { ip_address } => assert_eq!(ip_address, "127.0.0.1"),
        other => panic!("Expected RemoteIp, got {:?}", other),
    }

    server.cancel.cancel();
}

#[tokio::test]
async fn test_random_port_trigger_reservation_flow() {
    let server = start_server(None).await;
    let mut stream = connect(server.addr).await;

    let port = match call(
        &mut stream,
        ClientMessage::RequireRandomPortTrigger {
            token: "tok1".to_string(),
            ttl_seconds: 60,
        },
    )
    .await
    {
        ServerMessage::RandomPortAssigned {
            port,
            token,
            external_ip,
        } => {
            assert_eq!(token, "tok1");
            assert_eq!(external_ip, "127.0.0.1");
            port
        }
        other => panic!("Expected RandomPortAssigned, got {:?}", other),
    };
    assert!((55000..=65534).contains(&port));

    // No SYN observed yet: explicit no-data error, not a zero notification
    match call(
        &mut stream,
        ClientMessage::QueryExistedRandomPortTrigger {
            token: "tok1".to_string(),
        },
    )
    .await
    {
        ServerMessage::Error { message } => assert_eq!(message, "empty port connections"),
        other => panic!("Expected Error, got {:?}", other),
    }

    match call(
        &mut stream,
        ClientMessage::QueryExistedRandomPortTrigger {
            token: "unknown".to_string(),
        },
    )
    .await
    {
        ServerMessage::Error { message } => assert_eq!(message, "empty token port mapped"),
        other => panic!("Expected Error, got {:?}", other),
    }

    server.cancel.cancel();
}

#[tokio::test]
async fn test_icmp_query_boundary() {
    let server = start_server(None).await;
    let mut stream = connect(server.addr).await;

    match call(
        &mut stream,
        ClientMessage::QuerySpecificIcmpLengthTrigger { length: 0 },
    )
    .await
    {
        ServerMessage::Error { message } => assert_eq!(message, "empty size connections"),
        other => panic!("Expected Error, got {:?}", other),
    }

    server.cancel.cancel();
}

#[tokio::test]
async fn test_secret_gates_every_connection() {
    let server = start_server(Some("hunter2".to_string())).await;

    // Without auth: rejected and disconnected
    let mut stream = connect(server.addr).await;
    stream.send(&ClientMessage::RemoteIp).await.unwrap();
    match stream.recv::<ServerMessage>().await.unwrap() {
        Some(ServerMessage::Error { message }) => {
            assert_eq!(message, "authentication required");
        }
        other => panic!("Expected Error, got {:?}", other),
    }

    // Wrong secret: rejected
    let mut stream = connect(server.addr).await;
    stream
        .send(&ClientMessage::Auth {
            secret: "wrong".to_string(),
        })
        .await
        .unwrap();
    match stream.recv::<ServerMessage>().await.unwrap() {
        Some(ServerMessage::Error { .. }) => {}
        other => panic!("Expected Error, got {:?}", other),
    }

    // Right secret: authenticated, requests flow
    let mut stream = connect(server.addr).await;
    stream
        .send(&ClientMessage::Auth {
            secret: "hunter2".to_string(),
        })
        .await
        .unwrap();
    match stream.recv::<ServerMessage>().await.unwrap() {
        Some(ServerMessage::AuthOk) => {}
        other => panic!("Expected AuthOk, got {:?}", other),
    }
    match call(&mut stream, ClientMessage::RemoteIp).await {
        ServerMessage::RemoteIp { .. } => {}
        other => panic!("Expected RemoteIp, got {:?}", other),
    }

    server.cancel.cancel();
}

#[tokio::test]
async fn test_register_tunnel_and_lookup() {
    let server = start_server(None).await;
    let mut stream = connect(server.addr).await;

    let id = match call(
        &mut stream,
        ClientMessage::RegisterTunnel {
            public_key: vec![1, 2, 3],
            secret: "s3cret".to_string(),
            verbose: "demo".to_string(),
            auth: String::new(),
        },
    )
    .await
    {
        ServerMessage::TunnelRegistered { id } => id,
        other => panic!("Expected TunnelRegistered, got {:?}", other),
    };

    let registration = server.registry.get(&id).unwrap();
    assert_eq!(registration.secret, "s3cret");
    assert_ne!(registration.port, 0);

    server.cancel.cancel();
}

#[tokio::test]
async fn test_empty_mirror_list_tears_down_stream() {
    let server = start_server(None).await;
    let mut stream = connect(server.addr).await;

    stream
        .send(&ClientMessage::CreateTunnel {
            mirrors: Vec::new(),
        })
        .await
        .unwrap();

    match stream.recv::<ServerMessage>().await.unwrap() {
        Some(ServerMessage::Error { message }) => assert_eq!(message, "empty mirrors"),
        other => panic!("Expected Error, got {:?}", other),
    }
    // Server hangs up after the hard precondition failure
    let next: Option<ServerMessage> = stream.recv().await.unwrap();
    assert!(next.is_none());

    server.cancel.cancel();
}
