//! Wire-level gateway tests over a real WebSocket connection.

use futures_util::{SinkExt, StreamExt};
use hpcsh_core::{
    decode_message, encode_message, AllocRequest, ClientMessage, ErrorCode, ServerMessage,
};
use hpcsh_server::config::ServerConfig;
use hpcsh_server::server::HpcshServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server() -> SocketAddr {
    let mut cfg = ServerConfig::default();
    cfg.slurm.salloc = String::new();
    cfg.terminal.shell = "/bin/sh".to_string();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(HpcshServer::new(cfg));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("client connect failed");
    ws
}

async fn send(ws: &mut WsClient, msg: &ClientMessage) {
    ws.send(Message::Binary(encode_message(msg).unwrap().into()))
        .await
        .expect("client send failed");
}

async fn recv(ws: &mut WsClient) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Binary(data) = frame {
            return decode_message(&data).expect("undecodable server message");
        }
    }
}

/// Receive until the predicate matches, returning the matching message.
async fn recv_until<F>(ws: &mut WsClient, mut pred: F) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    loop {
        let msg = recv(ws).await;
        if pred(&msg) {
            return msg;
        }
    }
}

#[tokio::test]
async fn unknown_ids_and_unattached_input_are_rejected() {
    let addr = start_server().await;
    let mut ws = connect(addr).await;

    send(
        &mut ws,
        &ClientMessage::Attach {
            session_id: "nonexistent".into(),
        },
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::SessionNotFound),
        other => panic!("expected error, got {other:?}"),
    }

    send(
        &mut ws,
        &ClientMessage::Terminate {
            session_id: "nonexistent".into(),
        },
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::SessionNotFound),
        other => panic!("expected error, got {other:?}"),
    }

    // Input before any attach is rejected outright.
    send(
        &mut ws,
        &ClientMessage::Input {
            session_id: "nonexistent".into(),
            data: "x".into(),
        },
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotAttached),
        other => panic!("expected error, got {other:?}"),
    }

    // Nothing was created along the way.
    send(&mut ws, &ClientMessage::ListSessions).await;
    match recv(&mut ws).await {
        ServerMessage::Sessions { sessions } => assert!(sessions.is_empty()),
        other => panic!("expected session list, got {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_frames_get_an_invalid_message_error() {
    let addr = start_server().await;
    let mut ws = connect(addr).await;

    ws.send(Message::Binary(vec![0xff, 0x13, 0x37].into()))
        .await
        .unwrap();
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidMessage),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn full_session_round_trip_over_the_wire() {
    let addr = start_server().await;
    let mut ws = connect(addr).await;

    send(
        &mut ws,
        &ClientMessage::CreateSession {
            request: AllocRequest {
                nodes: Some(1),
                memory_gb: None,
                time_hours: Some(1),
            },
        },
    )
    .await;
    let session_id = match recv(&mut ws).await {
        ServerMessage::SessionCreated { session_id } => session_id,
        ServerMessage::Error { message, .. } => {
            println!("PTY creation failed (may be expected in CI): {message}");
            return;
        }
        other => panic!("unexpected reply: {other:?}"),
    };

    send(
        &mut ws,
        &ClientMessage::Attach {
            session_id: session_id.clone(),
        },
    )
    .await;
    match recv_until(&mut ws, |m| {
        matches!(m, ServerMessage::Attached { .. } | ServerMessage::Error { .. })
    })
    .await
    {
        ServerMessage::Attached { session_id: sid } => assert_eq!(sid, session_id),
        other => panic!("expected attach confirmation, got {other:?}"),
    }

    send(
        &mut ws,
        &ClientMessage::Input {
            session_id: session_id.clone(),
            data: "echo over-the-wire\n".into(),
        },
    )
    .await;
    recv_until(&mut ws, |m| {
        matches!(m, ServerMessage::Output { data, .. } if data.contains("over-the-wire"))
    })
    .await;

    send(&mut ws, &ClientMessage::ListSessions).await;
    match recv_until(&mut ws, |m| matches!(m, ServerMessage::Sessions { .. })).await {
        ServerMessage::Sessions { sessions } => {
            assert_eq!(sessions.len(), 1);
            assert_eq!(sessions[0].id, session_id);
            assert!(sessions[0].attached);
            assert_eq!(sessions[0].request.nodes, Some(1));
        }
        other => panic!("expected session list, got {other:?}"),
    }

    send(
        &mut ws,
        &ClientMessage::Terminate {
            session_id: session_id.clone(),
        },
    )
    .await;
    match recv_until(&mut ws, |m| {
        matches!(m, ServerMessage::Terminated { .. } | ServerMessage::Error { .. })
    })
    .await
    {
        ServerMessage::Terminated { session_id: sid } => assert_eq!(sid, session_id),
        other => panic!("expected termination confirmation, got {other:?}"),
    }

    // Idempotent over the wire as well.
    send(
        &mut ws,
        &ClientMessage::Terminate {
            session_id: session_id.clone(),
        },
    )
    .await;
    match recv_until(&mut ws, |m| {
        matches!(m, ServerMessage::Terminated { .. } | ServerMessage::Error { .. })
    })
    .await
    {
        ServerMessage::Terminated { session_id: sid } => assert_eq!(sid, session_id),
        other => panic!("expected termination confirmation, got {other:?}"),
    }
}
