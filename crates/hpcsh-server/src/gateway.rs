//! Channel gateway: binds remote WebSocket connections to sessions.
//!
//! A connection must attach to a session before any input for it is
//! accepted. Attaching replaces whatever channel was bound before — the
//! old one stops receiving output, never both. A connection going away
//! does not reap live sessions; the user can reattach later with the same
//! session id.

use crate::session::registry::SessionRegistry;
use futures_util::{SinkExt, StreamExt};
use hpcsh_core::{
    decode_message, encode_message, ClientMessage, ErrorCode, HpcshError, HpcshResult,
    ServerMessage, MAX_MESSAGE_SIZE,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

/// Outbound events queued per connection. Terminal output is bursty;
/// overflow is dropped by the bridge rather than stalling a session.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Per-connection state threaded through the message loop.
struct ConnectionContext {
    conn_id: u64,
    /// Session ids this connection has attached to; input and resize are
    /// only accepted for these.
    attached: HashSet<String>,
    /// Sender handed to the registry on attach; the bridges push output
    /// and lifecycle events through it.
    outbound: mpsc::Sender<ServerMessage>,
}

/// Serve one remote connection until either side closes it.
pub async fn handle_connection(
    registry: Arc<SessionRegistry>,
    stream: TcpStream,
    remote: SocketAddr,
    conn_id: u64,
) -> HpcshResult<()> {
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| HpcshError::Transport(format!("WebSocket handshake failed: {e}")))?;
    debug!(remote = %remote, conn_id, "connection accepted");

    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let mut ctx = ConnectionContext {
        conn_id,
        attached: HashSet::new(),
        outbound: outbound_tx,
    };

    let result = loop {
        tokio::select! {
            Some(event) = outbound_rx.recv() => {
                if let Err(e) = send_message(&mut ws, &event).await {
                    break Err(e);
                }
            }

            incoming = recv_binary(&mut ws) => match incoming {
                Ok(Some(frame)) => {
                    let reply = match decode_message::<ClientMessage>(&frame) {
                        Ok(msg) => dispatch(&registry, &mut ctx, msg).await,
                        Err(e) => Some(ServerMessage::Error {
                            code: ErrorCode::InvalidMessage,
                            message: e.to_string(),
                        }),
                    };
                    if let Some(reply) = reply {
                        if let Err(e) = send_message(&mut ws, &reply).await {
                            break Err(e);
                        }
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        }
    };

    // The connection is gone. Detach from every session we were bound to;
    // the registry keeps live ones around for reattach and reaps only
    // those whose child already exited.
    for id in &ctx.attached {
        registry.channel_closed(id, conn_id).await;
    }
    info!(remote = %remote, conn_id, "connection closed");

    result
}

/// Handle one decoded client message, returning the direct reply if any.
async fn dispatch(
    registry: &Arc<SessionRegistry>,
    ctx: &mut ConnectionContext,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::CreateSession { request } => match registry.create(request).await {
            Ok(session_id) => Some(ServerMessage::SessionCreated { session_id }),
            Err(e) => Some(error_reply(e)),
        },

        ClientMessage::Attach { session_id } => {
            match registry
                .attach(&session_id, ctx.conn_id, ctx.outbound.clone())
                .await
            {
                Ok(()) => {
                    ctx.attached.insert(session_id.clone());
                    Some(ServerMessage::Attached { session_id })
                }
                Err(e) => Some(error_reply(e)),
            }
        }

        ClientMessage::Input { session_id, data } => {
            if !ctx.attached.contains(&session_id) {
                return Some(ServerMessage::Error {
                    code: ErrorCode::NotAttached,
                    message: "attach to the session before sending input".into(),
                });
            }
            match registry.send_input(&session_id, data.into_bytes()).await {
                Ok(()) => None,
                Err(e) => Some(error_reply(e)),
            }
        }

        ClientMessage::Resize {
            session_id,
            rows,
            cols,
        } => {
            if !ctx.attached.contains(&session_id) {
                return Some(ServerMessage::Error {
                    code: ErrorCode::NotAttached,
                    message: "attach to the session before resizing".into(),
                });
            }
            match registry.resize(&session_id, rows, cols).await {
                Ok(()) => None,
                Err(e) => Some(error_reply(e)),
            }
        }

        ClientMessage::Terminate { session_id } => match registry.terminate(&session_id).await {
            Ok(()) => {
                ctx.attached.remove(&session_id);
                Some(ServerMessage::Terminated { session_id })
            }
            Err(e) => Some(error_reply(e)),
        },

        ClientMessage::ListSessions => Some(ServerMessage::Sessions {
            sessions: registry.list().await,
        }),
    }
}

/// Map a session-layer error to its wire shape. Internal detail stays in
/// the logs; the client sees the named condition.
fn error_reply(e: HpcshError) -> ServerMessage {
    let code = match &e {
        HpcshError::SessionNotFound(_) => ErrorCode::SessionNotFound,
        HpcshError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
        HpcshError::LaunchFailed(_) => ErrorCode::LaunchFailed,
        HpcshError::InvalidMessage(_) | HpcshError::Codec(_) => ErrorCode::InvalidMessage,
        _ => ErrorCode::Internal,
    };
    ServerMessage::Error {
        code,
        message: e.to_string(),
    }
}

/// Send one CBOR-encoded message as a binary frame.
async fn send_message(
    ws: &mut WebSocketStream<TcpStream>,
    msg: &ServerMessage,
) -> HpcshResult<()> {
    let payload = encode_message(msg)?;
    ws.send(Message::Binary(payload.into()))
        .await
        .map_err(|e| HpcshError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next binary frame. `None` means the peer closed cleanly.
/// Pings are answered in place; text frames are ignored; oversized frames
/// are rejected before decoding.
async fn recv_binary(ws: &mut WebSocketStream<TcpStream>) -> HpcshResult<Option<Vec<u8>>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                if data.len() > MAX_MESSAGE_SIZE {
                    return Err(HpcshError::InvalidMessage(format!(
                        "frame too large: {} bytes (max {MAX_MESSAGE_SIZE})",
                        data.len()
                    )));
                }
                return Ok(Some(data.to_vec()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(HpcshError::Transport(format!("WS recv failed: {e}"))),
            None => return Ok(None),
        }
    }
}
