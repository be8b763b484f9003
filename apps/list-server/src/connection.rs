//! One WebSocket connection driving one sync session

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use listsync::{Authenticator, CloseReason, ListRegistry, ServerMessage, SyncSession};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// What woke the connection loop
enum Step {
    Frame(Option<Result<Message, WsError>>),
    Event(Option<ServerMessage>),
}

pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<ListRegistry>,
    auth: Arc<dyn Authenticator>,
) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    info!("WebSocket connection established: {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut session = SyncSession::new(registry, auth);

    loop {
        let step = tokio::select! {
            frame = ws_receiver.next() => Step::Frame(frame),
            event = session.next_event() => Step::Event(event),
        };

        let outbound = match step {
            Step::Frame(Some(Ok(Message::Text(text)))) => session.handle_text(&text).await,
            Step::Frame(Some(Ok(Message::Ping(data)))) => {
                if ws_sender.send(Message::Pong(data)).await.is_err() {
                    break;
                }
                continue;
            }
            Step::Frame(Some(Ok(Message::Close(_)))) | Step::Frame(None) => {
                info!("Client {} closed the connection", addr);
                break;
            }
            Step::Frame(Some(Ok(_))) => {
                debug!("Ignoring non-text frame from {}", addr);
                continue;
            }
            Step::Frame(Some(Err(e))) => {
                error!("Error receiving message from {}: {}", addr, e);
                break;
            }
            Step::Event(Some(msg)) => vec![msg],
            Step::Event(None) => break,
        };

        if !send_all(&mut ws_sender, &outbound).await {
            break;
        }
        if outbound
            .iter()
            .any(|msg| matches!(msg, ServerMessage::Closed { .. }))
        {
            let _ = ws_sender.send(Message::Close(None)).await;
            break;
        }
    }

    session.close(CloseReason::Disconnected).await;
    info!("Connection closed: {}", addr);
}

/// Returns false once the socket can no longer be written
async fn send_all(ws_sender: &mut WsSender, messages: &[ServerMessage]) -> bool {
    for msg in messages {
        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                continue;
            }
        };

        if let Err(e) = ws_sender.send(Message::Text(json)).await {
            error!("Failed to send message: {}", e);
            return false;
        }
    }
    true
}
