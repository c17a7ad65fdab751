//! WebSocket transport for chat sessions
//!
//! Adapts `axum::extract::ws::WebSocket` to the `StreamMessage` trait; all
//! chat logic lives in `ChatSession::run`.

use axum::extract::{
    ws::{Message as WsMessage, WebSocket},
    ConnectInfo, State, WebSocketUpgrade,
};
use axum::response::IntoResponse;
use futures::{stream::SplitStream, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::http::AppState;
use crate::impls::messaging::{ChatSession, ClientEvent, EventCodec, ServerEvent, StreamMessage};

/// Frames buffered for the socket writer before the client counts as too slow
const WRITER_CHANNEL_CAPACITY: usize = 1000;

/// Largest accepted inbound frame
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

struct WebSocketStream {
    receiver: SplitStream<WebSocket>,
    sender: mpsc::Sender<String>,
    is_alive: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl StreamMessage for WebSocketStream {
    async fn recv(&mut self) -> Option<Result<ClientEvent, String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Some(EventCodec::decode_client_event(text.as_str()));
                }
                Some(Ok(WsMessage::Close(_))) | None => return None,
                Some(Err(e)) => return Some(Err(format!("WebSocket error: {e}"))),
                Some(Ok(_)) => {
                    // Ping/pong are answered by axum; binary frames are not part of the protocol
                }
            }
        }
    }

    fn send(&self, event: ServerEvent) -> Result<(), String> {
        let text = EventCodec::encode_server_event(&event)?;

        self.sender.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                "Channel full: WebSocket client too slow to consume messages".to_string()
            }
            mpsc::error::TrySendError::Closed(_) => {
                "Channel closed: WebSocket client disconnected".to_string()
            }
        })
    }

    fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }
}

/// Upgrade to a chat stream
pub async fn websocket_handler(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    info!(remote_addr = %remote_addr, "WebSocket connection established");

    let (tx, mut rx) = mpsc::channel::<String>(WRITER_CHANNEL_CAPACITY);
    let is_alive = Arc::new(AtomicBool::new(true));
    let (mut sink, receiver) = socket.split();

    let writer_alive = Arc::clone(&is_alive);
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                debug!(error = %e, "Failed to send WebSocket message");
                writer_alive.store(false, Ordering::Relaxed);
                return;
            }
        }
        // Session ended: close the socket
        let _ = sink.send(WsMessage::Close(None)).await;
        let _ = sink.close().await;
    });

    let mut stream = WebSocketStream {
        receiver,
        sender: tx,
        is_alive,
    };

    let session = ChatSession::new(
        Arc::clone(&state.message_service),
        Arc::clone(&state.registry),
        Some(remote_addr),
    );
    if let Err(e) = session.run(&mut stream).await {
        error!(error = %e, remote_addr = %remote_addr, "Chat session ended with error");
    }

    // Dropping the stream closes the writer channel once queued frames are flushed
    drop(stream);
    let _ = writer.await;

    info!(remote_addr = %remote_addr, "WebSocket connection closed");
}
