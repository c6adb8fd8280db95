//! WebSocket listener using tokio-tungstenite.
//!
//! Frames are JSON text; binary frames carrying UTF-8 JSON are accepted on
//! receive. Each accepted socket is handed to the server over a channel.

use futures_util::{SinkExt, StreamExt};
use relay_core::{RelayError, RelayResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub type WsStream = WebSocketStream<TcpStream>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    pub remote_addr: SocketAddr,
}

/// Bind `bind_addr` and start accepting.
///
/// Returns the bound address (useful with port 0) and a receiver that
/// yields connections whose upgrade handshake succeeded.
pub async fn start_listener(
    bind_addr: &str,
) -> RelayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind {bind_addr} failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    if tx.is_closed() {
                        debug!("connection receiver dropped, stopping accept loop");
                        break;
                    }
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Send one text frame.
pub async fn ws_send_text(ws: &mut WsStream, text: String) -> RelayResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| RelayError::Transport(format!("WS send failed: {e}")))
}

/// Send a close frame, ignoring failures on an already broken socket.
pub async fn ws_close(ws: &mut WsStream) {
    if let Err(e) = ws.close(None).await {
        debug!(error = %e, "WS close failed");
    }
}

/// Receive the next text or binary payload.
///
/// Returns `None` once the peer has closed. Payloads over `max_bytes` are
/// an error, which ends the connection.
pub async fn ws_recv(ws: &mut WsStream, max_bytes: usize) -> RelayResult<Option<Vec<u8>>> {
    loop {
        let data = match ws.next().await {
            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(RelayError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        };

        if data.len() > max_bytes {
            return Err(RelayError::InvalidMessage(format!(
                "WS frame too large: {} bytes (max {max_bytes})",
                data.len()
            )));
        }
        return Ok(Some(data));
    }
}
