//! Core server: accepts WebSocket connections and drives one task per client.
//!
//! Each connection task multiplexes three sources: the shutdown broadcast,
//! frames queued for it by the relay, and inbound frames from the socket.

use crate::config::ServerConfig;
use crate::relay::{Outbound, Relay};
use crate::transport::websocket::{self, WebSocketConnection};
use relay_core::{decode, encode, ConnectionId, RelayError, RelayResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How long connection tasks get to send their close frames on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The relay server instance.
pub struct RelayServer {
    config: ServerConfig,
    relay: Arc<Relay>,
    /// Tells every connection loop to close its socket.
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let relay = Arc::new(Relay::new(config.max_pending, config.drop_log_every));
        Self {
            config,
            relay,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    #[cfg(test)]
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> RelayResult<()> {
        let (addr, conn_rx) = websocket::start_listener(&self.config.bind_addr()).await?;
        info!(
            addr = %addr,
            max_pending = self.config.max_pending,
            "screen relay ready"
        );
        self.serve(conn_rx, shutdown).await
    }

    /// Serve connections from `conn_rx` until `shutdown` resolves or the
    /// listener goes away.
    pub async fn serve(
        self,
        mut conn_rx: mpsc::Receiver<WebSocketConnection>,
        shutdown: impl Future<Output = ()>,
    ) -> RelayResult<()> {
        let server = Arc::new(self);
        server.spawn_stats_ticker();

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                Some(ws_conn) = conn_rx.recv() => {
                    let srv = server.clone();
                    tasks.spawn(async move {
                        let remote = ws_conn.remote_addr;
                        if let Err(e) = srv.handle_websocket(ws_conn).await {
                            warn!(remote = %remote, error = %e, "WebSocket connection error");
                        }
                    });
                }
                // Reap finished connection tasks as we go.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                else => {
                    info!("listener closed, shutting down");
                    break;
                }
            }
        }

        info!(connections = tasks.len(), "closing connected clients");
        let _ = server.shutdown_tx.send(());
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("connections still open after grace period, aborting");
            tasks.abort_all();
        }

        Ok(())
    }

    /// Log the statistics report every `stats_interval_secs`.
    fn spawn_stats_ticker(self: &Arc<Self>) {
        let secs = self.config.stats_interval_secs;
        if secs == 0 {
            return;
        }
        let relay = self.relay.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            // The first tick fires immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        let r = relay.performance_report().await;
                        info!(
                            uptime = r.uptime,
                            frames_processed = r.frames_processed,
                            frames_per_second = r.frames_per_second,
                            average_frame_size = r.average_frame_size_bytes,
                            total_bytes = r.total_bytes_transferred,
                            frames_dropped = r.frames_dropped,
                            active_sessions = r.active_sessions,
                            controllers = r.connected_controllers,
                            targets = r.connected_targets,
                            "relay statistics"
                        );
                    }
                }
            }
        });
    }

    async fn handle_websocket(&self, mut conn: WebSocketConnection) -> RelayResult<()> {
        let (outbox, outbox_rx) = mpsc::channel::<Outbound>(self.config.outbound_queue);
        let conn_id = self
            .relay
            .connect(conn.remote_addr.to_string(), outbox)
            .await;

        let result = self.connection_loop(conn_id, &mut conn, outbox_rx).await;

        // Runs on every exit path, including errors.
        self.relay.disconnect(conn_id).await;
        result
    }

    async fn connection_loop(
        &self,
        conn_id: ConnectionId,
        conn: &mut WebSocketConnection,
        mut outbox_rx: mpsc::Receiver<Outbound>,
    ) -> RelayResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let max_bytes = self.config.max_message_bytes;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(conn_id, "shutdown signal received, closing WebSocket");
                    websocket::ws_close(&mut conn.ws_stream).await;
                    break;
                }

                // Frames queued by the relay for this client. Dropping the
                // message after the write releases its admission permit.
                Some(outbound) = outbox_rx.recv() => {
                    let text = encode(&outbound.event)?;
                    websocket::ws_send_text(&mut conn.ws_stream, text).await?;
                    drop(outbound);
                }

                ws_result = websocket::ws_recv(&mut conn.ws_stream, max_bytes) => {
                    match ws_result {
                        Ok(Some(data)) => {
                            let event = match decode(&data) {
                                Ok(event) => event,
                                Err(e @ RelayError::InvalidMessage(_)) => {
                                    debug!(conn_id, error = %e, "dropping rejected frame");
                                    continue;
                                }
                                Err(e) => {
                                    warn!(conn_id, error = %e, "dropping undecodable frame");
                                    continue;
                                }
                            };
                            debug!(conn_id, event = event.name(), len = data.len(), "inbound");
                            if let Some(reply) = self.relay.handle_event(conn_id, event, data.len()).await {
                                let text = encode(&reply)?;
                                websocket::ws_send_text(&mut conn.ws_stream, text).await?;
                            }
                        }
                        Ok(None) => {
                            debug!(conn_id, "WebSocket closed by peer");
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Harness {
        addr: SocketAddr,
        relay: Arc<Relay>,
        stop: Option<oneshot::Sender<()>>,
        handle: tokio::task::JoinHandle<RelayResult<()>>,
    }

    impl Harness {
        async fn stop(mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            self.handle.await.unwrap().unwrap();
        }
    }

    async fn start(config: ServerConfig) -> Harness {
        let (addr, conn_rx) = websocket::start_listener("127.0.0.1:0").await.unwrap();
        let server = RelayServer::new(config);
        let relay = server.relay().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(conn_rx, async move {
            let _ = stop_rx.await;
        }));
        Harness {
            addr,
            relay,
            stop: Some(stop_tx),
            handle,
        }
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, frame: Value) {
        ws.send(Message::Text(frame.to_string().into())).await.unwrap();
    }

    /// Next JSON event, failing the test after a short wait.
    async fn recv(ws: &mut Client) -> Value {
        let next = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    other => panic!("unexpected message: {other:?}"),
                }
            }
        });
        next.await.expect("timed out waiting for event")
    }

    /// Wait until the socket is closed by the server.
    async fn expect_closed(ws: &mut Client) {
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                }
            }
        });
        closed.await.expect("server did not close the connection");
    }

    fn quiet_config() -> ServerConfig {
        ServerConfig {
            stats_interval_secs: 0,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn end_to_end_pairing_and_screen_update() {
        let harness = start(quiet_config()).await;
        let mut controller = connect(harness.addr).await;
        let mut target = connect(harness.addr).await;

        send(&mut controller, json!({"event": "join_as_controller", "data": {"controller_id": "c1"}})).await;
        let reg = recv(&mut controller).await;
        assert_eq!(reg["event"], "registered");
        assert_eq!(reg["data"]["role"], "controller");

        send(&mut target, json!({"event": "join_as_target", "data": {"target_id": "t1"}})).await;
        assert_eq!(recv(&mut target).await["event"], "registered");

        send(&mut controller, json!({"event": "get_targets"})).await;
        let list = recv(&mut controller).await;
        assert_eq!(list["event"], "targets_list");
        assert_eq!(list["data"]["targets"][0]["target_id"], "t1");

        send(&mut controller, json!({"event": "pair_with_target", "data": {"target_id": "t1"}})).await;
        let paired = recv(&mut controller).await;
        assert_eq!(paired["event"], "pairing_success");
        assert_eq!(paired["data"]["target_id"], "t1");
        let session_id = paired["data"]["session_id"].as_str().unwrap().to_string();

        let notice = recv(&mut target).await;
        assert_eq!(notice["event"], "controller_paired");
        assert_eq!(notice["data"]["controller_id"], "c1");
        assert_eq!(notice["data"]["session_id"], session_id.as_str());

        let image = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk";
        send(
            &mut target,
            json!({"event": "screen_data", "data": {"session_id": session_id, "image": image, "width": 1920}}),
        )
        .await;
        let update = recv(&mut controller).await;
        assert_eq!(update["event"], "screen_update");
        assert_eq!(update["data"]["image"], image);
        assert_eq!(update["data"]["width"], 1920);
        assert_eq!(update["data"]["session_id"], session_id.as_str());
        assert!(update["data"]["server_timestamp"].as_u64().unwrap() > 0);

        send(&mut controller, json!({"event": "get_stats"})).await;
        let stats = recv(&mut controller).await;
        assert_eq!(stats["event"], "stats");
        assert_eq!(stats["data"]["framesProcessed"], 1);
        assert_eq!(stats["data"]["activeSessions"], 1);
        assert_eq!(stats["data"]["connectedControllers"], 1);
        assert_eq!(stats["data"]["connectedTargets"], 1);

        harness.stop().await;
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_without_reply() {
        let harness = start(quiet_config()).await;
        let mut client = connect(harness.addr).await;

        client.send(Message::Text("not json".to_string().into())).await.unwrap();
        send(&mut client, json!({"event": "format_disk", "data": {}})).await;
        send(&mut client, json!({"event": "ping"})).await;

        // The only reply is to the ping.
        assert_eq!(recv(&mut client).await["event"], "pong");
        harness.stop().await;
    }

    #[tokio::test]
    async fn binary_json_frames_are_accepted() {
        let harness = start(quiet_config()).await;
        let mut client = connect(harness.addr).await;

        let frame = json!({"event": "join_as_target", "data": {"target_id": "t9"}}).to_string();
        client.send(Message::Binary(frame.into_bytes().into())).await.unwrap();
        let reg = recv(&mut client).await;
        assert_eq!(reg["data"]["id"], "t9");
        harness.stop().await;
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let harness = start(ServerConfig {
            max_message_bytes: 64,
            ..quiet_config()
        })
        .await;
        let mut client = connect(harness.addr).await;
        send(&mut client, json!({"event": "join_as_target", "data": {"target_id": "t1"}})).await;
        recv(&mut client).await;

        let big = "x".repeat(200);
        send(&mut client, json!({"event": "screen_data", "data": {"image": big}})).await;
        expect_closed(&mut client).await;

        // The relay forgets the connection once its task exits.
        let mut remaining = usize::MAX;
        for _ in 0..50 {
            remaining = harness.relay.performance_report().await.connected_targets;
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(remaining, 0);
        harness.stop().await;
    }

    #[tokio::test]
    async fn disconnect_notifies_paired_controller() {
        let harness = start(quiet_config()).await;
        let mut controller = connect(harness.addr).await;
        let mut target = connect(harness.addr).await;

        send(&mut controller, json!({"event": "join_as_controller", "data": {"controller_id": "c1"}})).await;
        recv(&mut controller).await;
        send(&mut target, json!({"event": "join_as_target", "data": {"target_id": "t1"}})).await;
        recv(&mut target).await;
        send(&mut controller, json!({"event": "pair_with_target", "data": {"target_id": "t1"}})).await;
        let session_id = recv(&mut controller).await["data"]["session_id"].clone();

        target.close(None).await.unwrap();
        let ended = recv(&mut controller).await;
        assert_eq!(ended["event"], "session_ended");
        assert_eq!(ended["data"]["session_id"], session_id);
        harness.stop().await;
    }

    #[tokio::test]
    async fn shutdown_closes_clients() {
        let harness = start(quiet_config()).await;
        let mut client = connect(harness.addr).await;
        send(&mut client, json!({"event": "ping"})).await;
        recv(&mut client).await;

        harness.stop().await;
        expect_closed(&mut client).await;
    }
}
