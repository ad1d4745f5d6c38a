//! WebSocket server implementation
//!
//! Provides a WebSocket server that listens on a configurable port and exposes
//! the host's colonies to bridge clients.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::handler::{ConnectionHandler, OUTBOUND_CAPACITY};
use super::protocol::ServerMessage;
use crate::host::Host;

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Optional authentication token
    pub token: Option<String>,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            token: None,
        }
    }

    /// Set the authentication token
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server for bridge client connections
pub struct WebSocketServer {
    config: ServerConfig,
    host: Arc<Host>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, host: Arc<Host>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            host,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and run the WebSocket server
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}", addr);
        self.serve(listener).await
    }

    /// Accept connections until shutdown, then retire every drone
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let host = Arc::clone(&self.host);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let token = self.config.token.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, host, shutdown_rx, token).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        self.host.shutdown().await;
        Ok(())
    }
}

async fn send_json<S>(sink: &mut S, message: &ServerMessage) -> anyhow::Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(message)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    host: Arc<Host>,
    mut shutdown_rx: broadcast::Receiver<()>,
    token: Option<String>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    // Upgrade to WebSocket
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let mut handler = ConnectionHandler::new(host, token, outbound_tx);

    send_json(&mut ws_sender, &handler.welcome().await).await?;
    debug!("Sent welcome message to {}", peer_addr);

    // Message handling loop
    loop {
        tokio::select! {
            // Receive messages from client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received message from {} ({} bytes)", peer_addr, text.len());
                        let response = handler.handle_text(&text).await;
                        send_json(&mut ws_sender, &response).await?;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            // Push drone notifications and background replies
            Some(message) = outbound_rx.recv() => {
                send_json(&mut ws_sender, &message).await?;
            }
            // Handle shutdown signal
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    info!("Connection from {} closed", peer_addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColonyOptions;
    use crate::host::ColonyPlugin;
    use crate::server::protocol::ClientMessage;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_server_config_with_token() {
        let config = ServerConfig::new("0.0.0.0".to_string(), 8080)
            .with_token(Some("secret".to_string()));
        assert_eq!(config.token, Some("secret".to_string()));
    }

    async fn recv_json<S>(stream: &mut S) -> ServerMessage
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("frame within timeout")
                .expect("stream open")
                .expect("valid frame");
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_end_to_end_buzz_and_shutdown() {
        let host = Arc::new(Host::new());
        host.register(ColonyPlugin::new(ColonyOptions::new("test-api-key")))
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(WebSocketServer::new(
            ServerConfig::new("127.0.0.1".to_string(), addr.port()),
            Arc::clone(&host),
        ));
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let (mut tx, mut rx) = ws.split();

        assert!(matches!(
            recv_json(&mut rx).await,
            ServerMessage::Welcome {
                auth_required: false,
                ..
            }
        ));

        let hatch = serde_json::to_string(&ClientMessage::hatch("/project")).unwrap();
        tx.send(Message::Text(hatch)).await.unwrap();
        let drone_id = match recv_json(&mut rx).await {
            ServerMessage::DroneHatched { drone, .. } => drone.id,
            other => panic!("Expected DroneHatched, got {:?}", other),
        };

        let buzz = serde_json::to_string(&ClientMessage::buzz(&drone_id, "Hello")).unwrap();
        tx.send(Message::Text(buzz)).await.unwrap();

        let mut saw_ack = false;
        let mut saw_message = false;
        loop {
            match recv_json(&mut rx).await {
                ServerMessage::Ack { action, .. } if action == "buzz" => saw_ack = true,
                ServerMessage::DroneEvent {
                    event: crate::colony::DroneEvent::Message(message),
                    ..
                } => {
                    assert_eq!(message.content, "Received prompt: Hello");
                    saw_message = true;
                }
                ServerMessage::DroneEvent {
                    event: crate::colony::DroneEvent::Complete(complete),
                    ..
                } => {
                    assert!(complete.success);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_ack);
        assert!(saw_message);

        let colony = host.get("colony").await.unwrap();
        let drone = colony.recall(&drone_id).await.unwrap();

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(drone.is_retired());
        assert_eq!(colony.drone_count().await, 0);
    }
}
