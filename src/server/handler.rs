//! WebSocket connection handler
//!
//! Routes client messages for one connection to the hosted colonies. Replies
//! that are produced later (drone notifications, failed prompts) are pushed
//! through the connection's outbound channel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{ClientEnvelope, ClientMessage, ErrorCode, ServerMessage};
use crate::colony::{Colony, Drone, DroneError, DroneId, DroneStatus};
use crate::config::DroneConfig;
use crate::host::{Host, DEFAULT_DECORATOR};

/// Messages a connection may have queued before producers wait
pub const OUTBOUND_CAPACITY: usize = 256;

/// Sender half of a connection's outbound queue
pub type Outbound = mpsc::Sender<ServerMessage>;

/// Handles a single WebSocket connection
pub struct ConnectionHandler {
    host: Arc<Host>,
    token: Option<String>,
    authenticated: bool,
    outbound: Outbound,
    /// Event forwarders for drones this connection has touched
    watched: HashMap<DroneId, JoinHandle<()>>,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(host: Arc<Host>, token: Option<String>, outbound: Outbound) -> Self {
        Self {
            host,
            token,
            authenticated: false,
            outbound,
            watched: HashMap::new(),
        }
    }

    /// Whether the client still has to authenticate
    pub fn auth_required(&self) -> bool {
        self.token.is_some() && !self.authenticated
    }

    /// Message sent as soon as the connection opens
    pub async fn welcome(&self) -> ServerMessage {
        ServerMessage::welcome(self.token.is_some(), self.host.names().await)
    }

    /// Parse, validate and dispatch one text frame
    pub async fn handle_text(&mut self, text: &str) -> ServerMessage {
        match ClientEnvelope::from_json(text) {
            Ok(envelope) => self.handle_message(envelope.message).await,
            Err(e) => {
                debug!("Rejected client message: {}", e);
                e.into()
            }
        }
    }

    /// Dispatch a parsed client message and return the immediate reply
    pub async fn handle_message(&mut self, message: ClientMessage) -> ServerMessage {
        if self.auth_required()
            && !matches!(
                message,
                ClientMessage::Ping { .. } | ClientMessage::Authenticate { .. }
            )
        {
            return ServerMessage::error_with_code(
                format!("Authenticate before sending {}", message.kind()),
                ErrorCode::AuthRequired,
            );
        }

        match message {
            ClientMessage::Ping { seq } => {
                debug!("Received ping with seq {}", seq);
                ServerMessage::pong(seq)
            }
            ClientMessage::Authenticate { token } => self.authenticate(&token),
            ClientMessage::Hatch {
                colony,
                cwd,
                model,
                tools,
                system_prompt,
                metadata,
            } => {
                let mut config = DroneConfig::new(cwd)
                    .with_model(model.unwrap_or_default())
                    .with_tools(tools)
                    .with_metadata(metadata);
                if let Some(prompt) = system_prompt {
                    config = config.with_system_prompt(prompt);
                }
                self.hatch(colony, config).await
            }
            ClientMessage::Buzz {
                colony,
                drone_id,
                prompt,
            } => self.buzz(colony, drone_id, prompt).await,
            ClientMessage::Interrupt { colony, drone_id } => {
                match self.drone(colony, &drone_id).await {
                    Ok((_, drone)) => {
                        drone.interrupt().await;
                        ServerMessage::ack("interrupt", drone_id)
                    }
                    Err(reply) => reply,
                }
            }
            ClientMessage::Retire { colony, drone_id } => {
                let (name, colony) = match self.colony(colony).await {
                    Ok(found) => found,
                    Err(reply) => return reply,
                };
                colony.retire(&drone_id).await;
                if let Some(forwarder) = self.watched.remove(&drone_id) {
                    forwarder.abort();
                }
                ServerMessage::DroneRetired {
                    colony: name,
                    drone_id,
                }
            }
            ClientMessage::ListDrones { colony } => match self.colony(colony).await {
                Ok((name, colony)) => ServerMessage::DroneList {
                    colony: name,
                    drones: colony.list_drones().await,
                },
                Err(reply) => reply,
            },
            ClientMessage::GetDrone { colony, drone_id } => {
                match self.drone(colony, &drone_id).await {
                    Ok((name, drone)) => ServerMessage::DroneStatus {
                        colony: name,
                        drone: drone.info(),
                    },
                    Err(reply) => reply,
                }
            }
            ClientMessage::GetMessages {
                colony,
                drone_id,
                limit,
                offset,
            } => match self.drone(colony, &drone_id).await {
                Ok((_, drone)) => ServerMessage::Messages {
                    messages: drone.get_messages(limit, offset),
                    drone_id,
                },
                Err(reply) => reply,
            },
            ClientMessage::ClearMessages { colony, drone_id } => {
                match self.drone(colony, &drone_id).await {
                    Ok((_, drone)) => {
                        drone.clear_messages();
                        ServerMessage::ack("clear_messages", drone_id)
                    }
                    Err(reply) => reply,
                }
            }
        }
    }

    fn authenticate(&mut self, token: &str) -> ServerMessage {
        match &self.token {
            Some(expected) if expected != token => {
                warn!("Authentication failed");
                ServerMessage::error_with_code("Invalid token", ErrorCode::AuthFailed)
            }
            _ => {
                self.authenticated = true;
                info!("Client authenticated");
                ServerMessage::Authenticated
            }
        }
    }

    async fn colony(&self, name: Option<String>) -> Result<(String, Arc<Colony>), ServerMessage> {
        let name = name.unwrap_or_else(|| DEFAULT_DECORATOR.to_string());
        match self.host.get(&name).await {
            Some(colony) => Ok((name, colony)),
            None => Err(ServerMessage::error_with_code(
                format!("Colony not found: {}", name),
                ErrorCode::ColonyNotFound,
            )),
        }
    }

    async fn drone(
        &self,
        colony: Option<String>,
        drone_id: &str,
    ) -> Result<(String, Arc<Drone>), ServerMessage> {
        let (name, colony) = self.colony(colony).await?;
        match colony.recall(drone_id).await {
            Some(drone) => Ok((name, drone)),
            None => Err(ServerMessage::drone_error(
                drone_id,
                format!("Drone not found: {}", drone_id),
                ErrorCode::DroneNotFound,
            )),
        }
    }

    async fn hatch(&mut self, colony: Option<String>, config: DroneConfig) -> ServerMessage {
        let (name, colony) = match self.colony(colony).await {
            Ok(found) => found,
            Err(reply) => return reply,
        };

        match colony.hatch(config).await {
            Ok(drone) => {
                self.watch(&drone);
                ServerMessage::DroneHatched {
                    colony: name,
                    drone: drone.info(),
                }
            }
            Err(e) => ServerMessage::error_with_code(e.to_string(), ErrorCode::HatchFailed),
        }
    }

    /// Start the prompt in the background so the connection stays responsive
    async fn buzz(
        &mut self,
        colony: Option<String>,
        drone_id: DroneId,
        prompt: String,
    ) -> ServerMessage {
        let drone = match self.drone(colony, &drone_id).await {
            Ok((_, drone)) => drone,
            Err(reply) => return reply,
        };

        let status = drone.status();
        if status != DroneStatus::Idle {
            let err = DroneError::Busy { status };
            return ServerMessage::drone_error(drone_id, err.to_string(), ErrorCode::DroneBusy);
        }

        self.watch(&drone);
        let outbound = self.outbound.clone();
        let id = drone_id.clone();
        tokio::spawn(async move {
            if let Err(e) = drone.buzz(&prompt).await {
                let code = match e {
                    DroneError::Busy { .. } => ErrorCode::DroneBusy,
                    DroneError::Retired => ErrorCode::DroneNotFound,
                    _ => ErrorCode::PromptFailed,
                };
                let _ = outbound
                    .send(ServerMessage::drone_error(id, e.to_string(), code))
                    .await;
            }
        });

        ServerMessage::ack("buzz", drone_id)
    }

    /// Stream a drone's notifications to this connection
    fn watch(&mut self, drone: &Arc<Drone>) {
        if let Some(existing) = self.watched.get(drone.id()) {
            if !existing.is_finished() {
                return;
            }
        }

        let mut drone_rx = drone.subscribe();
        let outbound = self.outbound.clone();
        let drone_id = drone.id().to_string();
        let task_id = drone_id.clone();

        let forwarder = tokio::spawn(async move {
            loop {
                match drone_rx.recv().await {
                    Ok(event) => {
                        let message = ServerMessage::DroneEvent {
                            drone_id: task_id.clone(),
                            event,
                        };
                        if outbound.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Drone {} event stream lagged by {} events", task_id, n);
                    }
                }
            }
        });

        self.watched.insert(drone_id, forwarder);
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        for (_, forwarder) in self.watched.drain() {
            forwarder.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colony::DroneEvent;
    use crate::config::ColonyOptions;
    use crate::host::ColonyPlugin;
    use crate::provider::ScriptedProvider;
    use std::time::Duration;

    async fn host() -> Arc<Host> {
        let host = Arc::new(Host::new());
        host.register(ColonyPlugin::new(ColonyOptions::new("test-api-key")))
            .await
            .unwrap();
        host
    }

    fn handler(
        host: Arc<Host>,
        token: Option<&str>,
    ) -> (ConnectionHandler, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (
            ConnectionHandler::new(host, token.map(str::to_string), tx),
            rx,
        )
    }

    async fn hatch(handler: &mut ConnectionHandler) -> DroneId {
        match handler.handle_text(r#"{"type": "hatch", "cwd": "/test"}"#).await {
            ServerMessage::DroneHatched { drone, colony } => {
                assert_eq!(colony, "colony");
                drone.id
            }
            other => panic!("Expected DroneHatched, got {:?}", other),
        }
    }

    async fn next_complete(rx: &mut mpsc::Receiver<ServerMessage>) -> bool {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(ServerMessage::DroneEvent {
                    event: DroneEvent::Complete(complete),
                    ..
                }) = rx.recv().await
                {
                    return complete.success;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_handle_ping_message() {
        let (mut handler, _rx) = handler(host().await, None);
        let response = handler.handle_text(r#"{"type": "ping", "seq": 42}"#).await;
        assert_eq!(response, ServerMessage::Pong { seq: 42 });
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let (mut handler, _rx) = handler(host().await, None);
        let response = handler.handle_text("not json").await;
        assert!(matches!(
            response,
            ServerMessage::Error {
                code: Some(ErrorCode::InvalidMessage),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_welcome_lists_colonies() {
        let (handler, _rx) = handler(host().await, Some("secret"));
        match handler.welcome().await {
            ServerMessage::Welcome {
                auth_required,
                colonies,
                ..
            } => {
                assert!(auth_required);
                assert_eq!(colonies, vec!["colony".to_string()]);
            }
            other => panic!("Expected Welcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_required_before_requests() {
        let (mut handler, _rx) = handler(host().await, Some("secret"));

        let response = handler.handle_text(r#"{"type": "list_drones"}"#).await;
        assert!(matches!(
            response,
            ServerMessage::Error {
                code: Some(ErrorCode::AuthRequired),
                ..
            }
        ));

        // ping is always allowed
        let response = handler.handle_text(r#"{"type": "ping", "seq": 1}"#).await;
        assert_eq!(response, ServerMessage::Pong { seq: 1 });

        let response = handler
            .handle_text(r#"{"type": "authenticate", "token": "wrong"}"#)
            .await;
        assert!(matches!(
            response,
            ServerMessage::Error {
                code: Some(ErrorCode::AuthFailed),
                ..
            }
        ));
        assert!(handler.auth_required());

        let response = handler
            .handle_text(r#"{"type": "authenticate", "token": "secret"}"#)
            .await;
        assert_eq!(response, ServerMessage::Authenticated);

        let response = handler.handle_text(r#"{"type": "list_drones"}"#).await;
        assert!(matches!(response, ServerMessage::DroneList { .. }));
    }

    #[tokio::test]
    async fn test_hatch_and_list() {
        let (mut handler, _rx) = handler(host().await, None);
        let id = hatch(&mut handler).await;

        match handler.handle_text(r#"{"type": "list_drones"}"#).await {
            ServerMessage::DroneList { drones, .. } => {
                assert_eq!(drones.len(), 1);
                assert_eq!(drones[0].id, id);
                assert_eq!(drones[0].status, DroneStatus::Idle);
            }
            other => panic!("Expected DroneList, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hatch_unknown_colony() {
        let (mut handler, _rx) = handler(host().await, None);
        let response = handler
            .handle_text(r#"{"type": "hatch", "colony": "missing", "cwd": "/test"}"#)
            .await;
        assert!(matches!(
            response,
            ServerMessage::Error {
                code: Some(ErrorCode::ColonyNotFound),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_buzz_streams_events_and_records_message() {
        let (mut handler, mut rx) = handler(host().await, None);
        let id = hatch(&mut handler).await;

        let response = handler.handle_message(ClientMessage::buzz(&id, "Hello")).await;
        assert_eq!(response, ServerMessage::ack("buzz", id.clone()));
        assert!(next_complete(&mut rx).await);

        let response = handler
            .handle_message(ClientMessage::GetMessages {
                colony: None,
                drone_id: id.clone(),
                limit: Some(10),
                offset: None,
            })
            .await;
        match response {
            ServerMessage::Messages { messages, drone_id } => {
                assert_eq!(drone_id, id);
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].content, "Received prompt: Hello");
            }
            other => panic!("Expected Messages, got {:?}", other),
        }

        let response = handler
            .handle_message(ClientMessage::ClearMessages {
                colony: None,
                drone_id: id.clone(),
            })
            .await;
        assert_eq!(response, ServerMessage::ack("clear_messages", id.clone()));
        let host_drone = handler.drone(None, &id).await.unwrap().1;
        assert!(host_drone.messages().is_empty());
    }

    #[tokio::test]
    async fn test_slow_reader_applies_backpressure() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut handler = ConnectionHandler::new(host().await, None, tx);
        let id = hatch(&mut handler).await;

        handler.handle_message(ClientMessage::buzz(&id, "Hello")).await;
        let drone = handler.drone(None, &id).await.unwrap().1;
        tokio::time::timeout(Duration::from_secs(1), async {
            while drone.message_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the forwarder waits on the full queue instead of buffering
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerMessage::DroneEvent {
                event: DroneEvent::Status {
                    status: DroneStatus::Thinking
                },
                ..
            })
        ));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));

        // nothing was dropped while the reader was stalled
        let mut kinds = vec!["status"];
        loop {
            let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match message {
                ServerMessage::DroneEvent { event, .. } => match event {
                    DroneEvent::Status { .. } => kinds.push("status"),
                    DroneEvent::Message(_) => kinds.push("message"),
                    DroneEvent::Complete(_) => {
                        kinds.push("complete");
                        break;
                    }
                    _ => {}
                },
                other => panic!("Unexpected {:?}", other),
            }
        }
        assert_eq!(kinds, vec!["status", "message", "status", "complete"]);
    }

    #[tokio::test]
    async fn test_buzz_busy_and_interrupt() {
        let host = Arc::new(Host::new());
        host.register(
            ColonyPlugin::new(ColonyOptions::new("test-api-key")).with_provider(Arc::new(
                ScriptedProvider::new().with_delay(Duration::from_secs(10)),
            )),
        )
        .await
        .unwrap();
        let (mut handler, mut rx) = handler(host, None);
        let id = hatch(&mut handler).await;

        let response = handler.handle_message(ClientMessage::buzz(&id, "slow")).await;
        assert_eq!(response, ServerMessage::ack("buzz", id.clone()));

        // wait until the drone reports thinking
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(ServerMessage::DroneEvent {
                    event: DroneEvent::Status {
                        status: DroneStatus::Thinking,
                    },
                    ..
                }) = rx.recv().await
                {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let response = handler.handle_message(ClientMessage::buzz(&id, "again")).await;
        assert!(matches!(
            response,
            ServerMessage::Error {
                code: Some(ErrorCode::DroneBusy),
                ..
            }
        ));

        let response = handler.handle_message(ClientMessage::interrupt(&id)).await;
        assert_eq!(response, ServerMessage::ack("interrupt", id.clone()));
        assert!(!next_complete(&mut rx).await);

        match handler
            .handle_message(ClientMessage::GetDrone {
                colony: None,
                drone_id: id.clone(),
            })
            .await
        {
            ServerMessage::DroneStatus { drone, .. } => assert_eq!(drone.status, DroneStatus::Idle),
            other => panic!("Expected DroneStatus, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retire_and_unknown_drone() {
        let (mut handler, _rx) = handler(host().await, None);
        let id = hatch(&mut handler).await;

        let response = handler.handle_message(ClientMessage::retire(&id)).await;
        assert_eq!(
            response,
            ServerMessage::DroneRetired {
                colony: "colony".to_string(),
                drone_id: id.clone(),
            }
        );

        let response = handler
            .handle_message(ClientMessage::GetDrone {
                colony: None,
                drone_id: id.clone(),
            })
            .await;
        assert!(matches!(
            response,
            ServerMessage::Error {
                code: Some(ErrorCode::DroneNotFound),
                drone_id: Some(_),
                ..
            }
        ));

        // retiring again is still acknowledged
        let response = handler.handle_message(ClientMessage::retire(&id)).await;
        assert!(matches!(response, ServerMessage::DroneRetired { .. }));
    }
}
