//! Home Assistant websocket API client.
//!
//! Only the handful of messages the listener needs are implemented:
//! the auth handshake, `get_states` and `subscribe_entities`.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace};

use crate::config::HubConfig;
use crate::error::{Error, Result};
use crate::events::{EntityEvent, EntityState};
use crate::platform::hub::{HubConnector, HubSession};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WEBSOCKET_PATH: &str = "/api/websocket";

#[derive(Clone)]
pub struct HassConnector {
    url: String,
    token: String,
    connect_timeout: Duration,
}

impl std::fmt::Debug for HassConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HassConnector")
            .field("url", &self.url)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl HassConnector {
    pub fn new(cfg: &HubConfig) -> Self {
        let url = websocket_url(&cfg.url);
        if url.starts_with("wss://") {
            install_crypto_provider();
        }
        Self {
            url,
            token: cfg.token.clone().unwrap_or_default(),
            connect_timeout: cfg.connect_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn open(&self) -> Result<HassSession> {
        let (socket, response) = connect_async(self.url.as_str()).await?;
        debug!(url = %self.url, status = %response.status(), "websocket connected");
        let mut session = HassSession {
            socket,
            next_id: 0,
            subscription: None,
        };
        session.authenticate(&self.token).await?;
        Ok(session)
    }
}

#[async_trait]
impl HubConnector for HassConnector {
    async fn connect(&self) -> Result<Box<dyn HubSession>> {
        match tokio::time::timeout(self.connect_timeout, self.open()).await {
            Ok(session) => Ok(Box::new(session?)),
            Err(_) => Err(Error::Transport(format!(
                "connect/auth did not finish within {}",
                humantime::format_duration(self.connect_timeout)
            ))),
        }
    }
}

pub struct HassSession {
    socket: Socket,
    next_id: u64,
    subscription: Option<u64>,
}

impl HassSession {
    async fn authenticate(&mut self, token: &str) -> Result<()> {
        let hello = self.expect_message().await?;
        if message_type(&hello) != Some("auth_required") {
            return Err(Error::Transport(format!(
                "unexpected handshake message: {hello}"
            )));
        }

        self.send_json(json!({ "type": "auth", "access_token": token }))
            .await?;

        let reply = self.expect_message().await?;
        match message_type(&reply) {
            Some("auth_ok") => {
                let ha_version = reply.get("ha_version").and_then(|v| v.as_str());
                info!(ha_version, "authenticated with hub");
                Ok(())
            }
            Some("auth_invalid") => Err(Error::AuthRejected(
                reply
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("invalid access token")
                    .to_string(),
            )),
            _ => Err(Error::Transport(format!(
                "unexpected auth reply: {reply}"
            ))),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Send a command and wait for its `result`, skipping unrelated traffic.
    async fn command(&mut self, id: u64, command: &str, mut payload: Value) -> Result<Value> {
        payload["id"] = json!(id);
        payload["type"] = json!(command);
        self.send_json(payload).await?;

        loop {
            let message = self.expect_message().await?;
            if message_id(&message) != Some(id) || message_type(&message) != Some("result") {
                debug!(id, command, "skipping unrelated hub message");
                continue;
            }
            if message.get("success").and_then(Value::as_bool) == Some(true) {
                return Ok(message.get("result").cloned().unwrap_or(Value::Null));
            }
            let reason = message
                .get("error")
                .map(Value::to_string)
                .unwrap_or_else(|| "no error detail".to_string());
            return Err(Error::Command {
                command: command.to_string(),
                message: reason,
            });
        }
    }

    async fn send_json(&mut self, value: Value) -> Result<()> {
        trace!(%value, "hub <-");
        self.socket.send(Message::Text(value.to_string())).await?;
        Ok(())
    }

    /// Next JSON message, `None` once the socket is closed.
    async fn recv_json(&mut self) -> Result<Option<Value>> {
        while let Some(frame) = self.socket.next().await {
            let value: Value = match frame? {
                Message::Text(text) => serde_json::from_str(&text)?,
                Message::Binary(bytes) => serde_json::from_slice(&bytes)?,
                Message::Close(frame) => {
                    debug!(?frame, "hub closed websocket");
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            trace!(%value, "hub ->");
            return Ok(Some(value));
        }
        Ok(None)
    }

    async fn expect_message(&mut self) -> Result<Value> {
        self.recv_json()
            .await?
            .ok_or_else(|| Error::Transport("hub closed the connection".to_string()))
    }
}

#[async_trait]
impl HubSession for HassSession {
    async fn get_states(&mut self) -> Result<Vec<EntityState>> {
        let id = self.allocate_id();
        let result = self.command(id, "get_states", json!({})).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn subscribe_entities(&mut self, entity_ids: &[String]) -> Result<()> {
        let id = self.allocate_id();
        self.command(id, "subscribe_entities", json!({ "entity_ids": entity_ids }))
            .await?;
        self.subscription = Some(id);
        debug!(id, ?entity_ids, "subscribed to entities");
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<EntityEvent>> {
        let Some(subscription) = self.subscription else {
            return Err(Error::Transport(
                "next_event called before subscribe_entities".to_string(),
            ));
        };
        while let Some(message) = self.recv_json().await? {
            if message_type(&message) == Some("event") && message_id(&message) == Some(subscription) {
                if let Some(payload) = message.get("event") {
                    return Ok(Some(EntityEvent::from_value(payload)));
                }
            }
            trace!("ignoring hub message outside the subscription");
        }
        Ok(None)
    }
}

/// `wss://` hubs go through rustls; pin its process-wide provider to ring.
fn install_crypto_provider() {
    // Already installed is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn message_type(message: &Value) -> Option<&str> {
    message.get("type").and_then(Value::as_str)
}

fn message_id(message: &Value) -> Option<u64> {
    message.get("id").and_then(Value::as_u64)
}

/// Turn the configured hub address into its websocket API endpoint.
///
/// `http` becomes `ws`, `https` becomes `wss`, a bare host gets `ws://`.
pub fn websocket_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };
    if base.ends_with(WEBSOCKET_PATH) {
        base
    } else {
        format!("{base}{WEBSOCKET_PATH}")
    }
}
