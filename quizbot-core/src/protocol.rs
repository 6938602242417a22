// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Bayeux client state machine. It performs no I/O: callers feed inbound
//! batches and write out whatever batches it returns.

use chrono::Utc;
use quizbot_common::{
    BAYEUX_VERSION, META_CONNECT, META_DISCONNECT, META_HANDSHAKE, META_SUBSCRIBE, MessageId,
    ProtocolMessage, SERVICE_CHANNELS, SERVICE_CONTROLLER,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Idle,
    Handshaking,
    Connecting,
    Subscribed,
    Active,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub name: String,
    pub pin: String,
    pub host: String,
    pub challenge_token: Option<String>,
    /// Send one `/meta/connect` and wait for its ack before subscribing.
    pub initial_connect: bool,
}

impl ProtocolConfig {
    pub fn new(name: impl Into<String>, pin: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pin: pin.into(),
            host: "kahoot.it".to_string(),
            challenge_token: None,
            initial_connect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolNotice {
    HandshakeAccepted { client_id: String },
    Subscribed { channel: String },
    LoginSent,
    Activated,
}

/// Output of one inbound batch: batches to write (in order), application
/// messages for the interpreter, and transitions worth reporting.
#[derive(Debug, Default)]
pub struct Step {
    pub outbound: Vec<Vec<ProtocolMessage>>,
    pub events: Vec<ProtocolMessage>,
    pub notices: Vec<ProtocolNotice>,
}

pub struct ProtocolClient {
    config: ProtocolConfig,
    state: ProtocolState,
    client_id: Option<String>,
    next_id: u64,
    server_ack: Option<i64>,
    subscriptions_sent: bool,
    pending_subscriptions: Vec<String>,
}

impl ProtocolClient {
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            config,
            state: ProtocolState::Idle,
            client_id: None,
            next_id: 1,
            server_ack: None,
            subscriptions_sent: false,
            pending_subscriptions: Vec::new(),
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn server_ack(&self) -> Option<i64> {
        self.server_ack
    }

    fn message(&mut self, channel: &str) -> ProtocolMessage {
        let mut message = ProtocolMessage::new(channel);
        message.id = Some(MessageId::Text(self.next_id.to_string()));
        self.next_id += 1;
        message.client_id = self.client_id.clone();
        message
    }

    /// Starts a fresh logical session and returns the handshake batch.
    pub fn open(&mut self) -> Vec<ProtocolMessage> {
        self.client_id = None;
        self.server_ack = None;
        self.subscriptions_sent = false;
        self.pending_subscriptions.clear();
        self.state = ProtocolState::Handshaking;

        let mut handshake = self.message(META_HANDSHAKE);
        handshake.version = Some(BAYEUX_VERSION.to_string());
        handshake.minimum_version = Some(BAYEUX_VERSION.to_string());
        handshake.supported_connection_types =
            Some(vec!["websocket".to_string(), "long-polling".to_string()]);
        handshake.advice = Some(json!({"timeout": 60000, "interval": 0}));
        let mut ext = json!({
            "ack": true,
            "timesync": {"tc": Utc::now().timestamp_millis(), "l": 0, "o": 0},
        });
        if let Some(token) = &self.config.challenge_token {
            ext["challenge"] = json!(token);
        }
        handshake.ext = Some(ext);
        vec![handshake]
    }

    fn connect_batch(&mut self) -> Vec<ProtocolMessage> {
        let ack = self.server_ack.unwrap_or(0);
        let mut connect = self.message(META_CONNECT);
        connect.connection_type = Some("websocket".to_string());
        connect.ext = Some(json!({
            "ack": ack,
            "timesync": {"tc": Utc::now().timestamp_millis(), "l": 0, "o": 0},
        }));
        vec![connect]
    }

    fn subscribe_batch(&mut self) -> Vec<ProtocolMessage> {
        self.subscriptions_sent = true;
        self.pending_subscriptions = SERVICE_CHANNELS.iter().map(|c| c.to_string()).collect();
        SERVICE_CHANNELS
            .iter()
            .map(|channel| {
                let mut subscribe = self.message(META_SUBSCRIBE);
                subscribe.subscription = Some(channel.to_string());
                subscribe
            })
            .collect()
    }

    fn login_batch(&mut self) -> Vec<ProtocolMessage> {
        let mut login = self.message(SERVICE_CONTROLLER);
        login.data = Some(json!({
            "type": "login",
            "gameid": self.config.pin,
            "host": self.config.host,
            "name": self.config.name,
        }));
        vec![login]
    }

    pub fn on_batch(&mut self, batch: Vec<ProtocolMessage>) -> Result<Step, ProtocolError> {
        let mut step = Step::default();
        for message in batch {
            if self.state == ProtocolState::Closed {
                break;
            }
            self.dispatch(message, &mut step)?;
        }
        Ok(step)
    }

    fn dispatch(&mut self, message: ProtocolMessage, step: &mut Step) -> Result<(), ProtocolError> {
        match message.channel.as_str() {
            META_HANDSHAKE => self.on_handshake(message, step),
            META_CONNECT => self.on_connect(message, step),
            META_SUBSCRIBE => self.on_subscribe(message, step),
            META_DISCONNECT => {
                self.close();
                Err(ProtocolError::Disconnected)
            }
            channel if message.is_meta() => {
                debug!(channel = %channel, "ignoring unknown meta reply");
                Ok(())
            }
            _ => {
                if let Some(error) = message.error.as_deref() {
                    warn!(channel = %message.channel, error = %error, "server reported an error");
                }
                if self.state == ProtocolState::Subscribed {
                    self.state = ProtocolState::Active;
                    step.notices.push(ProtocolNotice::Activated);
                }
                step.events.push(message);
                Ok(())
            }
        }
    }

    fn on_handshake(&mut self, message: ProtocolMessage, step: &mut Step) -> Result<(), ProtocolError> {
        if self.state != ProtocolState::Handshaking {
            debug!(state = ?self.state, "ignoring late handshake reply");
            return Ok(());
        }
        if !message.succeeded() {
            self.state = ProtocolState::Closed;
            return Err(ProtocolError::HandshakeRejected(
                message.error.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        let client_id = message
            .client_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                self.state = ProtocolState::Closed;
                ProtocolError::HandshakeRejected("reply carried no clientId".to_string())
            })?;

        self.client_id = Some(client_id.clone());
        self.state = ProtocolState::Connecting;
        step.notices.push(ProtocolNotice::HandshakeAccepted { client_id });

        if self.config.initial_connect {
            let connect = self.connect_batch();
            step.outbound.push(connect);
        } else {
            let subscribe = self.subscribe_batch();
            step.outbound.push(subscribe);
            let connect = self.connect_batch();
            step.outbound.push(connect);
        }
        Ok(())
    }

    fn on_connect(&mut self, message: ProtocolMessage, step: &mut Step) -> Result<(), ProtocolError> {
        if matches!(self.state, ProtocolState::Idle | ProtocolState::Handshaking) {
            return Ok(());
        }
        if !message.succeeded() {
            let reason = message
                .error
                .clone()
                .or_else(|| message.reconnect_advice().map(|advice| format!("advice {advice}")))
                .unwrap_or_else(|| "no reason given".to_string());
            self.close();
            return Err(ProtocolError::ConnectRejected(reason));
        }

        if let Some(ack) = message.ext_ack() {
            self.server_ack = Some(self.server_ack.map_or(ack, |last| last.max(ack)));
        }
        if !self.subscriptions_sent {
            let subscribe = self.subscribe_batch();
            step.outbound.push(subscribe);
        }
        let connect = self.connect_batch();
        step.outbound.push(connect);
        Ok(())
    }

    fn on_subscribe(&mut self, message: ProtocolMessage, step: &mut Step) -> Result<(), ProtocolError> {
        let channel = message.subscription.clone().unwrap_or_default();
        if !message.succeeded() {
            self.close();
            return Err(ProtocolError::SubscribeRejected {
                channel,
                reason: message.error.unwrap_or_else(|| "no reason given".to_string()),
            });
        }

        let before = self.pending_subscriptions.len();
        self.pending_subscriptions.retain(|pending| *pending != channel);
        if self.pending_subscriptions.len() == before {
            return Ok(());
        }
        step.notices.push(ProtocolNotice::Subscribed { channel });

        if self.pending_subscriptions.is_empty() && self.state == ProtocolState::Connecting {
            let login = self.login_batch();
            step.outbound.push(login);
            self.state = ProtocolState::Subscribed;
            step.notices.push(ProtocolNotice::LoginSent);
        }
        Ok(())
    }

    /// Answer publish for the open question. Only allowed once the session
    /// is live; otherwise nothing is produced.
    pub fn publish_answer(&mut self, choice: usize, lag: u64) -> Result<Vec<ProtocolMessage>, ProtocolError> {
        if self.state != ProtocolState::Active {
            return Err(ProtocolError::NotActive(self.state));
        }
        let mut answer = self.message(SERVICE_CONTROLLER);
        answer.data = Some(json!({
            "type": "answer",
            "choice": choice,
            "meta": {"lag": lag},
        }));
        Ok(vec![answer])
    }

    /// Farewell batch: a controller `leave` followed by `/meta/disconnect`.
    /// Empty when there is no live client id to say goodbye with.
    pub fn leave_batch(&mut self) -> Vec<ProtocolMessage> {
        if self.client_id.is_none() || self.state == ProtocolState::Closed {
            return Vec::new();
        }
        let mut leave = self.message(SERVICE_CONTROLLER);
        leave.data = Some(json!({"type": "leave"}));
        let disconnect = self.message(META_DISCONNECT);
        vec![leave, disconnect]
    }

    pub fn close(&mut self) {
        self.state = ProtocolState::Closed;
        self.client_id = None;
        self.pending_subscriptions.clear();
    }
}
