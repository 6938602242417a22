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

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use quizbot_common::{BotEventKind, ProtocolMessage};
use tracing::{debug, info, warn};

use crate::{
    challenge::ChallengeSolver,
    config::BotSettings,
    driver::{DriverEvent, DriverFactory, DriverKind, DriverSpec, Established, SessionDriver},
    error::{BotError, HandshakeError, ProtocolError, SessionError, TransportError},
    events::BotEmitter,
    interpreter::classify,
    protocol::{ProtocolClient, ProtocolConfig, ProtocolNotice, ProtocolState},
    session::{SessionSource, random_user_agent},
    transport::{ConnectTarget, Connection, Connector},
};

/// Shared pieces every wire driver is built from.
#[derive(Clone)]
pub struct WireDriverFactory {
    sessions: Arc<dyn SessionSource>,
    connector: Arc<dyn Connector>,
    solver: ChallengeSolver,
    ws_base: String,
    host: String,
    connect_timeout: Duration,
    initial_connect: bool,
}

impl WireDriverFactory {
    pub fn new(
        sessions: Arc<dyn SessionSource>,
        connector: Arc<dyn Connector>,
        solver: ChallengeSolver,
        settings: &BotSettings,
    ) -> Self {
        Self {
            sessions,
            connector,
            solver,
            ws_base: settings.ws_base(),
            host: settings.vendor_host(),
            connect_timeout: settings.connect_timeout(),
            initial_connect: settings.initial_connect,
        }
    }
}

impl DriverFactory for WireDriverFactory {
    fn kind(&self) -> DriverKind {
        DriverKind::Wire
    }

    fn create(&self, spec: &DriverSpec, events: BotEmitter) -> Box<dyn SessionDriver> {
        Box::new(WireDriver {
            factory: self.clone(),
            spec: spec.clone(),
            events,
            protocol: None,
            connection: None,
            pending: VecDeque::new(),
        })
    }
}

/// Drives one bot over the Bayeux socket.
pub struct WireDriver {
    factory: WireDriverFactory,
    spec: DriverSpec,
    events: BotEmitter,
    protocol: Option<ProtocolClient>,
    connection: Option<Connection>,
    pending: VecDeque<DriverEvent>,
}

impl WireDriver {
    fn report_notices(&self, notices: &[ProtocolNotice]) {
        for notice in notices {
            match notice {
                ProtocolNotice::HandshakeAccepted { client_id } => self.events.info(
                    BotEventKind::HandshakeOk {
                        client_id: client_id.clone(),
                    },
                    format!("handshake accepted, clientId {client_id}"),
                ),
                ProtocolNotice::Subscribed { channel } => self.events.info(
                    BotEventKind::SubscribeOk {
                        channel: channel.clone(),
                    },
                    format!("subscribed to {channel}"),
                ),
                ProtocolNotice::LoginSent => self.events.info(
                    BotEventKind::LoginSent,
                    format!("login sent as {}", self.spec.name),
                ),
                ProtocolNotice::Activated => {
                    debug!(bot_id = %self.spec.bot_id, "first application event received");
                }
            }
        }
    }

    fn report_protocol_failure(&self, error: &ProtocolError) {
        match error {
            ProtocolError::SubscribeRejected { channel, .. } => self.events.error(
                BotEventKind::SubscribeFailed {
                    channel: channel.clone(),
                },
                error.to_string(),
            ),
            _ => self
                .events
                .error(BotEventKind::HandshakeFailed, error.to_string()),
        }
    }

    fn send(&self, batches: &[Vec<ProtocolMessage>]) -> Result<(), TransportError> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| TransportError::Closed("not connected".to_string()))?;
        for batch in batches {
            connection.send_batch(batch)?;
        }
        Ok(())
    }

    fn queue_events(&mut self, messages: Vec<ProtocolMessage>) {
        self.pending
            .extend(messages.iter().map(|message| DriverEvent::Game(classify(message))));
    }

    /// Opens the socket and runs the protocol until the first application
    /// event arrives.
    async fn connect(
        &mut self,
        target: &ConnectTarget,
        mut protocol: ProtocolClient,
    ) -> Result<String, HandshakeError> {
        let connection = self.factory.connector.connect(target).await?;
        self.connection = Some(connection);
        let opening = protocol.open();
        self.send(&[opening])
            .map_err(|error| HandshakeError::Closed(error.to_string()))?;

        loop {
            let Some(connection) = self.connection.as_mut() else {
                return Err(HandshakeError::Closed("not connected".to_string()));
            };
            let batch = connection
                .recv_batch()
                .await
                .map_err(|error| HandshakeError::Closed(error.to_string()))?;
            let step = match protocol.on_batch(batch) {
                Ok(step) => step,
                Err(error) => {
                    self.report_protocol_failure(&error);
                    return Err(HandshakeError::Protocol(error));
                }
            };
            self.report_notices(&step.notices);
            self.send(&step.outbound)
                .map_err(|error| HandshakeError::Closed(error.to_string()))?;
            self.queue_events(step.events);

            if protocol.state() == ProtocolState::Active {
                let client_id = protocol.client_id().unwrap_or_default().to_string();
                self.protocol = Some(protocol);
                return Ok(client_id);
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(protocol) = self.protocol.as_mut() {
            protocol.close();
        }
        self.connection = None;
    }
}

#[async_trait]
impl SessionDriver for WireDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Wire
    }

    async fn establish(&mut self) -> Result<Established, BotError> {
        self.teardown();
        self.protocol = None;
        self.pending.clear();

        let session = self.factory.sessions.resolve(&self.spec.pin).await?;
        self.events.info(
            BotEventKind::SessionResolved,
            format!(
                "session reserved (token: {}, game id: {}, challenge: {})",
                session.session_token.is_some(),
                session.game_id.is_some(),
                session.challenge.is_some()
            ),
        );
        let connection_id = session
            .connection_id()
            .ok_or(SessionError::MissingIdentifier)?
            .to_string();

        let challenge_token = match session.challenge.as_deref() {
            Some(raw) => match self.factory.solver.solve_detailed(raw) {
                Ok(solved) => {
                    self.events.info(
                        BotEventKind::ChallengeSolved {
                            scheme: solved.scheme.clone(),
                        },
                        format!("challenge decoded with offset {}", solved.offset),
                    );
                    Some(solved.token)
                }
                Err(error) => {
                    warn!(
                        bot_id = %self.spec.bot_id,
                        error = %error,
                        challenge_len = raw.len(),
                        "challenge decoding failed"
                    );
                    self.events
                        .error(BotEventKind::ChallengeFailed, error.to_string());
                    return Err(error.into());
                }
            },
            None => None,
        };

        let target = ConnectTarget {
            url: ConnectTarget::for_session(
                &self.factory.ws_base,
                &self.spec.pin,
                &connection_id,
                Utc::now().timestamp_millis(),
            ),
            origin: "https://kahoot.it".to_string(),
            user_agent: random_user_agent().to_string(),
            cookie_header: session.cookie_header(),
        };
        let mut config = ProtocolConfig::new(self.spec.name.clone(), self.spec.pin.clone());
        config.host = self.factory.host.clone();
        config.challenge_token = challenge_token;
        config.initial_connect = self.factory.initial_connect;
        let protocol = ProtocolClient::new(config);

        let timeout = self.factory.connect_timeout;
        let outcome = match tokio::time::timeout(timeout, self.connect(&target, protocol)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(HandshakeError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(client_id) => {
                info!(bot_id = %self.spec.bot_id, client_id = %client_id, "wire session established");
                Ok(Established {
                    client_id: Some(client_id).filter(|id| !id.is_empty()),
                })
            }
            Err(error) => {
                if !matches!(error, HandshakeError::Protocol(_)) {
                    self.events
                        .error(BotEventKind::HandshakeFailed, error.to_string());
                }
                self.teardown();
                Err(error.into())
            }
        }
    }

    async fn next_event(&mut self) -> DriverEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            let Some(connection) = self.connection.as_mut() else {
                return DriverEvent::Closed(TransportError::Closed("not connected".to_string()));
            };
            let batch = match connection.recv_batch().await {
                Ok(batch) => batch,
                Err(error) => {
                    self.teardown();
                    return DriverEvent::Closed(error);
                }
            };
            let Some(protocol) = self.protocol.as_mut() else {
                return DriverEvent::Closed(TransportError::Closed("no protocol session".to_string()));
            };
            match protocol.on_batch(batch) {
                Ok(step) => {
                    if let Err(error) = self.send(&step.outbound) {
                        self.teardown();
                        return DriverEvent::Closed(error);
                    }
                    self.queue_events(step.events);
                }
                Err(error) => {
                    self.teardown();
                    return DriverEvent::Closed(TransportError::Protocol(error));
                }
            }
        }
    }

    async fn submit_answer(&mut self, choice: usize, lag: u64) -> Result<(), BotError> {
        let protocol = self
            .protocol
            .as_mut()
            .ok_or_else(|| BotError::NotActive("no protocol session".to_string()))?;
        let batch = protocol.publish_answer(choice, lag).map_err(|error| match error {
            ProtocolError::NotActive(state) => {
                BotError::NotActive(format!("protocol state is {state:?}"))
            }
            other => BotError::Transport(TransportError::Protocol(other)),
        })?;
        self.send(&[batch])?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_open)
            && self
                .protocol
                .as_ref()
                .is_some_and(|protocol| protocol.state() != ProtocolState::Closed)
    }

    async fn shutdown(&mut self) {
        if let Some(protocol) = self.protocol.as_mut() {
            let farewell = protocol.leave_batch();
            if !farewell.is_empty() {
                if let Some(connection) = self.connection.as_ref() {
                    if connection.send_batch(&farewell).is_ok() {
                        debug!(bot_id = %self.spec.bot_id, "leave and disconnect sent");
                    }
                }
            }
        }
        self.teardown();
    }
}
