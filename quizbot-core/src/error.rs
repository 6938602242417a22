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

//! Error taxonomy for the bot core.

use thiserror::Error;

use crate::protocol::ProtocolState;

/// Rejections from the restricted offset evaluator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected character {ch:?} at offset {position}")]
    UnexpectedChar { ch: char, position: usize },
    #[error("identifier {name:?} at offset {position} is not allowed")]
    Identifier { name: String, position: usize },
    #[error("malformed number {text:?}")]
    BadNumber { text: String },
    #[error("unexpected token at offset {position}")]
    UnexpectedToken { position: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("modulo by zero")]
    ModuloByZero,
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
    #[error("expression result is not finite")]
    NotFinite,
}

/// Decoding failures. The display text always starts with "challenge scheme"
/// so vendor drift is easy to tell apart from network trouble in logs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChallengeError {
    #[error("challenge scheme: empty challenge")]
    Empty,
    #[error("challenge scheme: no encoded message matched any known call shape")]
    MessageNotFound,
    #[error(
        "challenge scheme {scheme}: no plausible token (tried offsets {tried:?}, best candidate {best:?})"
    )]
    Implausible {
        scheme: String,
        tried: Vec<f64>,
        best: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid game pin {0:?}; expected 6-10 digits")]
    InvalidPin(String),
    #[error("session reservation returned HTTP {status}")]
    Http { status: u16 },
    #[error("session reservation body is malformed: {0}")]
    Malformed(String),
    #[error("session reservation request failed: {0}")]
    Transport(String),
    #[error("session reservation carried no session identifier")]
    MissingIdentifier,
}

impl SessionError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("subscription to {channel} rejected: {reason}")]
    SubscribeRejected { channel: String, reason: String },
    #[error("connect rejected: {0}")]
    ConnectRejected(String),
    #[error("server ended the session")]
    Disconnected,
    #[error("answer not permitted in protocol state {0:?}")]
    NotActive(ProtocolState),
    #[error("failed to encode batch: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("socket connect failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("session not established within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("socket closed during handshake: {0}")]
    Closed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("socket closed: {0}")]
    Closed(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("transport stopped responding")]
    Unresponsive,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum BotError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Session(SessionError),
    #[error(transparent)]
    Challenge(#[from] ChallengeError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("capacity: {0}")]
    Capacity(String),
    #[error("bot {0} not found")]
    NotFound(String),
    #[error("answer rejected: {0}")]
    NotActive(String),
    #[error("bot {0} was stopped before its session was established")]
    Cancelled(String),
}

impl From<SessionError> for BotError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::InvalidPin(_) => Self::InvalidInput(error.to_string()),
            other => Self::Session(other),
        }
    }
}

impl BotError {
    /// Whether another connection attempt may succeed where this one failed.
    /// A changed challenge scheme or a reservation without any identifier
    /// will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Session(SessionError::MissingIdentifier) => false,
            Self::Session(_) | Self::Handshake(_) | Self::Transport(_) => true,
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Session(_) => "session",
            Self::Challenge(_) => "challenge",
            Self::Handshake(_) => "handshake",
            Self::Transport(_) => "transport",
            Self::Capacity(_) => "capacity",
            Self::NotFound(_) => "not_found",
            Self::NotActive(_) => "not_active",
            Self::Cancelled(_) => "cancelled",
        }
    }
}
