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

//! The single interface every way of driving a game session implements.
//! A driver is chosen once, when the bot is created.

use async_trait::async_trait;

use crate::{
    error::{BotError, TransportError},
    events::BotEmitter,
    interpreter::GameEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Wire,
    Visual,
}

impl DriverKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wire => "wire",
            Self::Visual => "visual",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverSpec {
    pub bot_id: String,
    pub name: String,
    pub pin: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Established {
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Game(GameEvent),
    Closed(TransportError),
}

#[async_trait]
pub trait SessionDriver: Send {
    fn kind(&self) -> DriverKind;

    /// Acquires a fresh session and returns once it is live. Called again by
    /// the supervisor for every reconnect.
    async fn establish(&mut self) -> Result<Established, BotError>;

    /// Next game event or the loss of the session. Must be cancel-safe.
    async fn next_event(&mut self) -> DriverEvent;

    async fn submit_answer(&mut self, choice: usize, lag: u64) -> Result<(), BotError>;

    /// Cheap liveness probe for the watchdog.
    fn is_alive(&self) -> bool;

    /// Deliberate shutdown: says goodbye when possible, then releases the
    /// underlying resource.
    async fn shutdown(&mut self);
}

pub trait DriverFactory: Send + Sync {
    fn kind(&self) -> DriverKind;

    fn create(&self, spec: &DriverSpec, events: BotEmitter) -> Box<dyn SessionDriver>;
}
