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

use std::sync::Arc;

use chrono::Utc;
use quizbot_common::{BotEvent, BotEventKind, Severity};
use tokio::sync::broadcast;

/// Fan-out of bot transitions. Emitting never blocks and never fails; with no
/// subscribers the event is simply dropped.
#[derive(Clone)]
pub struct EventSink {
    sender: broadcast::Sender<BotEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: BotEvent) {
        let _ = self.sender.send(event);
    }

    pub fn for_bot(&self, bot_id: &str) -> BotEmitter {
        BotEmitter {
            sink: self.clone(),
            bot_id: Arc::from(bot_id),
        }
    }
}

#[derive(Clone)]
pub struct BotEmitter {
    sink: EventSink,
    bot_id: Arc<str>,
}

impl BotEmitter {
    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn emit(&self, severity: Severity, kind: BotEventKind, message: impl Into<String>) {
        self.sink.emit(BotEvent {
            bot_id: self.bot_id.to_string(),
            at: Utc::now(),
            severity,
            kind,
            message: message.into(),
        });
    }

    pub fn info(&self, kind: BotEventKind, message: impl Into<String>) {
        self.emit(Severity::Info, kind, message);
    }

    pub fn warn(&self, kind: BotEventKind, message: impl Into<String>) {
        self.emit(Severity::Warn, kind, message);
    }

    pub fn error(&self, kind: BotEventKind, message: impl Into<String>) {
        self.emit(Severity::Error, kind, message);
    }
}
