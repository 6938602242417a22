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

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::interpreter::RandomDelayPolicy;

pub const DEFAULT_HTTP_BASE_URL: &str = "https://kahoot.it";

/// Tunables shared by every bot in the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotSettings {
    pub http_base_url: String,
    /// Socket base; derived from `http_base_url` when empty.
    pub ws_base_url: String,
    pub connect_timeout_ms: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub watchdog_interval_ms: u64,
    pub answer_delay_min_ms: u64,
    pub answer_delay_max_ms: u64,
    pub max_bots: usize,
    pub stop_timeout_ms: u64,
    pub event_buffer: usize,
    pub initial_connect: bool,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            http_base_url: DEFAULT_HTTP_BASE_URL.to_string(),
            ws_base_url: String::new(),
            connect_timeout_ms: 15_000,
            reconnect_max_attempts: 3,
            reconnect_base_delay_ms: 2_000,
            reconnect_max_delay_ms: 15_000,
            watchdog_interval_ms: 5_000,
            answer_delay_min_ms: 1_000,
            answer_delay_max_ms: 6_000,
            max_bots: 200,
            stop_timeout_ms: 5_000,
            event_buffer: 1_024,
            initial_connect: true,
        }
    }
}

impl BotSettings {
    pub fn ws_base(&self) -> String {
        if self.ws_base_url.trim().is_empty() {
            derive_ws_base(&self.http_base_url)
        } else {
            self.ws_base_url.trim_end_matches('/').to_string()
        }
    }

    /// Host name sent in the login message.
    pub fn vendor_host(&self) -> String {
        let without_scheme = self
            .http_base_url
            .split_once("://")
            .map_or(self.http_base_url.as_str(), |(_, rest)| rest);
        without_scheme
            .split(['/', ':'])
            .next()
            .unwrap_or_default()
            .to_string()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_max_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    pub fn answer_policy(&self) -> RandomDelayPolicy {
        RandomDelayPolicy {
            min_delay: Duration::from_millis(self.answer_delay_min_ms),
            max_delay: Duration::from_millis(self.answer_delay_max_ms.max(self.answer_delay_min_ms)),
        }
    }
}

pub fn derive_ws_base(http_base_url: &str) -> String {
    let trimmed = http_base_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("wss://{trimmed}")
    }
}

/// Linear backoff capped at `max_delay`, bounded by `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }
}
