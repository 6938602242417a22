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

use std::{fmt, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const BAYEUX_VERSION: &str = "1.0";

pub const META_HANDSHAKE: &str = "/meta/handshake";
pub const META_CONNECT: &str = "/meta/connect";
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
pub const META_DISCONNECT: &str = "/meta/disconnect";

pub const SERVICE_PLAYER: &str = "/service/player";
pub const SERVICE_STATUS: &str = "/service/status";
pub const SERVICE_CONTROLLER: &str = "/service/controller";

/// Service channels the game pushes to, in subscription order.
pub const SERVICE_CHANNELS: [&str; 3] = [SERVICE_PLAYER, SERVICE_STATUS, SERVICE_CONTROLLER];

pub const MAX_NAME_CHARS: usize = 15;

static PIN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{6,10}$").expect("pin pattern is a valid regex"));

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is a valid regex")
});

/// A game PIN is 6 to 10 ASCII digits.
pub fn is_valid_pin(pin: &str) -> bool {
    PIN_PATTERN.is_match(pin)
}

/// Returns the trimmed display name when it is usable for a login.
pub fn normalize_display_name(name: &str) -> Option<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_NAME_CHARS {
        return None;
    }
    Some(trimmed)
}

/// Correlation id of an envelope. Servers echo whatever the client sent, and
/// some send their own numeric ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(u64),
    Text(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

/// One Bayeux envelope. Batches on the wire are JSON arrays of these and the
/// order inside a batch is significant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Value>,
}

impl ProtocolMessage {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    pub fn is_meta(&self) -> bool {
        self.channel.starts_with("/meta/")
    }

    pub fn succeeded(&self) -> bool {
        self.successful == Some(true)
    }

    /// Server-side acknowledgement counter carried in `ext.ack`.
    pub fn ext_ack(&self) -> Option<i64> {
        self.ext.as_ref()?.get("ack")?.as_i64()
    }

    /// `data.type` of an application message.
    pub fn data_type(&self) -> Option<&str> {
        self.data.as_ref()?.get("type")?.as_str()
    }

    /// `advice.reconnect` as sent by the server on meta replies.
    pub fn reconnect_advice(&self) -> Option<&str> {
        self.advice.as_ref()?.get("reconnect")?.as_str()
    }
}

pub fn encode_batch(batch: &[ProtocolMessage]) -> serde_json::Result<String> {
    serde_json::to_string(batch)
}

/// Parses one inbound frame. Servers normally send arrays but a bare object is
/// accepted as a batch of one.
pub fn decode_batch(raw: &str) -> serde_json::Result<Vec<ProtocolMessage>> {
    let value: Value = serde_json::from_str(raw)?;
    match value {
        Value::Array(_) => serde_json::from_value(value),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotState {
    Created,
    Connecting,
    Active,
    Reconnecting,
    Stopped,
    Failed,
}

impl BotState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Connecting => "CONNECTING",
            Self::Active => "ACTIVE",
            Self::Reconnecting => "RECONNECTING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }
}

/// Everything known about one running bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotSession {
    pub bot_id: String,
    pub name: String,
    pub pin: String,
    pub state: BotState,
    pub client_id: Option<String>,
    pub question_index: u64,
    pub last_question: Option<String>,
    pub last_answer: Option<usize>,
    pub reconnect_attempts: u32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl BotSession {
    pub fn new(bot_id: impl Into<String>, name: impl Into<String>, pin: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            bot_id: bot_id.into(),
            name: name.into(),
            pin: pin.into(),
            state: BotState::Created,
            client_id: None,
            question_index: 0,
            last_question: None,
            last_answer: None,
            reconnect_attempts: 0,
            failure_reason: None,
            created_at: now,
            last_activity: now,
        }
    }

    /// Stores the server-assigned client id. A second assignment on the same
    /// connection is ignored; `clear_connection` must run first.
    pub fn assign_client_id(&mut self, client_id: &str) -> bool {
        if self.client_id.is_some() {
            return false;
        }
        self.client_id = Some(client_id.to_string());
        true
    }

    pub fn clear_connection(&mut self) {
        self.client_id = None;
        if self.state == BotState::Active {
            self.state = BotState::Reconnecting;
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds().max(0)
    }

    pub fn summary(&self, now: DateTime<Utc>) -> BotSummary {
        BotSummary {
            bot_id: self.bot_id.clone(),
            name: self.name.clone(),
            pin: self.pin.clone(),
            state: self.state,
            uptime_seconds: self.uptime_seconds(now),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotSummary {
    pub bot_id: String,
    pub name: String,
    pub pin: String,
    pub state: BotState,
    pub uptime_seconds: i64,
}

/// Forward proxy used for both the reservation call and the socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.authority())
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotEventKind {
    Starting,
    SessionResolved,
    ChallengeSolved { scheme: String },
    ChallengeFailed,
    HandshakeOk { client_id: String },
    HandshakeFailed,
    SubscribeOk { channel: String },
    SubscribeFailed { channel: String },
    LoginSent,
    Active,
    QuestionDetected { question_index: u64 },
    AnswerSent { question_index: u64, choice: usize },
    AnswerDiscarded { question_index: u64 },
    ConnectionLost,
    ReconnectAttempt { attempt: u32, max_attempts: u32, delay_ms: u64 },
    Reconnected,
    GameEnded,
    Stopped,
    Fatal,
}

/// Structured record of a significant bot transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotEvent {
    pub bot_id: String,
    pub at: DateTime<Utc>,
    pub severity: Severity,
    pub kind: BotEventKind,
    pub message: String,
}

/// Replace `${VAR_NAME}` patterns in a string with values from environment variables.
/// Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pin_accepts_six_to_ten_ascii_digits() {
        for pin in ["123456", "1234567", "12345678", "123456789", "1234567890"] {
            assert!(is_valid_pin(pin), "{pin} should be valid");
        }
    }

    #[test]
    fn pin_rejects_everything_else() {
        for pin in [
            "", "12345", "12345678901", "abc123", "1234 567", " 123456", "123456\n",
            "١٢٣٤٥٦", "12345a",
        ] {
            assert!(!is_valid_pin(pin), "{pin:?} should be invalid");
        }
    }

    #[test]
    fn display_name_is_trimmed_and_bounded() {
        assert_eq!(normalize_display_name("  Quizzer "), Some("Quizzer"));
        assert_eq!(normalize_display_name("   "), None);
        assert_eq!(normalize_display_name("abcdefghijklmnop"), None);
    }

    #[test]
    fn decode_batch_preserves_order() {
        let raw = r#"[{"channel":"/meta/handshake","successful":true,"clientId":"c1"},
                      {"channel":"/service/player","data":{"type":"question"}}]"#;
        let batch = decode_batch(raw).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].channel, META_HANDSHAKE);
        assert_eq!(batch[0].client_id.as_deref(), Some("c1"));
        assert!(batch[0].succeeded());
        assert_eq!(batch[1].data_type(), Some("question"));
    }

    #[test]
    fn decode_batch_accepts_a_bare_object() {
        let batch = decode_batch(r#"{"channel":"/meta/connect","id":7}"#).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, Some(MessageId::Number(7)));
    }

    #[test]
    fn encode_batch_omits_absent_fields() {
        let mut message = ProtocolMessage::new(META_SUBSCRIBE);
        message.subscription = Some(SERVICE_PLAYER.to_string());
        let encoded = encode_batch(&[message]).unwrap();
        assert_eq!(
            encoded,
            r#"[{"channel":"/meta/subscribe","subscription":"/service/player"}]"#
        );
    }

    #[test]
    fn ext_ack_and_advice_are_read_from_meta_replies() {
        let mut message = ProtocolMessage::new(META_CONNECT);
        message.ext = Some(json!({"ack": 4}));
        message.advice = Some(json!({"reconnect": "handshake"}));
        assert_eq!(message.ext_ack(), Some(4));
        assert_eq!(message.reconnect_advice(), Some("handshake"));
    }

    #[test]
    fn client_id_is_assigned_once_until_cleared() {
        let mut session = BotSession::new("bot-1", "Quizzer", "12345678");
        session.state = BotState::Active;
        assert!(session.assign_client_id("first"));
        assert!(!session.assign_client_id("second"));
        assert_eq!(session.client_id.as_deref(), Some("first"));

        session.clear_connection();
        assert_eq!(session.client_id, None);
        assert_eq!(session.state, BotState::Reconnecting);
        assert!(session.assign_client_id("second"));
    }

    #[test]
    fn summary_reports_uptime() {
        let session = BotSession::new("bot-1", "Quizzer", "12345678");
        let later = session.created_at + chrono::Duration::seconds(42);
        let summary = session.summary(later);
        assert_eq!(summary.uptime_seconds, 42);
        assert_eq!(summary.state, BotState::Created);
    }

    #[test]
    fn proxy_credentials_require_a_username() {
        let mut proxy = ProxyConfig {
            host: "proxy.local".to_string(),
            port: 3128,
            username: None,
            password: Some("secret".to_string()),
        };
        assert!(proxy.is_configured());
        assert_eq!(proxy.url(), "http://proxy.local:3128");
        assert_eq!(proxy.credentials(), None);
        proxy.username = Some("user".to_string());
        assert_eq!(proxy.credentials(), Some(("user", "secret")));
    }

    #[test]
    fn expand_env_vars_replaces_unset_with_empty() {
        let expanded = expand_env_vars("host=${QUIZBOT_COMMON_TEST_UNSET_VAR}:1");
        assert_eq!(expanded, "host=:1");
    }
}
