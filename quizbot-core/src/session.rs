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

use async_trait::async_trait;
use chrono::Utc;
use quizbot_common::{ProxyConfig, is_valid_pin};
use rand::{Rng, distr::Alphanumeric, seq::IndexedRandom};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SessionError;

pub const USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (iPhone; CPU iPhone OS 14_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0.3 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPad; CPU OS 14_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0.3 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 10; SM-G981B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/80.0.3987.162 Mobile Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.5 Safari/605.1.15",
];

pub const SESSION_TOKEN_HEADER: &str = "x-kahoot-session-token";

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

fn random_suffix(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect()
}

/// A browser-looking cookie jar. None of these values are checked by the
/// backend beyond being present.
pub fn synthesize_cookies() -> Vec<String> {
    let uuid = Uuid::new_v4();
    let consent_id = Uuid::new_v4();
    let now = Utc::now();
    let datestamp = now
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
        .replace(',', "%2C")
        .replace(' ', "%20")
        .replace(':', "%3A");

    vec![
        format!("generated_uuid={uuid}"),
        format!("OptanonAlertBoxClosed={}", now.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
        format!(
            "OptanonConsent=isGpcEnabled=0&datestamp={datestamp}&version=202411.1.0&browserGpcFlag=0&isIABGlobal=false&hosts=&consentId={consent_id}&interactionCount=1&isAnonUser=1&landingPath=NotLandingPage&groups=C0001%3A1%2CC0002%3A0%2CC0003%3A0%2CC0004%3A0&intType=3"
        ),
        format!("deviceId={}", uuid.simple()),
        format!("AWSALB={}", random_suffix(11)),
        format!("session-id={}", random_suffix(11)),
        "player=true".to_string(),
    ]
}

/// What the reservation call produced. The backend sends any subset of the
/// identifiers, so every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_token: Option<String>,
    pub game_id: Option<String>,
    pub challenge: Option<String>,
    pub cookies: Vec<String>,
}

impl SessionHandle {
    /// Identifier used in the socket path.
    pub fn connection_id(&self) -> Option<&str> {
        self.game_id.as_deref().or(self.session_token.as_deref())
    }

    pub fn cookie_header(&self) -> String {
        self.cookies.join("; ")
    }

    fn from_body(body: &Value, header_token: Option<String>, cookies: Vec<String>) -> Self {
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| body.get(*key))
                .and_then(|value| match value {
                    Value::String(text) => Some(text.trim().to_string()),
                    Value::Number(number) => Some(number.to_string()),
                    _ => None,
                })
                .filter(|value| !value.is_empty())
        };

        Self {
            session_token: text(&["sessionToken", "session_token"]).or(header_token),
            game_id: text(&["liveGameId", "gameId"]),
            challenge: text(&["challenge"]),
            cookies,
        }
    }
}

#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn resolve(&self, pin: &str) -> Result<SessionHandle, SessionError>;
}

#[derive(Clone)]
pub struct HttpSessionResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSessionResolver {
    pub fn new(
        base_url: impl Into<String>,
        proxy: Option<&ProxyConfig>,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = proxy.filter(|proxy| proxy.is_configured()) {
            let mut upstream = reqwest::Proxy::all(proxy.url())
                .map_err(|error| SessionError::Transport(error.to_string()))?;
            if let Some((username, password)) = proxy.credentials() {
                upstream = upstream.basic_auth(username, password);
            }
            builder = builder.proxy(upstream);
        }
        let client = builder
            .build()
            .map_err(|error| SessionError::Transport(error.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn reservation_url(&self, pin: &str) -> String {
        format!("{}/reserve/session/{pin}/", self.base_url)
    }
}

#[async_trait]
impl SessionSource for HttpSessionResolver {
    async fn resolve(&self, pin: &str) -> Result<SessionHandle, SessionError> {
        if !is_valid_pin(pin) {
            return Err(SessionError::InvalidPin(pin.to_string()));
        }

        let cookies = synthesize_cookies();
        let response = self
            .client
            .get(self.reservation_url(pin))
            .header(reqwest::header::USER_AGENT, random_user_agent())
            .header(reqwest::header::ORIGIN, "https://kahoot.it")
            .header(reqwest::header::REFERER, "https://kahoot.it/")
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .header(reqwest::header::COOKIE, cookies.join("; "))
            .send()
            .await
            .map_err(|error| {
                warn!(pin = %pin, error = %error, "session reservation request failed");
                SessionError::Transport(error.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(pin = %pin, status = status.as_u16(), "session reservation rejected");
            return Err(SessionError::Http {
                status: status.as_u16(),
            });
        }

        let header_token = response
            .headers()
            .get(SESSION_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .filter(|value| !value.trim().is_empty());
        let body = response
            .text()
            .await
            .map_err(|error| SessionError::Transport(error.to_string()))?;
        let parsed: Value = serde_json::from_str(&body)
            .map_err(|error| SessionError::Malformed(error.to_string()))?;
        if !parsed.is_object() {
            return Err(SessionError::Malformed(
                "expected a JSON object".to_string(),
            ));
        }

        let handle = SessionHandle::from_body(&parsed, header_token, cookies);
        info!(
            pin = %pin,
            has_token = handle.session_token.is_some(),
            has_game_id = handle.game_id.is_some(),
            has_challenge = handle.challenge.is_some(),
            "session reserved"
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, header_exists, method, path},
    };

    fn resolver(server: &MockServer) -> HttpSessionResolver {
        HttpSessionResolver::new(server.uri(), None, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn resolves_game_id_challenge_and_header_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reserve/session/12345678/"))
            .and(header("origin", "https://kahoot.it"))
            .and(header_exists("cookie"))
            .and(header_exists("user-agent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_TOKEN_HEADER, "header-token")
                    .set_body_json(json!({
                        "liveGameId": "live-1",
                        "challenge": "decode.call(this, 'abc'); var offset = 1;"
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let handle = resolver(&server).resolve("12345678").await.unwrap();
        assert_eq!(handle.game_id.as_deref(), Some("live-1"));
        assert_eq!(handle.session_token.as_deref(), Some("header-token"));
        assert!(handle.challenge.as_deref().unwrap().contains("decode.call"));
        assert_eq!(handle.connection_id(), Some("live-1"));
        assert!(handle.cookies.iter().any(|cookie| cookie == "player=true"));
    }

    #[tokio::test]
    async fn tolerates_a_partial_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sessionToken": "tok"})))
            .mount(&server)
            .await;

        let handle = resolver(&server).resolve("123456").await.unwrap();
        assert_eq!(handle.session_token.as_deref(), Some("tok"));
        assert_eq!(handle.game_id, None);
        assert_eq!(handle.challenge, None);
        assert_eq!(handle.connection_id(), Some("tok"));
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let error = resolver(&server).resolve("123456").await.unwrap_err();
        assert_eq!(error, SessionError::Http { status: 404 });
        assert_eq!(error.status(), Some(404));
    }

    #[tokio::test]
    async fn malformed_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>busy</html>"))
            .mount(&server)
            .await;

        let error = resolver(&server).resolve("123456").await.unwrap_err();
        assert!(matches!(error, SessionError::Malformed(_)));
    }

    #[tokio::test]
    async fn invalid_pin_never_reaches_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&server)
            .await;

        let resolver = resolver(&server);
        for pin in ["abc123", "12345", "12345678901", ""] {
            let error = resolver.resolve(pin).await.unwrap_err();
            assert!(matches!(error, SessionError::InvalidPin(_)));
        }
    }

    #[test]
    fn cookies_look_like_a_browser_jar() {
        let cookies = synthesize_cookies();
        assert_eq!(cookies.len(), 7);
        let device = cookies
            .iter()
            .find(|cookie| cookie.starts_with("deviceId="))
            .unwrap();
        assert_eq!(device.len(), "deviceId=".len() + 32);
        assert!(cookies.iter().all(|cookie| !cookie.contains(' ')));
    }

    #[test]
    fn user_agent_comes_from_the_pool() {
        for _ in 0..20 {
            assert!(USER_AGENTS.contains(&random_user_agent()));
        }
    }
}
