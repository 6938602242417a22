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

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        rejection::JsonRejection,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use quizbot_common::{BotEvent, BotSession, BotSummary, ProxyConfig, Severity, expand_env_vars};
use quizbot_core::{
    BotConfig, BotError, BotRegistry, BotSettings, ChallengeSolver, HttpSessionResolver,
    SessionSource, WebSocketConnector, WireDriverFactory,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
struct AppState {
    registry: Arc<BotRegistry>,
    sessions: Arc<dyn SessionSource>,
    solver: ChallengeSolver,
    proxy: Option<ProxyConfig>,
}

#[derive(Debug, Clone, Default)]
struct ServiceConfig {
    settings: BotSettings,
    proxy: Option<ProxyConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceConfigFile {
    #[serde(flatten)]
    bots: BotSettings,
    proxy: Option<ProxyConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBotRequest {
    name: String,
    #[serde(deserialize_with = "string_or_number")]
    pin: String,
    #[serde(default)]
    bot_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartBotResponse {
    success: bool,
    bot_id: String,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopBotRequest {
    bot_id: String,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BotStatusView {
    #[serde(flatten)]
    session: BotSession,
    uptime_seconds: i64,
}

#[derive(Debug, Serialize)]
struct BotStatusResponse {
    success: bool,
    status: BotStatusView,
}

#[derive(Debug, Serialize)]
struct BotListResponse {
    success: bool,
    count: usize,
    bots: Vec<BotSummary>,
}

#[derive(Debug, Deserialize)]
struct AnswerRequest {
    choice: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnswerResponse {
    success: bool,
    question_index: u64,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionProbeResponse {
    success: bool,
    pin: String,
    has_session_token: bool,
    has_game_id: bool,
    has_challenge: bool,
    /// Present only when a challenge came back.
    challenge_plausible: Option<bool>,
    challenge_error: Option<String>,
    message: String,
}

#[derive(Debug, Serialize)]
struct ProxyStatusResponse {
    success: bool,
    configured: bool,
    host: Option<String>,
    port: Option<u16>,
    authenticated: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "bot_service=debug,quizbot_core=debug,tower_http=info".to_string()
        }))
        .init();

    let ServiceConfig { settings, proxy } = load_service_config(|name| std::env::var(name).ok());
    let sessions: Arc<dyn SessionSource> = Arc::new(
        HttpSessionResolver::new(
            settings.http_base_url.clone(),
            proxy.as_ref(),
            settings.connect_timeout(),
        )
        .context("failed to build session reservation client")?,
    );
    let solver = ChallengeSolver::default();
    let factory = WireDriverFactory::new(
        sessions.clone(),
        Arc::new(WebSocketConnector::new(proxy.clone())),
        solver.clone(),
        &settings,
    );
    info!(
        vendor = %settings.http_base_url,
        socket_base = %settings.ws_base(),
        max_bots = settings.max_bots,
        proxy = proxy.as_ref().map(ProxyConfig::authority).unwrap_or_default(),
        "bot-service configured"
    );

    let registry = Arc::new(BotRegistry::new(Arc::new(factory), settings));
    tokio::spawn(log_bot_events(registry.events().subscribe()));

    let state = AppState {
        registry: registry.clone(),
        sessions,
        solver,
        proxy,
    };
    let app = build_router(state);
    let bind_addr = parse_bind_addr("BOT_SERVICE_BIND", "0.0.0.0:8091")?;
    info!(%bind_addr, "bot-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let stopped = registry.shutdown_all().await;
    info!(stopped, "bot-service stopped all bots");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("bot-service shutting down");
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/start-bot", post(start_bot_handler))
        .route("/api/stop-bot", post(stop_bot_handler))
        .route("/api/bot-status/{bot_id}", get(bot_status_handler))
        .route("/api/bots", get(list_bots_handler))
        .route("/api/bots/{bot_id}/answer", post(answer_handler))
        .route("/api/test-session/{pin}", get(test_session_handler))
        .route("/api/proxy-status", get(proxy_status_handler))
        .route("/api/events", get(events_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

/// File values first, then environment overrides.
fn load_service_config(lookup: impl Fn(&str) -> Option<String>) -> ServiceConfig {
    let file = normalize_optional_string(lookup("BOT_SERVICE_CONFIG_PATH"))
        .and_then(|path| load_config_file(&path))
        .unwrap_or_default();
    let mut settings = file.bots;
    let mut proxy = file.proxy;

    override_from(&lookup, "QUIZ_VENDOR_BASE_URL", &mut settings.http_base_url);
    override_from(&lookup, "QUIZ_VENDOR_WS_BASE_URL", &mut settings.ws_base_url);
    override_from(&lookup, "BOT_CONNECT_TIMEOUT_MS", &mut settings.connect_timeout_ms);
    override_from(&lookup, "BOT_RECONNECT_MAX_ATTEMPTS", &mut settings.reconnect_max_attempts);
    override_from(&lookup, "BOT_RECONNECT_BASE_DELAY_MS", &mut settings.reconnect_base_delay_ms);
    override_from(&lookup, "BOT_RECONNECT_MAX_DELAY_MS", &mut settings.reconnect_max_delay_ms);
    override_from(&lookup, "BOT_WATCHDOG_INTERVAL_MS", &mut settings.watchdog_interval_ms);
    override_from(&lookup, "BOT_ANSWER_DELAY_MIN_MS", &mut settings.answer_delay_min_ms);
    override_from(&lookup, "BOT_ANSWER_DELAY_MAX_MS", &mut settings.answer_delay_max_ms);
    override_from(&lookup, "BOT_MAX_BOTS", &mut settings.max_bots);
    override_from(&lookup, "BOT_STOP_TIMEOUT_MS", &mut settings.stop_timeout_ms);
    override_from(&lookup, "BOT_EVENT_BUFFER", &mut settings.event_buffer);
    settings.initial_connect = parse_bool(lookup("BOT_INITIAL_CONNECT"), settings.initial_connect);

    if let Some(host) = normalize_optional_string(lookup("PROXY_HOST")) {
        let port = lookup("PROXY_PORT")
            .and_then(|value| value.trim().parse::<u16>().ok())
            .or(proxy.as_ref().map(|existing| existing.port));
        match port {
            Some(port) => {
                proxy = Some(ProxyConfig {
                    host,
                    port,
                    username: normalize_optional_string(lookup("PROXY_USERNAME")),
                    password: lookup("PROXY_PASSWORD"),
                });
            }
            None => warn!(host = %host, "PROXY_HOST set without a valid PROXY_PORT; proxy disabled"),
        }
    }
    let proxy = proxy.filter(ProxyConfig::is_configured);

    ServiceConfig { settings, proxy }
}

fn load_config_file(path: &str) -> Option<ServiceConfigFile> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read bot-service config path");
            return None;
        }
    };

    match serde_yaml::from_str::<ServiceConfigFile>(&expand_env_vars(&raw)) {
        Ok(parsed) => {
            info!(path = %path, "loaded bot-service config file");
            Some(parsed)
        }
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse bot-service config yaml");
            None
        }
    }
}

fn override_from<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, var_name: &str, target: &mut T) {
    let Some(raw) = normalize_optional_string(lookup(var_name)) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!(var = var_name, value = %raw, "ignoring unparsable environment override"),
    }
}

fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            if normalized.is_empty() {
                default
            } else {
                !matches!(normalized.as_str(), "0" | "false" | "no" | "off")
            }
        })
        .unwrap_or(default)
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, got {other}"
        ))),
    }
}

/// Mirrors every bot event into the process log.
async fn log_bot_events(mut events: broadcast::Receiver<BotEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match event.severity {
                Severity::Debug => {
                    debug!(bot_id = %event.bot_id, kind = ?event.kind, "{}", event.message)
                }
                Severity::Info => {
                    info!(bot_id = %event.bot_id, kind = ?event.kind, "{}", event.message)
                }
                Severity::Warn => {
                    warn!(bot_id = %event.bot_id, kind = ?event.kind, "{}", event.message)
                }
                Severity::Error => {
                    error!(bot_id = %event.bot_id, kind = ?event.kind, "{}", event.message)
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "bot event logger fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({"ok": true, "service": "bot-service"}))
}

async fn start_bot_handler(
    State(state): State<AppState>,
    payload: Result<Json<StartBotRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StartBotResponse>), ApiError> {
    let Json(request) = payload?;
    let session = state
        .registry
        .start(BotConfig {
            bot_id: normalize_optional_string(request.bot_id),
            name: request.name,
            pin: request.pin,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(StartBotResponse {
            success: true,
            message: format!("bot {} joined game {}", session.name, session.pin),
            bot_id: session.bot_id,
        }),
    ))
}

async fn stop_bot_handler(
    State(state): State<AppState>,
    payload: Result<Json<StopBotRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Json(request) = payload?;
    let bot_id = request.bot_id.trim();
    if bot_id.is_empty() {
        return Err(ApiError::bad_request("botId is required"));
    }
    let session = state.registry.stop(bot_id).await?;

    Ok(Json(MessageResponse {
        success: true,
        message: format!("bot {} stopped ({})", session.bot_id, session.state.as_str()),
    }))
}

async fn bot_status_handler(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> Result<Json<BotStatusResponse>, ApiError> {
    let session = state.registry.status(&bot_id).await?;
    let uptime_seconds = session.uptime_seconds(Utc::now());

    Ok(Json(BotStatusResponse {
        success: true,
        status: BotStatusView {
            session,
            uptime_seconds,
        },
    }))
}

async fn list_bots_handler(State(state): State<AppState>) -> Json<BotListResponse> {
    let bots = state.registry.list().await;
    Json(BotListResponse {
        success: true,
        count: bots.len(),
        bots,
    })
}

async fn answer_handler(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    payload: Result<Json<AnswerRequest>, JsonRejection>,
) -> Result<Json<AnswerResponse>, ApiError> {
    let Json(request) = payload?;
    let question_index = state.registry.answer(&bot_id, request.choice).await?;

    Ok(Json(AnswerResponse {
        success: true,
        question_index,
        message: format!(
            "answered question {question_index} with choice {}",
            request.choice
        ),
    }))
}

async fn test_session_handler(
    State(state): State<AppState>,
    Path(pin): Path<String>,
) -> Result<Json<SessionProbeResponse>, ApiError> {
    let pin = pin.trim().to_string();
    let session = state
        .sessions
        .resolve(&pin)
        .await
        .map_err(BotError::from)?;

    let (challenge_plausible, challenge_error) = match session.challenge.as_deref() {
        Some(raw) => match state.solver.solve_detailed(raw) {
            Ok(solved) => (Some(solved.plausible), None),
            Err(error) => (Some(false), Some(error.to_string())),
        },
        None => (None, None),
    };

    Ok(Json(SessionProbeResponse {
        success: true,
        has_session_token: session.session_token.is_some(),
        has_game_id: session.game_id.is_some(),
        has_challenge: session.challenge.is_some(),
        challenge_plausible,
        challenge_error,
        message: format!("session reserved for game {pin}"),
        pin,
    }))
}

async fn proxy_status_handler(State(state): State<AppState>) -> Json<ProxyStatusResponse> {
    let proxy = state.proxy.as_ref();
    Json(ProxyStatusResponse {
        success: true,
        configured: proxy.is_some(),
        host: proxy.map(|proxy| proxy.host.clone()),
        port: proxy.map(|proxy| proxy.port),
        authenticated: proxy.is_some_and(|proxy| proxy.credentials().is_some()),
    })
}

async fn events_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let events = state.registry.events().subscribe();
    ws.on_upgrade(move |socket| stream_bot_events(socket, events))
}

async fn stream_bot_events(mut socket: WebSocket, mut events: broadcast::Receiver<BotEvent>) {
    debug!("bot event stream connected");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(payload) => payload,
                        Err(error) => {
                            warn!(error = %error, "failed to encode bot event");
                            continue;
                        }
                    };
                    if let Err(error) = socket.send(Message::Text(payload.into())).await {
                        debug!(error = %error, "bot event stream closed by peer");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bot event stream subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("bot event stream disconnected");
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<BotError> for ApiError {
    fn from(error: BotError) -> Self {
        let status = match &error {
            BotError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            BotError::Capacity(_) | BotError::NotActive(_) | BotError::Cancelled(_) => {
                StatusCode::CONFLICT
            }
            BotError::NotFound(_) => StatusCode::NOT_FOUND,
            BotError::Session(_)
            | BotError::Challenge(_)
            | BotError::Handshake(_)
            | BotError::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "bot-service request failed");
        (
            self.status,
            Json(serde_json::json!({"success": false, "message": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quizbot_common::BotState;
    use quizbot_core::{
        DriverFactory, DriverKind, SessionDriver,
        driver::{DriverEvent, DriverSpec, Established},
        error::{HandshakeError, SessionError},
        events::BotEmitter,
        session::SessionHandle,
    };
    use std::collections::HashMap;

    struct FakeDriver {
        refuse: bool,
    }

    #[async_trait]
    impl SessionDriver for FakeDriver {
        fn kind(&self) -> DriverKind {
            DriverKind::Wire
        }

        async fn establish(&mut self) -> Result<Established, BotError> {
            if self.refuse {
                return Err(BotError::Handshake(HandshakeError::Connect("refused".to_string())));
            }
            Ok(Established {
                client_id: Some("client-1".to_string()),
            })
        }

        async fn next_event(&mut self) -> DriverEvent {
            std::future::pending().await
        }

        async fn submit_answer(&mut self, _choice: usize, _lag: u64) -> Result<(), BotError> {
            Ok(())
        }

        fn is_alive(&self) -> bool {
            true
        }

        async fn shutdown(&mut self) {}
    }

    struct FakeFactory;

    impl DriverFactory for FakeFactory {
        fn kind(&self) -> DriverKind {
            DriverKind::Wire
        }

        fn create(&self, spec: &DriverSpec, _events: BotEmitter) -> Box<dyn SessionDriver> {
            Box::new(FakeDriver {
                refuse: spec.name == "Refused",
            })
        }
    }

    struct FakeSessions;

    #[async_trait]
    impl SessionSource for FakeSessions {
        async fn resolve(&self, pin: &str) -> Result<SessionHandle, SessionError> {
            match pin {
                "404404" => Err(SessionError::Http { status: 404 }),
                "abc" => Err(SessionError::InvalidPin(pin.to_string())),
                _ => Ok(SessionHandle {
                    session_token: Some("token".to_string()),
                    game_id: None,
                    challenge: Some(
                        "decode.call(this, 'ABCDEFGHIJKL'); var offset = 18150;".to_string(),
                    ),
                    cookies: Vec::new(),
                }),
            }
        }
    }

    fn state_with(proxy: Option<ProxyConfig>) -> AppState {
        AppState {
            registry: Arc::new(BotRegistry::new(Arc::new(FakeFactory), BotSettings::default())),
            sessions: Arc::new(FakeSessions),
            solver: ChallengeSolver::default(),
            proxy,
        }
    }

    fn start_request(name: &str, pin: &str) -> StartBotRequest {
        StartBotRequest {
            name: name.to_string(),
            pin: pin.to_string(),
            bot_id: None,
        }
    }

    #[tokio::test]
    async fn start_then_status_then_stop() {
        let state = state_with(None);
        let (status, Json(started)) =
            start_bot_handler(State(state.clone()), Ok(Json(start_request("Alice", "123456"))))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert!(started.success);

        let Json(view) = bot_status_handler(State(state.clone()), Path(started.bot_id.clone()))
            .await
            .unwrap();
        assert_eq!(view.status.session.state, BotState::Active);
        let body = serde_json::to_value(&view).unwrap();
        assert_eq!(body["status"]["state"], "ACTIVE");
        assert_eq!(body["status"]["clientId"], "client-1");
        assert!(body["status"].get("uptimeSeconds").is_some());

        let Json(listed) = list_bots_handler(State(state.clone())).await;
        assert_eq!(listed.count, 1);

        let Json(stopped) = stop_bot_handler(
            State(state.clone()),
            Ok(Json(StopBotRequest {
                bot_id: started.bot_id.clone(),
            })),
        )
        .await
        .unwrap();
        assert!(stopped.success);

        let error = stop_bot_handler(
            State(state),
            Ok(Json(StopBotRequest {
                bot_id: started.bot_id,
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn errors_map_to_http_statuses() {
        let state = state_with(None);

        let invalid = start_bot_handler(State(state.clone()), Ok(Json(start_request("Bob", "abc123"))))
            .await
            .unwrap_err();
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);

        let refused =
            start_bot_handler(State(state.clone()), Ok(Json(start_request("Refused", "123456"))))
                .await
                .unwrap_err();
        assert_eq!(refused.status, StatusCode::BAD_GATEWAY);

        let missing = bot_status_handler(State(state.clone()), Path("bot-missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let (_, Json(started)) =
            start_bot_handler(State(state.clone()), Ok(Json(start_request("Carol", "123456"))))
                .await
                .unwrap();
        let no_question = answer_handler(
            State(state.clone()),
            Path(started.bot_id),
            Ok(Json(AnswerRequest { choice: 1 })),
        )
        .await
        .unwrap_err();
        assert_eq!(no_question.status, StatusCode::CONFLICT);

        let blank = stop_bot_handler(
            State(state),
            Ok(Json(StopBotRequest {
                bot_id: "  ".to_string(),
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(blank.status, StatusCode::BAD_REQUEST);

        let cancelled = ApiError::from(BotError::Cancelled("bot-1".to_string()));
        assert_eq!(cancelled.status, StatusCode::CONFLICT);
    }

    async fn rejected_body<T: serde::de::DeserializeOwned + std::fmt::Debug>(
        content_type: Option<&str>,
        body: &'static str,
    ) -> JsonRejection {
        use axum::{body::Body, extract::FromRequest, http::Request};

        let mut request = Request::builder().method("POST").uri("/api/start-bot");
        if let Some(content_type) = content_type {
            request = request.header(axum::http::header::CONTENT_TYPE, content_type);
        }
        let request = request.body(Body::from(body)).unwrap();
        Json::<T>::from_request(request, &())
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn malformed_bodies_use_the_error_envelope() {
        let state = state_with(None);

        let truncated = rejected_body::<StartBotRequest>(Some("application/json"), r#"{"name": "#).await;
        let error = start_bot_handler(State(state.clone()), Err(truncated))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert!(!body["message"].as_str().unwrap().is_empty());

        let untyped = rejected_body::<StopBotRequest>(None, r#"{"botId": "bot-1"}"#).await;
        let error = stop_bot_handler(State(state.clone()), Err(untyped))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let wrong_shape = rejected_body::<AnswerRequest>(Some("application/json"), r#"{"choice": "two"}"#).await;
        let error = answer_handler(State(state.clone()), Path("bot-1".to_string()), Err(wrong_shape))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(state.registry.list().await.is_empty());
    }

    #[test]
    fn start_request_accepts_numeric_pin() {
        let request: StartBotRequest =
            serde_json::from_str(r#"{"name": "Dave", "pin": 12345678, "botId": "bot-7"}"#).unwrap();
        assert_eq!(request.pin, "12345678");
        assert_eq!(request.bot_id.as_deref(), Some("bot-7"));
        assert!(serde_json::from_str::<StartBotRequest>(r#"{"name": "Dave", "pin": true}"#).is_err());
    }

    #[tokio::test]
    async fn session_probe_reports_fields_without_starting_a_bot() {
        let state = state_with(None);
        let Json(probe) = test_session_handler(State(state.clone()), Path("123456".to_string()))
            .await
            .unwrap();
        assert!(probe.has_session_token);
        assert!(!probe.has_game_id);
        assert!(probe.has_challenge);
        assert_eq!(probe.challenge_plausible, Some(true));
        assert!(state.registry.list().await.is_empty());

        let rejected = test_session_handler(State(state.clone()), Path("404404".to_string()))
            .await
            .unwrap_err();
        assert_eq!(rejected.status, StatusCode::BAD_GATEWAY);
        let invalid = test_session_handler(State(state), Path("abc".to_string()))
            .await
            .unwrap_err();
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn proxy_status_never_echoes_the_password() {
        let state = state_with(Some(ProxyConfig {
            host: "proxy.internal".to_string(),
            port: 3128,
            username: Some("user".to_string()),
            password: Some("hunter2".to_string()),
        }));
        let Json(status) = proxy_status_handler(State(state)).await;
        assert!(status.configured);
        assert!(status.authenticated);
        assert_eq!(status.port, Some(3128));
        let body = serde_json::to_string(&status).unwrap();
        assert!(!body.contains("hunter2"));

        let Json(empty) = proxy_status_handler(State(state_with(None))).await;
        assert!(!empty.configured);
        assert!(!empty.authenticated);
    }

    #[test]
    fn environment_overrides_config_file() {
        let path = std::env::temp_dir().join(format!("bot-service-config-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "max_bots: 5\nreconnect_max_attempts: 4\nproxy:\n  host: file-proxy\n  port: 8080\n",
        )
        .unwrap();

        let env: HashMap<&str, String> = HashMap::from([
            ("BOT_SERVICE_CONFIG_PATH", path.display().to_string()),
            ("BOT_MAX_BOTS", "7".to_string()),
            ("BOT_WATCHDOG_INTERVAL_MS", "not-a-number".to_string()),
            ("BOT_INITIAL_CONNECT", "false".to_string()),
        ]);
        let config = load_service_config(|name| env.get(name).cloned());
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.settings.max_bots, 7);
        assert_eq!(config.settings.reconnect_max_attempts, 4);
        assert_eq!(config.settings.watchdog_interval_ms, 5_000);
        assert!(!config.settings.initial_connect);
        assert_eq!(config.proxy.unwrap().authority(), "file-proxy:8080");
    }

    #[test]
    fn proxy_from_environment_requires_a_port() {
        let env: HashMap<&str, String> = HashMap::from([("PROXY_HOST", "proxy".to_string())]);
        assert!(load_service_config(|name| env.get(name).cloned()).proxy.is_none());

        let env: HashMap<&str, String> = HashMap::from([
            ("PROXY_HOST", "proxy".to_string()),
            ("PROXY_PORT", "3128".to_string()),
            ("PROXY_USERNAME", "user".to_string()),
            ("PROXY_PASSWORD", "secret".to_string()),
        ]);
        let proxy = load_service_config(|name| env.get(name).cloned()).proxy.unwrap();
        assert_eq!(proxy.credentials(), Some(("user", "secret")));
    }

    #[test]
    fn unreadable_config_file_falls_back_to_defaults() {
        let env: HashMap<&str, String> = HashMap::from([(
            "BOT_SERVICE_CONFIG_PATH",
            "/definitely/not/here.yaml".to_string(),
        )]);
        let config = load_service_config(|name| env.get(name).cloned());
        assert_eq!(config.settings, BotSettings::default());
        assert!(config.proxy.is_none());
    }
}
