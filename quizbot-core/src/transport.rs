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

//! One socket per bot, surfaced as a pair of channels so the rest of the core
//! never touches the WebSocket directly.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use futures::{SinkExt, StreamExt};
use quizbot_common::{ProtocolMessage, ProxyConfig, decode_batch, encode_batch};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, client_async_tls_with_config, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header},
    },
};
use tracing::{debug, info, warn};

use crate::error::{HandshakeError, ProtocolError, TransportError};

const MAX_PROXY_RESPONSE_BYTES: usize = 8 * 1024;

/// Everything needed to open the game socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub url: String,
    pub origin: String,
    pub user_agent: String,
    pub cookie_header: String,
}

impl ConnectTarget {
    /// `wss://host/cometd/{pin}/{session}?_=<ts>`. Challenge material never
    /// goes into the URL.
    pub fn for_session(ws_base: &str, pin: &str, session_id: &str, cache_buster: i64) -> String {
        format!(
            "{}/cometd/{pin}/{session_id}?_={cache_buster}",
            ws_base.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Closed(String),
}

pub struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Connection {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// In-memory connection whose other end is driven by the caller.
    pub fn pair() -> (Self, PeerEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self::new(out_tx, in_rx),
            PeerEnd {
                received: out_rx,
                sender: in_tx,
            },
        )
    }

    pub fn send_batch(&self, batch: &[ProtocolMessage]) -> Result<(), TransportError> {
        if batch.is_empty() {
            return Ok(());
        }
        let frame = encode_batch(batch)
            .map_err(|error| TransportError::Protocol(ProtocolError::Encode(error.to_string())))?;
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed("socket writer is gone".to_string()))
    }

    /// Next inbound batch. Cancel-safe; a finished pump reads as `Closed`.
    pub async fn recv_batch(&mut self) -> Result<Vec<ProtocolMessage>, TransportError> {
        loop {
            match self.inbound.recv().await {
                Some(TransportEvent::Frame(text)) => match decode_batch(&text) {
                    Ok(batch) => return Ok(batch),
                    Err(error) => {
                        warn!(error = %error, frame_len = text.len(), "dropping undecodable frame");
                    }
                },
                Some(TransportEvent::Closed(reason)) => return Err(TransportError::Closed(reason)),
                None => return Err(TransportError::Closed("socket reader is gone".to_string())),
            }
        }
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// Server side of `Connection::pair`.
pub struct PeerEnd {
    received: mpsc::UnboundedReceiver<String>,
    sender: mpsc::UnboundedSender<TransportEvent>,
}

impl PeerEnd {
    pub fn send_batch(&self, batch: &[ProtocolMessage]) -> bool {
        match encode_batch(batch) {
            Ok(frame) => self.send_frame(frame),
            Err(_) => false,
        }
    }

    pub fn send_frame(&self, frame: impl Into<String>) -> bool {
        self.sender.send(TransportEvent::Frame(frame.into())).is_ok()
    }

    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.sender.send(TransportEvent::Closed(reason.into()));
    }

    /// Next batch the client wrote, or `None` once the client hung up.
    pub async fn recv_batch(&mut self) -> Option<Vec<ProtocolMessage>> {
        loop {
            let frame = self.received.recv().await?;
            if let Ok(batch) = decode_batch(&frame) {
                return Some(batch);
            }
        }
    }

    /// Batches already written by the client, without waiting.
    pub fn drain(&mut self) -> Vec<Vec<ProtocolMessage>> {
        let mut batches = Vec::new();
        while let Ok(frame) = self.received.try_recv() {
            if let Ok(batch) = decode_batch(&frame) {
                batches.push(batch);
            }
        }
        batches
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<Connection, HandshakeError>;
}

#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    proxy: Option<ProxyConfig>,
}

impl WebSocketConnector {
    pub fn new(proxy: Option<ProxyConfig>) -> Self {
        Self {
            proxy: proxy.filter(ProxyConfig::is_configured),
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue, HandshakeError> {
    HeaderValue::from_str(value).map_err(|error| HandshakeError::Connect(error.to_string()))
}

/// Opens a raw tunnel through an HTTP forward proxy.
async fn connect_via_proxy(
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<TcpStream, HandshakeError> {
    let mut stream = TcpStream::connect(proxy.authority())
        .await
        .map_err(|error| HandshakeError::Connect(format!("proxy {}: {error}", proxy.authority())))?;

    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some((username, password)) = proxy.credentials() {
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|error| HandshakeError::Connect(error.to_string()))?;

    let mut response = Vec::new();
    let mut chunk = [0u8; 512];
    while !response.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|error| HandshakeError::Connect(error.to_string()))?;
        if read == 0 {
            return Err(HandshakeError::Connect(
                "proxy closed the tunnel request".to_string(),
            ));
        }
        response.extend_from_slice(&chunk[..read]);
        if response.len() > MAX_PROXY_RESPONSE_BYTES {
            return Err(HandshakeError::Connect(
                "proxy response headers too large".to_string(),
            ));
        }
    }

    let status_line = String::from_utf8_lossy(&response)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    if status_line.split_whitespace().nth(1) != Some("200") {
        return Err(HandshakeError::Connect(format!(
            "proxy refused tunnel: {status_line}"
        )));
    }
    debug!(proxy = %proxy.authority(), host = %host, "proxy tunnel established");
    Ok(stream)
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Connection, HandshakeError> {
        let mut request = target
            .url
            .as_str()
            .into_client_request()
            .map_err(|error| HandshakeError::Connect(error.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(header::USER_AGENT, header_value(&target.user_agent)?);
        headers.insert(header::ORIGIN, header_value(&target.origin)?);
        headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if !target.cookie_header.is_empty() {
            headers.insert(header::COOKIE, header_value(&target.cookie_header)?);
        }

        let ws = match &self.proxy {
            Some(proxy) => {
                let uri = request.uri();
                let host = uri
                    .host()
                    .ok_or_else(|| HandshakeError::Connect("socket url has no host".to_string()))?
                    .to_string();
                let port = uri
                    .port_u16()
                    .unwrap_or(if uri.scheme_str() == Some("ws") { 80 } else { 443 });
                let stream = connect_via_proxy(proxy, &host, port).await?;
                let (ws, _) = client_async_tls_with_config(request, stream, None, None)
                    .await
                    .map_err(|error| HandshakeError::Connect(error.to_string()))?;
                ws
            }
            None => {
                let (ws, _) = connect_async(request)
                    .await
                    .map_err(|error| HandshakeError::Connect(error.to_string()))?;
                ws
            }
        };
        info!(via_proxy = self.proxy.is_some(), "game socket open");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(socket_pump(ws, out_rx, in_tx));
        Ok(Connection::new(out_tx, in_rx))
    }
}

/// Bridges the socket and the connection channels until either side ends.
async fn socket_pump(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    in_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                };
                if let Err(error) = ws_tx.send(Message::text(frame)).await {
                    let _ = in_tx.send(TransportEvent::Closed(error.to_string()));
                    break;
                }
            }
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let _ = in_tx.send(TransportEvent::Frame(text.as_str().to_string()));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                            let _ = in_tx.send(TransportEvent::Frame(text));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| format!("{} {}", frame.code, frame.reason.as_str()))
                            .unwrap_or_else(|| "closed by server".to_string());
                        let _ = in_tx.send(TransportEvent::Closed(reason));
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        let _ = in_tx.send(TransportEvent::Closed(error.to_string()));
                        break;
                    }
                    None => {
                        let _ = in_tx.send(TransportEvent::Closed("stream ended".to_string()));
                        break;
                    }
                }
            }
        }
    }
}
