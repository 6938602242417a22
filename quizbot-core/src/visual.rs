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

//! Session driving through an external rendering surface (a browser page
//! owned by some other process). The surface only reports what it shows; the
//! same interpreter and supervisor run on top of it as for the wire path.

use std::sync::Arc;

use async_trait::async_trait;
use quizbot_common::BotEventKind;
use tracing::{debug, warn};

use crate::{
    driver::{DriverEvent, DriverFactory, DriverKind, DriverSpec, Established, SessionDriver},
    error::{BotError, HandshakeError, TransportError},
    events::BotEmitter,
    interpreter::{GameEvent, detect_end_phrase},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSignal {
    Question { text: String, choice_count: usize },
    QuestionEnded,
    /// Any other visible text, checked for end-of-game phrases.
    Text(String),
    Closed(String),
}

#[async_trait]
pub trait PageSurface: Send {
    async fn join(&mut self, pin: &str, name: &str) -> Result<(), String>;

    /// Must be cancel-safe.
    async fn next_signal(&mut self) -> PageSignal;

    async fn click_answer(&mut self, choice: usize) -> Result<(), String>;

    /// Pages can die without telling anyone, so this is polled.
    fn is_open(&self) -> bool;

    async fn close(&mut self);
}

#[async_trait]
pub trait SurfaceProvider: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PageSurface>, String>;
}

#[derive(Clone)]
pub struct VisualDriverFactory {
    provider: Arc<dyn SurfaceProvider>,
}

impl VisualDriverFactory {
    pub fn new(provider: Arc<dyn SurfaceProvider>) -> Self {
        Self { provider }
    }
}

impl DriverFactory for VisualDriverFactory {
    fn kind(&self) -> DriverKind {
        DriverKind::Visual
    }

    fn create(&self, spec: &DriverSpec, events: BotEmitter) -> Box<dyn SessionDriver> {
        Box::new(VisualDriver {
            provider: self.provider.clone(),
            spec: spec.clone(),
            events,
            surface: None,
        })
    }
}

pub struct VisualDriver {
    provider: Arc<dyn SurfaceProvider>,
    spec: DriverSpec,
    events: BotEmitter,
    surface: Option<Box<dyn PageSurface>>,
}

#[async_trait]
impl SessionDriver for VisualDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Visual
    }

    async fn establish(&mut self) -> Result<Established, BotError> {
        if let Some(mut stale) = self.surface.take() {
            stale.close().await;
        }

        let mut surface = self
            .provider
            .open()
            .await
            .map_err(|error| BotError::Handshake(HandshakeError::Connect(error)))?;
        if let Err(error) = surface.join(&self.spec.pin, &self.spec.name).await {
            surface.close().await;
            self.events
                .error(BotEventKind::HandshakeFailed, format!("page join failed: {error}"));
            return Err(BotError::Handshake(HandshakeError::Connect(error)));
        }

        debug!(bot_id = %self.spec.bot_id, "joined through page surface");
        self.events
            .info(BotEventKind::LoginSent, format!("joined page as {}", self.spec.name));
        self.surface = Some(surface);
        Ok(Established::default())
    }

    async fn next_event(&mut self) -> DriverEvent {
        let Some(surface) = self.surface.as_mut() else {
            return DriverEvent::Closed(TransportError::Closed("no page".to_string()));
        };
        match surface.next_signal().await {
            PageSignal::Question { text, choice_count } => {
                DriverEvent::Game(GameEvent::Question { text, choice_count })
            }
            PageSignal::QuestionEnded => DriverEvent::Game(GameEvent::QuestionEnded),
            PageSignal::Text(text) => match detect_end_phrase(&text) {
                Some(phrase) => DriverEvent::Game(GameEvent::GameOver {
                    reason: phrase.to_string(),
                }),
                None => DriverEvent::Game(GameEvent::Other),
            },
            PageSignal::Closed(reason) => {
                self.surface = None;
                DriverEvent::Closed(TransportError::Closed(reason))
            }
        }
    }

    async fn submit_answer(&mut self, choice: usize, _lag: u64) -> Result<(), BotError> {
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| BotError::NotActive("no page".to_string()))?;
        surface.click_answer(choice).await.map_err(|error| {
            warn!(bot_id = %self.spec.bot_id, error = %error, "answer click failed");
            BotError::Transport(TransportError::Socket(error))
        })
    }

    fn is_alive(&self) -> bool {
        self.surface.as_ref().is_some_and(|surface| surface.is_open())
    }

    async fn shutdown(&mut self) {
        if let Some(mut surface) = self.surface.take() {
            surface.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSink;
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    };
    use tokio::sync::mpsc;

    struct ScriptedPage {
        signals: mpsc::UnboundedReceiver<PageSignal>,
        open: Arc<AtomicBool>,
        clicks: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl PageSurface for ScriptedPage {
        async fn join(&mut self, _pin: &str, _name: &str) -> Result<(), String> {
            Ok(())
        }

        async fn next_signal(&mut self) -> PageSignal {
            self.signals
                .recv()
                .await
                .unwrap_or_else(|| PageSignal::Closed("script ended".to_string()))
        }

        async fn click_answer(&mut self, choice: usize) -> Result<(), String> {
            self.clicks.lock().unwrap().push(choice);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn close(&mut self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    struct OnePage {
        page: Mutex<Option<ScriptedPage>>,
    }

    #[async_trait]
    impl SurfaceProvider for OnePage {
        async fn open(&self) -> Result<Box<dyn PageSurface>, String> {
            self.page
                .lock()
                .unwrap()
                .take()
                .map(|page| Box::new(page) as Box<dyn PageSurface>)
                .ok_or_else(|| "browser unavailable".to_string())
        }
    }

    fn driver() -> (
        Box<dyn SessionDriver>,
        mpsc::UnboundedSender<PageSignal>,
        Arc<AtomicBool>,
        Arc<Mutex<Vec<usize>>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let clicks = Arc::new(Mutex::new(Vec::new()));
        let provider = OnePage {
            page: Mutex::new(Some(ScriptedPage {
                signals: rx,
                open: open.clone(),
                clicks: clicks.clone(),
            })),
        };
        let factory = VisualDriverFactory::new(Arc::new(provider));
        let spec = DriverSpec {
            bot_id: "bot-v".to_string(),
            name: "Viewer".to_string(),
            pin: "123456".to_string(),
        };
        let driver = factory.create(&spec, EventSink::new(8).for_bot("bot-v"));
        (driver, tx, open, clicks)
    }

    #[tokio::test]
    async fn page_signals_become_game_events() {
        let (mut driver, signals, _open, clicks) = driver();
        assert_eq!(driver.kind(), DriverKind::Visual);
        driver.establish().await.unwrap();

        signals
            .send(PageSignal::Question {
                text: "Capital?".to_string(),
                choice_count: 4,
            })
            .unwrap();
        signals.send(PageSignal::Text("Get ready".to_string())).unwrap();
        signals.send(PageSignal::Text("Thanks for playing!".to_string())).unwrap();

        assert!(matches!(
            driver.next_event().await,
            DriverEvent::Game(GameEvent::Question { choice_count: 4, .. })
        ));
        assert_eq!(driver.next_event().await, DriverEvent::Game(GameEvent::Other));
        assert!(matches!(
            driver.next_event().await,
            DriverEvent::Game(GameEvent::GameOver { .. })
        ));

        driver.submit_answer(2, 15).await.unwrap();
        assert_eq!(*clicks.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn silently_closed_page_is_caught_by_liveness() {
        let (mut driver, _signals, open, _clicks) = driver();
        driver.establish().await.unwrap();
        assert!(driver.is_alive());
        open.store(false, Ordering::SeqCst);
        assert!(!driver.is_alive());
    }

    #[tokio::test]
    async fn unavailable_surface_fails_establish() {
        let (mut driver, _signals, _open, _clicks) = driver();
        driver.establish().await.unwrap();
        driver.shutdown().await;
        let error = driver.establish().await.unwrap_err();
        assert!(matches!(error, BotError::Handshake(HandshakeError::Connect(_))));
    }
}
