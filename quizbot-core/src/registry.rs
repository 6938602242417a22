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

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::Utc;
use quizbot_common::{
    BotEventKind, BotSession, BotState, BotSummary, is_valid_pin, normalize_display_name,
};
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::BotSettings,
    driver::{DriverFactory, DriverSpec},
    error::BotError,
    events::EventSink,
    interpreter::{AnswerPolicy, GameEventInterpreter},
    worker::{BotCommand, BotWorker, BotWorkerHandle, spawn_bot_worker},
};

#[derive(Debug, Clone, Default)]
pub struct BotConfig {
    pub bot_id: Option<String>,
    pub name: String,
    pub pin: String,
}

struct BotEntry {
    session: watch::Receiver<BotSession>,
    /// Held while the session is being established.
    cancel_tx: Option<oneshot::Sender<()>>,
    worker: Option<BotWorkerHandle>,
    generation: u64,
}

impl BotEntry {
    fn is_finished(&self) -> bool {
        self.session.borrow().state.is_terminal()
    }
}

/// Owns every bot in the process. Operations on different bots never wait on
/// each other's network I/O; the map lock is only held for bookkeeping.
pub struct BotRegistry {
    bots: Mutex<HashMap<String, BotEntry>>,
    factory: Arc<dyn DriverFactory>,
    policy: Arc<dyn AnswerPolicy>,
    settings: BotSettings,
    events: EventSink,
    next_generation: AtomicU64,
}

impl BotRegistry {
    pub fn new(factory: Arc<dyn DriverFactory>, settings: BotSettings) -> Self {
        let policy = Arc::new(settings.answer_policy());
        Self::with_policy(factory, policy, settings)
    }

    pub fn with_policy(
        factory: Arc<dyn DriverFactory>,
        policy: Arc<dyn AnswerPolicy>,
        settings: BotSettings,
    ) -> Self {
        let events = EventSink::new(settings.event_buffer);
        Self {
            bots: Mutex::new(HashMap::new()),
            factory,
            policy,
            settings,
            events,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn settings(&self) -> &BotSettings {
        &self.settings
    }

    /// Creates a bot and returns once its session is live.
    pub async fn start(&self, config: BotConfig) -> Result<BotSession, BotError> {
        let name = normalize_display_name(&config.name)
            .ok_or_else(|| {
                BotError::InvalidInput("name must be 1-15 characters after trimming".to_string())
            })?
            .to_string();
        let pin = config.pin.trim().to_string();
        if !is_valid_pin(&pin) {
            return Err(BotError::InvalidInput(format!(
                "invalid game pin {:?}; expected 6-10 digits",
                config.pin
            )));
        }
        let bot_id = config
            .bot_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("bot-{}", Uuid::new_v4()));

        let mut initial = BotSession::new(bot_id.clone(), name.clone(), pin.clone());
        initial.state = BotState::Connecting;
        let (session_tx, session_rx) = watch::channel(initial);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut bots = self.bots.lock().await;
            if bots.len() >= self.settings.max_bots {
                let before = bots.len();
                bots.retain(|_, entry| !entry.is_finished());
                let evicted = before - bots.len();
                if evicted > 0 {
                    debug!(evicted, "finished bots evicted to make room");
                }
            }
            if bots.get(&bot_id).is_some_and(BotEntry::is_finished) {
                bots.remove(&bot_id);
            }
            if bots.contains_key(&bot_id) {
                return Err(BotError::Capacity(format!("bot {bot_id} already exists")));
            }
            let running = bots.values().filter(|entry| !entry.is_finished()).count();
            if running >= self.settings.max_bots {
                return Err(BotError::Capacity(format!(
                    "bot limit of {} reached",
                    self.settings.max_bots
                )));
            }
            bots.insert(
                bot_id.clone(),
                BotEntry {
                    session: session_rx,
                    cancel_tx: Some(cancel_tx),
                    worker: None,
                    generation,
                },
            );
        }

        let emitter = self.events.for_bot(&bot_id);
        info!(bot_id = %bot_id, name = %name, pin = %pin, driver = self.factory.kind().as_str(), "starting bot");
        emitter.info(BotEventKind::Starting, format!("starting {name} for game {pin}"));

        let spec = DriverSpec {
            bot_id: bot_id.clone(),
            name,
            pin,
        };
        let mut driver = self.factory.create(&spec, emitter.clone());
        let outcome = tokio::select! {
            biased;
            _ = cancel_rx => None,
            outcome = driver.establish() => Some(outcome),
        };
        let established = match outcome {
            None => {
                info!(bot_id = %bot_id, "bot stopped while connecting");
                driver.shutdown().await;
                return Err(BotError::Cancelled(bot_id));
            }
            Some(Ok(established)) => established,
            Some(Err(error)) => {
                warn!(bot_id = %bot_id, error = %error, kind = error.kind(), "bot failed to start");
                driver.shutdown().await;
                let mut bots = self.bots.lock().await;
                if bots.get(&bot_id).is_some_and(|entry| entry.generation == generation) {
                    bots.remove(&bot_id);
                }
                return Err(error);
            }
        };

        session_tx.send_modify(|session| {
            session.state = BotState::Active;
            if let Some(client_id) = established.client_id.as_deref() {
                session.assign_client_id(client_id);
            }
            session.touch();
        });
        let snapshot = session_tx.borrow().clone();
        emitter.info(BotEventKind::Active, "bot is active");

        let worker = BotWorker::new(
            driver,
            GameEventInterpreter::new(self.policy.clone()),
            session_tx,
            emitter,
            &self.settings,
        );
        let handle = spawn_bot_worker(worker);

        let orphaned = {
            let mut bots = self.bots.lock().await;
            match bots.get_mut(&bot_id) {
                Some(entry) if entry.generation == generation => {
                    entry.cancel_tx = None;
                    entry.worker = Some(handle);
                    None
                }
                _ => Some(handle),
            }
        };
        match orphaned {
            None => Ok(snapshot),
            Some(mut handle) => {
                // Stopped between establishing and attaching the worker.
                handle.signal_stop();
                let _ = handle.join.await;
                Err(BotError::Cancelled(bot_id))
            }
        }
    }

    /// Stops and forgets a bot. Waits for the worker to say goodbye, up to the
    /// configured stop timeout.
    pub async fn stop(&self, bot_id: &str) -> Result<BotSession, BotError> {
        let entry = self
            .bots
            .lock()
            .await
            .remove(bot_id)
            .ok_or_else(|| BotError::NotFound(bot_id.to_string()))?;

        if let Some(cancel_tx) = entry.cancel_tx {
            let _ = cancel_tx.send(());
        }
        if let Some(mut worker) = entry.worker {
            worker.signal_stop();
            let timeout = self.settings.stop_timeout();
            if tokio::time::timeout(timeout, &mut worker.join).await.is_err() {
                warn!(bot_id = %bot_id, timeout_ms = timeout.as_millis() as u64, "bot worker did not stop in time; aborting");
                worker.join.abort();
            }
        }

        let mut session = entry.session.borrow().clone();
        if !session.state.is_terminal() {
            session.state = BotState::Stopped;
            session.client_id = None;
            self.events
                .for_bot(bot_id)
                .info(BotEventKind::Stopped, "stopped before becoming active");
        }
        info!(bot_id = %bot_id, state = session.state.as_str(), "bot stopped");
        Ok(session)
    }

    pub async fn status(&self, bot_id: &str) -> Result<BotSession, BotError> {
        self.bots
            .lock()
            .await
            .get(bot_id)
            .map(|entry| entry.session.borrow().clone())
            .ok_or_else(|| BotError::NotFound(bot_id.to_string()))
    }

    pub async fn list(&self) -> Vec<BotSummary> {
        let now = Utc::now();
        let mut summaries: Vec<BotSummary> = self
            .bots
            .lock()
            .await
            .values()
            .map(|entry| entry.session.borrow().summary(now))
            .collect();
        summaries.sort_by(|left, right| left.bot_id.cmp(&right.bot_id));
        summaries
    }

    pub async fn count(&self) -> usize {
        self.bots.lock().await.len()
    }

    /// Answers the bot's open question immediately. Returns the question
    /// index that was answered.
    pub async fn answer(&self, bot_id: &str, choice: usize) -> Result<u64, BotError> {
        let (reply, reply_rx) = oneshot::channel();
        {
            let bots = self.bots.lock().await;
            let entry = bots
                .get(bot_id)
                .ok_or_else(|| BotError::NotFound(bot_id.to_string()))?;
            let worker = entry
                .worker
                .as_ref()
                .ok_or_else(|| BotError::NotActive("bot is still connecting".to_string()))?;
            worker
                .command_tx
                .send(BotCommand::Answer { choice, reply })
                .map_err(|_| BotError::NotActive("bot is no longer running".to_string()))?;
        }
        reply_rx
            .await
            .map_err(|_| BotError::NotActive("bot is no longer running".to_string()))?
    }

    /// Stops every bot; used on process shutdown.
    pub async fn shutdown_all(&self) -> usize {
        let ids: Vec<String> = self.bots.lock().await.keys().cloned().collect();
        let total = ids.len();
        let stops = ids.iter().map(|bot_id| self.stop(bot_id));
        let stopped = futures::future::join_all(stops)
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count();
        info!(total, stopped, "all bots stopped");
        stopped
    }
}
