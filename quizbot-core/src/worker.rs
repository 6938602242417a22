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

//! One supervisor task per bot: reacts to game events, schedules answers,
//! watches liveness and reconnects with backoff.

use std::{pin::Pin, time::Duration};

use quizbot_common::{BotEventKind, BotSession, BotState};
use rand::Rng;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, Sleep},
};
use tracing::{debug, info, warn};

use crate::{
    config::{BotSettings, ReconnectPolicy},
    driver::{DriverEvent, SessionDriver},
    error::{BotError, TransportError},
    events::BotEmitter,
    interpreter::{AnswerPlan, GameEvent, GameEventInterpreter, MAX_LAG, MIN_LAG, Reaction},
};

#[derive(Debug)]
pub enum BotCommand {
    /// Answer the open question now. Replies with the answered question index.
    Answer {
        choice: usize,
        reply: oneshot::Sender<Result<u64, BotError>>,
    },
}

pub struct BotWorkerHandle {
    pub stop_tx: Option<oneshot::Sender<()>>,
    pub command_tx: mpsc::UnboundedSender<BotCommand>,
    pub join: JoinHandle<()>,
}

impl BotWorkerHandle {
    /// Signals the worker to stop. Returns false when it already exited or
    /// was signalled before.
    pub fn signal_stop(&mut self) -> bool {
        self.stop_tx
            .take()
            .is_some_and(|stop_tx| stop_tx.send(()).is_ok())
    }
}

struct PendingAnswer {
    plan: AnswerPlan,
    timer: Pin<Box<Sleep>>,
}

pub struct BotWorker {
    driver: Box<dyn SessionDriver>,
    interpreter: GameEventInterpreter,
    session: watch::Sender<BotSession>,
    events: BotEmitter,
    reconnect: ReconnectPolicy,
    watchdog_interval: Duration,
    pending: Option<PendingAnswer>,
}

pub fn spawn_bot_worker(worker: BotWorker) -> BotWorkerHandle {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let (command_tx, command_rx) = mpsc::unbounded_channel::<BotCommand>();
    let join = tokio::spawn(run_bot_worker(worker, stop_rx, command_rx));

    BotWorkerHandle {
        stop_tx: Some(stop_tx),
        command_tx,
        join,
    }
}

async fn run_bot_worker(
    mut worker: BotWorker,
    mut stop_rx: oneshot::Receiver<()>,
    mut command_rx: mpsc::UnboundedReceiver<BotCommand>,
) {
    info!(
        bot_id = %worker.events.bot_id(),
        driver = worker.driver.kind().as_str(),
        "bot worker started"
    );

    let period = worker.watchdog_interval;
    let mut watchdog = tokio::time::interval_at(Instant::now() + period, period);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let lost = loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => {
                    info!(bot_id = %worker.events.bot_id(), "bot worker received stop signal");
                    worker.finish(BotEventKind::Stopped, "stopped on request".to_string()).await;
                    return;
                }
                Some(command) = command_rx.recv() => {
                    worker.on_command(command).await;
                }
                _ = answer_due(&mut worker.pending) => {
                    worker.fire_answer().await;
                }
                event = worker.driver.next_event() => match event {
                    DriverEvent::Game(event) => {
                        if !worker.on_game_event(event).await {
                            return;
                        }
                    }
                    DriverEvent::Closed(error) => break error,
                },
                _ = watchdog.tick() => {
                    if !worker.driver.is_alive() {
                        warn!(bot_id = %worker.events.bot_id(), "watchdog found a dead session");
                        break TransportError::Unresponsive;
                    }
                }
            }
        };

        if !worker.reconnect(lost, &mut stop_rx, &mut command_rx).await {
            return;
        }
        watchdog.reset();
    }
}

fn refuse_while_reconnecting(command: BotCommand) {
    match command {
        BotCommand::Answer { reply, .. } => {
            let _ = reply.send(Err(BotError::NotActive("bot is reconnecting".to_string())));
        }
    }
}

/// Resolves when the scheduled answer is due; never resolves without one.
async fn answer_due(pending: &mut Option<PendingAnswer>) {
    match pending {
        Some(pending) => pending.timer.as_mut().await,
        None => std::future::pending().await,
    }
}

impl BotWorker {
    pub fn new(
        driver: Box<dyn SessionDriver>,
        interpreter: GameEventInterpreter,
        session: watch::Sender<BotSession>,
        events: BotEmitter,
        settings: &BotSettings,
    ) -> Self {
        Self {
            driver,
            interpreter,
            session,
            events,
            reconnect: settings.reconnect_policy(),
            watchdog_interval: settings.watchdog_interval(),
            pending: None,
        }
    }

    fn state(&self) -> BotState {
        self.session.borrow().state
    }

    fn discard_pending(&mut self, why: &str) {
        if let Some(pending) = self.pending.take() {
            let question_index = pending.plan.question_index;
            debug!(bot_id = %self.events.bot_id(), question_index, why, "scheduled answer discarded");
            self.events.info(
                BotEventKind::AnswerDiscarded { question_index },
                format!("answer for question {question_index} discarded: {why}"),
            );
        }
    }

    /// Terminal stop: no answer may leave after this.
    async fn finish(&mut self, kind: BotEventKind, message: String) {
        self.discard_pending("bot stopping");
        self.driver.shutdown().await;
        self.session.send_modify(|session| {
            session.state = BotState::Stopped;
            session.client_id = None;
            session.touch();
        });
        self.events.info(kind, message);
    }

    /// Returns false once the game is over for this bot.
    async fn on_game_event(&mut self, event: GameEvent) -> bool {
        self.session.send_modify(BotSession::touch);
        match self.interpreter.on_event(&event) {
            Reaction::Answer(plan) => {
                self.discard_pending("superseded by a newer question");
                let question_index = plan.question_index;
                let last_question = self.interpreter.last_question().map(str::to_string);
                self.session.send_modify(|session| {
                    session.question_index = question_index;
                    session.last_question = last_question;
                    session.last_answer = None;
                });
                self.events.info(
                    BotEventKind::QuestionDetected { question_index },
                    format!(
                        "question {question_index} detected, answering in {}ms",
                        plan.delay.as_millis()
                    ),
                );
                self.pending = Some(PendingAnswer {
                    timer: Box::pin(tokio::time::sleep(plan.delay)),
                    plan,
                });
                true
            }
            Reaction::CloseQuestion => {
                self.discard_pending("question closed");
                true
            }
            Reaction::Stop(reason) => {
                info!(bot_id = %self.events.bot_id(), reason = %reason, "game ended for bot");
                self.finish(BotEventKind::GameEnded, format!("game ended: {reason}"))
                    .await;
                false
            }
            Reaction::None => {
                match event {
                    GameEvent::LoginAccepted => {
                        debug!(bot_id = %self.events.bot_id(), "login accepted")
                    }
                    GameEvent::Status { status } => {
                        debug!(bot_id = %self.events.bot_id(), status = %status, "status update")
                    }
                    _ => {}
                }
                true
            }
        }
    }

    async fn fire_answer(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let plan = pending.plan;
        if self.state() != BotState::Active || !self.interpreter.question_open(plan.question_index) {
            self.events.info(
                BotEventKind::AnswerDiscarded {
                    question_index: plan.question_index,
                },
                format!("question {} is no longer open", plan.question_index),
            );
            return;
        }
        if let Err(error) = self.submit(plan.question_index, plan.choice, plan.lag).await {
            warn!(
                bot_id = %self.events.bot_id(),
                question_index = plan.question_index,
                error = %error,
                "scheduled answer could not be sent"
            );
        }
    }

    async fn submit(&mut self, question_index: u64, choice: usize, lag: u64) -> Result<(), BotError> {
        self.driver.submit_answer(choice, lag).await?;
        self.interpreter.record_answer(question_index);
        self.session.send_modify(|session| {
            session.last_answer = Some(choice);
            session.touch();
        });
        self.events.info(
            BotEventKind::AnswerSent {
                question_index,
                choice,
            },
            format!("answered question {question_index} with choice {choice}"),
        );
        Ok(())
    }

    async fn on_command(&mut self, command: BotCommand) {
        match command {
            BotCommand::Answer { choice, reply } => {
                let result = self.answer_now(choice).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn answer_now(&mut self, choice: usize) -> Result<u64, BotError> {
        if self.state() != BotState::Active {
            return Err(BotError::NotActive(format!("bot is {}", self.state().as_str())));
        }
        let question_index = self
            .interpreter
            .open_question()
            .ok_or_else(|| BotError::NotActive("no open question".to_string()))?;
        self.discard_pending("answered manually");
        let lag = rand::rng().random_range(MIN_LAG..MAX_LAG);
        self.submit(question_index, choice, lag).await?;
        Ok(question_index)
    }

    /// Returns true once a fresh session is live again.
    async fn reconnect(
        &mut self,
        cause: TransportError,
        stop_rx: &mut oneshot::Receiver<()>,
        command_rx: &mut mpsc::UnboundedReceiver<BotCommand>,
    ) -> bool {
        self.discard_pending("connection lost");
        self.interpreter.connection_lost();
        self.session.send_modify(|session| {
            session.clear_connection();
            session.state = BotState::Reconnecting;
            session.touch();
        });
        warn!(bot_id = %self.events.bot_id(), cause = %cause, "bot connection lost");
        self.events
            .warn(BotEventKind::ConnectionLost, format!("connection lost: {cause}"));

        let policy = self.reconnect;
        let mut last_error = cause.to_string();
        let mut attempts_made = 0;
        for attempt in 1..=policy.max_attempts {
            attempts_made = attempt;
            let delay = policy.delay_for(attempt);
            self.session
                .send_modify(|session| session.reconnect_attempts = attempt);
            self.events.warn(
                BotEventKind::ReconnectAttempt {
                    attempt,
                    max_attempts: policy.max_attempts,
                    delay_ms: delay.as_millis() as u64,
                },
                format!(
                    "reconnect attempt {attempt}/{} in {}ms",
                    policy.max_attempts,
                    delay.as_millis()
                ),
            );

            let backoff = tokio::time::sleep(delay);
            tokio::pin!(backoff);
            let outcome = loop {
                tokio::select! {
                    biased;
                    _ = &mut *stop_rx => break None,
                    Some(command) = command_rx.recv() => refuse_while_reconnecting(command),
                    _ = &mut backoff => break Some(()),
                }
            };
            if outcome.is_none() {
                self.finish(BotEventKind::Stopped, "stopped while reconnecting".to_string()).await;
                return false;
            }

            let outcome = {
                let establish = self.driver.establish();
                tokio::pin!(establish);
                loop {
                    tokio::select! {
                        biased;
                        _ = &mut *stop_rx => break None,
                        Some(command) = command_rx.recv() => refuse_while_reconnecting(command),
                        outcome = &mut establish => break Some(outcome),
                    }
                }
            };
            let Some(outcome) = outcome else {
                self.finish(BotEventKind::Stopped, "stopped while reconnecting".to_string()).await;
                return false;
            };

            match outcome {
                Ok(established) => {
                    self.session.send_modify(|session| {
                        session.state = BotState::Active;
                        session.reconnect_attempts = 0;
                        if let Some(client_id) = established.client_id.as_deref() {
                            session.assign_client_id(client_id);
                        }
                        session.touch();
                    });
                    info!(bot_id = %self.events.bot_id(), attempt, "bot reconnected");
                    self.events.info(
                        BotEventKind::Reconnected,
                        format!("reconnected on attempt {attempt}"),
                    );
                    return true;
                }
                Err(error) => {
                    warn!(
                        bot_id = %self.events.bot_id(),
                        attempt,
                        error = %error,
                        kind = error.kind(),
                        "reconnect attempt failed"
                    );
                    last_error = error.to_string();
                    if !error.is_retryable() {
                        break;
                    }
                }
            }
        }

        let reason = format!("reconnect failed after {attempts_made} attempt(s): {last_error}");
        self.driver.shutdown().await;
        self.session.send_modify(|session| {
            session.state = BotState::Failed;
            session.failure_reason = Some(reason.clone());
            session.touch();
        });
        self.events.error(BotEventKind::Fatal, reason);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        driver::{DriverKind, Established},
        error::ChallengeError,
        events::EventSink,
        interpreter::AnswerPolicy,
    };
    use async_trait::async_trait;
    use quizbot_common::BotEvent;
    use std::{
        collections::VecDeque,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };
    use tokio::sync::broadcast;

    struct FixedPolicy {
        delay: Duration,
    }

    impl AnswerPolicy for FixedPolicy {
        fn plan(&self, question_index: u64, _choice_count: usize) -> AnswerPlan {
            AnswerPlan {
                question_index,
                choice: 1,
                delay: self.delay,
                lag: 12,
            }
        }
    }

    #[derive(Clone, Default)]
    struct DriverLog {
        answers: Arc<Mutex<Vec<usize>>>,
        establish_results: Arc<Mutex<VecDeque<Result<Established, BotError>>>>,
        dead: Arc<AtomicBool>,
        establishes: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
    }

    struct ScriptedDriver {
        events: mpsc::UnboundedReceiver<DriverEvent>,
        log: DriverLog,
    }

    #[async_trait]
    impl SessionDriver for ScriptedDriver {
        fn kind(&self) -> DriverKind {
            DriverKind::Wire
        }

        async fn establish(&mut self) -> Result<Established, BotError> {
            self.log.establishes.fetch_add(1, Ordering::SeqCst);
            self.log.dead.store(false, Ordering::SeqCst);
            self.log
                .establish_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BotError::Transport(TransportError::Closed("refused".to_string()))))
        }

        async fn next_event(&mut self) -> DriverEvent {
            match self.events.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }

        async fn submit_answer(&mut self, choice: usize, _lag: u64) -> Result<(), BotError> {
            self.log.answers.lock().unwrap().push(choice);
            Ok(())
        }

        fn is_alive(&self) -> bool {
            !self.log.dead.load(Ordering::SeqCst)
        }

        async fn shutdown(&mut self) {
            self.log.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        handle: BotWorkerHandle,
        script: mpsc::UnboundedSender<DriverEvent>,
        session: watch::Receiver<BotSession>,
        events: broadcast::Receiver<BotEvent>,
        log: DriverLog,
    }

    impl Harness {
        fn kinds(&mut self) -> Vec<BotEventKind> {
            let mut kinds = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                kinds.push(event.kind);
            }
            kinds
        }
    }

    fn start(answer_delay: Duration) -> Harness {
        let mut settings = BotSettings::default();
        settings.watchdog_interval_ms = 1_000;
        let sink = EventSink::new(64);
        let events = sink.subscribe();
        let (script, script_rx) = mpsc::unbounded_channel();
        let log = DriverLog::default();
        let driver = ScriptedDriver {
            events: script_rx,
            log: log.clone(),
        };
        let mut initial = BotSession::new("bot-w", "Worker", "123456");
        initial.state = BotState::Active;
        let (session_tx, session) = watch::channel(initial);
        let worker = BotWorker::new(
            Box::new(driver),
            GameEventInterpreter::new(Arc::new(FixedPolicy { delay: answer_delay })),
            session_tx,
            sink.for_bot("bot-w"),
            &settings,
        );
        Harness {
            handle: spawn_bot_worker(worker),
            script,
            session,
            events,
            log,
        }
    }

    fn question() -> DriverEvent {
        DriverEvent::Game(GameEvent::Question {
            text: "Which?".to_string(),
            choice_count: 4,
        })
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn question_is_answered_after_the_planned_delay() {
        let mut harness = start(Duration::from_millis(100));
        harness.script.send(question()).unwrap();

        settle(50).await;
        assert!(harness.log.answers.lock().unwrap().is_empty());
        assert_eq!(harness.session.borrow().question_index, 1);

        settle(100).await;
        assert_eq!(*harness.log.answers.lock().unwrap(), vec![1]);
        assert_eq!(harness.session.borrow().last_answer, Some(1));
        let kinds = harness.kinds();
        assert!(kinds.contains(&BotEventKind::QuestionDetected { question_index: 1 }));
        assert!(kinds.contains(&BotEventKind::AnswerSent {
            question_index: 1,
            choice: 1
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_question_discards_the_scheduled_answer() {
        let mut harness = start(Duration::from_millis(300));
        harness.script.send(question()).unwrap();
        harness
            .script
            .send(DriverEvent::Game(GameEvent::QuestionEnded))
            .unwrap();

        settle(1_000).await;
        assert!(harness.log.answers.lock().unwrap().is_empty());
        assert!(
            harness
                .kinds()
                .contains(&BotEventKind::AnswerDiscarded { question_index: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_answer_delay_sends_nothing() {
        let mut harness = start(Duration::from_millis(500));
        harness.script.send(question()).unwrap();
        settle(100).await;

        assert!(harness.handle.signal_stop());
        (&mut harness.handle.join).await.unwrap();
        settle(1_000).await;

        assert!(harness.log.answers.lock().unwrap().is_empty());
        assert_eq!(harness.log.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(harness.session.borrow().state, BotState::Stopped);
        assert!(!harness.handle.signal_stop());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_answer_replaces_the_scheduled_one() {
        let harness = start(Duration::from_secs(10));
        harness.script.send(question()).unwrap();
        settle(10).await;

        let (reply, reply_rx) = oneshot::channel();
        harness
            .handle
            .command_tx
            .send(BotCommand::Answer { choice: 3, reply })
            .unwrap();
        assert_eq!(reply_rx.await.unwrap().unwrap(), 1);

        settle(20_000).await;
        assert_eq!(*harness.log.answers.lock().unwrap(), vec![3]);

        let (reply, reply_rx) = oneshot::channel();
        harness
            .handle
            .command_tx
            .send(BotCommand::Answer { choice: 0, reply })
            .unwrap();
        assert!(matches!(reply_rx.await.unwrap(), Err(BotError::NotActive(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn game_over_stops_the_worker() {
        let mut harness = start(Duration::from_millis(100));
        harness
            .script
            .send(DriverEvent::Game(GameEvent::GameOver {
                reason: "podium".to_string(),
            }))
            .unwrap();

        (&mut harness.handle.join).await.unwrap();
        assert_eq!(harness.session.borrow().state, BotState::Stopped);
        assert!(harness.kinds().contains(&BotEventKind::GameEnded));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_recovers_a_silently_dead_session() {
        let mut harness = start(Duration::from_millis(100));
        harness
            .log
            .establish_results
            .lock()
            .unwrap()
            .push_back(Ok(Established {
                client_id: Some("client-2".to_string()),
            }));
        harness.log.dead.store(true, Ordering::SeqCst);

        settle(5_000).await;
        {
            let session = harness.session.borrow();
            assert_eq!(session.state, BotState::Active);
            assert_eq!(session.reconnect_attempts, 0);
            assert_eq!(session.client_id.as_deref(), Some("client-2"));
        }
        let kinds = harness.kinds();
        assert!(kinds.contains(&BotEventKind::ConnectionLost));
        assert!(kinds.contains(&BotEventKind::Reconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_mark_the_bot_failed() {
        let mut harness = start(Duration::from_millis(100));
        harness
            .script
            .send(DriverEvent::Closed(TransportError::Closed("reset".to_string())))
            .unwrap();

        (&mut harness.handle.join).await.unwrap();
        let session = harness.session.borrow().clone();
        assert_eq!(session.state, BotState::Failed);
        assert_eq!(session.reconnect_attempts, 3);
        assert!(session.failure_reason.unwrap().contains("refused"));

        let delays: Vec<u64> = harness
            .kinds()
            .into_iter()
            .filter_map(|kind| match kind {
                BotEventKind::ReconnectAttempt { delay_ms, .. } => Some(delay_ms),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![2_000, 4_000, 6_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_reconnect_error_fails_without_retrying() {
        let mut harness = start(Duration::from_millis(100));
        harness
            .log
            .establish_results
            .lock()
            .unwrap()
            .push_back(Err(BotError::from(ChallengeError::MessageNotFound)));
        harness
            .script
            .send(DriverEvent::Closed(TransportError::Closed("reset".to_string())))
            .unwrap();

        (&mut harness.handle.join).await.unwrap();
        let session = harness.session.borrow().clone();
        assert_eq!(session.state, BotState::Failed);
        assert_eq!(session.reconnect_attempts, 1);
        assert!(
            session
                .failure_reason
                .unwrap()
                .contains("after 1 attempt(s): challenge scheme")
        );
        assert_eq!(harness.log.establishes.load(Ordering::SeqCst), 1);
        let attempts = harness
            .kinds()
            .into_iter()
            .filter(|kind| matches!(kind, BotEventKind::ReconnectAttempt { .. }))
            .count();
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_refused_promptly_while_reconnecting() {
        let harness = start(Duration::from_millis(100));
        harness
            .log
            .establish_results
            .lock()
            .unwrap()
            .push_back(Ok(Established {
                client_id: Some("client-2".to_string()),
            }));
        harness
            .script
            .send(DriverEvent::Closed(TransportError::Closed("reset".to_string())))
            .unwrap();
        settle(10).await;
        assert_eq!(harness.session.borrow().state, BotState::Reconnecting);

        let asked_at = Instant::now();
        let (reply, reply_rx) = oneshot::channel();
        harness
            .handle
            .command_tx
            .send(BotCommand::Answer { choice: 0, reply })
            .unwrap();
        assert!(matches!(reply_rx.await.unwrap(), Err(BotError::NotActive(_))));
        assert!(asked_at.elapsed() < Duration::from_millis(100));

        settle(3_000).await;
        assert_eq!(harness.session.borrow().state, BotState::Active);
        assert_eq!(harness.log.establishes.load(Ordering::SeqCst), 1);
    }
}
