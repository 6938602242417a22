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

use std::{sync::Arc, time::Duration};

use quizbot_common::ProtocolMessage;
use rand::Rng;
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_CHOICE_COUNT: usize = 4;
pub const MIN_LAG: u64 = 10;
pub const MAX_LAG: u64 = 40;

/// Lowercase phrases shown when a game is over or the player was removed.
pub const END_OF_GAME_PHRASES: [&str; 8] = [
    "game over",
    "thanks for playing",
    "quiz is over",
    "this game has ended",
    "podium",
    "you were kicked",
    "removed from the game",
    "game does not exist",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    LoginAccepted,
    QuizStarted,
    Question { text: String, choice_count: usize },
    QuestionEnded,
    GameOver { reason: String },
    Kicked { reason: String },
    Status { status: String },
    Other,
}

pub fn detect_end_phrase(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    END_OF_GAME_PHRASES
        .into_iter()
        .find(|phrase| lowered.contains(phrase))
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn choice_count(value: &Value) -> usize {
    if let Some(choices) = value.get("choices").and_then(Value::as_array) {
        return choices.len();
    }
    if let Some(count) = ["numberOfChoices", "numberOfAnswersAllowed"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_u64))
    {
        return count as usize;
    }
    if let Some(map) = value.get("answerMap").and_then(Value::as_object) {
        return map.len();
    }
    let index = value.get("questionIndex").and_then(Value::as_u64).unwrap_or(0) as usize;
    value
        .get("quizQuestionAnswers")
        .and_then(Value::as_array)
        .and_then(|answers| answers.get(index))
        .and_then(Value::as_u64)
        .map_or(0, |count| count as usize)
}

fn question_from(value: &Value) -> GameEvent {
    GameEvent::Question {
        text: string_field(value, &["question", "title", "text"]).unwrap_or_default(),
        choice_count: choice_count(value),
    }
}

/// Vendor numbered messages: `{type:"message", id, content:"<json>"}`.
fn classify_numbered(id: u64, content: &Value) -> GameEvent {
    match id {
        2 => question_from(content),
        8 => GameEvent::QuestionEnded,
        3 | 13 => GameEvent::GameOver {
            reason: format!("game over (message {id})"),
        },
        10 => GameEvent::Kicked {
            reason: string_field(content, &["kickCode", "reason"])
                .or_else(|| content.get("kickCode").map(Value::to_string))
                .unwrap_or_else(|| "removed by host".to_string()),
        },
        14 => GameEvent::LoginAccepted,
        9 => GameEvent::QuizStarted,
        _ => GameEvent::Other,
    }
}

pub fn classify(message: &ProtocolMessage) -> GameEvent {
    let Some(data) = message.data.as_ref() else {
        return GameEvent::Other;
    };
    let Some(kind) = data.get("type").and_then(Value::as_str) else {
        return GameEvent::Other;
    };

    match kind {
        "message" => {
            let Some(id) = data.get("id").and_then(Value::as_u64) else {
                return GameEvent::Other;
            };
            let content = match data.get("content") {
                Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(Value::Null),
                Some(other) => other.clone(),
                None => Value::Null,
            };
            classify_numbered(id, &content)
        }
        "question" => question_from(data),
        "questionEnd" | "question_end" | "timeUp" => GameEvent::QuestionEnded,
        "gameOver" | "game_over" | "quizEnd" | "quiz_result" | "finish" => GameEvent::GameOver {
            reason: kind.to_string(),
        },
        "kicked" | "kick" => GameEvent::Kicked {
            reason: string_field(data, &["reason", "message"]).unwrap_or_else(|| kind.to_string()),
        },
        "loginResponse" | "loginOk" => GameEvent::LoginAccepted,
        "startQuiz" | "quizStart" => GameEvent::QuizStarted,
        "status" => GameEvent::Status {
            status: string_field(data, &["status"]).unwrap_or_default(),
        },
        _ => {
            if let Some(phrase) = string_field(data, &["message", "text"])
                .as_deref()
                .and_then(detect_end_phrase)
            {
                return GameEvent::GameOver {
                    reason: phrase.to_string(),
                };
            }
            GameEvent::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerPlan {
    pub question_index: u64,
    pub choice: usize,
    pub delay: Duration,
    pub lag: u64,
}

pub trait AnswerPolicy: Send + Sync {
    fn plan(&self, question_index: u64, choice_count: usize) -> AnswerPlan;
}

/// Uniform choice after a uniform human-looking delay.
#[derive(Debug, Clone)]
pub struct RandomDelayPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RandomDelayPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(6000),
        }
    }
}

impl AnswerPolicy for RandomDelayPolicy {
    fn plan(&self, question_index: u64, choice_count: usize) -> AnswerPlan {
        let mut rng = rand::rng();
        let choices = if choice_count == 0 { DEFAULT_CHOICE_COUNT } else { choice_count };
        let min_ms = self.min_delay.as_millis() as u64;
        let max_ms = (self.max_delay.as_millis() as u64).max(min_ms);
        AnswerPlan {
            question_index,
            choice: rng.random_range(0..choices),
            delay: Duration::from_millis(rng.random_range(min_ms..=max_ms)),
            lag: rng.random_range(MIN_LAG..MAX_LAG),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    None,
    Answer(AnswerPlan),
    CloseQuestion,
    Stop(String),
}

/// Per-bot game state. Survives reconnects so question numbering stays
/// continuous in logs.
pub struct GameEventInterpreter {
    policy: Arc<dyn AnswerPolicy>,
    question_index: u64,
    last_question: Option<String>,
    question_open: bool,
    answered_for: Option<u64>,
}

impl GameEventInterpreter {
    pub fn new(policy: Arc<dyn AnswerPolicy>) -> Self {
        Self {
            policy,
            question_index: 0,
            last_question: None,
            question_open: false,
            answered_for: None,
        }
    }

    pub fn question_index(&self) -> u64 {
        self.question_index
    }

    pub fn last_question(&self) -> Option<&str> {
        self.last_question.as_deref()
    }

    pub fn on_event(&mut self, event: &GameEvent) -> Reaction {
        match event {
            GameEvent::Question { text, choice_count } => {
                self.question_index += 1;
                self.last_question = Some(text.clone());
                self.question_open = true;
                debug!(question_index = self.question_index, choice_count, "question opened");
                Reaction::Answer(self.policy.plan(self.question_index, *choice_count))
            }
            GameEvent::QuestionEnded => {
                self.question_open = false;
                Reaction::CloseQuestion
            }
            GameEvent::GameOver { reason } | GameEvent::Kicked { reason } => {
                self.question_open = false;
                Reaction::Stop(reason.clone())
            }
            _ => Reaction::None,
        }
    }

    /// Whether an answer for `question_index` may still go out.
    pub fn question_open(&self, question_index: u64) -> bool {
        self.question_open
            && self.question_index == question_index
            && self.answered_for != Some(question_index)
    }

    /// The currently open question, if it has not been answered yet.
    pub fn open_question(&self) -> Option<u64> {
        self.question_open(self.question_index)
            .then_some(self.question_index)
    }

    pub fn record_answer(&mut self, question_index: u64) {
        self.answered_for = Some(question_index);
    }

    /// A dropped connection closes whatever question was open.
    pub fn connection_lost(&mut self) {
        self.question_open = false;
    }
}
