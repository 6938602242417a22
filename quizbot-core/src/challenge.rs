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

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::{arith, error::ChallengeError};

pub const DEFAULT_OFFSET: f64 = 18150.0;
pub const FALLBACK_OFFSETS: [f64; 5] = [18150.0, 16050.0, 17150.0, 19200.0, 20250.0];
pub const MIN_TOKEN_CHARS: usize = 10;

/// Call shapes the encoded literal has been observed in, newest first.
static MESSAGE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"decode\.call\(this,\s*'([^']+)'",
        r#"decode\.call\(this,\s*"([^"]+)""#,
        r"decode\s*\(\s*'([^']+)'\s*\)",
        r#"decode\s*\(\s*"([^"]+)"\s*\)"#,
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("challenge message pattern is a valid regex"))
    .collect()
});

static OFFSET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"var\s+offset\s*=\s*([^;]+);").expect("offset pattern is a valid regex")
});

/// A per-character transform. The vendor changes it between releases, so
/// schemes are versioned and swappable.
pub trait DecodeScheme: Send + Sync {
    fn version(&self) -> &str;

    fn decode(&self, message: &str, offset: f64) -> String;
}

/// `floor(((code * (i + 1) + offset) mod 77) + 48)`, with anything outside
/// printable ASCII replaced by `X`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModularScheme;

impl ModularScheme {
    const MODULUS: f64 = 77.0;
    const BASE: f64 = 48.0;
    const SENTINEL: char = 'X';
}

impl DecodeScheme for ModularScheme {
    fn version(&self) -> &str {
        "v1"
    }

    fn decode(&self, message: &str, offset: f64) -> String {
        message
            .chars()
            .enumerate()
            .map(|(index, ch)| {
                let code = f64::from(u32::from(ch));
                let position = (index + 1) as f64;
                let value = (((code * position + offset) % Self::MODULUS) + Self::BASE).floor();
                if value.is_finite() && (32.0..=126.0).contains(&value) {
                    char::from(value as u8)
                } else {
                    Self::SENTINEL
                }
            })
            .collect()
    }
}

/// Result of a successful solve, kept for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct SolvedChallenge {
    pub token: String,
    pub offset: f64,
    pub scheme: String,
    pub plausible: bool,
}

#[derive(Clone)]
pub struct ChallengeSolver {
    scheme: Arc<dyn DecodeScheme>,
    default_offset: f64,
    fallback_offsets: Vec<f64>,
}

impl Default for ChallengeSolver {
    fn default() -> Self {
        Self::new(Arc::new(ModularScheme))
    }
}

impl ChallengeSolver {
    pub fn new(scheme: Arc<dyn DecodeScheme>) -> Self {
        Self {
            scheme,
            default_offset: DEFAULT_OFFSET,
            fallback_offsets: FALLBACK_OFFSETS.to_vec(),
        }
    }

    pub fn with_offsets(mut self, default_offset: f64, fallback_offsets: Vec<f64>) -> Self {
        self.default_offset = default_offset;
        self.fallback_offsets = fallback_offsets;
        self
    }

    pub fn scheme_version(&self) -> &str {
        self.scheme.version()
    }

    pub fn solve(&self, raw_challenge: &str) -> Result<String, ChallengeError> {
        self.solve_detailed(raw_challenge).map(|solved| solved.token)
    }

    pub fn solve_detailed(&self, raw_challenge: &str) -> Result<SolvedChallenge, ChallengeError> {
        if raw_challenge.trim().is_empty() {
            return Err(ChallengeError::Empty);
        }

        let message = extract_message(raw_challenge).ok_or_else(|| {
            warn!(
                scheme = self.scheme.version(),
                challenge_len = raw_challenge.len(),
                "no encoded message found in challenge"
            );
            ChallengeError::MessageNotFound
        })?;
        let offset = self.resolve_offset(raw_challenge);

        let primary = self.scheme.decode(message, offset);
        if is_plausible(&primary) {
            info!(scheme = self.scheme.version(), offset, "challenge decoded");
            return Ok(self.solved(primary, offset, true));
        }

        warn!(
            scheme = self.scheme.version(),
            offset,
            candidate = %primary,
            "decoded token looks implausible, trying fallback offsets"
        );

        let mut tried = vec![offset];
        let mut best = (alphanumeric_score(&primary), primary, offset);
        for &fallback in &self.fallback_offsets {
            if tried.contains(&fallback) {
                continue;
            }
            tried.push(fallback);
            let candidate = self.scheme.decode(message, fallback);
            if is_plausible(&candidate) {
                info!(scheme = self.scheme.version(), offset = fallback, "challenge decoded with fallback offset");
                return Ok(self.solved(candidate, fallback, true));
            }
            let score = alphanumeric_score(&candidate);
            if score > best.0 {
                best = (score, candidate, fallback);
            }
        }

        let (score, token, best_offset) = best;
        if score == 0 {
            warn!(
                scheme = self.scheme.version(),
                tried = ?tried,
                candidate = %token,
                message_len = message.chars().count(),
                "no candidate token contains alphanumeric characters"
            );
            return Err(ChallengeError::Implausible {
                scheme: self.scheme.version().to_string(),
                tried,
                best: token,
            });
        }

        warn!(
            scheme = self.scheme.version(),
            offset = best_offset,
            score,
            "using best-scoring challenge candidate"
        );
        Ok(self.solved(token, best_offset, false))
    }

    fn solved(&self, token: String, offset: f64, plausible: bool) -> SolvedChallenge {
        SolvedChallenge {
            token,
            offset,
            scheme: self.scheme.version().to_string(),
            plausible,
        }
    }

    fn resolve_offset(&self, raw_challenge: &str) -> f64 {
        let Some(expression) = extract_offset_expression(raw_challenge) else {
            debug!(offset = self.default_offset, "no offset expression, using default");
            return self.default_offset;
        };
        match arith::evaluate(expression) {
            Ok(offset) => offset,
            Err(error) => {
                warn!(
                    expression = %expression,
                    error = %error,
                    offset = self.default_offset,
                    "offset expression rejected, using default"
                );
                self.default_offset
            }
        }
    }
}

pub fn extract_message(raw_challenge: &str) -> Option<&str> {
    MESSAGE_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures(raw_challenge)
            .and_then(|captures| captures.get(1))
            .map(|found| found.as_str())
    })
}

pub fn extract_offset_expression(raw_challenge: &str) -> Option<&str> {
    OFFSET_PATTERN
        .captures(raw_challenge)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().trim())
}

pub fn is_plausible(token: &str) -> bool {
    token.chars().count() >= MIN_TOKEN_CHARS && alphanumeric_score(token) > 0
}

fn alphanumeric_score(token: &str) -> usize {
    token.chars().filter(char::is_ascii_alphanumeric).count()
}
