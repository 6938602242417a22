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

//! Restricted arithmetic over `f64`: numeric literals, `+ - * %`, unary sign
//! and parentheses. Anything else is rejected while tokenizing, so vendor text
//! is never executed.

use crate::error::EvalError;

pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Percent,
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, EvalError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < chars.len() {
        let (position, ch) = chars[index];
        match ch {
            c if c.is_whitespace() => {
                index += 1;
            }
            '0'..='9' | '.' => {
                let start = index;
                while index < chars.len() && (chars[index].1.is_ascii_digit() || chars[index].1 == '.') {
                    index += 1;
                }
                let end = chars.get(index).map_or(input.len(), |(offset, _)| *offset);
                let text = &input[position..end];
                if chars
                    .get(index)
                    .is_some_and(|(_, next)| next.is_alphabetic() || *next == '_' || *next == '$')
                {
                    return Err(EvalError::BadNumber {
                        text: input[position..].chars().take(index - start + 1).collect(),
                    });
                }
                let value = text
                    .parse::<f64>()
                    .map_err(|_| EvalError::BadNumber { text: text.to_string() })?;
                tokens.push((position, Token::Number(value)));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut name = String::new();
                while index < chars.len()
                    && (chars[index].1.is_alphanumeric() || matches!(chars[index].1, '_' | '$' | '.'))
                {
                    name.push(chars[index].1);
                    index += 1;
                }
                return Err(EvalError::Identifier { name, position });
            }
            '+' | '-' | '*' | '%' | '(' | ')' => {
                let token = match ch {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '%' => Token::Percent,
                    '(' => Token::Open,
                    _ => Token::Close,
                };
                tokens.push((position, token));
                index += 1;
            }
            other => {
                return Err(EvalError::UnexpectedChar { ch: other, position });
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.cursor).map(|(_, token)| *token)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.cursor).map_or(0, |(position, _)| *position)
    }

    fn enter(&mut self) -> Result<(), EvalError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EvalError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<f64, EvalError> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.cursor += 1;
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.cursor += 1;
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, EvalError> {
        let mut value = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.cursor += 1;
                    value *= self.unary()?;
                }
                Some(Token::Percent) => {
                    self.cursor += 1;
                    let divisor = self.unary()?;
                    if divisor == 0.0 {
                        return Err(EvalError::ModuloByZero);
                    }
                    value %= divisor;
                }
                _ => return Ok(value),
            }
        }
    }

    fn unary(&mut self) -> Result<f64, EvalError> {
        match self.peek() {
            Some(Token::Plus) => {
                self.cursor += 1;
                self.enter()?;
                let value = self.unary();
                self.depth -= 1;
                value
            }
            Some(Token::Minus) => {
                self.cursor += 1;
                self.enter()?;
                let value = self.unary().map(|inner| -inner);
                self.depth -= 1;
                value
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<f64, EvalError> {
        let position = self.position();
        match self.peek() {
            Some(Token::Number(value)) => {
                self.cursor += 1;
                Ok(value)
            }
            Some(Token::Open) => {
                self.cursor += 1;
                self.enter()?;
                let value = self.expression()?;
                self.depth -= 1;
                match self.peek() {
                    Some(Token::Close) => {
                        self.cursor += 1;
                        Ok(value)
                    }
                    Some(_) => Err(EvalError::UnexpectedToken {
                        position: self.position(),
                    }),
                    None => Err(EvalError::UnexpectedEnd),
                }
            }
            Some(_) => Err(EvalError::UnexpectedToken { position }),
            None => Err(EvalError::UnexpectedEnd),
        }
    }
}

/// Evaluates `input` as plain arithmetic.
pub fn evaluate(input: &str) -> Result<f64, EvalError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(EvalError::Empty);
    }

    let mut parser = Parser {
        tokens,
        cursor: 0,
        depth: 0,
    };
    let value = parser.expression()?;
    if parser.cursor != parser.tokens.len() {
        return Err(EvalError::UnexpectedToken {
            position: parser.position(),
        });
    }
    if !value.is_finite() {
        return Err(EvalError::NotFinite);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_precedence_and_parentheses() {
        assert_eq!(evaluate("2+3").unwrap(), 5.0);
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("((33 * 70) + 84) * 67").unwrap(), 160_398.0);
        assert_eq!(evaluate("100 % 7 + 1").unwrap(), 3.0);
    }

    #[test]
    fn handles_unary_signs_and_decimals() {
        assert_eq!(evaluate("-5 + +2").unwrap(), -3.0);
        assert_eq!(evaluate("--4").unwrap(), 4.0);
        assert_eq!(evaluate("1.5 * 2").unwrap(), 3.0);
        assert_eq!(evaluate("-7 % 3").unwrap(), -1.0);
    }

    #[test]
    fn rejects_identifiers_calls_and_property_access() {
        for input in [
            "offset",
            "Math.floor(2)",
            "this.angular.isObject(1)",
            "2 + window.x",
            "process.exit()",
            "x(1)",
        ] {
            assert!(
                matches!(evaluate(input), Err(EvalError::Identifier { .. })),
                "{input} should be rejected as an identifier"
            );
        }
    }

    #[test]
    fn rejects_other_syntax() {
        assert!(matches!(
            evaluate("4 / 2"),
            Err(EvalError::UnexpectedChar { ch: '/', .. })
        ));
        assert!(matches!(
            evaluate("[1]"),
            Err(EvalError::UnexpectedChar { ch: '[', .. })
        ));
        assert!(matches!(evaluate("1e5"), Err(EvalError::BadNumber { .. })));
        assert!(matches!(evaluate("1.2.3"), Err(EvalError::BadNumber { .. })));
        assert_eq!(evaluate(""), Err(EvalError::Empty));
        assert_eq!(evaluate("   "), Err(EvalError::Empty));
        assert_eq!(evaluate("(1 + 2"), Err(EvalError::UnexpectedEnd));
        assert_eq!(evaluate("1 +"), Err(EvalError::UnexpectedEnd));
        assert!(matches!(evaluate("1 2"), Err(EvalError::UnexpectedToken { .. })));
        assert!(matches!(evaluate(")"), Err(EvalError::UnexpectedToken { .. })));
    }

    #[test]
    fn rejects_modulo_by_zero() {
        assert_eq!(evaluate("5 % 0"), Err(EvalError::ModuloByZero));
        assert_eq!(evaluate("5 % (2 - 2)"), Err(EvalError::ModuloByZero));
    }

    #[test]
    fn bounds_nesting_depth() {
        let deep = format!("{}1{}", "(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1));
        assert_eq!(evaluate(&deep), Err(EvalError::TooDeep(MAX_DEPTH)));

        let shallow = format!("{}1{}", "(".repeat(8), ")".repeat(8));
        assert_eq!(evaluate(&shallow).unwrap(), 1.0);
    }
}
