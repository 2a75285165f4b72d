//! # Subject Patterns
//!
//! Subjects are dot-delimited hierarchies (`ns.field.created`). Patterns may
//! use `*` to match exactly one token and `>` (last position only) to match
//! one or more trailing tokens.
//!
//! Patterns are compiled once when a subscription is registered; matching
//! walks the token list without re-parsing the pattern.

use std::fmt;

use crate::transport::BusError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Token {
    Literal(String),
    Single,
    Tail,
}

/// A compiled subject pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectPattern {
    raw: String,
    tokens: Vec<Token>,
}

impl SubjectPattern {
    /// Compile a pattern.
    ///
    /// # Errors
    ///
    /// Returns `BusError::InvalidSubject` for empty tokens, embedded
    /// whitespace, or a `>` anywhere but the last position.
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        let parts: Vec<&str> = pattern.split('.').collect();
        let last = parts.len() - 1;
        let mut tokens = Vec::with_capacity(parts.len());

        for (idx, part) in parts.iter().enumerate() {
            check_token(pattern, part)?;
            let token = match *part {
                "*" => Token::Single,
                ">" if idx == last => Token::Tail,
                ">" => {
                    return Err(invalid(pattern, "'>' is only allowed as the last token"));
                }
                literal if literal.contains('*') || literal.contains('>') => {
                    return Err(invalid(pattern, "wildcards must occupy a whole token"));
                }
                literal => Token::Literal(literal.to_string()),
            };
            tokens.push(token);
        }

        Ok(Self {
            raw: pattern.to_string(),
            tokens,
        })
    }

    /// Whether a concrete subject matches this pattern.
    #[must_use]
    pub fn matches(&self, subject: &str) -> bool {
        let mut parts = subject.split('.');
        for token in &self.tokens {
            match token {
                Token::Tail => return parts.next().is_some_and(|p| !p.is_empty()),
                Token::Single => match parts.next() {
                    Some(part) if !part.is_empty() => {}
                    _ => return false,
                },
                Token::Literal(literal) => match parts.next() {
                    Some(part) if part == literal => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }

    /// True when the pattern contains no wildcard.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::Literal(_)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Validate a concrete (publishable) subject: no wildcards, no empty tokens.
pub fn validate_subject(subject: &str) -> Result<(), BusError> {
    for part in subject.split('.') {
        check_token(subject, part)?;
        if part.contains('*') || part.contains('>') {
            return Err(invalid(subject, "wildcards are not allowed in a publish subject"));
        }
    }
    Ok(())
}

fn check_token(subject: &str, token: &str) -> Result<(), BusError> {
    if token.is_empty() {
        return Err(invalid(subject, "empty token"));
    }
    if token.chars().any(char::is_whitespace) {
        return Err(invalid(subject, "whitespace in token"));
    }
    Ok(())
}

fn invalid(subject: &str, reason: &str) -> BusError {
    BusError::InvalidSubject {
        subject: subject.to_string(),
        reason: reason.to_string(),
    }
}
