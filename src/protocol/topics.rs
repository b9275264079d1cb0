//! Topic template engine
//!
//! Templates mix literal text with bracketed tokens:
//!
//! - `[model]` inserts the record's `model` field
//! - `[model:unknown]` falls back to `unknown` when the field is absent
//! - `[/channel]` inserts `/` followed by the channel, or nothing at all when
//!   the record has no channel
//!
//! Templates are parsed once at configuration time so that malformed
//! templates fail before any connection is attempted. Expansion is pure.

use super::record::{EventRecord, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Well-known tokens a template may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKey {
    Hostname,
    Type,
    Model,
    Subtype,
    Channel,
    Id,
    Protocol,
}

impl TokenKey {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hostname" => Some(TokenKey::Hostname),
            "type" => Some(TokenKey::Type),
            "model" => Some(TokenKey::Model),
            "subtype" => Some(TokenKey::Subtype),
            "channel" => Some(TokenKey::Channel),
            "id" => Some(TokenKey::Id),
            "protocol" => Some(TokenKey::Protocol),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKey::Hostname => "hostname",
            TokenKey::Type => "type",
            TokenKey::Model => "model",
            TokenKey::Subtype => "subtype",
            TokenKey::Channel => "channel",
            TokenKey::Id => "id",
            TokenKey::Protocol => "protocol",
        }
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Template parsing and expansion errors
#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("unterminated token at offset {offset} in topic template \"{template}\"")]
    UnterminatedToken { template: String, offset: usize },
    #[error("unknown token \"{name}\" in topic template \"{template}\"")]
    UnknownToken { template: String, name: String },
    #[error("can't append {kind} value of \"{token}\" to topic")]
    UnsupportedValue { token: TokenKey, kind: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Token {
        separator: Option<char>,
        key: TokenKey,
        default: Option<String>,
    },
}

/// A parsed topic template
#[derive(Debug, Clone, PartialEq)]
pub struct TopicTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl TopicTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((offset, c)) = chars.next() {
            if c != '[' {
                literal.push(c);
                continue;
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let unterminated = || TemplateError::UnterminatedToken {
                template: template.to_string(),
                offset,
            };

            let separator = match chars.peek() {
                Some(&(_, s)) if !s.is_ascii_alphabetic() && s != ']' && s != '[' => {
                    chars.next();
                    Some(s)
                }
                _ => None,
            };

            let mut name = String::new();
            while let Some(&(_, n)) = chars.peek() {
                if matches!(n, ':' | ']' | '[') {
                    break;
                }
                name.push(n);
                chars.next();
            }

            let mut default = None;
            if matches!(chars.peek(), Some(&(_, ':'))) {
                chars.next();
                let mut text = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if matches!(d, ']' | '[') {
                        break;
                    }
                    text.push(d);
                    chars.next();
                }
                default = Some(text);
            }

            match chars.next() {
                Some((_, ']')) => {}
                _ => return Err(unterminated()),
            }

            let key = TokenKey::from_name(&name).ok_or_else(|| TemplateError::UnknownToken {
                template: template.to_string(),
                name: name.clone(),
            })?;

            segments.push(Segment::Token {
                separator,
                key,
                default,
            });
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(TopicTemplate {
            source: template.to_string(),
            segments,
        })
    }

    /// The template text as configured
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Tokens referenced by this template, in order
    pub fn tokens(&self) -> impl Iterator<Item = TokenKey> + '_ {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Token { key, .. } => Some(*key),
            Segment::Literal(_) => None,
        })
    }

    /// Expand the template against one record.
    ///
    /// Either the complete topic is produced or an error is returned;
    /// a partially expanded topic is never handed out.
    pub fn expand(&self, record: &EventRecord, hostname: &str) -> Result<String, TemplateError> {
        let mut topic = String::with_capacity(self.source.len() + 32);

        for segment in &self.segments {
            let (separator, key, default) = match segment {
                Segment::Literal(text) => {
                    topic.push_str(text);
                    continue;
                }
                Segment::Token {
                    separator,
                    key,
                    default,
                } => (separator, *key, default),
            };

            let resolved = resolve(key, record, hostname)?;
            let text = match (resolved, default) {
                (Some(text), _) => text,
                (None, Some(default)) => default.clone(),
                (None, None) => continue,
            };

            if let Some(separator) = separator {
                topic.push(*separator);
            }
            topic.push_str(&text);
        }

        Ok(topic)
    }
}

impl FromStr for TopicTemplate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicTemplate::parse(s)
    }
}

impl fmt::Display for TopicTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse `template` and expand it in one step
pub fn expand(template: &str, record: &EventRecord, hostname: &str) -> Result<String, TemplateError> {
    TopicTemplate::parse(template)?.expand(record, hostname)
}

/// Resolve a token to its topic text, `None` when absent or empty
fn resolve(
    key: TokenKey,
    record: &EventRecord,
    hostname: &str,
) -> Result<Option<String>, TemplateError> {
    if key == TokenKey::Hostname {
        return Ok((!hostname.is_empty()).then(|| hostname.to_string()));
    }

    match record.get(key.as_str()) {
        None => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(sanitize_topic_segment(s))),
        Some(Value::Int(i)) => Ok(Some(i.to_string())),
        Some(other) => Err(TemplateError::UnsupportedValue {
            token: key,
            kind: other.kind(),
        }),
    }
}

/// Replace everything outside `[A-Za-z0-9.-]` with `_`.
///
/// Keeps device-supplied strings from injecting topic levels (`/`),
/// wildcards (`+`, `#`), system prefixes (`$`) or whitespace.
pub fn sanitize_topic_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
