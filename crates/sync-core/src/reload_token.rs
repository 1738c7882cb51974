//! URL-fragment token that carries session state across a forced reload.
//!
//! Wire format: `reload:key1=val1+key2=val2+...` where every key and value is
//! percent-encoded, so `+` and `=` never appear unescaped inside a pair.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::MessageId;

/// Fragment prefix that marks a reload token.
pub const RELOAD_PREFIX: &str = "reload:";

/// Characters left alone, matching `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'!')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Errors produced while reading a reload token.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReloadTokenError {
    #[error("fragment is not a reload token")]
    MissingPrefix,
    #[error("malformed reload token pair '{0}'")]
    MalformedPair(String),
    #[error("reload token value for '{key}' is invalid: {reason}")]
    InvalidValue { key: String, reason: String },
    /// The token was not minted for this session.
    #[error("reload token csrf token does not match the session")]
    CsrfMismatch,
    #[error("reload token was already consumed")]
    AlreadyConsumed,
}

/// Where the preserved draft was addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComposeTarget {
    Stream { stream: String, topic: String },
    Private { recipient: String },
}

/// Compose box state carried across the reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeDraft {
    pub target: ComposeTarget,
    pub content: String,
}

/// Everything preserved for the next page load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadToken {
    pub csrf_token: Option<String>,
    pub send_after_reload: bool,
    pub compose: Option<ComposeDraft>,
    /// Selected message in the unnarrowed list.
    pub pointer: Option<MessageId>,
    pub offset: Option<i64>,
    /// Selected message in the narrowed list.
    pub narrow_pointer: Option<MessageId>,
    pub narrow_offset: Option<i64>,
    /// Location hash before the reload.
    pub oldhash: Option<String>,
}

impl ReloadToken {
    /// Render as a URL fragment (without the leading `#`).
    pub fn encode(&self) -> String {
        let mut pairs: Vec<(&str, String)> = vec![(
            "send_after_reload",
            u8::from(self.send_after_reload).to_string(),
        )];
        if let Some(csrf_token) = &self.csrf_token {
            pairs.push(("csrf_token", csrf_token.clone()));
        }
        if let Some(compose) = &self.compose {
            match &compose.target {
                ComposeTarget::Stream { stream, topic } => {
                    pairs.push(("msg_type", "stream".to_owned()));
                    pairs.push(("stream", stream.clone()));
                    pairs.push(("topic", topic.clone()));
                }
                ComposeTarget::Private { recipient } => {
                    pairs.push(("msg_type", "private".to_owned()));
                    pairs.push(("recipient", recipient.clone()));
                }
            }
            pairs.push(("msg", compose.content.clone()));
        }
        if let Some(pointer) = self.pointer {
            pairs.push(("pointer", pointer.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset", offset.to_string()));
        }
        if let Some(narrow_pointer) = self.narrow_pointer {
            pairs.push(("narrow_pointer", narrow_pointer.to_string()));
        }
        if let Some(narrow_offset) = self.narrow_offset {
            pairs.push(("narrow_offset", narrow_offset.to_string()));
        }
        if let Some(oldhash) = &self.oldhash {
            pairs.push(("oldhash", oldhash.clone()));
        }

        let body = pairs
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(key, COMPONENT),
                    utf8_percent_encode(value, COMPONENT)
                )
            })
            .collect::<Vec<_>>()
            .join("+");
        format!("{RELOAD_PREFIX}{body}")
    }

    /// Parse a fragment, with or without the leading `#`.
    pub fn parse(fragment: &str) -> Result<Self, ReloadTokenError> {
        let fragment = fragment.strip_prefix('#').unwrap_or(fragment);
        let body = fragment
            .strip_prefix(RELOAD_PREFIX)
            .ok_or(ReloadTokenError::MissingPrefix)?;

        let mut token = ReloadToken::default();
        let mut msg_type = None;
        let mut stream = None;
        let mut topic = None;
        let mut recipient = None;
        let mut msg = None;

        for pair in body.split('+').filter(|pair| !pair.is_empty()) {
            let (raw_key, raw_value) = pair
                .split_once('=')
                .ok_or_else(|| ReloadTokenError::MalformedPair(pair.to_owned()))?;
            let key = decode_component(raw_key, raw_key)?;
            let value = decode_component(&key, raw_value)?;

            match key.as_str() {
                "csrf_token" => token.csrf_token = Some(value),
                "send_after_reload" => token.send_after_reload = value == "1",
                "msg_type" => msg_type = Some(value),
                "stream" => stream = Some(value),
                "topic" => topic = Some(value),
                "recipient" => recipient = Some(value),
                "msg" => msg = Some(value),
                "pointer" => token.pointer = Some(parse_value(&key, &value)?),
                "offset" => token.offset = Some(parse_value(&key, &value)?),
                "narrow_pointer" => token.narrow_pointer = Some(parse_value(&key, &value)?),
                "narrow_offset" => token.narrow_offset = Some(parse_value(&key, &value)?),
                "oldhash" => token.oldhash = Some(value),
                _ => {}
            }
        }

        token.compose = match (msg_type.as_deref(), msg) {
            (Some("stream"), Some(content)) => Some(ComposeDraft {
                target: ComposeTarget::Stream {
                    stream: stream.unwrap_or_default(),
                    topic: topic.unwrap_or_default(),
                },
                content,
            }),
            (Some("private"), Some(content)) => Some(ComposeDraft {
                target: ComposeTarget::Private {
                    recipient: recipient.unwrap_or_default(),
                },
                content,
            }),
            _ => None,
        };
        Ok(token)
    }

    /// Check the token against the session before any of it is trusted.
    pub fn verify(self, session_csrf_token: &str) -> Result<Self, ReloadTokenError> {
        match self.csrf_token.as_deref() {
            Some(token) if !token.is_empty() && token == session_csrf_token => Ok(self),
            _ => Err(ReloadTokenError::CsrfMismatch),
        }
    }
}

fn decode_component(key: &str, raw: &str) -> Result<String, ReloadTokenError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|value| value.into_owned())
        .map_err(|err| ReloadTokenError::InvalidValue {
            key: key.to_owned(),
            reason: err.to_string(),
        })
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ReloadTokenError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|err| ReloadTokenError::InvalidValue {
            key: key.to_owned(),
            reason: err.to_string(),
        })
}

/// Holds the cold-start fragment until it is consumed exactly once.
#[derive(Debug, Clone, Default)]
pub struct ReloadTokenSlot {
    fragment: Option<String>,
    consumed: bool,
}

impl ReloadTokenSlot {
    /// Keep `fragment` only when it looks like a reload token.
    pub fn new(fragment: Option<String>) -> Self {
        let fragment = fragment.filter(|fragment| {
            fragment
                .strip_prefix('#')
                .unwrap_or(fragment)
                .starts_with(RELOAD_PREFIX)
        });
        Self {
            fragment,
            consumed: false,
        }
    }

    pub fn is_present(&self) -> bool {
        self.fragment.is_some()
    }

    /// Parse and verify the token. `Ok(None)` when the page was not a reload.
    pub fn consume(
        &mut self,
        session_csrf_token: &str,
    ) -> Result<Option<ReloadToken>, ReloadTokenError> {
        if self.consumed {
            return Err(ReloadTokenError::AlreadyConsumed);
        }
        self.consumed = true;
        let Some(fragment) = self.fragment.take() else {
            return Ok(None);
        };
        ReloadToken::parse(&fragment)?
            .verify(session_csrf_token)
            .map(Some)
    }
}
