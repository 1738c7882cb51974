use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Largest fractional step a provisional id can take (`<base>.99`).
pub const MAX_PENDING_SEQ: u16 = 99;

/// Errors produced while parsing or allocating message identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageIdError {
    /// The textual id could not be parsed.
    #[error("malformed message id '{0}'")]
    Malformed(String),
    /// Every provisional slot after the given server id is taken.
    #[error("no provisional ids left after server id {0}")]
    Exhausted(u64),
}

/// Provisional identifier of a locally echoed message, written `<base>.<seq>`.
///
/// `base` is the highest server id known when the message was sent, so the
/// echo sorts right after it and before `base + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingId {
    base: u64,
    seq: u16,
}

impl PendingId {
    /// Build a provisional id; `seq` must be in `1..=99`.
    pub fn new(base: u64, seq: u16) -> Result<Self, MessageIdError> {
        if seq == 0 || seq > MAX_PENDING_SEQ {
            return Err(MessageIdError::Malformed(format!("{base}.{seq}")));
        }
        Ok(Self { base, seq })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn seq(&self) -> u16 {
        self.seq
    }

    /// The following slot under the same base.
    pub fn next(&self) -> Result<Self, MessageIdError> {
        if self.seq >= MAX_PENDING_SEQ {
            return Err(MessageIdError::Exhausted(self.base));
        }
        Ok(Self {
            base: self.base,
            seq: self.seq + 1,
        })
    }
}

impl fmt::Display for PendingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.base, self.seq)
    }
}

/// Identifier of a message in the store.
///
/// Server ids are realm-wide integers. Pending ids order between the server id
/// they were derived from and the next integer, the same place a fractional
/// `100.01` would sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Server(u64),
    Pending(PendingId),
}

impl MessageId {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    pub fn as_server(&self) -> Option<u64> {
        match self {
            Self::Server(id) => Some(*id),
            Self::Pending(_) => None,
        }
    }

    /// Numeric position used for distance comparisons.
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Server(id) => *id as f64,
            Self::Pending(pending) => pending.base as f64 + f64::from(pending.seq) / 100.0,
        }
    }

    /// Absolute numeric distance between two ids.
    pub fn distance(&self, other: &MessageId) -> f64 {
        (self.as_f64() - other.as_f64()).abs()
    }

    fn sort_key(&self) -> (u64, u8, u16) {
        match self {
            Self::Server(id) => (*id, 0, 0),
            Self::Pending(pending) => (pending.base, 1, pending.seq),
        }
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self::Server(id)
    }
}

impl From<PendingId> for MessageId {
    fn from(id: PendingId) -> Self {
        Self::Pending(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{id}"),
            Self::Pending(pending) => pending.fmt(f),
        }
    }
}

impl FromStr for MessageId {
    type Err = MessageIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let malformed = || MessageIdError::Malformed(value.to_owned());
        let trimmed = value.trim();

        let Some((whole, fraction)) = trimmed.split_once('.') else {
            return trimmed
                .parse::<u64>()
                .map(MessageId::Server)
                .map_err(|_| malformed());
        };

        let base = whole.parse::<u64>().map_err(|_| malformed())?;
        if fraction.is_empty()
            || fraction.len() > 2
            || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(malformed());
        }
        let mut seq = fraction.parse::<u16>().map_err(|_| malformed())?;
        if fraction.len() == 1 {
            seq *= 10;
        }
        if seq == 0 {
            return Ok(MessageId::Server(base));
        }
        PendingId::new(base, seq)
            .map(MessageId::Pending)
            .map_err(|_| malformed())
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Server(id) => serializer.serialize_u64(*id),
            Self::Pending(pending) => serializer.collect_str(pending),
        }
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Int(u64),
            Text(String),
        }

        match RawId::deserialize(deserializer)? {
            RawId::Int(id) => Ok(MessageId::Server(id)),
            RawId::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Hands out provisional ids for local echoes.
#[derive(Debug, Clone, Default)]
pub struct PendingIdAllocator {
    last: Option<PendingId>,
}

impl PendingIdAllocator {
    /// Allocate the next provisional id following `max_server_id`.
    pub fn allocate(&mut self, max_server_id: u64) -> Result<PendingId, MessageIdError> {
        let next = match self.last {
            Some(last) if last.base == max_server_id => last.next()?,
            _ => PendingId::new(max_server_id, 1)?,
        };
        self.last = Some(next);
        Ok(next)
    }
}
