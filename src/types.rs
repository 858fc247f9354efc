use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KeyType {
    String = 1,
    Hash = 2,
    ZSet = 5,
}

impl KeyType {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(KeyType::String),
            2 => Some(KeyType::Hash),
            5 => Some(KeyType::ZSet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::String => "string",
            KeyType::Hash => "hash",
            KeyType::ZSet => "zset",
        }
    }
}

/// A sorted-set member with its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZMember {
    pub member: String,
    pub score: f64,
}

impl ZMember {
    pub fn new(member: impl Into<String>, score: f64) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

/// Options for SET.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub nx: bool,
    pub xx: bool,
    /// Absolute instant at which the key expires.
    pub expiration: Option<DateTime<Utc>>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nx(mut self) -> Self {
        self.nx = true;
        self
    }

    pub fn xx(mut self) -> Self {
        self.xx = true;
        self
    }

    pub fn expiration(mut self, at: DateTime<Utc>) -> Self {
        self.expiration = Some(at);
        self
    }
}

/// Result of EXPIRETIME.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireTime {
    /// The key expires at this instant (second precision).
    At(DateTime<Utc>),
    /// The key exists and has no expiry set.
    Persistent,
    /// The key does not exist.
    Missing,
}

/// One page of an HSCAN iteration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HScanPage {
    /// Cursor to pass to the next call; `"0"` once iteration is complete.
    pub cursor: String,
    pub field_values: Vec<(String, String)>,
}

/// One page of a ZSCAN iteration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ZScanPage {
    /// Cursor to pass to the next call; `"0"` once iteration is complete.
    pub cursor: String,
    pub members: Vec<ZMember>,
}
