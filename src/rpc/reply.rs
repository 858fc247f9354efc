use serde::{Deserialize, Serialize};

use crate::error::KvError;
use crate::types::ZMember;

/// Response payload of one remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ok,
    /// Absent key, field or member; for EXEC, an aborted transaction.
    Nil,
    Int(i64),
    Float(f64),
    Str(String),
    /// One optional value per requested key or field.
    Values(Vec<Option<String>>),
    /// One optional integer per bitfield step.
    Ints(Vec<Option<i64>>),
    Strings(Vec<String>),
    Members(Vec<ZMember>),
    Fields(Vec<(String, String)>),
    HashPage {
        cursor: String,
        fields: Vec<(String, String)>,
    },
    ZPage {
        cursor: String,
        members: Vec<ZMember>,
    },
    /// One reply per replayed operation of an EXEC.
    Multi(Vec<Reply>),
    Error(String),
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Ok => "ok",
            Reply::Nil => "nil",
            Reply::Int(_) => "int",
            Reply::Float(_) => "float",
            Reply::Str(_) => "str",
            Reply::Values(_) => "values",
            Reply::Ints(_) => "ints",
            Reply::Strings(_) => "strings",
            Reply::Members(_) => "members",
            Reply::Fields(_) => "fields",
            Reply::HashPage { .. } => "hash page",
            Reply::ZPage { .. } => "zset page",
            Reply::Multi(_) => "multi",
            Reply::Error(_) => "error",
        }
    }

    /// Error for a reply whose shape the decoder did not expect.
    /// Store errors pass through as `Remote`.
    pub fn unexpected(self, expected: &'static str) -> KvError {
        match self {
            Reply::Error(message) => KvError::Remote(message),
            other => KvError::UnexpectedReply {
                expected,
                got: other.kind().to_string(),
            },
        }
    }
}

impl From<KvError> for Reply {
    fn from(err: KvError) -> Self {
        Reply::Error(err.to_string())
    }
}
