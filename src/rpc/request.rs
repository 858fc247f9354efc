use serde::{Deserialize, Serialize};

use crate::bitfield::BitfieldOp;
use crate::range::{ZBounds, ZRangeQuery};
use crate::scope::{PhysicalKey, Scope};
use crate::types::ZMember;

/// Opaque transaction session id issued by the store on WATCH.
pub type TxId = String;

/// One remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub op: Op,
    /// Keyspace every key in `op` must belong to.
    pub scope: Scope,
    /// Transaction session the call belongs to; only transaction control ops carry one.
    pub tx: Option<TxId>,
    /// Report absence as an error instead of a zero value.
    pub strict: bool,
}

impl Request {
    pub fn new(op: Op, scope: Scope) -> Self {
        Self {
            op,
            scope,
            tx: None,
            strict: false,
        }
    }

    pub fn in_tx(mut self, tx: impl Into<TxId>) -> Self {
        self.tx = Some(tx.into());
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// Store operations with typed arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    // strings and keys
    Get {
        key: PhysicalKey,
    },
    Set {
        key: PhysicalKey,
        value: String,
        nx: bool,
        xx: bool,
        ttl_secs: Option<i64>,
    },
    Del {
        keys: Vec<PhysicalKey>,
    },
    Exists {
        keys: Vec<PhysicalKey>,
    },
    Type {
        key: PhysicalKey,
    },
    Rename {
        key: PhysicalKey,
        new_key: PhysicalKey,
    },
    IncrBy {
        key: PhysicalKey,
        increment: i64,
    },
    GetRange {
        key: PhysicalKey,
        start: i64,
        end: i64,
    },
    SetRange {
        key: PhysicalKey,
        offset: i64,
        value: String,
    },
    StrLen {
        key: PhysicalKey,
    },
    MGet {
        keys: Vec<PhysicalKey>,
    },
    MSet {
        pairs: Vec<(PhysicalKey, String)>,
    },
    Expire {
        key: PhysicalKey,
        seconds: i64,
    },
    ExpireTime {
        key: PhysicalKey,
    },
    Bitfield {
        key: PhysicalKey,
        ops: Vec<BitfieldOp>,
    },

    // hashes
    HGet {
        key: PhysicalKey,
        field: String,
    },
    HMGet {
        key: PhysicalKey,
        fields: Vec<String>,
    },
    HSet {
        key: PhysicalKey,
        pairs: Vec<(String, String)>,
    },
    HSetNx {
        key: PhysicalKey,
        field: String,
        value: String,
    },
    HDel {
        key: PhysicalKey,
        fields: Vec<String>,
    },
    HGetAll {
        key: PhysicalKey,
    },
    HIncrBy {
        key: PhysicalKey,
        field: String,
        increment: i64,
    },
    HLen {
        key: PhysicalKey,
    },
    HKeys {
        key: PhysicalKey,
    },
    HScan {
        key: PhysicalKey,
        cursor: String,
        pattern: Option<String>,
        count: Option<usize>,
    },

    // sorted sets
    ZAdd {
        key: PhysicalKey,
        members: Vec<ZMember>,
    },
    ZRem {
        key: PhysicalKey,
        members: Vec<String>,
    },
    ZScore {
        key: PhysicalKey,
        member: String,
    },
    ZRank {
        key: PhysicalKey,
        member: String,
    },
    ZIncrBy {
        key: PhysicalKey,
        member: String,
        increment: f64,
    },
    ZCard {
        key: PhysicalKey,
    },
    ZRange {
        key: PhysicalKey,
        query: ZRangeQuery,
    },
    ZRemRange {
        key: PhysicalKey,
        bounds: ZBounds,
    },
    ZScan {
        key: PhysicalKey,
        cursor: String,
        pattern: Option<String>,
        count: Option<usize>,
    },

    // transaction control
    Watch {
        keys: Vec<PhysicalKey>,
    },
    Unwatch,
    Multi,
    Exec {
        ops: Vec<Op>,
    },
    Discard,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Get { .. } => "get",
            Op::Set { .. } => "set",
            Op::Del { .. } => "del",
            Op::Exists { .. } => "exists",
            Op::Type { .. } => "type",
            Op::Rename { .. } => "rename",
            Op::IncrBy { .. } => "incrby",
            Op::GetRange { .. } => "getrange",
            Op::SetRange { .. } => "setrange",
            Op::StrLen { .. } => "strlen",
            Op::MGet { .. } => "mget",
            Op::MSet { .. } => "mset",
            Op::Expire { .. } => "expire",
            Op::ExpireTime { .. } => "expiretime",
            Op::Bitfield { .. } => "bitfield",
            Op::HGet { .. } => "hget",
            Op::HMGet { .. } => "hmget",
            Op::HSet { .. } => "hset",
            Op::HSetNx { .. } => "hsetnx",
            Op::HDel { .. } => "hdel",
            Op::HGetAll { .. } => "hgetall",
            Op::HIncrBy { .. } => "hincrby",
            Op::HLen { .. } => "hlen",
            Op::HKeys { .. } => "hkeys",
            Op::HScan { .. } => "hscan",
            Op::ZAdd { .. } => "zadd",
            Op::ZRem { .. } => "zrem",
            Op::ZScore { .. } => "zscore",
            Op::ZRank { .. } => "zrank",
            Op::ZIncrBy { .. } => "zincrby",
            Op::ZCard { .. } => "zcard",
            Op::ZRange { .. } => "zrange",
            Op::ZRemRange { .. } => "zremrange",
            Op::ZScan { .. } => "zscan",
            Op::Watch { .. } => "watch",
            Op::Unwatch => "unwatch",
            Op::Multi => "multi",
            Op::Exec { .. } => "exec",
            Op::Discard => "discard",
        }
    }

    /// WATCH/UNWATCH/MULTI/EXEC/DISCARD.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Op::Watch { .. } | Op::Unwatch | Op::Multi | Op::Exec { .. } | Op::Discard
        )
    }

    /// Every physical key the operation touches, including those of batched ops.
    pub fn keys(&self) -> Vec<&PhysicalKey> {
        match self {
            Op::Del { keys } | Op::Exists { keys } | Op::MGet { keys } | Op::Watch { keys } => {
                keys.iter().collect()
            }
            Op::MSet { pairs } => pairs.iter().map(|(k, _)| k).collect(),
            Op::Rename { key, new_key } => vec![key, new_key],
            Op::Exec { ops } => ops.iter().flat_map(|op| op.keys()).collect(),
            Op::Unwatch | Op::Multi | Op::Discard => Vec::new(),
            Op::Get { key }
            | Op::Set { key, .. }
            | Op::Type { key }
            | Op::IncrBy { key, .. }
            | Op::GetRange { key, .. }
            | Op::SetRange { key, .. }
            | Op::StrLen { key }
            | Op::Expire { key, .. }
            | Op::ExpireTime { key }
            | Op::Bitfield { key, .. }
            | Op::HGet { key, .. }
            | Op::HMGet { key, .. }
            | Op::HSet { key, .. }
            | Op::HSetNx { key, .. }
            | Op::HDel { key, .. }
            | Op::HGetAll { key }
            | Op::HIncrBy { key, .. }
            | Op::HLen { key }
            | Op::HKeys { key }
            | Op::HScan { key, .. }
            | Op::ZAdd { key, .. }
            | Op::ZRem { key, .. }
            | Op::ZScore { key, .. }
            | Op::ZRank { key, .. }
            | Op::ZIncrBy { key, .. }
            | Op::ZCard { key }
            | Op::ZRange { key, .. }
            | Op::ZRemRange { key, .. }
            | Op::ZScan { key, .. } => vec![key],
        }
    }
}
