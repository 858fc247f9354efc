//! Command builders and their reply decoders.
//!
//! Each builder validates its arguments, resolves keys into the caller's scope
//! and pairs the resulting [`Op`] with the decoder for its reply. Immediate
//! calls and queued transaction slots decode through the same function.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use super::nil::NilMode;
use crate::bitfield::{self, BitfieldCommand};
use crate::error::{KvError, Result};
use crate::range::{ZBounds, ZRangeQuery};
use crate::rpc::{Op, Reply};
use crate::scope::{resolve, PhysicalKey, Scope};
use crate::types::{ExpireTime, HScanPage, SetOptions, ZMember, ZScanPage};

/// Reply decoder for one operation kind.
pub type Decoder<T> = fn(Reply, NilMode) -> Result<T>;

/// A validated operation ready to send, with the decoder for its reply.
pub struct Cmd<T> {
    pub(crate) op: Op,
    pub(crate) nil: NilMode,
    pub(crate) decode: Decoder<T>,
}

impl<T> Cmd<T> {
    fn new(op: Op, decode: Decoder<T>) -> Self {
        Self {
            op,
            nil: NilMode::Default,
            decode,
        }
    }

    fn strict(mut self) -> Self {
        self.nil = NilMode::Strict;
        self
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn decode(&self, reply: Reply) -> Result<T> {
        (self.decode)(reply, self.nil)
    }
}

/// Relative TTL for an absolute expiration: whole seconds, never below 1.
pub fn ttl_from_expiration(at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (at - now).num_seconds().max(1)
}

fn keys(scope: Scope, keys: &[&str]) -> Vec<PhysicalKey> {
    keys.iter().map(|k| resolve(k, scope)).collect()
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// --- strings and keys ---

pub fn get(scope: Scope, key: &str) -> Cmd<String> {
    Cmd::new(
        Op::Get {
            key: resolve(key, scope),
        },
        decode_string,
    )
}

pub fn get_strict(scope: Scope, key: &str) -> Cmd<String> {
    get(scope, key).strict()
}

pub fn set(scope: Scope, key: &str, value: &str, options: &SetOptions) -> Result<Cmd<String>> {
    if options.nx && options.xx {
        return Err(KvError::InvalidArgument(
            "nx and xx are mutually exclusive".to_string(),
        ));
    }
    let ttl_secs = options
        .expiration
        .map(|at| ttl_from_expiration(at, Utc::now()));
    Ok(Cmd::new(
        Op::Set {
            key: resolve(key, scope),
            value: value.to_string(),
            nx: options.nx,
            xx: options.xx,
            ttl_secs,
        },
        decode_confirmation,
    ))
}

pub fn del(scope: Scope, names: &[&str]) -> Cmd<i64> {
    Cmd::new(
        Op::Del {
            keys: keys(scope, names),
        },
        decode_int,
    )
}

pub fn exists(scope: Scope, names: &[&str]) -> Cmd<i64> {
    Cmd::new(
        Op::Exists {
            keys: keys(scope, names),
        },
        decode_int,
    )
}

pub fn key_type(scope: Scope, key: &str) -> Cmd<String> {
    Cmd::new(
        Op::Type {
            key: resolve(key, scope),
        },
        decode_string,
    )
}

pub fn rename(scope: Scope, key: &str, new_key: &str) -> Cmd<()> {
    Cmd::new(
        Op::Rename {
            key: resolve(key, scope),
            new_key: resolve(new_key, scope),
        },
        decode_ok,
    )
}

pub fn incr_by(scope: Scope, key: &str, increment: i64) -> Cmd<i64> {
    Cmd::new(
        Op::IncrBy {
            key: resolve(key, scope),
            increment,
        },
        decode_int,
    )
}

pub fn get_range(scope: Scope, key: &str, start: i64, end: i64) -> Cmd<String> {
    Cmd::new(
        Op::GetRange {
            key: resolve(key, scope),
            start,
            end,
        },
        decode_string,
    )
}

pub fn set_range(scope: Scope, key: &str, offset: i64, value: &str) -> Result<Cmd<i64>> {
    if offset < 0 {
        return Err(KvError::InvalidArgument(format!(
            "offset must not be negative: {}",
            offset
        )));
    }
    Ok(Cmd::new(
        Op::SetRange {
            key: resolve(key, scope),
            offset,
            value: value.to_string(),
        },
        decode_int,
    ))
}

pub fn str_len(scope: Scope, key: &str) -> Cmd<i64> {
    Cmd::new(
        Op::StrLen {
            key: resolve(key, scope),
        },
        decode_int,
    )
}

pub fn mget(scope: Scope, names: &[&str]) -> Cmd<Vec<String>> {
    Cmd::new(
        Op::MGet {
            keys: keys(scope, names),
        },
        decode_values_or_empty,
    )
}

pub fn mset(scope: Scope, pairs: &[(&str, &str)]) -> Cmd<()> {
    Cmd::new(
        Op::MSet {
            pairs: pairs
                .iter()
                .map(|(k, v)| (resolve(k, scope), v.to_string()))
                .collect(),
        },
        decode_ok,
    )
}

pub fn expire(scope: Scope, key: &str, seconds: i64) -> Cmd<bool> {
    Cmd::new(
        Op::Expire {
            key: resolve(key, scope),
            seconds,
        },
        decode_flag,
    )
}

pub fn expire_time(scope: Scope, key: &str) -> Cmd<ExpireTime> {
    Cmd::new(
        Op::ExpireTime {
            key: resolve(key, scope),
        },
        decode_expire_time,
    )
}

pub fn bitfield(scope: Scope, key: &str, program: &[BitfieldCommand]) -> Result<Cmd<Vec<Option<i64>>>> {
    Ok(Cmd::new(
        Op::Bitfield {
            key: resolve(key, scope),
            ops: bitfield::compile(program)?,
        },
        decode_ints,
    ))
}

// --- hashes ---

pub fn hget(scope: Scope, key: &str, field: &str) -> Cmd<String> {
    Cmd::new(
        Op::HGet {
            key: resolve(key, scope),
            field: field.to_string(),
        },
        decode_string,
    )
}

pub fn hget_strict(scope: Scope, key: &str, field: &str) -> Cmd<String> {
    hget(scope, key, field).strict()
}

pub fn hmget(scope: Scope, key: &str, fields: &[&str]) -> Cmd<Vec<Option<String>>> {
    Cmd::new(
        Op::HMGet {
            key: resolve(key, scope),
            fields: owned(fields),
        },
        decode_values,
    )
}

pub fn hset(scope: Scope, key: &str, pairs: &[(&str, &str)]) -> Cmd<i64> {
    Cmd::new(
        Op::HSet {
            key: resolve(key, scope),
            pairs: pairs
                .iter()
                .map(|(f, v)| (f.to_string(), v.to_string()))
                .collect(),
        },
        decode_int,
    )
}

pub fn hsetnx(scope: Scope, key: &str, field: &str, value: &str) -> Cmd<bool> {
    Cmd::new(
        Op::HSetNx {
            key: resolve(key, scope),
            field: field.to_string(),
            value: value.to_string(),
        },
        decode_flag,
    )
}

pub fn hdel(scope: Scope, key: &str, fields: &[&str]) -> Cmd<i64> {
    Cmd::new(
        Op::HDel {
            key: resolve(key, scope),
            fields: owned(fields),
        },
        decode_int,
    )
}

pub fn hgetall(scope: Scope, key: &str) -> Cmd<HashMap<String, String>> {
    Cmd::new(
        Op::HGetAll {
            key: resolve(key, scope),
        },
        decode_map,
    )
}

pub fn hincr_by(scope: Scope, key: &str, field: &str, increment: i64) -> Cmd<i64> {
    Cmd::new(
        Op::HIncrBy {
            key: resolve(key, scope),
            field: field.to_string(),
            increment,
        },
        decode_int,
    )
}

pub fn hlen(scope: Scope, key: &str) -> Cmd<i64> {
    Cmd::new(
        Op::HLen {
            key: resolve(key, scope),
        },
        decode_int,
    )
}

pub fn hkeys(scope: Scope, key: &str) -> Cmd<Vec<String>> {
    Cmd::new(
        Op::HKeys {
            key: resolve(key, scope),
        },
        decode_strings,
    )
}

pub fn hscan(
    scope: Scope,
    key: &str,
    cursor: &str,
    pattern: Option<&str>,
    count: Option<usize>,
) -> Cmd<HScanPage> {
    Cmd::new(
        Op::HScan {
            key: resolve(key, scope),
            cursor: cursor.to_string(),
            pattern: pattern.map(str::to_string),
            count,
        },
        decode_hash_page,
    )
}

// --- sorted sets ---

pub fn zadd(scope: Scope, key: &str, members: &[ZMember]) -> Result<Cmd<i64>> {
    if members.iter().any(|m| m.score.is_nan()) {
        return Err(KvError::InvalidArgument("score is not a number (NaN)".to_string()));
    }
    Ok(Cmd::new(
        Op::ZAdd {
            key: resolve(key, scope),
            members: members.to_vec(),
        },
        decode_int,
    ))
}

pub fn zrem(scope: Scope, key: &str, members: &[&str]) -> Cmd<i64> {
    Cmd::new(
        Op::ZRem {
            key: resolve(key, scope),
            members: owned(members),
        },
        decode_int,
    )
}

pub fn zscore(scope: Scope, key: &str, member: &str) -> Cmd<f64> {
    Cmd::new(
        Op::ZScore {
            key: resolve(key, scope),
            member: member.to_string(),
        },
        decode_score,
    )
}

pub fn zscore_strict(scope: Scope, key: &str, member: &str) -> Cmd<f64> {
    zscore(scope, key, member).strict()
}

pub fn zrank(scope: Scope, key: &str, member: &str) -> Cmd<i64> {
    Cmd::new(
        Op::ZRank {
            key: resolve(key, scope),
            member: member.to_string(),
        },
        decode_rank,
    )
}

pub fn zrank_strict(scope: Scope, key: &str, member: &str) -> Cmd<i64> {
    zrank(scope, key, member).strict()
}

pub fn zincr_by(scope: Scope, key: &str, member: &str, increment: f64) -> Result<Cmd<f64>> {
    if increment.is_nan() {
        return Err(KvError::InvalidArgument("increment is not a number (NaN)".to_string()));
    }
    Ok(Cmd::new(
        Op::ZIncrBy {
            key: resolve(key, scope),
            member: member.to_string(),
            increment,
        },
        decode_float,
    ))
}

pub fn zcard(scope: Scope, key: &str) -> Cmd<i64> {
    Cmd::new(
        Op::ZCard {
            key: resolve(key, scope),
        },
        decode_int,
    )
}

pub fn zrange(scope: Scope, key: &str, query: &ZRangeQuery) -> Result<Cmd<Vec<ZMember>>> {
    query.validate()?;
    Ok(Cmd::new(
        Op::ZRange {
            key: resolve(key, scope),
            query: query.clone(),
        },
        decode_members,
    ))
}

pub fn zrem_range(scope: Scope, key: &str, bounds: ZBounds) -> Result<Cmd<i64>> {
    ZRangeQuery::new(bounds.clone()).validate()?;
    Ok(Cmd::new(
        Op::ZRemRange {
            key: resolve(key, scope),
            bounds,
        },
        decode_int,
    ))
}

pub fn zscan(
    scope: Scope,
    key: &str,
    cursor: &str,
    pattern: Option<&str>,
    count: Option<usize>,
) -> Cmd<ZScanPage> {
    Cmd::new(
        Op::ZScan {
            key: resolve(key, scope),
            cursor: cursor.to_string(),
            pattern: pattern.map(str::to_string),
            count,
        },
        decode_zset_page,
    )
}

// --- decoders ---

fn decode_ok(reply: Reply, _: NilMode) -> Result<()> {
    match reply {
        Reply::Ok => Ok(()),
        other => Err(other.unexpected("ok")),
    }
}

/// SET: "OK" when written, "" when NX/XX prevented the write.
fn decode_confirmation(reply: Reply, _: NilMode) -> Result<String> {
    match reply {
        Reply::Ok => Ok("OK".to_string()),
        Reply::Nil => Ok(String::new()),
        other => Err(other.unexpected("ok or nil")),
    }
}

fn decode_string(reply: Reply, nil: NilMode) -> Result<String> {
    match reply {
        Reply::Str(s) => Ok(s),
        Reply::Nil => nil.absent(String::new()),
        other => Err(other.unexpected("str")),
    }
}

fn decode_int(reply: Reply, _: NilMode) -> Result<i64> {
    match reply {
        Reply::Int(n) => Ok(n),
        other => Err(other.unexpected("int")),
    }
}

fn decode_flag(reply: Reply, _: NilMode) -> Result<bool> {
    match reply {
        Reply::Int(n) => Ok(n != 0),
        other => Err(other.unexpected("int")),
    }
}

fn decode_float(reply: Reply, _: NilMode) -> Result<f64> {
    match reply {
        Reply::Float(f) => Ok(f),
        other => Err(other.unexpected("float")),
    }
}

fn decode_score(reply: Reply, nil: NilMode) -> Result<f64> {
    match reply {
        Reply::Float(f) => Ok(f),
        Reply::Nil => nil.absent(0.0),
        other => Err(other.unexpected("float")),
    }
}

fn decode_rank(reply: Reply, nil: NilMode) -> Result<i64> {
    match reply {
        Reply::Int(n) => Ok(n),
        Reply::Nil => nil.absent(-1),
        other => Err(other.unexpected("int")),
    }
}

/// MGET never reports absence as an error: missing slots are empty strings.
fn decode_values_or_empty(reply: Reply, _: NilMode) -> Result<Vec<String>> {
    match reply {
        Reply::Values(values) => Ok(values.into_iter().map(Option::unwrap_or_default).collect()),
        other => Err(other.unexpected("values")),
    }
}

fn decode_values(reply: Reply, _: NilMode) -> Result<Vec<Option<String>>> {
    match reply {
        Reply::Values(values) => Ok(values),
        other => Err(other.unexpected("values")),
    }
}

fn decode_ints(reply: Reply, _: NilMode) -> Result<Vec<Option<i64>>> {
    match reply {
        Reply::Ints(values) => Ok(values),
        other => Err(other.unexpected("ints")),
    }
}

fn decode_strings(reply: Reply, _: NilMode) -> Result<Vec<String>> {
    match reply {
        Reply::Strings(values) => Ok(values),
        other => Err(other.unexpected("strings")),
    }
}

fn decode_members(reply: Reply, _: NilMode) -> Result<Vec<ZMember>> {
    match reply {
        Reply::Members(members) => Ok(members),
        other => Err(other.unexpected("members")),
    }
}

fn decode_map(reply: Reply, _: NilMode) -> Result<HashMap<String, String>> {
    match reply {
        Reply::Fields(fields) => Ok(fields.into_iter().collect()),
        other => Err(other.unexpected("fields")),
    }
}

fn decode_hash_page(reply: Reply, _: NilMode) -> Result<HScanPage> {
    match reply {
        Reply::HashPage { cursor, fields } => Ok(HScanPage {
            cursor,
            field_values: fields,
        }),
        other => Err(other.unexpected("hash page")),
    }
}

fn decode_zset_page(reply: Reply, _: NilMode) -> Result<ZScanPage> {
    match reply {
        Reply::ZPage { cursor, members } => Ok(ZScanPage { cursor, members }),
        other => Err(other.unexpected("zset page")),
    }
}

fn decode_expire_time(reply: Reply, _: NilMode) -> Result<ExpireTime> {
    match reply {
        Reply::Int(-2) => Ok(ExpireTime::Missing),
        Reply::Int(-1) => Ok(ExpireTime::Persistent),
        Reply::Int(secs) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .map(ExpireTime::At)
            .ok_or_else(|| KvError::UnexpectedReply {
                expected: "unix timestamp",
                got: secs.to_string(),
            }),
        other => Err(other.unexpected("int")),
    }
}
