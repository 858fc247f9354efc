//! Scoped client for the store.
//!
//! [`Commands`] defines every operation once. [`Client`] runs them immediately;
//! a transaction [`Session`] queues them and hands back [`Queued`] placeholders.

pub mod cmd;
pub mod nil;
pub mod transaction;
pub mod value;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::bitfield::BitfieldCommand;
use crate::config::Config;
use crate::error::Result;
use crate::range::{LexBound, ScoreBound, ZBounds, ZRangeQuery};
use crate::rpc::{LocalTransport, Op, Reply, Request, Transport};
use crate::scope::{resolve, Scope};
use crate::types::{ExpireTime, HScanPage, SetOptions, ZMember, ZScanPage};
pub use cmd::Cmd;
pub use nil::NilMode;
pub use transaction::{CallContext, Queued, Session, Transaction, TxPhase};
pub use value::Value;

/// The command surface shared by immediate and queued execution.
///
/// Absent keys, fields and members read as zero values (`""`, `0.0`, `-1`);
/// the `_strict` variants fail with `NotFound` instead. Malformed arguments
/// fail with `InvalidArgument` before anything is sent.
#[allow(async_fn_in_trait)]
pub trait Commands {
    /// What a call yields: the value itself, or a placeholder inside a transaction.
    type Output<T>;

    fn scope(&self) -> Scope;

    async fn run<T>(&self, cmd: Cmd<T>) -> Result<Self::Output<T>>
    where
        T: Into<Value> + 'static;

    // strings and keys

    /// Missing keys read as `""`. A value that is not valid UTF-8, such as
    /// bytes written by `bitfield`, fails with a remote error.
    async fn get(&self, key: &str) -> Result<Self::Output<String>> {
        self.run(cmd::get(self.scope(), key)).await
    }

    async fn get_strict(&self, key: &str) -> Result<Self::Output<String>> {
        self.run(cmd::get_strict(self.scope(), key)).await
    }

    /// Returns `"OK"`, or `""` when `nx`/`xx` kept the value from being written.
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<Self::Output<String>> {
        self.run(cmd::set(self.scope(), key, value, &options)?).await
    }

    async fn del(&self, keys: &[&str]) -> Result<Self::Output<i64>> {
        self.run(cmd::del(self.scope(), keys)).await
    }

    async fn exists(&self, keys: &[&str]) -> Result<Self::Output<i64>> {
        self.run(cmd::exists(self.scope(), keys)).await
    }

    /// `"string"`, `"hash"`, `"zset"` or `"none"`.
    async fn key_type(&self, key: &str) -> Result<Self::Output<String>> {
        self.run(cmd::key_type(self.scope(), key)).await
    }

    async fn rename(&self, key: &str, new_key: &str) -> Result<Self::Output<()>> {
        self.run(cmd::rename(self.scope(), key, new_key)).await
    }

    async fn incr_by(&self, key: &str, increment: i64) -> Result<Self::Output<i64>> {
        self.run(cmd::incr_by(self.scope(), key, increment)).await
    }

    /// Like `get`, the selected bytes must form valid UTF-8.
    async fn get_range(&self, key: &str, start: i64, end: i64) -> Result<Self::Output<String>> {
        self.run(cmd::get_range(self.scope(), key, start, end)).await
    }

    async fn set_range(&self, key: &str, offset: i64, value: &str) -> Result<Self::Output<i64>> {
        self.run(cmd::set_range(self.scope(), key, offset, value)?).await
    }

    async fn str_len(&self, key: &str) -> Result<Self::Output<i64>> {
        self.run(cmd::str_len(self.scope(), key)).await
    }

    /// One slot per key; absent keys read as `""`.
    async fn mget(&self, keys: &[&str]) -> Result<Self::Output<Vec<String>>> {
        self.run(cmd::mget(self.scope(), keys)).await
    }

    async fn mset(&self, pairs: &[(&str, &str)]) -> Result<Self::Output<()>> {
        self.run(cmd::mset(self.scope(), pairs)).await
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<Self::Output<bool>> {
        self.run(cmd::expire(self.scope(), key, seconds)).await
    }

    async fn expire_time(&self, key: &str) -> Result<Self::Output<ExpireTime>> {
        self.run(cmd::expire_time(self.scope(), key)).await
    }

    /// One entry per GET/SET/INCRBY step; `None` where FAIL overflow refused the step.
    async fn bitfield(
        &self,
        key: &str,
        program: &[BitfieldCommand],
    ) -> Result<Self::Output<Vec<Option<i64>>>> {
        self.run(cmd::bitfield(self.scope(), key, program)?).await
    }

    // hashes

    async fn hget(&self, key: &str, field: &str) -> Result<Self::Output<String>> {
        self.run(cmd::hget(self.scope(), key, field)).await
    }

    async fn hget_strict(&self, key: &str, field: &str) -> Result<Self::Output<String>> {
        self.run(cmd::hget_strict(self.scope(), key, field)).await
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Self::Output<Vec<Option<String>>>> {
        self.run(cmd::hmget(self.scope(), key, fields)).await
    }

    async fn hset(&self, key: &str, pairs: &[(&str, &str)]) -> Result<Self::Output<i64>> {
        self.run(cmd::hset(self.scope(), key, pairs)).await
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<Self::Output<bool>> {
        self.run(cmd::hsetnx(self.scope(), key, field, value)).await
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<Self::Output<i64>> {
        self.run(cmd::hdel(self.scope(), key, fields)).await
    }

    async fn hgetall(&self, key: &str) -> Result<Self::Output<HashMap<String, String>>> {
        self.run(cmd::hgetall(self.scope(), key)).await
    }

    async fn hincr_by(&self, key: &str, field: &str, increment: i64) -> Result<Self::Output<i64>> {
        self.run(cmd::hincr_by(self.scope(), key, field, increment)).await
    }

    async fn hlen(&self, key: &str) -> Result<Self::Output<i64>> {
        self.run(cmd::hlen(self.scope(), key)).await
    }

    async fn hkeys(&self, key: &str) -> Result<Self::Output<Vec<String>>> {
        self.run(cmd::hkeys(self.scope(), key)).await
    }

    /// Start with cursor `"0"`; iteration is done when the returned cursor is `"0"`.
    async fn hscan(
        &self,
        key: &str,
        cursor: &str,
        pattern: Option<&str>,
        count: Option<usize>,
    ) -> Result<Self::Output<HScanPage>> {
        self.run(cmd::hscan(self.scope(), key, cursor, pattern, count)).await
    }

    // sorted sets

    /// Returns the number of members that were not present before.
    async fn zadd(&self, key: &str, members: &[ZMember]) -> Result<Self::Output<i64>> {
        self.run(cmd::zadd(self.scope(), key, members)?).await
    }

    async fn zrem(&self, key: &str, members: &[&str]) -> Result<Self::Output<i64>> {
        self.run(cmd::zrem(self.scope(), key, members)).await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Self::Output<f64>> {
        self.run(cmd::zscore(self.scope(), key, member)).await
    }

    async fn zscore_strict(&self, key: &str, member: &str) -> Result<Self::Output<f64>> {
        self.run(cmd::zscore_strict(self.scope(), key, member)).await
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Self::Output<i64>> {
        self.run(cmd::zrank(self.scope(), key, member)).await
    }

    async fn zrank_strict(&self, key: &str, member: &str) -> Result<Self::Output<i64>> {
        self.run(cmd::zrank_strict(self.scope(), key, member)).await
    }

    async fn zincr_by(&self, key: &str, member: &str, increment: f64) -> Result<Self::Output<f64>> {
        self.run(cmd::zincr_by(self.scope(), key, member, increment)?).await
    }

    async fn zcard(&self, key: &str) -> Result<Self::Output<i64>> {
        self.run(cmd::zcard(self.scope(), key)).await
    }

    async fn zrange(&self, key: &str, query: &ZRangeQuery) -> Result<Self::Output<Vec<ZMember>>> {
        self.run(cmd::zrange(self.scope(), key, query)?).await
    }

    async fn zrem_range_by_rank(&self, key: &str, start: i64, stop: i64) -> Result<Self::Output<i64>> {
        self.run(cmd::zrem_range(self.scope(), key, ZBounds::Rank { start, stop })?)
            .await
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<Self::Output<i64>> {
        self.run(cmd::zrem_range(self.scope(), key, ZBounds::Score { min, max })?)
            .await
    }

    /// Bounds in string form: `[a`, `(a`, `-` or `+`.
    async fn zrem_range_by_lex(&self, key: &str, min: &str, max: &str) -> Result<Self::Output<i64>> {
        let bounds = ZBounds::Lex {
            min: LexBound::parse(min)?,
            max: LexBound::parse(max)?,
        };
        self.run(cmd::zrem_range(self.scope(), key, bounds)?).await
    }

    async fn zscan(
        &self,
        key: &str,
        cursor: &str,
        pattern: Option<&str>,
        count: Option<usize>,
    ) -> Result<Self::Output<ZScanPage>> {
        self.run(cmd::zscan(self.scope(), key, cursor, pattern, count)).await
    }
}

/// Immediate-mode client bound to one scope.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    scope: Scope,
}

impl Client {
    /// Installation-scoped client over `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_scope(transport, Scope::Installation)
    }

    pub fn with_scope(transport: Arc<dyn Transport>, scope: Scope) -> Self {
        Self { transport, scope }
    }

    /// Installation-scoped client over a fresh in-process store.
    pub fn local(config: &Config) -> Result<Self> {
        Ok(Self::new(Arc::new(LocalTransport::open(config)?)))
    }

    /// Client for the globally shared keyspace over the same transport.
    pub fn global(&self) -> Client {
        Self::with_scope(Arc::clone(&self.transport), Scope::Global)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Watch `keys` and open a transaction owned by `context`.
    pub async fn watch(&self, context: &CallContext, keys: &[&str]) -> Result<Transaction> {
        let physical: Vec<_> = keys.iter().map(|k| resolve(k, self.scope)).collect();
        let request = Request::new(
            Op::Watch {
                keys: physical.clone(),
            },
            self.scope,
        );
        match self.transport.call(request).await? {
            Reply::Str(id) => {
                debug!(tx = %id, context = context.id(), keys = physical.len(), "watching");
                Ok(Transaction::new(
                    id,
                    self.scope,
                    Arc::clone(&self.transport),
                    context.clone(),
                    physical,
                ))
            }
            other => Err(other.unexpected("transaction id")),
        }
    }
}

impl Commands for Client {
    type Output<T> = T;

    fn scope(&self) -> Scope {
        self.scope
    }

    async fn run<T>(&self, cmd: Cmd<T>) -> Result<T>
    where
        T: Into<Value> + 'static,
    {
        let Cmd { op, nil, decode } = cmd;
        let request = Request::new(op, self.scope).strict(nil.is_strict());
        let reply = self.transport.call(request).await?;
        decode(reply, nil)
    }
}
